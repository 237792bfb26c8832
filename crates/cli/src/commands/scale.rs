//! `burrow scale` - resize the tunnel set

use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_lib::tunnel::{TunnelDriver, TunnelManager, WgQuickDriver};

use crate::config::BurrowConfig;
use crate::output::{print_info, print_success, print_warning};

pub async fn run(config: &BurrowConfig, target: u32) -> Result<()> {
    let tunnel_config = config.tunnel_config()?;
    let driver: Arc<dyn TunnelDriver> =
        Arc::new(WgQuickDriver::new(tunnel_config.config_dir.clone()));

    let manager = Arc::new(
        TunnelManager::discover(tunnel_config, driver)
            .await
            .context("could not rebuild tunnel state from config directory")?,
    );

    let current = manager.tunnel_count().await;
    if current == target {
        print_info(&format!("already at {target} tunnels"));
        return Ok(());
    }
    print_info(&format!("scaling from {current} to {target} tunnels"));

    while manager.tunnel_count().await < target {
        let id = manager.add_tunnel().await.context("scale-up failed")?;
        print_success(&format!("tunnel {id} added"));
    }
    while manager.tunnel_count().await > target {
        let id = manager.remove_tunnel().await.context("scale-down failed")?;
        print_success(&format!("tunnel {id} removed"));
    }

    if let Err(e) = manager.configure_ecmp().await {
        print_warning(&format!("route refresh failed, tunnels stay up: {e}"));
    }
    print_success(&format!("tunnel set now at {target}"));
    Ok(())
}
