//! `burrow down` - tear down every tunnel and release bastions

use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_lib::provision::{MockProvisioner, Provisioner};
use burrow_lib::tunnel::{TunnelDriver, TunnelManager, WgQuickDriver};

use crate::config::BurrowConfig;
use crate::output::{print_info, print_success, print_warning};

pub async fn run(config: &BurrowConfig) -> Result<()> {
    let tunnel_config = config.tunnel_config()?;
    let driver: Arc<dyn TunnelDriver> =
        Arc::new(WgQuickDriver::new(tunnel_config.config_dir.clone()));

    let manager = Arc::new(
        TunnelManager::discover(tunnel_config, driver)
            .await
            .context("could not rebuild tunnel state from config directory")?,
    );

    let count = manager.tunnel_count().await;
    if count == 0 {
        print_info("no tunnels to remove");
    } else {
        manager
            .destroy_all()
            .await
            .context("tunnel teardown failed")?;
        print_success(&format!("{count} tunnels removed"));
    }

    // Release any bastions tagged as ours. The provisioner double binds
    // at the same seam a cloud-specific implementation would.
    let provisioner: Arc<dyn Provisioner> = Arc::new(MockProvisioner::new());
    match provisioner.list_instances_by_tag("app", "burrow").await {
        Ok(instances) => {
            for instance in instances {
                match provisioner.terminate(&instance.instance_id).await {
                    Ok(()) => print_success(&format!("bastion {} terminated", instance.instance_id)),
                    Err(e) => print_warning(&format!(
                        "could not terminate {}: {e}",
                        instance.instance_id
                    )),
                }
            }
        }
        Err(e) => print_warning(&format!("bastion lookup failed: {e}")),
    }

    Ok(())
}
