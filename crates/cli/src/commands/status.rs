//! `burrow status` - inspect the live tunnel set
//!
//! State is rebuilt from the config files on disk, then the driver is
//! polled twice so a throughput figure exists before rendering.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_lib::tunnel::{
    CollectorConfig, MetricsCollector, TunnelDriver, TunnelManager, WgQuickDriver,
};
use serde::Serialize;
use tabled::Tabled;

use crate::config::BurrowConfig;
use crate::output::{
    color_state, format_bandwidth, print_info, print_table, OutputFormat,
};

/// Row for the tunnel status table
#[derive(Tabled, Serialize)]
struct TunnelRow {
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "RX")]
    rx: String,
    #[tabled(rename = "TX")]
    tx: String,
    #[tabled(rename = "Throughput")]
    throughput: String,
}

pub async fn run(config: &BurrowConfig, format: OutputFormat) -> Result<()> {
    let tunnel_config = config.tunnel_config()?;
    let driver: Arc<dyn TunnelDriver> =
        Arc::new(WgQuickDriver::new(tunnel_config.config_dir.clone()));

    let manager = Arc::new(
        TunnelManager::discover(tunnel_config, driver)
            .await
            .context("could not rebuild tunnel state from config directory")?,
    );

    if manager.tunnel_count().await == 0 {
        print_info("no tunnels configured; run 'burrow up' first");
        return Ok(());
    }

    // Two samples a second apart give the rate a baseline
    let collector = MetricsCollector::new(manager.clone(), CollectorConfig::default());
    collector.collect_cycle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    collector.collect_cycle().await;

    let snapshots = manager.active_tunnels().await;
    let rows: Vec<TunnelRow> = snapshots
        .iter()
        .map(|snap| TunnelRow {
            id: snap.id,
            interface: snap.interface_name.clone(),
            state: color_state(&format!("{:?}", snap.state).to_lowercase()),
            address: snap.local_address.clone(),
            port: snap.listen_port,
            rx: format_bytes(snap.status.rx_bytes),
            tx: format_bytes(snap.status.tx_bytes),
            throughput: format_bandwidth(snap.metrics.throughput_bps),
        })
        .collect();

    print_table(&rows, format);

    if matches!(format, OutputFormat::Table) {
        let total: u64 = snapshots.iter().map(|s| s.metrics.throughput_bps).sum();
        print_info(&format!(
            "{} tunnels, aggregate throughput {}",
            snapshots.len(),
            format_bandwidth(total)
        ));
    }
    Ok(())
}

/// Format a byte count with binary units
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00GiB");
    }
}
