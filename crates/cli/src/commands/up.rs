//! `burrow up` - deploy the tunnel set and run the control loops
//!
//! Optionally probes first, provisions a bastion through the provisioner
//! boundary, brings up the tunnel set, installs equal-cost routes, then
//! runs the metrics collector, the scaling controller and the
//! health/metrics API until interrupted. Tunnels stay up across exits;
//! `burrow down` removes them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_lib::health::{components, HealthRegistry};
use burrow_lib::observability::{StructuredLogger, TunnelMetricsExporter};
use burrow_lib::probe::NetworkProber;
use burrow_lib::provision::{BastionRequest, MockProvisioner, Provisioner};
use burrow_lib::scaler::{tiers, ClusterManager, TunnelScaler};
use burrow_lib::tunnel::{
    CollectorConfig, MetricsCollector, MockDriver, TunnelDriver, TunnelManager, WgQuickDriver,
};
use tokio::sync::broadcast;

use crate::api::{self, AppState};
use crate::config::BurrowConfig;
use crate::output::{print_info, print_success, print_warning};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct UpOptions {
    pub tunnels: Option<u32>,
    pub auto_optimize: bool,
    pub region: Option<String>,
    pub api_port: Option<u16>,
    pub mock_driver: bool,
}

pub async fn run(config: &BurrowConfig, options: UpOptions) -> Result<()> {
    let region = options.region.unwrap_or_else(|| config.region.clone());
    let mut tunnel_config = config.tunnel_config()?;
    let scaling_config = config.scaling_config();

    let mut tunnel_count = options.tunnels.unwrap_or(tunnel_config.min_tunnels);
    let mut baseline_bps = 0u64;

    // Optional discovery pass feeding MTU and tunnel count
    if options.auto_optimize {
        print_info("running network performance discovery");
        match NetworkProber::new(config.probe_config()).probe(&region).await {
            Ok(results) => {
                tunnel_config.mtu = results.optimal_mtu;
                baseline_bps = results.baseline_bandwidth_bps;
                let suggested = results.optimal_stream_count;
                if options.tunnels.is_none() && suggested >= 1 {
                    tunnel_count = suggested.min(tunnel_config.max_tunnels);
                }
                print_success(&format!(
                    "discovery: MTU {}, {} tunnels",
                    tunnel_config.mtu, tunnel_count
                ));
            }
            Err(e) => print_warning(&format!("probing failed, using configured defaults: {e}")),
        }
    }
    let tunnel_count = tunnel_count.clamp(1, tunnel_config.max_tunnels);

    let driver: Arc<dyn TunnelDriver> = if options.mock_driver {
        print_warning("using the in-process driver double; no kernel interfaces are created");
        Arc::new(MockDriver::new())
    } else {
        Arc::new(WgQuickDriver::new(tunnel_config.config_dir.clone()))
    };

    // The cloud side binds at this seam; a deployment-specific
    // provisioner replaces the double here.
    let provisioner: Arc<dyn Provisioner> = Arc::new(MockProvisioner::new());

    let tier = tiers::select_tier(baseline_bps / 8, 100.0);
    let bastion = provisioner
        .create_bastion(&BastionRequest {
            region: region.clone(),
            availability_zone: format!("{region}a"),
            instance_tier: tier.name.to_string(),
            tunnel_count,
            mtu: tunnel_config.mtu,
        })
        .await
        .context("bastion provisioning failed")?;
    print_success(&format!(
        "bastion {} ready at {} ({})",
        bastion.instance_id, bastion.public_ip, tier.name
    ));

    // Recover any tunnels a previous run left on disk, then grow to the
    // requested count
    let manager = Arc::new(
        TunnelManager::discover(tunnel_config.clone(), driver)
            .await
            .context("tunnel state recovery failed")?,
    );
    manager.set_peer(bastion.peer_public_key.clone(), bastion.public_ip.clone());
    manager
        .create_tunnels(tunnel_count)
        .await
        .context("tunnel creation failed")?;
    print_success(&format!("{tunnel_count} tunnels active"));

    if options.mock_driver {
        print_info("skipping route installation (mock driver)");
    } else {
        match manager.configure_ecmp().await {
            Ok(()) => print_success("equal-cost routes installed"),
            Err(e) => print_warning(&format!("route installation failed, tunnels stay up: {e}")),
        }
    }

    // Control plane: health, metrics, collector, scaler, API
    let health = HealthRegistry::new();
    health.register(components::COLLECTOR).await;
    health.register(components::SCALER).await;
    health.register(components::DRIVER).await;
    health.register(components::PROVISIONER).await;

    let metrics = TunnelMetricsExporter::new();
    let logger = StructuredLogger::new(
        hostname().unwrap_or_else(|| "unknown".to_string()),
    );
    logger.log_startup(VERSION, tunnel_count);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let collector = Arc::new(MetricsCollector::new(
        manager.clone(),
        CollectorConfig::default(),
    ));
    let collector_task = tokio::spawn(collector.clone().run(shutdown_tx.subscribe()));

    let per_tunnel_capacity_bps = scaling_config.per_tunnel_capacity_bps;
    let cluster = Arc::new(ClusterManager::new(
        scaling_config.clone(),
        manager.clone(),
        provisioner,
        region.clone(),
    ));
    cluster.register_primary(&bastion, tunnel_count).await;

    let scaler = TunnelScaler::new(scaling_config, manager.clone(), cluster.clone())?;
    scaler.start().await;

    let api_state = Arc::new(AppState::new(health.clone(), metrics.clone()));
    let api_port = options.api_port.unwrap_or(config.api_port);
    let api_task = tokio::spawn(api::serve(api_port, api_state));

    let gauge_task = tokio::spawn(refresh_gauges(
        manager.clone(),
        cluster.clone(),
        metrics,
        per_tunnel_capacity_bps,
        shutdown_tx.subscribe(),
    ));

    health.set_ready(true).await;
    print_info(&format!(
        "running; health and metrics on :{api_port}, interrupt to stop"
    ));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("interrupt received");

    // Stop the loops; in-flight driver calls finish under their own
    // deadlines. The tunnels themselves stay up.
    let _ = shutdown_tx.send(());
    scaler.stop().await;
    let _ = collector_task.await;
    gauge_task.abort();
    api_task.abort();

    print_info("control loops stopped; tunnels remain up (use 'burrow down' to remove them)");
    Ok(())
}

/// Keep the Prometheus gauges in line with live state
async fn refresh_gauges(
    manager: Arc<TunnelManager>,
    cluster: Arc<ClusterManager>,
    metrics: TunnelMetricsExporter,
    per_tunnel_capacity_bps: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshots = manager.active_tunnels().await;
                metrics.set_tunnels_active(snapshots.len() as i64);
                let mut total = 0u64;
                for snap in &snapshots {
                    metrics.set_tunnel_throughput(snap.id, snap.metrics.throughput_bps as f64);
                    total += snap.metrics.throughput_bps;
                }
                let state = cluster.state().await;
                metrics.set_instances_active(state.instances.len() as i64);
                let capacity = snapshots.len() as f64 * per_tunnel_capacity_bps as f64;
                if capacity > 0.0 {
                    metrics.set_aggregate_utilization(total as f64 / capacity);
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
