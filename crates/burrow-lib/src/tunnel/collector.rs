//! Tunnel metrics collection loop
//!
//! Polls the driver for cumulative per-peer counters on a fixed tick,
//! derives smoothed per-tunnel throughput, and fans samples out on the
//! manager's performance stream. Malformed or failing dumps are skipped;
//! a collection cycle never fails as a whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::models::{MetricsSample, TunnelState};
use crate::observability::TunnelMetricsExporter;

use super::manager::TunnelManager;

/// Configuration for the metrics collection loop
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Collection cadence (default: 5 seconds)
    pub interval: Duration,
    /// Smoothing factor for the throughput EWMA
    pub ewma_alpha: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ewma_alpha: 0.3,
        }
    }
}

/// Last-cycle counter snapshot for one tunnel
#[derive(Debug, Clone, Copy)]
struct CounterSnapshot {
    total_bytes: u64,
    taken_at: Instant,
    latest_handshake: Option<i64>,
}

/// Periodically samples every Active tunnel through the driver
pub struct MetricsCollector {
    manager: Arc<TunnelManager>,
    config: CollectorConfig,
    samples_tx: broadcast::Sender<MetricsSample>,
    previous: Mutex<HashMap<u32, CounterSnapshot>>,
    exporter: TunnelMetricsExporter,
}

impl MetricsCollector {
    pub fn new(manager: Arc<TunnelManager>, config: CollectorConfig) -> Self {
        let samples_tx = manager.sample_sender();
        Self {
            manager,
            config,
            samples_tx,
            previous: Mutex::new(HashMap::new()),
            exporter: TunnelMetricsExporter::new(),
        }
    }

    /// Run until the shutdown broadcast fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "starting tunnel metrics collector"
        );
        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("shutting down tunnel metrics collector");
                    break;
                }
            }
        }
    }

    /// One pass over the tunnel set. Public for tests: drives exactly one
    /// collection cycle without the ticker.
    pub async fn collect_cycle(&self) {
        let driver = self.manager.driver();
        let tunnels = self.manager.tunnels().await;
        let now = Instant::now();
        let mut errors = 0usize;

        for tunnel in &tunnels {
            if tunnel.state() != TunnelState::Active {
                continue;
            }

            let peers = match driver.show_dump(&tunnel.interface_name).await {
                Ok(peers) => peers,
                Err(e) => {
                    errors += 1;
                    self.exporter.inc_collection_error("dump");
                    debug!(interface = %tunnel.interface_name, error = %e, "dump failed, skipping");
                    continue;
                }
            };
            if peers.is_empty() {
                continue;
            }

            let rx: u64 = peers.iter().map(|p| p.rx_bytes).sum();
            let tx: u64 = peers.iter().map(|p| p.tx_bytes).sum();
            let total = rx + tx;
            let handshake = peers.iter().filter_map(|p| p.latest_handshake).max();

            let mut previous = self.previous.lock().await;
            let last = previous.insert(
                tunnel.id,
                CounterSnapshot {
                    total_bytes: total,
                    taken_at: now,
                    latest_handshake: handshake,
                },
            );

            tunnel.update_status(|status| {
                status.rx_bytes = rx;
                status.tx_bytes = tx;
                status.last_seen = Some(Utc::now());
                if let (Some(prev), Some(current)) =
                    (last.and_then(|l| l.latest_handshake), handshake)
                {
                    if current > prev {
                        status.handshake_count += 1;
                    }
                } else if handshake.is_some() && last.map_or(true, |l| l.latest_handshake.is_none())
                {
                    status.handshake_count += 1;
                }
            });

            let Some(last) = last else {
                // First observation has no rate yet
                continue;
            };
            let elapsed = now.duration_since(last.taken_at).as_secs_f64();
            if elapsed <= 0.0 {
                continue;
            }
            // Counters reset when the driver restarts an interface
            let delta = total.saturating_sub(last.total_bytes);
            let instant_bps = (delta as f64) * 8.0 / elapsed;

            let alpha = self.config.ewma_alpha;
            tunnel.update_metrics(|metrics| {
                let smoothed = if metrics.last_update.is_none() {
                    instant_bps
                } else {
                    alpha * instant_bps + (1.0 - alpha) * metrics.throughput_bps as f64
                };
                metrics.throughput_bps = smoothed as u64;
                metrics.last_update = Some(Utc::now());
            });

            let sample = MetricsSample {
                tunnel_id: tunnel.id,
                metrics: tunnel.metrics(),
            };
            // Receivers that lag simply lose the oldest samples
            let _ = self.samples_tx.send(sample);
        }

        if errors > 0 {
            warn!(errors, "collection cycle completed with skipped tunnels");
        }

        // Forget tunnels that no longer exist
        let live: std::collections::HashSet<u32> = tunnels.iter().map(|t| t.id).collect();
        self.previous.lock().await.retain(|id, _| live.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{MockDriver, TunnelConfig, TunnelDriver};

    async fn setup(dir: &std::path::Path) -> (Arc<TunnelManager>, Arc<MockDriver>, MetricsCollector)
    {
        let driver = Arc::new(MockDriver::new());
        let config = TunnelConfig {
            config_dir: dir.to_path_buf(),
            ..TunnelConfig::default()
        };
        let manager = Arc::new(
            TunnelManager::new(config, driver.clone() as Arc<dyn TunnelDriver>).unwrap(),
        );
        manager.create_tunnels(2).await.unwrap();
        let collector = MetricsCollector::new(manager.clone(), CollectorConfig::default());
        (manager, driver, collector)
    }

    #[tokio::test]
    async fn test_throughput_derived_from_counter_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, driver, collector) = setup(dir.path()).await;

        driver.advance_counters("wg0", 1_000, 1_000);
        collector.collect_cycle().await;

        // Second cycle sees a delta and can compute a rate
        driver.advance_counters("wg0", 50_000, 50_000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.collect_cycle().await;

        let snapshots = manager.active_tunnels().await;
        assert!(snapshots[0].metrics.throughput_bps > 0);
        assert_eq!(snapshots[0].status.rx_bytes, 51_000);
        assert_eq!(snapshots[0].status.tx_bytes, 51_000);
        assert!(snapshots[0].status.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_samples_reach_performance_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, driver, collector) = setup(dir.path()).await;
        let mut stream = manager.performance_stream();

        driver.advance_counters("wg1", 10, 10);
        collector.collect_cycle().await;
        driver.advance_counters("wg1", 10_000, 10_000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.collect_cycle().await;

        let sample = stream.try_recv().expect("a sample should be queued");
        assert!(sample.tunnel_id < 2);
    }

    #[tokio::test]
    async fn test_dump_failure_skips_tunnel_not_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, driver, collector) = setup(dir.path()).await;

        // wg1 goes away behind the manager's back; its dump now errors
        driver.bring_down("wg1").await.unwrap();
        driver.advance_counters("wg0", 500, 500);
        collector.collect_cycle().await;
        driver.advance_counters("wg0", 5_000, 5_000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.collect_cycle().await;

        let snapshots = manager.active_tunnels().await;
        assert!(snapshots[0].status.rx_bytes > 0);
        assert_eq!(snapshots[1].status.rx_bytes, 0);
    }

    #[tokio::test]
    async fn test_counter_reset_does_not_underflow() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, driver, collector) = setup(dir.path()).await;

        driver.advance_counters("wg0", 100_000, 100_000);
        collector.collect_cycle().await;

        // Fresh counters below the previous totals
        driver.set_peer_stats(
            "wg0",
            vec![crate::tunnel::PeerStats {
                public_key: "wg0-peer".to_string(),
                latest_handshake: None,
                rx_bytes: 10,
                tx_bytes: 10,
            }],
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.collect_cycle().await;

        let snapshots = manager.active_tunnels().await;
        assert_eq!(snapshots[0].status.rx_bytes, 10);
    }
}
