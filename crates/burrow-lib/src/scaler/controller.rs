//! Scaling decision loop
//!
//! Every interval the controller snapshots tunnel metrics under the
//! metrics locks, releases them, decides, and only then calls into the
//! lifecycle layer. Decision rules run in fixed priority order and each
//! respects its direction's cooldown; a decision that changed nothing
//! does not reset a cooldown.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::observability::TunnelMetricsExporter;
use crate::tunnel::TunnelManager;

use super::cluster::ClusterManager;
use super::tiers::{self, InstanceTier};
use super::{
    BurstEvent, ScalingAction, ScalingConfig, ScalingDirective, ScalingRecommendation,
};

/// Fraction of per-tunnel capacity above which a cycle counts as a burst
const BURST_RATIO: f64 = 0.7;

/// Burst events inside the window needed before burst scaling kicks in
const BURST_TRIGGER_COUNT: usize = 3;

/// Tunnels added on a burst decision
const BURST_SCALE_STEP: u32 = 2;

/// Target utilization the recommendation sizes tunnel counts against
const RECOMMENDED_UTILIZATION: f64 = 0.7;

/// Monthly budget assumed when recommending an instance tier
const DEFAULT_TIER_BUDGET_USD: f64 = 100.0;

/// Inputs one decision cycle works from
#[derive(Debug, Clone)]
pub(crate) struct MetricsWindow {
    pub tunnel_count: u32,
    /// Aggregate throughput over aggregate capacity, 0..=1 and beyond
    pub utilization: f64,
    /// Tunnels currently running above the elephant-flow threshold
    pub elephant_flows: u32,
    /// Burst events observed inside the rolling window
    pub recent_bursts: usize,
    pub total_throughput_bps: u64,
}

/// Per-direction cooldown bookkeeping
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Cooldowns {
    pub last_scale_up: Option<Instant>,
    pub last_scale_down: Option<Instant>,
}

impl Cooldowns {
    fn up_active(&self, config: &ScalingConfig, now: Instant) -> bool {
        self.last_scale_up
            .is_some_and(|at| now.duration_since(at) < config.scale_up_cooldown)
    }

    fn down_active(&self, config: &ScalingConfig, now: Instant) -> bool {
        self.last_scale_down
            .is_some_and(|at| now.duration_since(at) < config.scale_down_cooldown)
    }
}

/// The decision rules, applied in order with first match winning
pub(crate) fn decide(
    config: &ScalingConfig,
    min_tunnels: u32,
    max_tunnels: u32,
    window: &MetricsWindow,
    cooldowns: &Cooldowns,
    now: Instant,
) -> ScalingAction {
    let n = window.tunnel_count;
    let up_blocked = cooldowns.up_active(config, now);
    let down_blocked = cooldowns.down_active(config, now);

    if window.elephant_flows > n && n < max_tunnels && !up_blocked {
        return ScalingAction {
            directive: ScalingDirective::ScaleUp,
            target_count: window.elephant_flows.min(max_tunnels),
            reason: format!("elephant flow scaling: {} flows detected", window.elephant_flows),
            timestamp: Utc::now(),
        };
    }

    if window.utilization > config.scale_up_threshold && n < max_tunnels && !up_blocked {
        return ScalingAction {
            directive: ScalingDirective::ScaleUp,
            target_count: n + 1,
            reason: format!("high utilization: {:.1}%", window.utilization * 100.0),
            timestamp: Utc::now(),
        };
    }

    if window.utilization < config.scale_down_threshold && n > min_tunnels && !down_blocked {
        return ScalingAction {
            directive: ScalingDirective::ScaleDown,
            target_count: n - 1,
            reason: format!("low utilization: {:.1}%", window.utilization * 100.0),
            timestamp: Utc::now(),
        };
    }

    if window.recent_bursts >= BURST_TRIGGER_COUNT && n < max_tunnels && !up_blocked {
        return ScalingAction {
            directive: ScalingDirective::ScaleUp,
            target_count: (n + BURST_SCALE_STEP).min(max_tunnels),
            reason: format!("burst pattern detected: {} recent bursts", window.recent_bursts),
            timestamp: Utc::now(),
        };
    }

    ScalingAction {
        directive: ScalingDirective::NoAction,
        target_count: n,
        reason: "no scaling needed".to_string(),
        timestamp: Utc::now(),
    }
}

/// Closed-loop scaling controller
pub struct TunnelScaler {
    config: ScalingConfig,
    manager: Arc<TunnelManager>,
    cluster: Arc<ClusterManager>,
    bursts: Mutex<Vec<BurstEvent>>,
    cooldowns: Mutex<Cooldowns>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    exporter: TunnelMetricsExporter,
}

impl TunnelScaler {
    pub fn new(
        config: ScalingConfig,
        manager: Arc<TunnelManager>,
        cluster: Arc<ClusterManager>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            config,
            manager,
            cluster,
            bursts: Mutex::new(Vec::new()),
            cooldowns: Mutex::new(Cooldowns::default()),
            shutdown_tx,
            task: Mutex::new(None),
            exporter: TunnelMetricsExporter::new(),
        }))
    }

    /// Launch the decision loop
    pub async fn start(self: &Arc<Self>) {
        let scaler = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { scaler.run(shutdown).await });
        *self.task.lock().await = Some(handle);
    }

    /// Signal shutdown and wait for the loop to finish its cycle
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.scale_interval.as_secs(),
            "starting scaling controller"
        );
        let mut ticker = interval(self.config.scale_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("shutting down scaling controller");
                    break;
                }
            }
        }
    }

    /// One full observe-decide-act pass. Public for tests.
    pub async fn cycle(&self) {
        let window = self.observe().await;
        let now = Instant::now();
        let action = {
            let cooldowns = self.cooldowns.lock().await;
            decide(
                &self.config,
                self.manager.config().min_tunnels,
                self.manager.config().max_tunnels,
                &window,
                &cooldowns,
                now,
            )
        };

        if action.directive == ScalingDirective::NoAction {
            debug!(utilization = window.utilization, "no scaling needed");
            return;
        }
        info!(
            directive = ?action.directive,
            from = window.tunnel_count,
            to = action.target_count,
            reason = %action.reason,
            "executing scaling action"
        );
        self.execute(&window, &action, now).await;
    }

    /// Snapshot metrics under the read locks, then let them go
    async fn observe(&self) -> MetricsWindow {
        let snapshots = self.manager.active_tunnels().await;
        let tunnel_count = snapshots.len() as u32;
        let per_tunnel: Vec<u64> = snapshots.iter().map(|s| s.metrics.throughput_bps).collect();
        let total: u64 = per_tunnel.iter().sum();

        let capacity = self.config.per_tunnel_capacity_bps;
        let utilization = if tunnel_count == 0 {
            0.0
        } else {
            total as f64 / (tunnel_count as f64 * capacity as f64)
        };
        self.exporter.set_aggregate_utilization(utilization);
        let elephant_flows = per_tunnel
            .iter()
            .filter(|&&bps| bps > self.config.elephant_flow_threshold_bps)
            .count() as u32;

        let burst_line = (capacity as f64 * BURST_RATIO) as u64;
        let bursting = per_tunnel.iter().any(|&bps| bps > burst_line);

        let mut bursts = self.bursts.lock().await;
        if bursting && tunnel_count > 0 {
            bursts.push(BurstEvent {
                timestamp: Utc::now(),
                peak_throughput_bps: total,
                tunnel_count,
            });
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.burst_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        bursts.retain(|b| b.timestamp > cutoff);
        let recent_bursts = bursts.len();

        MetricsWindow {
            tunnel_count,
            utilization,
            elephant_flows,
            recent_bursts,
            total_throughput_bps: total,
        }
    }

    /// Apply a decision through the lifecycle layer. Partial progress is
    /// allowed; the cooldown timestamp is only recorded when at least one
    /// tunnel actually changed.
    async fn execute(&self, window: &MetricsWindow, action: &ScalingAction, now: Instant) {
        let mut changed = false;

        match action.directive {
            ScalingDirective::ScaleUp => {
                let mut current = window.tunnel_count;
                while current < action.target_count {
                    match self.cluster.add_capacity(window.utilization).await {
                        Ok(_) => {
                            changed = true;
                            current = self.manager.tunnel_count().await;
                        }
                        Err(e) => {
                            warn!(error = %e, at = current, "scale-up stopped early");
                            break;
                        }
                    }
                }
                if changed {
                    self.exporter.inc_scale_action("up");
                    self.cooldowns.lock().await.last_scale_up = Some(now);
                }
            }
            ScalingDirective::ScaleDown => {
                match self.manager.remove_tunnel().await {
                    Ok(id) => {
                        changed = true;
                        debug!(id, "tunnel removed");
                    }
                    Err(e) => warn!(error = %e, "scale-down failed"),
                }
                if changed {
                    self.exporter.inc_scale_action("down");
                    self.cooldowns.lock().await.last_scale_down = Some(now);
                }
            }
            ScalingDirective::NoAction => {}
        }
    }

    /// Current utilization plus tunnel-count and instance-tier guidance
    pub async fn recommendation(&self) -> ScalingRecommendation {
        let window = self.observe().await;
        let min = self.manager.config().min_tunnels;
        let max = self.manager.config().max_tunnels;

        let capacity = self.config.per_tunnel_capacity_bps as f64;
        let ideal = (window.total_throughput_bps as f64 / capacity / RECOMMENDED_UTILIZATION).ceil()
            as u32;
        let recommended_tunnels = ideal.clamp(min, max);

        let recommended_tier: InstanceTier =
            tiers::select_tier(window.total_throughput_bps / 8, DEFAULT_TIER_BUDGET_USD).clone();

        let mut reasoning = Vec::new();
        if window.utilization > self.config.scale_up_threshold {
            reasoning.push("high utilization - consider scaling up".to_string());
        }
        if window.elephant_flows > 0 {
            reasoning.push(format!(
                "{} elephant flows detected - additional tunnels recommended",
                window.elephant_flows
            ));
        }

        ScalingRecommendation {
            current_utilization: window.utilization,
            current_tunnels: window.tunnel_count,
            recommended_tunnels,
            recommended_tier,
            reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn window(n: u32, utilization: f64) -> MetricsWindow {
        MetricsWindow {
            tunnel_count: n,
            utilization,
            elephant_flows: 0,
            recent_bursts: 0,
            total_throughput_bps: 0,
        }
    }

    fn config() -> ScalingConfig {
        ScalingConfig {
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            ..ScalingConfig::default()
        }
    }

    #[test]
    fn test_high_utilization_scales_up_by_one() {
        let action = decide(&config(), 1, 8, &window(2, 0.9), &Cooldowns::default(), Instant::now());
        assert_eq!(action.directive, ScalingDirective::ScaleUp);
        assert_eq!(action.target_count, 3);
        assert!(action.reason.contains("high utilization"));
    }

    #[test]
    fn test_low_utilization_scales_down_by_one() {
        let action = decide(&config(), 1, 8, &window(2, 0.2), &Cooldowns::default(), Instant::now());
        assert_eq!(action.directive, ScalingDirective::ScaleDown);
        assert_eq!(action.target_count, 1);
        assert!(action.reason.contains("low utilization"));
    }

    #[test]
    fn test_up_cooldown_blocks_scale_up() {
        let cooldowns = Cooldowns {
            last_scale_up: Some(Instant::now()),
            last_scale_down: None,
        };
        let action = decide(&config(), 1, 8, &window(2, 0.9), &cooldowns, Instant::now());
        assert_eq!(action.directive, ScalingDirective::NoAction);
    }

    #[test]
    fn test_elephant_flows_supersede_utilization() {
        let mut w = window(2, 0.9);
        w.elephant_flows = 4;
        let action = decide(&config(), 1, 8, &w, &Cooldowns::default(), Instant::now());
        assert_eq!(action.directive, ScalingDirective::ScaleUp);
        assert_eq!(action.target_count, 4);
        assert!(action.reason.contains("elephant flow"));
    }

    #[test]
    fn test_elephant_target_clamped_to_max() {
        let mut w = window(2, 0.5);
        w.elephant_flows = 12;
        let action = decide(&config(), 1, 8, &w, &Cooldowns::default(), Instant::now());
        assert_eq!(action.target_count, 8);
    }

    #[test]
    fn test_at_max_no_action() {
        let action = decide(&config(), 1, 8, &window(8, 0.95), &Cooldowns::default(), Instant::now());
        assert_eq!(action.directive, ScalingDirective::NoAction);
    }

    #[test]
    fn test_at_min_no_scale_down() {
        let action = decide(&config(), 1, 8, &window(1, 0.1), &Cooldowns::default(), Instant::now());
        assert_eq!(action.directive, ScalingDirective::NoAction);
    }

    #[test]
    fn test_burst_pattern_adds_two() {
        let mut w = window(2, 0.5);
        w.recent_bursts = 3;
        let action = decide(&config(), 1, 8, &w, &Cooldowns::default(), Instant::now());
        assert_eq!(action.directive, ScalingDirective::ScaleUp);
        assert_eq!(action.target_count, 4);
        assert!(action.reason.contains("burst pattern"));
    }

    #[test]
    fn test_cooldowns_are_independent() {
        // A recent scale-down does not block an upward decision
        let cooldowns = Cooldowns {
            last_scale_up: None,
            last_scale_down: Some(Instant::now()),
        };
        let action = decide(&config(), 1, 8, &window(2, 0.9), &cooldowns, Instant::now());
        assert_eq!(action.directive, ScalingDirective::ScaleUp);
    }

    #[test]
    fn test_expired_cooldown_allows_action() {
        let config = ScalingConfig {
            scale_up_cooldown: Duration::from_millis(1),
            ..config()
        };
        let old = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        let cooldowns = Cooldowns {
            last_scale_up: Some(old),
            last_scale_down: None,
        };
        let action = decide(&config, 1, 8, &window(2, 0.9), &cooldowns, Instant::now());
        assert_eq!(action.directive, ScalingDirective::ScaleUp);
    }

    mod live {
        use super::*;
        use crate::provision::{MockProvisioner, Provisioner};
        use crate::scaler::cluster::ClusterManager;
        use crate::tunnel::{MockDriver, TunnelConfig, TunnelDriver, TunnelManager};
        use std::sync::Arc;

        async fn scaler_fixture(
            dir: &std::path::Path,
        ) -> (Arc<TunnelManager>, Arc<MockDriver>, Arc<TunnelScaler>) {
            let driver = Arc::new(MockDriver::new());
            let manager = Arc::new(
                TunnelManager::new(
                    TunnelConfig {
                        min_tunnels: 1,
                        max_tunnels: 8,
                        config_dir: dir.to_path_buf(),
                        ..TunnelConfig::default()
                    },
                    driver.clone() as Arc<dyn TunnelDriver>,
                )
                .unwrap(),
            );
            let config = ScalingConfig {
                process_pinning_enabled: false,
                ..ScalingConfig::default()
            };
            let cluster = Arc::new(ClusterManager::new(
                config.clone(),
                manager.clone(),
                Arc::new(MockProvisioner::new()) as Arc<dyn Provisioner>,
                "us-west-2",
            ));
            let scaler = TunnelScaler::new(config, manager.clone(), cluster).unwrap();
            (manager, driver, scaler)
        }

        #[tokio::test]
        async fn test_cycle_scales_up_on_high_utilization() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _driver, scaler) = scaler_fixture(dir.path()).await;
            manager.create_tunnels(2).await.unwrap();

            // Push both tunnels near capacity
            for tunnel in manager.tunnels().await {
                tunnel.update_metrics(|m| {
                    m.throughput_bps = 1_400_000_000;
                    m.last_update = Some(Utc::now());
                });
            }

            scaler.cycle().await;
            assert_eq!(manager.tunnel_count().await, 3);

            // Utilization stays high, but the up-cooldown blocks a second
            // action inside the same window
            for tunnel in manager.tunnels().await {
                tunnel.update_metrics(|m| {
                    m.throughput_bps = 1_400_000_000;
                    m.last_update = Some(Utc::now());
                });
            }
            scaler.cycle().await;
            assert_eq!(manager.tunnel_count().await, 3);
        }

        #[tokio::test]
        async fn test_cycle_scales_down_when_idle() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _driver, scaler) = scaler_fixture(dir.path()).await;
            manager.create_tunnels(3).await.unwrap();

            scaler.cycle().await;
            assert_eq!(manager.tunnel_count().await, 2);
        }

        #[tokio::test]
        async fn test_start_stop_terminates() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _driver, scaler) = scaler_fixture(dir.path()).await;
            manager.create_tunnels(1).await.unwrap();

            scaler.start().await;
            scaler.stop().await;
        }

        #[tokio::test]
        async fn test_recommendation_reports_current_shape() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _driver, scaler) = scaler_fixture(dir.path()).await;
            manager.create_tunnels(2).await.unwrap();

            let rec = scaler.recommendation().await;
            assert_eq!(rec.current_tunnels, 2);
            assert!(rec.recommended_tunnels >= 1);
            assert!(!rec.recommended_tier.name.is_empty());
        }
    }
}
