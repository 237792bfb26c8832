//! Dynamic tunnel scaling
//!
//! A closed-loop controller samples aggregate tunnel utilization on a
//! fixed interval and adds or removes tunnels, transitioning from
//! vertical scaling (more tunnels on one bastion) to horizontal scaling
//! (more bastions across availability zones) once a single instance is
//! saturated.

pub mod cluster;
pub mod controller;
pub mod tiers;

pub use cluster::{ClusterManager, ClusterState, InstanceState, ScalingPhase};
pub use controller::TunnelScaler;
pub use tiers::InstanceTier;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provision::ProvisionerError;
use crate::tunnel::TunnelError;

/// Errors surfaced by scaling operations
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Provisioner(#[from] ProvisionerError),
}

/// Scaling behavior knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Aggregate utilization above which a tunnel is added
    pub scale_up_threshold: f64,
    /// Aggregate utilization below which a tunnel is removed
    pub scale_down_threshold: f64,
    /// Decision cadence
    pub scale_interval: Duration,
    /// Quiet period after an upward action
    pub scale_up_cooldown: Duration,
    /// Quiet period after a downward action
    pub scale_down_cooldown: Duration,
    /// Per-flow rate that marks an elephant flow, bits/s
    pub elephant_flow_threshold_bps: u64,
    /// Rolling window for burst-event bookkeeping
    pub burst_window: Duration,
    /// Assumed per-tunnel throughput ceiling, bits/s
    pub per_tunnel_capacity_bps: u64,
    /// Vertical-phase limit before horizontal scaling is considered
    pub max_tunnels_per_instance: u32,
    /// Hard cap on bastion instances
    pub max_instances: u32,
    /// Availability zones used round-robin in the horizontal phase
    pub max_zones: u32,
    /// Utilization that, at the per-instance tunnel limit, triggers the
    /// phase transition
    pub vertical_to_horizontal_utilization_threshold: f64,
    /// Pin each tunnel's driver worker to a core
    pub process_pinning_enabled: bool,
    /// Cores left to the system before pinning assignments start
    pub reserved_cores: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.80,
            scale_down_threshold: 0.30,
            scale_interval: Duration::from_secs(30),
            scale_up_cooldown: Duration::from_secs(2 * 60),
            scale_down_cooldown: Duration::from_secs(10 * 60),
            elephant_flow_threshold_bps: 800_000_000,
            burst_window: Duration::from_secs(5 * 60),
            per_tunnel_capacity_bps: 1_500_000_000,
            max_tunnels_per_instance: 8,
            max_instances: 4,
            max_zones: 3,
            vertical_to_horizontal_utilization_threshold: 0.85,
            process_pinning_enabled: true,
            reserved_cores: 2,
        }
    }
}

impl ScalingConfig {
    /// Thresholds must leave a dead band between scale-down and scale-up
    pub fn validate(&self) -> Result<(), String> {
        if self.scale_up_threshold <= self.scale_down_threshold {
            return Err(format!(
                "scale_up_threshold ({}) must exceed scale_down_threshold ({})",
                self.scale_up_threshold, self.scale_down_threshold
            ));
        }
        if self.per_tunnel_capacity_bps == 0 {
            return Err("per_tunnel_capacity_bps must be positive".to_string());
        }
        Ok(())
    }
}

/// What a decision cycle chose to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirective {
    ScaleUp,
    ScaleDown,
    NoAction,
}

/// One scaling decision, with the reasoning attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingAction {
    pub directive: ScalingDirective,
    /// Tunnel count the decision aims for
    pub target_count: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// A cycle that saw per-tunnel throughput spike above the burst ratio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstEvent {
    pub timestamp: DateTime<Utc>,
    pub peak_throughput_bps: u64,
    pub tunnel_count: u32,
}

/// Operator-facing scaling guidance
#[derive(Debug, Clone, Serialize)]
pub struct ScalingRecommendation {
    pub current_utilization: f64,
    pub current_tunnels: u32,
    pub recommended_tunnels: u32,
    pub recommended_tier: InstanceTier,
    pub reasoning: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(ScalingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let config = ScalingConfig {
            scale_up_threshold: 0.2,
            scale_down_threshold: 0.8,
            ..ScalingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
