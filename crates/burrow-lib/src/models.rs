//! Core data models shared across the prober, tunnel manager and scaler

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local network interface configuration as discovered from the host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalInterface {
    /// Interface name (e.g. "enp5s0")
    pub name: String,
    /// Link speed in bits per second
    pub link_speed_bps: u64,
    /// Currently configured MTU
    pub current_mtu: u32,
    /// NIC driver identity
    pub driver: String,
    /// Number of RX queues (multi-queue support)
    pub queue_count: u32,
    /// Offload feature states as reported by ethtool
    pub offload_features: HashMap<String, bool>,
}

/// Where throughput is being limited, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckLocation {
    /// The local NIC is the limit
    Local,
    /// The campus/institutional network is the limit
    Campus,
    /// Internet transit is the limit
    Internet,
    /// Cloud-side ingress is the limit
    Cloud,
}

impl std::fmt::Display for BottleneckLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BottleneckLocation::Local => "local",
            BottleneckLocation::Campus => "campus",
            BottleneckLocation::Internet => "internet",
            BottleneckLocation::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

/// Outcome of a single MTU probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtuTestResult {
    pub mtu: u32,
    pub throughput_bps: u64,
    pub path_ok: bool,
}

/// Outcome of a single parallel-stream bandwidth test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthTestResult {
    pub streams: u32,
    pub throughput_bps: u64,
    pub duration: Duration,
    /// True when the value came from the deterministic scaling model
    /// rather than a live measurement tool
    pub synthetic: bool,
}

/// Outcome of a latency run against one region endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyTestResult {
    pub region: String,
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
    pub stddev: Duration,
    pub packet_loss_fraction: f64,
}

/// Outcome of a congestion-window observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionTestResult {
    pub window_bytes: u64,
    pub throughput_bps: u64,
    pub rtt: Duration,
    pub algorithm: String,
}

/// Raw per-test rows backing a probe run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailedMetrics {
    pub mtu_tests: Vec<MtuTestResult>,
    pub bandwidth_tests: Vec<BandwidthTestResult>,
    pub latency_tests: Vec<LatencyTestResult>,
    pub congestion_tests: Vec<CongestionTestResult>,
}

/// Complete network discovery output. Produced once, then read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResults {
    pub timestamp: DateTime<Utc>,
    pub local_interface: LocalInterface,
    pub optimal_mtu: u32,
    /// Sustained single-stream throughput in bits per second
    pub baseline_bandwidth_bps: u64,
    /// Peak multi-stream throughput in bits per second
    pub burst_bandwidth_bps: u64,
    /// Stream count that produced the peak
    pub optimal_stream_count: u32,
    pub bottleneck_location: BottleneckLocation,
    /// Average round-trip latency per reachable region
    pub region_latencies: HashMap<String, Duration>,
    /// Ordered, human-readable tuning recommendations
    pub recommendations: Vec<String>,
    /// True when bandwidth figures came from the deterministic model
    pub synthetic_bandwidth: bool,
    pub detailed_metrics: DetailedMetrics,
}

impl ProbeResults {
    /// Multi-stream scaling efficiency (burst over baseline)
    pub fn scaling_efficiency(&self) -> f64 {
        if self.baseline_bandwidth_bps == 0 {
            return 0.0;
        }
        self.burst_bandwidth_bps as f64 / self.baseline_bandwidth_bps as f64
    }
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Inactive,
    Active,
    Error,
}

/// Counters and liveness as last reported by the tunnel driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub last_seen: Option<DateTime<Utc>>,
    /// Cumulative received bytes (monotonic, driver-reported)
    pub rx_bytes: u64,
    /// Cumulative transmitted bytes (monotonic, driver-reported)
    pub tx_bytes: u64,
    pub handshake_count: u64,
    pub measured_latency: Option<Duration>,
}

/// Derived per-cycle performance figures for one tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelMetrics {
    /// Smoothed throughput in bits per second
    pub throughput_bps: u64,
    pub packet_loss_fraction: f64,
    pub jitter: Duration,
    pub last_update: Option<DateTime<Utc>>,
}

/// Point-in-time view of one tunnel, safe to hand to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub id: u32,
    pub interface_name: String,
    pub local_address: String,
    pub listen_port: u16,
    pub state: TunnelState,
    pub status: TunnelStatus,
    pub metrics: TunnelMetrics,
}

/// A metrics sample emitted on the performance stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub tunnel_id: u32,
    pub metrics: TunnelMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottleneck_display() {
        assert_eq!(BottleneckLocation::Internet.to_string(), "internet");
        assert_eq!(BottleneckLocation::Campus.to_string(), "campus");
        assert_eq!(BottleneckLocation::Cloud.to_string(), "cloud");
        assert_eq!(BottleneckLocation::Local.to_string(), "local");
    }

    #[test]
    fn test_scaling_efficiency() {
        let results = ProbeResults {
            timestamp: Utc::now(),
            local_interface: LocalInterface::default(),
            optimal_mtu: 1500,
            baseline_bandwidth_bps: 1_000_000_000,
            burst_bandwidth_bps: 4_000_000_000,
            optimal_stream_count: 4,
            bottleneck_location: BottleneckLocation::Local,
            region_latencies: HashMap::new(),
            recommendations: vec![],
            synthetic_bandwidth: false,
            detailed_metrics: DetailedMetrics::default(),
        };
        assert!((results.scaling_efficiency() - 4.0).abs() < f64::EPSILON);
    }
}
