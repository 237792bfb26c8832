//! Layered configuration for the CLI
//!
//! Defaults, then an optional YAML file at `$HOME/.burrow/config.yaml`,
//! then `BURROW_*` environment variables, each layer overriding the
//! previous one.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use burrow_lib::probe::ProbeConfig;
use burrow_lib::scaler::ScalingConfig;
use burrow_lib::tunnel::TunnelConfig;
use serde::Deserialize;

/// Complete application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BurrowConfig {
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub scaling: ScalingSection,
    #[serde(default)]
    pub probe: ProbeSection,
    /// Port for the health/metrics API served while `up` runs
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_min_tunnels")]
    pub min_tunnels: u32,
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: u32,
    #[serde(default = "default_base_cidr")]
    pub base_cidr: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_listen_port")]
    pub base_listen_port: u16,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScalingSection {
    #[serde(default = "default_scale_up")]
    pub scale_up_threshold: f64,
    #[serde(default = "default_scale_down")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_scale_interval_secs")]
    pub scale_interval_secs: u64,
    #[serde(default = "default_up_cooldown_secs")]
    pub scale_up_cooldown_secs: u64,
    #[serde(default = "default_down_cooldown_secs")]
    pub scale_down_cooldown_secs: u64,
    #[serde(default = "default_pinning")]
    pub process_pinning_enabled: bool,
    #[serde(default = "default_reserved_cores")]
    pub reserved_cores: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    #[serde(default = "default_test_duration_secs")]
    pub test_duration_secs: u64,
    #[serde(default = "default_mtu_candidates")]
    pub mtu_candidates: Vec<u32>,
    #[serde(default = "default_stream_counts")]
    pub parallel_stream_counts: Vec<u32>,
    #[serde(default = "default_latency_samples")]
    pub latency_sample_count: u32,
    #[serde(default = "default_regions")]
    pub regions_to_test: Vec<String>,
    #[serde(default = "default_large_frames")]
    pub enable_large_frames: bool,
}

fn default_api_port() -> u16 {
    8080
}
fn default_region() -> String {
    "us-west-2".to_string()
}
fn default_min_tunnels() -> u32 {
    1
}
fn default_max_tunnels() -> u32 {
    8
}
fn default_base_cidr() -> String {
    "10.100.0.0/16".to_string()
}
fn default_mtu() -> u32 {
    1420
}
fn default_listen_port() -> u16 {
    51820
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/burrow")
}
fn default_scale_up() -> f64 {
    0.80
}
fn default_scale_down() -> f64 {
    0.30
}
fn default_scale_interval_secs() -> u64 {
    30
}
fn default_up_cooldown_secs() -> u64 {
    120
}
fn default_down_cooldown_secs() -> u64 {
    600
}
fn default_pinning() -> bool {
    true
}
fn default_reserved_cores() -> usize {
    2
}
fn default_test_duration_secs() -> u64 {
    30
}
fn default_mtu_candidates() -> Vec<u32> {
    vec![1200, 1500, 1800, 9000]
}
fn default_stream_counts() -> Vec<u32> {
    vec![1, 2, 4, 8]
}
fn default_latency_samples() -> u32 {
    100
}
fn default_regions() -> Vec<String> {
    vec![
        "us-west-2".to_string(),
        "us-east-1".to_string(),
        "eu-west-1".to_string(),
    ]
}
fn default_large_frames() -> bool {
    true
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            min_tunnels: default_min_tunnels(),
            max_tunnels: default_max_tunnels(),
            base_cidr: default_base_cidr(),
            mtu: default_mtu(),
            base_listen_port: default_listen_port(),
            config_dir: default_config_dir(),
        }
    }
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            scale_up_threshold: default_scale_up(),
            scale_down_threshold: default_scale_down(),
            scale_interval_secs: default_scale_interval_secs(),
            scale_up_cooldown_secs: default_up_cooldown_secs(),
            scale_down_cooldown_secs: default_down_cooldown_secs(),
            process_pinning_enabled: default_pinning(),
            reserved_cores: default_reserved_cores(),
        }
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            test_duration_secs: default_test_duration_secs(),
            mtu_candidates: default_mtu_candidates(),
            parallel_stream_counts: default_stream_counts(),
            latency_sample_count: default_latency_samples(),
            regions_to_test: default_regions(),
            enable_large_frames: default_large_frames(),
        }
    }
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelSection::default(),
            scaling: ScalingSection::default(),
            probe: ProbeSection::default(),
            api_port: default_api_port(),
            region: default_region(),
        }
    }
}

impl BurrowConfig {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file path (used by tests and
    /// `--config`)
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = path.or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".burrow").join("config.yaml"))
        });
        if let Some(file) = file {
            if file.exists() {
                builder = builder.add_source(config::File::from(file));
            }
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("BURROW").separator("__"))
            .build()?;

        let loaded: BurrowConfig = settings
            .try_deserialize()
            .unwrap_or_else(|_| BurrowConfig::default());
        Ok(loaded)
    }

    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        Ok(TunnelConfig {
            min_tunnels: self.tunnel.min_tunnels,
            max_tunnels: self.tunnel.max_tunnels,
            base_cidr: self.tunnel.base_cidr.parse()?,
            mtu: self.tunnel.mtu,
            base_listen_port: self.tunnel.base_listen_port,
            config_dir: self.tunnel.config_dir.clone(),
        })
    }

    pub fn scaling_config(&self) -> ScalingConfig {
        ScalingConfig {
            scale_up_threshold: self.scaling.scale_up_threshold,
            scale_down_threshold: self.scaling.scale_down_threshold,
            scale_interval: Duration::from_secs(self.scaling.scale_interval_secs),
            scale_up_cooldown: Duration::from_secs(self.scaling.scale_up_cooldown_secs),
            scale_down_cooldown: Duration::from_secs(self.scaling.scale_down_cooldown_secs),
            process_pinning_enabled: self.scaling.process_pinning_enabled,
            reserved_cores: self.scaling.reserved_cores,
            ..ScalingConfig::default()
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            test_duration: Duration::from_secs(self.probe.test_duration_secs),
            mtu_candidates: self.probe.mtu_candidates.clone(),
            parallel_stream_counts: self.probe.parallel_stream_counts.clone(),
            latency_sample_count: self.probe.latency_sample_count,
            regions_to_test: self.probe.regions_to_test.clone(),
            enable_large_frames: self.probe.enable_large_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = BurrowConfig::default();
        assert_eq!(config.tunnel.min_tunnels, 1);
        assert_eq!(config.tunnel.max_tunnels, 8);
        assert_eq!(config.tunnel.base_listen_port, 51820);
        assert!(config.scaling.scale_up_threshold > config.scaling.scale_down_threshold);
        assert!(config.tunnel_config().is_ok());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "tunnel:\n  max_tunnels: 4\n  mtu: 9000\nregion: eu-west-1\n",
        )
        .unwrap();

        let config = BurrowConfig::load_from(Some(path)).unwrap();
        assert_eq!(config.tunnel.max_tunnels, 4);
        assert_eq!(config.tunnel.mtu, 9000);
        assert_eq!(config.region, "eu-west-1");
        // Untouched fields keep their defaults
        assert_eq!(config.tunnel.min_tunnels, 1);
    }
}
