//! Tunnel lifecycle management
//!
//! The manager owns the client-side tunnel set: it allocates addressing
//! and ports, renders per-tunnel configuration, and drives an abstract
//! tunnel driver to bring interfaces up and down. Two drivers exist: one
//! shelling out to the host's wg-quick tooling, and an in-process double
//! for tests.

pub mod collector;
pub mod config;
pub mod keys;
mod manager;
mod mock;
pub mod routes;
mod wg_quick;

pub use collector::{CollectorConfig, MetricsCollector};
pub use keys::Keypair;
pub use manager::{Tunnel, TunnelManager};
pub use mock::MockDriver;
pub use wg_quick::WgQuickDriver;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by tunnel lifecycle operations
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A requested tunnel count falls outside the configured bounds
    #[error("requested tunnel count ({requested}) out of range [{min}, {max}]")]
    OutOfRange { requested: u32, min: u32, max: u32 },

    /// The tunnel set is already at its configured maximum
    #[error("maximum tunnel count reached ({0})")]
    AtMaxTunnels(u32),

    /// The tunnel set is already at its configured minimum
    #[error("minimum tunnel count reached ({0})")]
    AtMinTunnels(u32),

    /// The tunnel driver failed or timed out
    #[error("tunnel driver: {0}")]
    Driver(String),

    /// Route or policy-rule installation failed; tunnels remain up
    #[error("routing: {0}")]
    Routing(String),

    /// Config file handling failed
    #[error("tunnel config: {0}")]
    Config(#[from] std::io::Error),
}

/// Manager-wide tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Minimum tunnels kept alive
    pub min_tunnels: u32,
    /// Maximum tunnels this host will run
    pub max_tunnels: u32,
    /// Network carved into per-tunnel /24s
    pub base_cidr: Ipv4Network,
    /// MTU applied to each tunnel interface (0 leaves the driver default)
    pub mtu: u32,
    /// Tunnel `i` listens on `base_listen_port + i`
    pub base_listen_port: u16,
    /// Where rendered config files live
    pub config_dir: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            min_tunnels: 1,
            max_tunnels: 8,
            base_cidr: "10.100.0.0/16".parse().expect("valid default CIDR"),
            mtu: 1420,
            base_listen_port: 51820,
            config_dir: PathBuf::from("/etc/burrow"),
        }
    }
}

/// Cumulative counters for one peer, as reported by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    /// Unix timestamp of the most recent handshake, if any
    pub latest_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl PeerStats {
    /// Parse a driver dump: one tab-separated line per peer, where column
    /// 0 is the peer public key, 4 is cumulative received bytes and 5 is
    /// cumulative transmitted bytes. Malformed lines are skipped.
    pub fn parse_dump(output: &str) -> Vec<PeerStats> {
        output
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 6 || fields[0].is_empty() {
                    return None;
                }
                let rx = fields[4].parse().ok()?;
                let tx = fields[5].parse().ok()?;
                Some(PeerStats {
                    public_key: fields[0].to_string(),
                    latest_handshake: fields.get(3).and_then(|f| f.parse().ok()).filter(|t| *t > 0),
                    rx_bytes: rx,
                    tx_bytes: tx,
                })
            })
            .collect()
    }
}

/// The capability set the manager needs from a tunnel implementation.
///
/// Driver-specific failures are folded into [`TunnelError::Driver`] so no
/// concrete driver type leaks into the manager's error surface.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Bring an interface up from its rendered config file
    async fn bring_up(&self, config_path: &Path) -> Result<(), TunnelError>;

    /// Tear an interface down by name
    async fn bring_down(&self, name: &str) -> Result<(), TunnelError>;

    /// Fetch cumulative per-peer counters for an interface
    async fn show_dump(&self, name: &str) -> Result<Vec<PeerStats>, TunnelError>;

    /// Check that an interface exists and is operational. Advisory.
    async fn validate(&self, name: &str) -> Result<(), TunnelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump_single_peer() {
        let dump = "pubkeyAAA\t(none)\t1.2.3.4:51820\t1716200000\t123456\t654321\t25\n";
        let peers = PeerStats::parse_dump(dump);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "pubkeyAAA");
        assert_eq!(peers[0].rx_bytes, 123_456);
        assert_eq!(peers[0].tx_bytes, 654_321);
        assert_eq!(peers[0].latest_handshake, Some(1_716_200_000));
    }

    #[test]
    fn test_parse_dump_skips_malformed_lines() {
        let dump = "short\tline\n\
                    key1\tx\t1.2.3.4:1\t0\t100\t200\t25\n\
                    key2\tx\t1.2.3.4:1\t5\tnot-a-number\t200\t25\n";
        let peers = PeerStats::parse_dump(dump);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "key1");
        // A zero handshake timestamp means "never"
        assert_eq!(peers[0].latest_handshake, None);
    }

    #[test]
    fn test_parse_dump_extra_fields_ignored() {
        let dump = "key\tpsk\tep\t7\t10\t20\t25\textra\tfields\n";
        let peers = PeerStats::parse_dump(dump);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].rx_bytes, 10);
        assert_eq!(peers[0].tx_bytes, 20);
    }

    #[test]
    fn test_boundary_error_messages() {
        assert_eq!(
            TunnelError::AtMaxTunnels(3).to_string(),
            "maximum tunnel count reached (3)"
        );
        assert_eq!(
            TunnelError::AtMinTunnels(1).to_string(),
            "minimum tunnel count reached (1)"
        );
    }
}
