//! In-process tunnel driver double for tests
//!
//! Touches nothing but the filesystem: bring-up checks the rendered
//! config exists, counters are advanced by the test itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{PeerStats, TunnelDriver, TunnelError};

#[derive(Default)]
struct MockState {
    /// Interfaces currently up
    up: Vec<String>,
    /// Per-interface peer counters returned by show_dump
    stats: HashMap<String, Vec<PeerStats>>,
    /// Ordered record of driver invocations, for assertions
    calls: Vec<String>,
    /// bring_up invocations left before the next injected failure
    fail_bring_up_after: Option<usize>,
}

/// Test double recording every call and serving canned peer counters
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th subsequent bring_up call fail (0 fails the next one)
    pub fn fail_bring_up_after(&self, n: usize) {
        self.state.lock().unwrap().fail_bring_up_after = Some(n);
    }

    /// Replace the peer counters an interface will report
    pub fn set_peer_stats(&self, name: &str, stats: Vec<PeerStats>) {
        self.state.lock().unwrap().stats.insert(name.to_string(), stats);
    }

    /// Advance the first peer's cumulative counters on an interface
    pub fn advance_counters(&self, name: &str, rx_delta: u64, tx_delta: u64) {
        let mut state = self.state.lock().unwrap();
        let peers = state.stats.entry(name.to_string()).or_insert_with(|| {
            vec![PeerStats {
                public_key: format!("{name}-peer"),
                ..PeerStats::default()
            }]
        });
        if let Some(peer) = peers.first_mut() {
            peer.rx_bytes += rx_delta;
            peer.tx_bytes += tx_delta;
        }
    }

    pub fn up_interfaces(&self) -> Vec<String> {
        self.state.lock().unwrap().up.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn interface_from_path(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TunnelDriver for MockDriver {
    async fn bring_up(&self, config_path: &Path) -> Result<(), TunnelError> {
        let name = Self::interface_from_path(config_path);
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("up:{name}"));

        if let Some(remaining) = state.fail_bring_up_after {
            if remaining == 0 {
                state.fail_bring_up_after = None;
                return Err(TunnelError::Driver(format!("injected failure on {name}")));
            }
            state.fail_bring_up_after = Some(remaining - 1);
        }

        if !config_path.exists() {
            return Err(TunnelError::Driver(format!(
                "config file missing: {}",
                config_path.display()
            )));
        }

        state.up.push(name);
        Ok(())
    }

    async fn bring_down(&self, name: &str) -> Result<(), TunnelError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("down:{name}"));
        state.up.retain(|n| n != name);
        Ok(())
    }

    async fn show_dump(&self, name: &str) -> Result<Vec<PeerStats>, TunnelError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("dump:{name}"));
        if !state.up.iter().any(|n| n == name) {
            return Err(TunnelError::Driver(format!("{name} is not up")));
        }
        Ok(state.stats.get(name).cloned().unwrap_or_default())
    }

    async fn validate(&self, name: &str) -> Result<(), TunnelError> {
        let state = self.state.lock().unwrap();
        if state.up.iter().any(|n| n == name) {
            Ok(())
        } else {
            Err(TunnelError::Driver(format!("{name} not found")))
        }
    }
}
