//! Tunnel driver backed by the host's wg-quick and iproute2 tooling
//!
//! Every invocation runs under a deadline; a driver that hangs is
//! reported as a timeout rather than stalling a lifecycle operation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{config, PeerStats, TunnelDriver, TunnelError};

/// Default per-invocation deadline
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Driver that programs kernel interfaces through `wg-quick`, `wg` and
/// `ip`, with elevated privileges via sudo.
pub struct WgQuickDriver {
    config_dir: PathBuf,
    deadline: Duration,
}

impl WgQuickDriver {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run a command under the driver deadline and return its stdout.
    /// Non-zero exit or deadline overrun become a driver error.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, TunnelError> {
        debug!(program, ?args, "invoking host tooling");
        let result = timeout(self.deadline, Command::new(program).args(args).output()).await;

        let output = match result {
            Err(_) => {
                return Err(TunnelError::Driver(format!(
                    "{program} timed out after {:?}",
                    self.deadline
                )))
            }
            Ok(Err(e)) => return Err(TunnelError::Driver(format!("{program}: {e}"))),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::Driver(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelDriver for WgQuickDriver {
    async fn bring_up(&self, config_path: &Path) -> Result<(), TunnelError> {
        let path = config_path.to_string_lossy();
        self.run("sudo", &["wg-quick", "up", &path]).await?;
        Ok(())
    }

    async fn bring_down(&self, name: &str) -> Result<(), TunnelError> {
        let path = config::config_path(&self.config_dir, name);
        let path = path.to_string_lossy().into_owned();
        self.run("sudo", &["wg-quick", "down", &path]).await?;
        Ok(())
    }

    async fn show_dump(&self, name: &str) -> Result<Vec<PeerStats>, TunnelError> {
        let output = self.run("sudo", &["wg", "show", name, "dump"]).await?;
        // The first line of a dump describes the interface itself and has
        // too few columns to parse as a peer, so it falls out here.
        Ok(PeerStats::parse_dump(&output))
    }

    async fn validate(&self, name: &str) -> Result<(), TunnelError> {
        self.run("ip", &["link", "show", name]).await?;
        self.run("ip", &["link", "show", name, "up"]).await?;
        self.run("sudo", &["wg", "show", name]).await?;
        Ok(())
    }
}
