//! Equal-cost route installation across the tunnel set
//!
//! Each active tunnel gets a default route in its own routing table plus
//! a policy rule steering its source address into that table. The host's
//! flow hash then spreads connections across the resulting next-hops.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::TunnelError;

const ROUTE_DEADLINE: Duration = Duration::from_secs(10);

/// One tunnel's contribution to the equal-cost set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub interface: String,
    pub source: Ipv4Addr,
    pub table: u32,
}

impl RouteSpec {
    /// The iproute2 command lines that install this leg
    pub fn install_commands(&self) -> Vec<Vec<String>> {
        let table = self.table.to_string();
        vec![
            vec![
                "route".into(),
                "replace".into(),
                "0.0.0.0/0".into(),
                "dev".into(),
                self.interface.clone(),
                "table".into(),
                table.clone(),
            ],
            vec![
                "rule".into(),
                "add".into(),
                "from".into(),
                self.source.to_string(),
                "table".into(),
                table,
            ],
        ]
    }
}

/// Install every spec's routes and rules. The first failing command maps
/// to a routing error; tunnels themselves are left untouched.
pub async fn install(specs: &[RouteSpec]) -> Result<(), TunnelError> {
    for spec in specs {
        for args in spec.install_commands() {
            debug!(interface = %spec.interface, ?args, "installing route leg");
            run_ip(&args).await?;
        }
    }
    Ok(())
}

async fn run_ip(args: &[String]) -> Result<(), TunnelError> {
    let result = timeout(
        ROUTE_DEADLINE,
        Command::new("sudo").arg("ip").args(args).output(),
    )
    .await;
    let output = match result {
        Err(_) => return Err(TunnelError::Routing(format!("ip {} timed out", args.join(" ")))),
        Ok(Err(e)) => return Err(TunnelError::Routing(format!("ip: {e}"))),
        Ok(Ok(output)) => output,
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TunnelError::Routing(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_commands_shape() {
        let spec = RouteSpec {
            interface: "wg2".to_string(),
            source: "10.100.3.1".parse().unwrap(),
            table: 202,
        };
        let cmds = spec.install_commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(
            cmds[0].join(" "),
            "route replace 0.0.0.0/0 dev wg2 table 202"
        );
        assert_eq!(cmds[1].join(" "), "rule add from 10.100.3.1 table 202");
    }
}
