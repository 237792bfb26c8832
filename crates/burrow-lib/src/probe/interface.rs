//! Local interface introspection
//!
//! Reads the default-route egress device and its capabilities from the
//! usual places: `ip route` for the device, sysfs for MTU/speed/queues,
//! ethtool for driver identity and offload feature states.

use std::collections::HashMap;
use std::path::Path;

use tokio::fs;
use tokio::process::Command;

use crate::models::LocalInterface;

use super::ProbeError;

/// Discover the default-route interface and populate its details
pub async fn discover_default_interface() -> Result<LocalInterface, ProbeError> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await
        .map_err(|e| ProbeError::Interface(format!("ip route: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    let name = parse_default_route(&stdout)
        .ok_or_else(|| ProbeError::Interface("could not determine default interface".to_string()))?;

    let mut iface = LocalInterface {
        name: name.clone(),
        ..LocalInterface::default()
    };
    populate_details(&mut iface).await?;
    Ok(iface)
}

/// Extract the device name from `ip route show default` output
pub fn parse_default_route(output: &str) -> Option<String> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    fields
        .iter()
        .position(|f| *f == "dev")
        .and_then(|pos| fields.get(pos + 1))
        .map(|name| (*name).to_string())
}

async fn populate_details(iface: &mut LocalInterface) -> Result<(), ProbeError> {
    let sys = Path::new("/sys/class/net").join(&iface.name);

    let mtu = fs::read_to_string(sys.join("mtu"))
        .await
        .map_err(|e| ProbeError::Interface(format!("{} has no readable mtu: {e}", iface.name)))?;
    iface.current_mtu = mtu
        .trim()
        .parse()
        .map_err(|e| ProbeError::Interface(format!("bad mtu value: {e}")))?;

    // Link speed is reported in Mbps; virtual devices report -1
    if let Ok(speed) = fs::read_to_string(sys.join("speed")).await {
        if let Ok(mbps) = speed.trim().parse::<i64>() {
            if mbps > 0 {
                iface.link_speed_bps = mbps as u64 * 1_000_000;
            }
        }
    }

    if let Ok(mut entries) = fs::read_dir(sys.join("queues")).await {
        let mut rx = 0u32;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with("rx-") {
                rx += 1;
            }
        }
        iface.queue_count = rx;
    }

    if let Ok(output) = Command::new("ethtool").args(["-i", &iface.name]).output().await {
        if let Some(driver) = parse_ethtool_driver(&String::from_utf8_lossy(&output.stdout)) {
            iface.driver = driver;
        }
    }

    if let Ok(output) = Command::new("ethtool").args(["-k", &iface.name]).output().await {
        iface.offload_features = parse_offload_features(&String::from_utf8_lossy(&output.stdout));
    }

    Ok(())
}

/// Pull the `driver:` line out of `ethtool -i` output
pub fn parse_ethtool_driver(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("driver:"))
        .map(|driver| driver.trim().to_string())
        .filter(|driver| !driver.is_empty())
}

/// Parse `ethtool -k` feature lines into a name -> enabled map. Lines
/// carrying qualifiers like "[fixed]" still parse by their leading state.
pub fn parse_offload_features(output: &str) -> HashMap<String, bool> {
    let mut features = HashMap::new();
    for line in output.lines() {
        let Some((name, state)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let state = state.trim();
        if name.is_empty() || name.starts_with("Features for") {
            continue;
        }
        let enabled = state == "on" || state.starts_with("on ");
        features.insert(name.to_string(), enabled);
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        let output = "default via 192.168.1.1 dev enp5s0 proto dhcp metric 100\n";
        assert_eq!(parse_default_route(output), Some("enp5s0".to_string()));
        assert_eq!(parse_default_route(""), None);
        assert_eq!(parse_default_route("default via 192.168.1.1"), None);
    }

    #[test]
    fn test_parse_ethtool_driver() {
        let output = "driver: mlx5_core\nversion: 5.15\nfirmware-version: 16.35\n";
        assert_eq!(parse_ethtool_driver(output), Some("mlx5_core".to_string()));
        assert_eq!(parse_ethtool_driver("version: 5.15\n"), None);
    }

    #[test]
    fn test_parse_offload_features() {
        let output = "Features for enp5s0:\n\
                      rx-checksumming: on\n\
                      tx-checksumming: on\n\
                      generic-segmentation-offload: off\n\
                      tcp-segmentation-offload: on [fixed]\n";
        let features = parse_offload_features(output);
        assert_eq!(features.get("rx-checksumming"), Some(&true));
        assert_eq!(features.get("generic-segmentation-offload"), Some(&false));
        assert_eq!(features.get("tcp-segmentation-offload"), Some(&true));
        assert!(!features.contains_key("Features for enp5s0"));
    }
}
