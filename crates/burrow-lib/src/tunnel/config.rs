//! Rendering and persistence of per-tunnel configuration files
//!
//! Each tunnel is described by a wg-quick style text file with an
//! `[Interface]` section and an optional `[Peer]` section. The PostUp and
//! PostDown commands install a dedicated routing table for the interface
//! plus a policy rule selecting it by source address, which together form
//! the per-tunnel leg of the equal-cost route set.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use super::TunnelError;

/// Keepalive the peer section always carries, in seconds
pub const PERSISTENT_KEEPALIVE_SECS: u32 = 25;

/// Routing tables for tunnels start here; tunnel `i` uses `BASE_TABLE + i`
pub const BASE_TABLE: u32 = 200;

/// Everything needed to render one tunnel's configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Interface name, e.g. "wg0"
    pub interface: String,
    /// Base64 private key (44 chars)
    pub private_key: String,
    /// Local address with prefix, e.g. "10.100.1.1/24"
    pub address: String,
    pub listen_port: u16,
    /// Omitted from the rendered file when zero
    pub mtu: u32,
    /// Routing table this tunnel's routes live in
    pub table: u32,
    /// Peer section is rendered only when this is set
    pub peer_public_key: Option<String>,
    /// Peer endpoint as host:port
    pub peer_endpoint: Option<String>,
    pub allowed_ips: String,
}

impl InterfaceSpec {
    /// The source address without its prefix length
    pub fn source_address(&self) -> &str {
        self.address.split('/').next().unwrap_or(&self.address)
    }
}

/// Render the configuration file contents for one tunnel
pub fn render(spec: &InterfaceSpec) -> String {
    let mut out = String::new();
    let src = spec.source_address();

    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", spec.private_key);
    let _ = writeln!(out, "Address = {}", spec.address);
    let _ = writeln!(out, "ListenPort = {}", spec.listen_port);
    if spec.mtu > 0 {
        let _ = writeln!(out, "MTU = {}", spec.mtu);
    }
    let _ = writeln!(
        out,
        "PostUp = ip route add 0.0.0.0/0 dev {} table {}",
        spec.interface, spec.table
    );
    let _ = writeln!(out, "PostUp = ip rule add from {} table {}", src, spec.table);
    let _ = writeln!(
        out,
        "PostDown = ip route del 0.0.0.0/0 dev {} table {}",
        spec.interface, spec.table
    );
    let _ = writeln!(out, "PostDown = ip rule del from {} table {}", src, spec.table);

    if let Some(peer_key) = &spec.peer_public_key {
        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer_key);
        if let Some(endpoint) = &spec.peer_endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if !spec.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", spec.allowed_ips);
        }
        let _ = writeln!(out, "PersistentKeepalive = {}", PERSISTENT_KEEPALIVE_SECS);
    }

    out
}

/// Parse a previously rendered configuration file back into a spec.
///
/// Only the keys this crate renders are recognized; unknown lines are
/// ignored so hand-edited files still load. Used to rebuild manager state
/// from the config directory, which is the only durable artifact.
pub fn parse(contents: &str) -> InterfaceSpec {
    let mut spec = InterfaceSpec::default();
    let mut in_peer = false;

    for line in contents.lines() {
        let line = line.trim();
        if line == "[Peer]" {
            in_peer = true;
            continue;
        }
        if line == "[Interface]" {
            in_peer = false;
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match (in_peer, key) {
            (false, "PrivateKey") => spec.private_key = value.to_string(),
            (false, "Address") => spec.address = value.to_string(),
            (false, "ListenPort") => spec.listen_port = value.parse().unwrap_or(0),
            (false, "MTU") => spec.mtu = value.parse().unwrap_or(0),
            (false, "PostUp") => {
                // Recover interface name and table id from the route command
                let fields: Vec<&str> = value.split_whitespace().collect();
                if let Some(pos) = fields.iter().position(|f| *f == "dev") {
                    if let Some(name) = fields.get(pos + 1) {
                        spec.interface = (*name).to_string();
                    }
                }
                if let Some(pos) = fields.iter().position(|f| *f == "table") {
                    if let Some(table) = fields.get(pos + 1) {
                        spec.table = table.parse().unwrap_or(spec.table);
                    }
                }
            }
            (true, "PublicKey") => spec.peer_public_key = Some(value.to_string()),
            (true, "Endpoint") => spec.peer_endpoint = Some(value.to_string()),
            (true, "AllowedIPs") => spec.allowed_ips = value.to_string(),
            _ => {}
        }
    }

    spec
}

/// Path of the config file for an interface inside a config directory
pub fn config_path(dir: &Path, interface: &str) -> PathBuf {
    dir.join(format!("{interface}.conf"))
}

/// Write a tunnel config with owner-only permissions.
///
/// The private key lives in this file, so it is created 0600 before any
/// contents land in it.
pub async fn write(dir: &Path, spec: &InterfaceSpec) -> Result<PathBuf, TunnelError> {
    fs::create_dir_all(dir).await?;
    let path = config_path(dir, &spec.interface);
    let contents = render(spec);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        use tokio::io::AsyncWriteExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
    }
    #[cfg(not(unix))]
    fs::write(&path, contents.as_bytes()).await?;

    Ok(path)
}

/// Remove a tunnel config file. Missing or undeletable files are logged
/// and otherwise ignored; the interface is already gone at this point.
pub async fn remove(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove tunnel config");
        }
    }
}
