//! Tunnel set lifecycle
//!
//! The manager owns a dense, id-indexed tunnel set: ids always cover
//! `0..N`, growth appends the next id and shrinkage removes the highest.
//! Lifecycle operations serialize on an internal mutex; the tunnel list
//! lock is only held for short, non-blocking sections so metrics
//! collection and status snapshots never wait on driver I/O.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::models::{MetricsSample, TunnelMetrics, TunnelSnapshot, TunnelState, TunnelStatus};

use super::config::{self, InterfaceSpec, BASE_TABLE};
use super::keys::Keypair;
use super::routes::{self, RouteSpec};
use super::{TunnelConfig, TunnelDriver, TunnelError};

/// Capacity of the performance stream; slow consumers lose the oldest
/// samples rather than blocking the collector.
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Cloud-side peer the tunnels connect to
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer's base64 public key
    pub public_key: String,
    /// Peer host (public IP or name); tunnel `i` dials port base + i
    pub host: String,
}

/// One point-to-point tunnel. Identity fields are fixed at creation;
/// state, status and metrics sit behind the tunnel's own lock.
pub struct Tunnel {
    pub id: u32,
    pub interface_name: String,
    pub private_key: String,
    pub public_key: String,
    pub local_address: Ipv4Network,
    pub listen_port: u16,
    pub peer_public_key: Option<String>,
    pub peer_endpoint: Option<String>,
    pub config_path: PathBuf,
    pub created_at: DateTime<Utc>,
    state: StdRwLock<TunnelState>,
    status: StdRwLock<TunnelStatus>,
    metrics: StdRwLock<TunnelMetrics>,
}

impl Tunnel {
    pub fn state(&self) -> TunnelState {
        *self.state.read().unwrap()
    }

    pub(crate) fn set_state(&self, state: TunnelState) {
        *self.state.write().unwrap() = state;
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.read().unwrap().clone()
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut TunnelStatus)) {
        f(&mut self.status.write().unwrap());
    }

    pub fn metrics(&self) -> TunnelMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub(crate) fn update_metrics(&self, f: impl FnOnce(&mut TunnelMetrics)) {
        f(&mut self.metrics.write().unwrap());
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            id: self.id,
            interface_name: self.interface_name.clone(),
            local_address: self.local_address.to_string(),
            listen_port: self.listen_port,
            state: self.state(),
            status: self.status(),
            metrics: self.metrics(),
        }
    }
}

/// Owns the complete state machine of the client-side tunnel set
pub struct TunnelManager {
    config: TunnelConfig,
    driver: Arc<dyn TunnelDriver>,
    peer: StdRwLock<Option<PeerInfo>>,
    /// Dense by id: `tunnels[i].id == i`
    tunnels: RwLock<Vec<Arc<Tunnel>>>,
    /// Serializes create/add/remove so contiguity holds without pinning
    /// the tunnel list lock across driver calls
    lifecycle: Mutex<()>,
    samples_tx: broadcast::Sender<MetricsSample>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, driver: Arc<dyn TunnelDriver>) -> Result<Self, TunnelError> {
        if config.min_tunnels < 1 {
            return Err(TunnelError::OutOfRange {
                requested: config.min_tunnels,
                min: 1,
                max: config.max_tunnels,
            });
        }
        if config.max_tunnels < config.min_tunnels || config.max_tunnels > 254 {
            return Err(TunnelError::OutOfRange {
                requested: config.max_tunnels,
                min: config.min_tunnels,
                max: 254,
            });
        }
        let (samples_tx, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            driver,
            peer: StdRwLock::new(None),
            tunnels: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            samples_tx,
        })
    }

    /// Rebuild a manager from the config files a previous run left on
    /// disk. Interfaces that still validate come back Active; the rest
    /// come back Inactive. Ids must form a contiguous prefix; anything
    /// past a gap is ignored with a warning.
    pub async fn discover(
        config: TunnelConfig,
        driver: Arc<dyn TunnelDriver>,
    ) -> Result<Self, TunnelError> {
        let manager = Self::new(config, driver)?;

        let mut found: Vec<(u32, InterfaceSpec)> = Vec::new();
        let mut entries = match tokio::fs::read_dir(&manager.config.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manager),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name
                .strip_prefix("wg")
                .and_then(|rest| rest.strip_suffix(".conf"))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            let contents = tokio::fs::read_to_string(entry.path()).await?;
            found.push((id, config::parse(&contents)));
        }
        found.sort_by_key(|(id, _)| *id);

        let mut rebuilt = Vec::new();
        for (expected, (id, spec)) in found.into_iter().enumerate() {
            if id != expected as u32 {
                warn!(id, expected, "non-contiguous tunnel config found, ignoring the rest");
                break;
            }
            let public_key = super::keys::public_from_private(&spec.private_key)
                .unwrap_or_default();
            let local_address = spec
                .address
                .parse()
                .unwrap_or_else(|_| Self::tunnel_address(manager.config.base_cidr, id));
            let tunnel = Arc::new(Tunnel {
                id,
                interface_name: spec.interface.clone(),
                private_key: spec.private_key.clone(),
                public_key,
                local_address,
                listen_port: spec.listen_port,
                peer_public_key: spec.peer_public_key.clone(),
                peer_endpoint: spec.peer_endpoint.clone(),
                config_path: config::config_path(&manager.config.config_dir, &spec.interface),
                created_at: Utc::now(),
                state: StdRwLock::new(TunnelState::Inactive),
                status: StdRwLock::new(TunnelStatus::default()),
                metrics: StdRwLock::new(TunnelMetrics::default()),
            });
            if manager.driver.validate(&spec.interface).await.is_ok() {
                tunnel.set_state(TunnelState::Active);
            }
            rebuilt.push(tunnel);
        }

        if !rebuilt.is_empty() {
            info!(count = rebuilt.len(), "recovered tunnel set from config directory");
            *manager.tunnels.write().await = rebuilt;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn driver(&self) -> Arc<dyn TunnelDriver> {
        Arc::clone(&self.driver)
    }

    /// Set the cloud-side peer applied to tunnels created from now on
    pub fn set_peer(&self, public_key: String, host: String) {
        *self.peer.write().unwrap() = Some(PeerInfo { public_key, host });
    }

    /// Derive the local /24 for a tunnel id: third octet becomes id + 1,
    /// host part .1
    pub fn tunnel_address(base: Ipv4Network, id: u32) -> Ipv4Network {
        let octets = base.ip().octets();
        let addr = Ipv4Addr::new(octets[0], octets[1], (id + 1) as u8, 1);
        Ipv4Network::new(addr, 24).expect("/24 prefix is always valid")
    }

    pub async fn tunnel_count(&self) -> u32 {
        self.tunnels.read().await.len() as u32
    }

    /// Bring up `n` tunnels so ids exactly cover `0..n`. Already-running
    /// tunnels are kept; a failure part-way rolls back everything this
    /// call created.
    pub async fn create_tunnels(&self, n: u32) -> Result<(), TunnelError> {
        if n < 1 || n > self.config.max_tunnels {
            return Err(TunnelError::OutOfRange {
                requested: n,
                min: 1,
                max: self.config.max_tunnels,
            });
        }
        let _guard = self.lifecycle.lock().await;

        let start = self.tunnels.read().await.len() as u32;
        if start > n {
            return Err(TunnelError::OutOfRange {
                requested: n,
                min: start,
                max: self.config.max_tunnels,
            });
        }

        for id in start..n {
            if let Err(e) = self.create_one(id).await {
                // Unwind this call's tunnels, highest id first
                let mut current = self.tunnels.read().await.len() as u32;
                while current > start {
                    if let Err(down_err) = self.destroy_one().await {
                        warn!(error = %down_err, "rollback teardown failed");
                        break;
                    }
                    current -= 1;
                }
                return Err(e);
            }
        }
        info!(count = n, "tunnel set ready");
        Ok(())
    }

    /// Add one tunnel with the next id. Returns the new id.
    pub async fn add_tunnel(&self) -> Result<u32, TunnelError> {
        let _guard = self.lifecycle.lock().await;
        let id = self.tunnels.read().await.len() as u32;
        if id >= self.config.max_tunnels {
            return Err(TunnelError::AtMaxTunnels(self.config.max_tunnels));
        }
        self.create_one(id).await?;
        Ok(id)
    }

    /// Remove the tunnel with the highest id. Returns the removed id.
    pub async fn remove_tunnel(&self) -> Result<u32, TunnelError> {
        let _guard = self.lifecycle.lock().await;
        let count = self.tunnels.read().await.len() as u32;
        if count <= self.config.min_tunnels {
            return Err(TunnelError::AtMinTunnels(self.config.min_tunnels));
        }
        self.destroy_one().await
    }

    /// Tear down the whole set, highest id first. Keeps going past driver
    /// failures so one stuck interface does not orphan the rest; the
    /// first error is reported once everything has been attempted.
    pub async fn destroy_all(&self) -> Result<(), TunnelError> {
        let _guard = self.lifecycle.lock().await;
        let mut first_err = None;
        while !self.tunnels.read().await.is_empty() {
            match self.destroy_one().await {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "teardown failed, skipping interface");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    // Drop the entry anyway so the loop terminates, and
                    // take its config file with it so a later discover
                    // does not resurrect a dead tunnel.
                    if let Some(tunnel) = self.tunnels.write().await.pop() {
                        config::remove(&tunnel.config_path).await;
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Install the equal-cost route set across all Active tunnels
    pub async fn configure_ecmp(&self) -> Result<(), TunnelError> {
        let specs: Vec<RouteSpec> = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .iter()
                .filter(|t| t.state() == TunnelState::Active)
                .map(|t| RouteSpec {
                    interface: t.interface_name.clone(),
                    source: t.local_address.ip(),
                    table: BASE_TABLE + t.id,
                })
                .collect()
        };
        routes::install(&specs).await
    }

    /// Snapshot of every tunnel's identity, state, status and metrics.
    /// Never blocks on in-flight lifecycle operations.
    pub async fn active_tunnels(&self) -> Vec<TunnelSnapshot> {
        let tunnels = self.tunnels.read().await;
        tunnels.iter().map(|t| t.snapshot()).collect()
    }

    /// Subscribe to the metrics stream. The sequence is lazy and
    /// restartable: every call yields a fresh receiver that observes
    /// samples from now on, until the manager shuts down.
    pub fn performance_stream(&self) -> broadcast::Receiver<MetricsSample> {
        self.samples_tx.subscribe()
    }

    pub(crate) fn sample_sender(&self) -> broadcast::Sender<MetricsSample> {
        self.samples_tx.clone()
    }

    pub(crate) async fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.read().await.clone()
    }

    /// Create and activate the tunnel with the given id. Caller holds the
    /// lifecycle lock and guarantees `id == current count`.
    async fn create_one(&self, id: u32) -> Result<(), TunnelError> {
        let interface_name = format!("wg{id}");
        let local_address = Self::tunnel_address(self.config.base_cidr, id);
        let listen_port = self.config.base_listen_port + id as u16;
        let keypair = Keypair::generate();
        let peer = self.peer.read().unwrap().clone();

        let spec = InterfaceSpec {
            interface: interface_name.clone(),
            private_key: keypair.private_key.clone(),
            address: local_address.to_string(),
            listen_port,
            mtu: self.config.mtu,
            table: BASE_TABLE + id,
            peer_public_key: peer.as_ref().map(|p| p.public_key.clone()),
            peer_endpoint: peer
                .as_ref()
                .map(|p| format!("{}:{}", p.host, self.config.base_listen_port + id as u16)),
            allowed_ips: "0.0.0.0/0".to_string(),
        };

        let config_path = config::write(&self.config.config_dir, &spec).await?;

        let tunnel = Arc::new(Tunnel {
            id,
            interface_name: interface_name.clone(),
            private_key: keypair.private_key,
            public_key: keypair.public_key,
            local_address,
            listen_port,
            peer_public_key: spec.peer_public_key.clone(),
            peer_endpoint: spec.peer_endpoint.clone(),
            config_path: config_path.clone(),
            created_at: Utc::now(),
            state: StdRwLock::new(TunnelState::Inactive),
            status: StdRwLock::new(TunnelStatus::default()),
            metrics: StdRwLock::new(TunnelMetrics::default()),
        });

        if let Err(e) = self.driver.bring_up(&config_path).await {
            config::remove(&config_path).await;
            tunnel.set_state(TunnelState::Error);
            return Err(e);
        }

        tunnel.set_state(TunnelState::Active);
        tunnel.update_status(|s| s.last_seen = Some(Utc::now()));
        self.tunnels.write().await.push(tunnel);
        info!(id, interface = %interface_name, port = listen_port, "tunnel up");
        Ok(())
    }

    /// Tear down the highest-id tunnel. Caller holds the lifecycle lock.
    async fn destroy_one(&self) -> Result<u32, TunnelError> {
        let Some(tunnel) = self.tunnels.read().await.last().cloned() else {
            return Err(TunnelError::Driver("no tunnels to remove".to_string()));
        };

        if let Err(e) = self.driver.bring_down(&tunnel.interface_name).await {
            tunnel.set_state(TunnelState::Error);
            return Err(e);
        }

        config::remove(&tunnel.config_path).await;
        tunnel.set_state(TunnelState::Inactive);
        self.tunnels.write().await.pop();
        info!(id = tunnel.id, interface = %tunnel.interface_name, "tunnel down");
        Ok(tunnel.id)
    }
}
