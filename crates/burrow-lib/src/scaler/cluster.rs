//! Vertical/horizontal scaling phases and CPU pinning
//!
//! Capacity grows vertically first: more tunnels on the single bastion,
//! each optionally pinned to its own core. Once the instance carries its
//! tunnel limit and utilization stays high, the cluster transitions to
//! horizontal scaling and adds bastions round-robin across availability
//! zones, one bootstrap tunnel each.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::provision::{BastionEndpoint, BastionRequest, Provisioner};
use crate::tunnel::{TunnelError, TunnelManager};

use super::{ScaleError, ScalingConfig};

/// Tier new bastions start on; the controller's recommendation guides
/// resizing later
const BOOTSTRAP_TIER: &str = "t4g.small";

/// Which way new capacity is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingPhase {
    Vertical,
    Horizontal,
}

/// One bastion instance the cluster knows about
#[derive(Debug, Clone, Serialize)]
pub struct InstanceState {
    pub instance_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub availability_zone: String,
    pub tunnel_count: u32,
}

/// Snapshot of cluster shape
#[derive(Debug, Clone, Serialize)]
pub struct ClusterState {
    pub phase: ScalingPhase,
    pub instances: HashMap<String, InstanceState>,
    /// tunnel id -> pinned core
    pub process_affinity: HashMap<u32, usize>,
}

/// What a capacity-add actually did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityChange {
    TunnelAdded(u32),
    InstanceAdded(String),
}

struct ClusterInner {
    phase: ScalingPhase,
    instances: HashMap<String, InstanceState>,
    process_affinity: HashMap<u32, usize>,
}

/// Coordinates tunnels, bastions and pinning across scaling phases
pub struct ClusterManager {
    config: ScalingConfig,
    manager: Arc<TunnelManager>,
    provisioner: Arc<dyn Provisioner>,
    region: String,
    /// Single writer: only capacity operations mutate cluster shape
    inner: Mutex<ClusterInner>,
}

impl ClusterManager {
    pub fn new(
        config: ScalingConfig,
        manager: Arc<TunnelManager>,
        provisioner: Arc<dyn Provisioner>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            config,
            manager,
            provisioner,
            region: region.into(),
            inner: Mutex::new(ClusterInner {
                phase: ScalingPhase::Vertical,
                instances: HashMap::new(),
                process_affinity: HashMap::new(),
            }),
        }
    }

    /// Record the bastion the tunnel set was initially deployed against
    pub async fn register_primary(&self, endpoint: &BastionEndpoint, tunnel_count: u32) {
        let mut inner = self.inner.lock().await;
        inner.instances.insert(
            endpoint.instance_id.clone(),
            InstanceState {
                instance_id: endpoint.instance_id.clone(),
                public_ip: endpoint.public_ip.clone(),
                private_ip: endpoint.private_ip.clone(),
                availability_zone: endpoint.availability_zone.clone(),
                tunnel_count,
            },
        );
    }

    pub async fn state(&self) -> ClusterState {
        let inner = self.inner.lock().await;
        ClusterState {
            phase: inner.phase,
            instances: inner.instances.clone(),
            process_affinity: inner.process_affinity.clone(),
        }
    }

    /// Add one unit of capacity: a tunnel while vertical, a bastion once
    /// the phase has flipped. `utilization` is the aggregate figure the
    /// decision was made on.
    pub async fn add_capacity(&self, utilization: f64) -> Result<CapacityChange, ScaleError> {
        let mut inner = self.inner.lock().await;

        match inner.phase {
            ScalingPhase::Vertical => {
                let tunnels = self.manager.tunnel_count().await;
                if tunnels < self.config.max_tunnels_per_instance {
                    let id = self.add_tunnel_pinned(&mut inner).await?;
                    let count = self.manager.tunnel_count().await;
                    // Vertical phase has a single registered instance
                    if let Some(primary) = inner.instances.values_mut().next() {
                        primary.tunnel_count = count;
                    }
                    return Ok(CapacityChange::TunnelAdded(id));
                }
                if utilization > self.config.vertical_to_horizontal_utilization_threshold {
                    info!(
                        utilization,
                        "instance saturated; transitioning to horizontal scaling"
                    );
                    inner.phase = ScalingPhase::Horizontal;
                    match self.scale_horizontal(&mut inner).await {
                        Ok(change) => Ok(change),
                        Err(e) => {
                            // The transition never materialized
                            inner.phase = ScalingPhase::Vertical;
                            Err(e)
                        }
                    }
                } else {
                    Err(ScaleError::Tunnel(TunnelError::AtMaxTunnels(
                        self.config.max_tunnels_per_instance,
                    )))
                }
            }
            ScalingPhase::Horizontal => self.scale_horizontal(&mut inner).await,
        }
    }

    /// Provision a bastion in the next availability zone and bootstrap it
    /// with one tunnel
    async fn scale_horizontal(
        &self,
        inner: &mut ClusterInner,
    ) -> Result<CapacityChange, ScaleError> {
        if inner.instances.len() as u32 >= self.config.max_instances {
            return Err(ScaleError::Provisioner(crate::provision::ProvisionerError(
                format!("max instances reached ({})", self.config.max_instances),
            )));
        }

        let zone = self.select_zone(inner.instances.len());
        let request = BastionRequest {
            region: self.region.clone(),
            availability_zone: zone.clone(),
            instance_tier: BOOTSTRAP_TIER.to_string(),
            tunnel_count: 1,
            mtu: self.manager.config().mtu,
        };
        let endpoint = self.provisioner.create_bastion(&request).await?;
        info!(
            instance = %endpoint.instance_id,
            zone = %zone,
            instances = inner.instances.len() + 1,
            "bastion added"
        );

        let mut tunnel_count = 0;
        match self.add_tunnel_pinned(inner).await {
            Ok(_) => tunnel_count = 1,
            Err(e) => warn!(error = %e, "bootstrap tunnel for new bastion failed"),
        }

        inner.instances.insert(
            endpoint.instance_id.clone(),
            InstanceState {
                instance_id: endpoint.instance_id.clone(),
                public_ip: endpoint.public_ip.clone(),
                private_ip: endpoint.private_ip.clone(),
                availability_zone: endpoint.availability_zone.clone(),
                tunnel_count,
            },
        );
        Ok(CapacityChange::InstanceAdded(endpoint.instance_id))
    }

    async fn add_tunnel_pinned(&self, inner: &mut ClusterInner) -> Result<u32, ScaleError> {
        let id = self.manager.add_tunnel().await?;

        if self.config.process_pinning_enabled {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let core = Self::optimal_core(cores, self.config.reserved_cores, id);
            if let Err(e) = pin_interface_worker(id, core).await {
                warn!(tunnel = id, core, error = %e, "CPU pinning failed, continuing unpinned");
            } else {
                inner.process_affinity.insert(id, core);
                info!(tunnel = id, core, "tunnel worker pinned");
            }
        }

        Ok(id)
    }

    /// Round-robin zone selection: `region`a, `region`b, ... up to the
    /// configured zone count
    fn select_zone(&self, instance_count: usize) -> String {
        let suffixes = ["a", "b", "c", "d", "e", "f"];
        let zones = (self.config.max_zones as usize).clamp(1, suffixes.len());
        format!("{}{}", self.region, suffixes[instance_count % zones])
    }

    /// Core assignment for a tunnel: skip the reserved cores, then wrap
    /// over what is left
    pub fn optimal_core(num_cores: usize, reserved: usize, tunnel_id: u32) -> usize {
        let available = num_cores.saturating_sub(reserved);
        if available == 0 {
            return tunnel_id as usize % num_cores.max(1);
        }
        reserved + (tunnel_id as usize % available)
    }
}

/// Pin the driver worker serving an interface to a core. Advisory: the
/// caller logs and continues on failure.
async fn pin_interface_worker(tunnel_id: u32, core: usize) -> anyhow::Result<()> {
    let interface = format!("wg{tunnel_id}");
    let output = Command::new("pgrep").args(["-f", &interface]).output().await?;
    if !output.status.success() {
        anyhow::bail!("no worker process found for {interface}");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let pid = stdout
        .lines()
        .next()
        .and_then(|l| l.trim().parse::<u32>().ok())
        .ok_or_else(|| anyhow::anyhow!("unparseable pid for {interface}"))?;

    let status = Command::new("sudo")
        .args(["taskset", "-cp", &core.to_string(), &pid.to_string()])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("taskset failed for pid {pid}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::MockProvisioner;
    use crate::tunnel::{MockDriver, TunnelConfig, TunnelDriver};

    fn cluster_fixture(
        dir: &std::path::Path,
        max_per_instance: u32,
        max_tunnels: u32,
    ) -> (Arc<TunnelManager>, Arc<MockProvisioner>, ClusterManager) {
        let driver = Arc::new(MockDriver::new());
        let manager = Arc::new(
            TunnelManager::new(
                TunnelConfig {
                    min_tunnels: 1,
                    max_tunnels,
                    config_dir: dir.to_path_buf(),
                    ..TunnelConfig::default()
                },
                driver as Arc<dyn TunnelDriver>,
            )
            .unwrap(),
        );
        let provisioner = Arc::new(MockProvisioner::new());
        let config = ScalingConfig {
            max_tunnels_per_instance: max_per_instance,
            process_pinning_enabled: false,
            ..ScalingConfig::default()
        };
        let cluster = ClusterManager::new(
            config,
            manager.clone(),
            provisioner.clone() as Arc<dyn Provisioner>,
            "us-west-2",
        );
        (manager, provisioner, cluster)
    }

    #[test]
    fn test_optimal_core_assignment() {
        // 8 cores, 2 reserved: tunnels wrap over cores 2..8
        assert_eq!(ClusterManager::optimal_core(8, 2, 0), 2);
        assert_eq!(ClusterManager::optimal_core(8, 2, 5), 7);
        assert_eq!(ClusterManager::optimal_core(8, 2, 6), 2);
        // Misconfigured reservation falls back to plain modulo
        assert_eq!(ClusterManager::optimal_core(2, 4, 3), 1);
    }

    #[tokio::test]
    async fn test_vertical_phase_adds_tunnels() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, cluster) = cluster_fixture(dir.path(), 4, 8);

        let change = cluster.add_capacity(0.5).await.unwrap();
        assert_eq!(change, CapacityChange::TunnelAdded(0));
        assert_eq!(manager.tunnel_count().await, 1);
        assert_eq!(cluster.state().await.phase, ScalingPhase::Vertical);
    }

    #[tokio::test]
    async fn test_phase_transition_at_saturation() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, provisioner, cluster) = cluster_fixture(dir.path(), 2, 8);

        manager.create_tunnels(2).await.unwrap();

        // Saturated instance + high utilization: next capacity is an
        // instance, not a tunnel
        let change = cluster.add_capacity(0.9).await.unwrap();
        assert!(matches!(change, CapacityChange::InstanceAdded(_)));
        assert_eq!(cluster.state().await.phase, ScalingPhase::Horizontal);
        assert_eq!(provisioner.created().len(), 1);
        // The new bastion bootstraps with one tunnel
        assert_eq!(manager.tunnel_count().await, 3);
    }

    #[tokio::test]
    async fn test_no_transition_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, cluster) = cluster_fixture(dir.path(), 2, 8);

        manager.create_tunnels(2).await.unwrap();
        let err = cluster.add_capacity(0.5).await.unwrap_err();
        assert!(matches!(
            err,
            ScaleError::Tunnel(TunnelError::AtMaxTunnels(2))
        ));
        assert_eq!(cluster.state().await.phase, ScalingPhase::Vertical);
    }

    #[tokio::test]
    async fn test_provisioner_failure_reverts_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, provisioner, cluster) = cluster_fixture(dir.path(), 2, 8);

        manager.create_tunnels(2).await.unwrap();
        provisioner.fail_next();

        let err = cluster.add_capacity(0.95).await.unwrap_err();
        assert!(matches!(err, ScaleError::Provisioner(_)));
        // The transition never materialized
        assert_eq!(cluster.state().await.phase, ScalingPhase::Vertical);
    }

    #[tokio::test]
    async fn test_zones_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, provisioner, cluster) = cluster_fixture(dir.path(), 1, 8);

        manager.create_tunnels(1).await.unwrap();
        cluster.add_capacity(0.95).await.unwrap();
        cluster.add_capacity(0.95).await.unwrap();
        cluster.add_capacity(0.95).await.unwrap();

        let zones: Vec<String> = provisioner
            .created()
            .iter()
            .map(|e| e.availability_zone.clone())
            .collect();
        assert_eq!(
            zones,
            vec!["us-west-2a", "us-west-2b", "us-west-2c"]
        );
    }

    #[tokio::test]
    async fn test_max_instances_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _provisioner, cluster) = cluster_fixture(dir.path(), 1, 16);

        manager.create_tunnels(1).await.unwrap();
        // max_instances defaults to 4; the primary is not registered in
        // this fixture so four adds succeed and the fifth hits the cap
        for _ in 0..4 {
            cluster.add_capacity(0.95).await.unwrap();
        }
        let err = cluster.add_capacity(0.95).await.unwrap_err();
        assert!(matches!(err, ScaleError::Provisioner(_)));
    }
}
