//! Provisioner boundary
//!
//! Bastion and network provisioning is an external concern; the core
//! consumes it through this trait and only strings and numbers cross the
//! boundary. A mock implementation backs tests and dry runs.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tunnel::Keypair;

/// Provisioning failures; the controller stays in its current phase and
/// retries after cooldown
#[derive(Debug, Error)]
#[error("provisioner: {0}")]
pub struct ProvisionerError(pub String);

/// What the core asks for when it needs a bastion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BastionRequest {
    pub region: String,
    pub availability_zone: String,
    /// Instance tier name from the catalog
    pub instance_tier: String,
    /// Tunnels the bastion should be sized to terminate
    pub tunnel_count: u32,
    pub mtu: u32,
}

/// What comes back once a bastion is up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BastionEndpoint {
    pub instance_id: String,
    pub public_ip: String,
    pub private_ip: String,
    /// The bastion's freshly generated tunnel public key, propagated out
    /// of band (instance tags or equivalent)
    pub peer_public_key: String,
    pub availability_zone: String,
}

/// Network infrastructure request, CIDRs only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub region: String,
    pub vpc_cidr: String,
    pub public_subnet_cidr: String,
    pub private_subnet_cidr: String,
    pub enable_nat: bool,
}

/// Identifiers of created network infrastructure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkIds {
    pub vpc_id: String,
    pub public_subnet_id: String,
    pub private_subnet_id: String,
}

/// Cloud-side provisioning, abstracted to provider-free types
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_bastion(&self, request: &BastionRequest)
        -> Result<BastionEndpoint, ProvisionerError>;

    async fn terminate(&self, instance_id: &str) -> Result<(), ProvisionerError>;

    async fn list_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<BastionEndpoint>, ProvisionerError>;

    async fn create_network_infrastructure(
        &self,
        request: &NetworkRequest,
    ) -> Result<NetworkIds, ProvisionerError>;
}

/// In-process provisioner double: deterministic identifiers, documentation
/// address ranges, real keys
#[derive(Default)]
pub struct MockProvisioner {
    counter: AtomicU32,
    fail_next: AtomicBool,
    created: Mutex<Vec<BastionEndpoint>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next create_bastion call fail
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<BastionEndpoint> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_bastion(
        &self,
        request: &BastionRequest,
    ) -> Result<BastionEndpoint, ProvisionerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProvisionerError("injected bastion failure".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = BastionEndpoint {
            instance_id: format!("i-{n:08x}"),
            public_ip: format!("203.0.113.{n}"),
            private_ip: format!("10.0.{n}.10"),
            peer_public_key: Keypair::generate().public_key,
            availability_zone: request.availability_zone.clone(),
        };
        self.created.lock().unwrap().push(endpoint.clone());
        Ok(endpoint)
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ProvisionerError> {
        let mut created = self.created.lock().unwrap();
        created.retain(|e| e.instance_id != instance_id);
        Ok(())
    }

    async fn list_instances_by_tag(
        &self,
        _key: &str,
        _value: &str,
    ) -> Result<Vec<BastionEndpoint>, ProvisionerError> {
        Ok(self.created.lock().unwrap().clone())
    }

    async fn create_network_infrastructure(
        &self,
        request: &NetworkRequest,
    ) -> Result<NetworkIds, ProvisionerError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = request;
        Ok(NetworkIds {
            vpc_id: format!("vpc-{n:08x}"),
            public_subnet_id: format!("subnet-{n:08x}a"),
            private_subnet_id: format!("subnet-{n:08x}b"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provisioner_lifecycle() {
        let provisioner = MockProvisioner::new();
        let request = BastionRequest {
            region: "us-west-2".to_string(),
            availability_zone: "us-west-2a".to_string(),
            instance_tier: "c6gn.medium".to_string(),
            tunnel_count: 4,
            mtu: 9000,
        };

        let endpoint = provisioner.create_bastion(&request).await.unwrap();
        assert_eq!(endpoint.availability_zone, "us-west-2a");
        assert_eq!(endpoint.peer_public_key.len(), 44);

        let listed = provisioner.list_instances_by_tag("app", "burrow").await.unwrap();
        assert_eq!(listed.len(), 1);

        provisioner.terminate(&endpoint.instance_id).await.unwrap();
        assert!(provisioner.list_instances_by_tag("app", "burrow").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let provisioner = MockProvisioner::new();
        provisioner.fail_next();
        let request = BastionRequest {
            region: "us-west-2".to_string(),
            availability_zone: "us-west-2b".to_string(),
            instance_tier: "t4g.small".to_string(),
            tunnel_count: 1,
            mtu: 1420,
        };
        assert!(provisioner.create_bastion(&request).await.is_err());
        assert!(provisioner.create_bastion(&request).await.is_ok());
    }
}
