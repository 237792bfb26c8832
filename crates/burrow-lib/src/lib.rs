//! Core library for burrow
//!
//! This crate provides the machinery behind the burrow CLI:
//! - Network performance discovery (interface introspection, MTU search,
//!   latency and bandwidth measurement, bottleneck classification)
//! - Tunnel lifecycle management over an abstract driver
//! - Closed-loop dynamic scaling across tunnels and bastion instances
//! - Health checks and observability

pub mod health;
pub mod models;
pub mod observability;
pub mod probe;
pub mod provision;
pub mod scaler;
pub mod tunnel;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, TunnelMetricsExporter};
pub use probe::{NetworkProber, ProbeConfig, ProbeError};
pub use provision::{BastionEndpoint, MockProvisioner, Provisioner, ProvisionerError};
pub use scaler::{ClusterManager, ScaleError, ScalingConfig, TunnelScaler};
pub use tunnel::{
    MockDriver, TunnelConfig, TunnelDriver, TunnelError, TunnelManager, WgQuickDriver,
};
