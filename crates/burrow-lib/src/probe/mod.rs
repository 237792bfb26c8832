//! Network performance discovery
//!
//! A probe run walks six phases in order: local interface introspection,
//! optimal-MTU search, per-region latency, a multi-stream bandwidth
//! sweep, bottleneck classification and recommendation synthesis. The
//! first phase failing is fatal; individual sub-tests in the middle
//! phases may fail and are skipped, as long as each phase produces at
//! least one measurement. The last two phases are pure.

pub mod bandwidth;
pub mod interface;
pub mod latency;
pub mod report;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{DetailedMetrics, MtuTestResult, ProbeResults};

/// Probe failures. Anything past phase one degrades before it fails.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("local interface discovery: {0}")]
    Interface(String),

    #[error("MTU discovery: {0}")]
    Mtu(String),

    #[error("latency measurement: {0}")]
    Latency(String),

    #[error("bandwidth testing: {0}")]
    Bandwidth(String),
}

/// Parameters for one probe run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Wall-clock budget per bandwidth test
    pub test_duration: Duration,
    /// MTU sizes to try, in order
    pub mtu_candidates: Vec<u32>,
    /// Stream fan-out values for the bandwidth sweep, in order
    pub parallel_stream_counts: Vec<u32>,
    /// Probes per latency measurement
    pub latency_sample_count: u32,
    /// Remote regions to measure against
    pub regions_to_test: Vec<String>,
    /// Whether MTUs above 1500 are tested at all
    pub enable_large_frames: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            test_duration: Duration::from_secs(30),
            mtu_candidates: vec![1200, 1500, 1800, 9000],
            parallel_stream_counts: vec![1, 2, 4, 8],
            latency_sample_count: 100,
            regions_to_test: vec![
                "us-west-2".to_string(),
                "us-east-1".to_string(),
                "eu-west-1".to_string(),
            ],
            enable_large_frames: true,
        }
    }
}

/// Runs the discovery pipeline against one target region
pub struct NetworkProber {
    config: ProbeConfig,
}

impl NetworkProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Execute all six phases and produce an immutable result set
    pub async fn probe(&self, target_region: &str) -> Result<ProbeResults, ProbeError> {
        info!(region = target_region, "starting network performance discovery");

        // Phase 1: local interface. Fatal on failure.
        let local_interface = interface::discover_default_interface().await?;
        info!(
            interface = %local_interface.name,
            driver = %local_interface.driver,
            speed_bps = local_interface.link_speed_bps,
            mtu = local_interface.current_mtu,
            queues = local_interface.queue_count,
            "local interface discovered"
        );

        let endpoint = latency::region_endpoint(target_region)
            .ok_or_else(|| ProbeError::Latency(format!("no endpoint for region {target_region}")))?;
        latency::resolve(&endpoint)
            .await
            .map_err(|e| ProbeError::Latency(format!("cannot resolve {endpoint}: {e}")))?;

        let mut detailed = DetailedMetrics::default();

        // Phase 2: MTU search
        let optimal_mtu = self.discover_mtu(&endpoint, &mut detailed).await?;

        // Phase 3: per-region latency
        let region_latencies = self.measure_latencies(&mut detailed).await?;

        // Phase 4: bandwidth sweep
        let sweep = bandwidth::run_sweep(&endpoint, &self.config).await?;
        detailed.bandwidth_tests = sweep.tests.clone();

        // Phase 5: bottleneck classification (pure)
        let bottleneck_location = report::classify_bottleneck(
            local_interface.link_speed_bps,
            sweep.baseline_bps,
            sweep.burst_bps,
        );
        info!(bottleneck = %bottleneck_location, "bottleneck classified");

        // Phase 6: recommendations (pure)
        let recommendations = report::recommendations(
            optimal_mtu,
            sweep.baseline_bps,
            sweep.burst_bps,
            bottleneck_location,
            &region_latencies,
        );

        Ok(ProbeResults {
            timestamp: Utc::now(),
            local_interface,
            optimal_mtu,
            baseline_bandwidth_bps: sweep.baseline_bps,
            burst_bandwidth_bps: sweep.burst_bps,
            optimal_stream_count: sweep.optimal_streams,
            bottleneck_location,
            region_latencies,
            recommendations,
            synthetic_bandwidth: sweep.synthetic,
            detailed_metrics: detailed,
        })
    }

    /// Try each candidate MTU: verify the path carries it, then measure
    /// throughput at that size. The throughput argmax wins.
    async fn discover_mtu(
        &self,
        endpoint: &str,
        detailed: &mut DetailedMetrics,
    ) -> Result<u32, ProbeError> {
        let mut best_mtu = 0u32;
        let mut best_throughput = 0u64;

        for &mtu in &self.config.mtu_candidates {
            if mtu > 1500 && !self.config.enable_large_frames {
                continue;
            }

            if !bandwidth::path_mtu_ok(endpoint, mtu).await {
                warn!(mtu, "path MTU exceeded, skipping candidate");
                detailed.mtu_tests.push(MtuTestResult {
                    mtu,
                    throughput_bps: 0,
                    path_ok: false,
                });
                continue;
            }

            let throughput = bandwidth::mtu_throughput(endpoint, mtu, self.config.test_duration)
                .await;
            detailed.mtu_tests.push(MtuTestResult {
                mtu,
                throughput_bps: throughput,
                path_ok: true,
            });
            if throughput > best_throughput {
                best_throughput = throughput;
                best_mtu = mtu;
            }
        }

        if best_mtu == 0 {
            return Err(ProbeError::Mtu(
                "no candidate MTU produced a successful measurement".to_string(),
            ));
        }
        info!(mtu = best_mtu, throughput_bps = best_throughput, "optimal MTU selected");
        Ok(best_mtu)
    }

    /// Measure every configured region; regions that fail to resolve or
    /// answer are dropped. At least one region must succeed.
    async fn measure_latencies(
        &self,
        detailed: &mut DetailedMetrics,
    ) -> Result<HashMap<String, Duration>, ProbeError> {
        let mut latencies = HashMap::new();

        for region in &self.config.regions_to_test {
            let Some(endpoint) = latency::region_endpoint(region) else {
                warn!(region = %region, "no known endpoint, skipping region");
                continue;
            };
            match latency::measure(region, &endpoint, self.config.latency_sample_count).await {
                Ok(result) => {
                    info!(region = %region, avg_ms = result.avg.as_millis() as u64, "region measured");
                    latencies.insert(region.clone(), result.avg);
                    detailed.latency_tests.push(result);
                }
                Err(e) => {
                    warn!(region = %region, error = %e, "latency measurement failed, skipping region");
                }
            }
        }

        if latencies.is_empty() {
            return Err(ProbeError::Latency(
                "no region produced a successful measurement".to_string(),
            ));
        }
        Ok(latencies)
    }
}
