//! Bandwidth measurement: live tool when available, deterministic model
//! otherwise
//!
//! The sweep prefers a real `iperf3` run against the target endpoint.
//! When the tool is absent or fails, throughput follows a documented
//! multi-stream scaling model so the rest of the pipeline still produces
//! a ranked result; synthetic figures are flagged all the way into the
//! final report.

use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::models::BandwidthTestResult;

use super::{ProbeConfig, ProbeError};

/// Single-stream baseline the synthetic model assumes when the sweep has
/// recorded no measurement of its own yet, in bits/s
pub const SYNTHETIC_BASELINE_BPS: u64 = 800_000_000;

/// Baseline used by the synthetic per-MTU model, in bits/s
const SYNTHETIC_MTU_BASELINE_BPS: u64 = 500_000_000;

/// Measured multi-stream scaling factors for 1, 2, 4 and 8 streams; the
/// tail grows by 0.3 per stream past four
const STREAM_SCALING: [f64; 4] = [1.0, 1.8, 3.2, 4.2];

/// Outcome of the bandwidth sweep phase
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub baseline_bps: u64,
    pub burst_bps: u64,
    pub optimal_streams: u32,
    pub synthetic: bool,
    pub tests: Vec<BandwidthTestResult>,
}

/// Verify the path carries a given MTU by sending fragment-prohibited
/// probes sized to fill it (28 bytes of IP + ICMP headers come off)
pub async fn path_mtu_ok(endpoint: &str, mtu: u32) -> bool {
    if mtu <= 28 {
        return false;
    }
    let payload = (mtu - 28).to_string();
    let status = Command::new("ping")
        .args(["-M", "do", "-s", &payload, "-c", "3", "-W", "5", endpoint])
        .status()
        .await;
    matches!(status, Ok(s) if s.success())
}

/// Throughput achievable at a given MTU. Falls back to the header
/// efficiency model when no measurement tool is available.
pub async fn mtu_throughput(endpoint: &str, mtu: u32, duration: Duration) -> u64 {
    match run_iperf(endpoint, 1, duration).await {
        Some(bps) => bps,
        None => model_mtu_throughput(mtu),
    }
}

/// Synthetic per-MTU throughput: payload efficiency over a fixed base
/// rate, accounting for 40 bytes of headers per frame
pub fn model_mtu_throughput(mtu: u32) -> u64 {
    if mtu <= 40 {
        return 0;
    }
    let efficiency = f64::from(mtu - 40) / f64::from(mtu);
    (SYNTHETIC_MTU_BASELINE_BPS as f64 * efficiency) as u64
}

/// Synthetic multi-stream throughput over a measured or assumed baseline
pub fn model_stream_throughput(baseline_bps: u64, streams: u32) -> u64 {
    if streams == 0 {
        return 0;
    }
    let factor = if streams <= STREAM_SCALING.len() as u32 {
        STREAM_SCALING[(streams - 1) as usize]
    } else {
        STREAM_SCALING[3] + 0.3 * f64::from(streams - 4)
    };
    (baseline_bps as f64 * factor) as u64
}

/// Baseline the model scales from: the sweep's own first recorded
/// throughput, or the assumed constant while nothing has been recorded
/// yet
fn model_baseline(tests: &[BandwidthTestResult]) -> u64 {
    tests
        .first()
        .map(|t| t.throughput_bps)
        .unwrap_or(SYNTHETIC_BASELINE_BPS)
}

/// Run the full stream sweep. A stream count whose live test fails falls
/// back to the model for that entry, scaled off the baseline this sweep
/// recorded, and the whole sweep is flagged synthetic.
pub async fn run_sweep(endpoint: &str, config: &ProbeConfig) -> Result<SweepOutcome, ProbeError> {
    if config.parallel_stream_counts.is_empty() {
        return Err(ProbeError::Bandwidth("no stream counts configured".to_string()));
    }

    let mut tests = Vec::new();
    let mut synthetic = false;

    for &streams in &config.parallel_stream_counts {
        let (throughput, was_synthetic) =
            match run_iperf(endpoint, streams, config.test_duration).await {
                Some(bps) => (bps, false),
                None => {
                    synthetic = true;
                    (model_stream_throughput(model_baseline(&tests), streams), true)
                }
            };
        tests.push(BandwidthTestResult {
            streams,
            throughput_bps: throughput,
            duration: config.test_duration,
            synthetic: was_synthetic,
        });
    }

    if synthetic {
        warn!("bandwidth tool unavailable; figures follow the deterministic scaling model");
    }

    let baseline_bps = tests.first().map(|t| t.throughput_bps).unwrap_or(0);
    let best = tests
        .iter()
        .max_by_key(|t| t.throughput_bps)
        .ok_or_else(|| ProbeError::Bandwidth("no successful bandwidth test".to_string()))?;

    Ok(SweepOutcome {
        baseline_bps,
        burst_bps: best.throughput_bps,
        optimal_streams: best.streams,
        synthetic,
        tests,
    })
}

/// Attempt a live iperf3 run; None when the tool is missing or errors
async fn run_iperf(endpoint: &str, streams: u32, duration: Duration) -> Option<u64> {
    let output = Command::new("iperf3")
        .args([
            "-c",
            endpoint,
            "-P",
            &streams.to_string(),
            "-t",
            &duration.as_secs().max(1).to_string(),
            "-J",
        ])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_iperf_json(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the received-side bits per second from iperf3 JSON output
pub fn parse_iperf_json(output: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(output).ok()?;
    let bps = value
        .get("end")?
        .get("sum_received")?
        .get("bits_per_second")?
        .as_f64()?;
    Some(bps as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_stream_scaling_table() {
        let base = 1_000_000_000u64;
        assert_eq!(model_stream_throughput(base, 1), 1_000_000_000);
        assert_eq!(model_stream_throughput(base, 2), 1_800_000_000);
        assert_eq!(model_stream_throughput(base, 4), 4_200_000_000);
        // Past four streams: 4.2 + 0.3 per extra stream
        assert_eq!(model_stream_throughput(base, 8), 5_400_000_000);
        assert_eq!(model_stream_throughput(base, 0), 0);
    }

    #[test]
    fn test_model_mtu_throughput_prefers_larger_frames() {
        let small = model_mtu_throughput(1200);
        let standard = model_mtu_throughput(1500);
        let jumbo = model_mtu_throughput(9000);
        assert!(small < standard);
        assert!(standard < jumbo);
        assert_eq!(model_mtu_throughput(40), 0);
    }

    #[test]
    fn test_model_baseline_prefers_recorded_measurement() {
        // A live single-stream measurement anchors every later fallback,
        // so synthetic entries stay consistent with the sweep's own
        // baseline
        let measured = vec![BandwidthTestResult {
            streams: 1,
            throughput_bps: 950_000_000,
            duration: Duration::from_secs(1),
            synthetic: false,
        }];
        assert_eq!(model_baseline(&measured), 950_000_000);
        assert_eq!(
            model_stream_throughput(model_baseline(&measured), 2),
            1_710_000_000
        );

        // Before anything is recorded, the assumed constant applies
        assert_eq!(model_baseline(&[]), SYNTHETIC_BASELINE_BPS);
    }

    #[test]
    fn test_parse_iperf_json() {
        let json = r#"{"end":{"sum_received":{"bits_per_second":941234567.8}}}"#;
        assert_eq!(parse_iperf_json(json), Some(941_234_567));
        assert_eq!(parse_iperf_json("{}"), None);
        assert_eq!(parse_iperf_json("not json"), None);
    }

    #[tokio::test]
    async fn test_sweep_falls_back_to_model() {
        // No iperf3 server is listening on localhost, so the sweep lands
        // on the deterministic model and flags it.
        let config = ProbeConfig {
            parallel_stream_counts: vec![1, 2, 4, 8],
            test_duration: Duration::from_secs(1),
            ..ProbeConfig::default()
        };
        let outcome = run_sweep("127.0.0.1", &config).await.unwrap();
        assert!(outcome.synthetic);
        assert_eq!(outcome.baseline_bps, SYNTHETIC_BASELINE_BPS);
        assert_eq!(outcome.optimal_streams, 8);
        assert!(outcome.burst_bps > outcome.baseline_bps);
        assert_eq!(outcome.tests.len(), 4);
    }

    #[tokio::test]
    async fn test_sweep_requires_stream_counts() {
        let config = ProbeConfig {
            parallel_stream_counts: vec![],
            ..ProbeConfig::default()
        };
        assert!(run_sweep("127.0.0.1", &config).await.is_err());
    }
}
