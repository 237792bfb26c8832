//! Bottleneck classification, recommendations and report output

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{BottleneckLocation, ProbeResults};

/// Region latency above which a BBR-style congestion control pays off
const HIGH_LATENCY: Duration = Duration::from_millis(100);

/// Derived tunnel counts are scaled back to this fraction of the raw
/// multi-stream efficiency
const TUNNEL_HEADROOM: f64 = 0.8;

/// Classify where throughput is being limited.
///
/// With link speed `L`, single-stream baseline `B` and multi-stream peak
/// `P`: a baseline under a tenth of the link points at internet transit,
/// under half at the campus network; a peak that cannot double the
/// baseline points at the cloud side; otherwise the local interface is
/// the ceiling.
pub fn classify_bottleneck(link_speed_bps: u64, baseline_bps: u64, burst_bps: u64) -> BottleneckLocation {
    let link = link_speed_bps as f64;
    let baseline = baseline_bps as f64;
    let burst = burst_bps as f64;

    if baseline < link * 0.1 {
        BottleneckLocation::Internet
    } else if baseline < link * 0.5 {
        BottleneckLocation::Campus
    } else if baseline > 0.0 && burst / baseline < 2.0 {
        BottleneckLocation::Cloud
    } else {
        BottleneckLocation::Local
    }
}

/// Tunnel count worth running, from the observed scaling efficiency
pub fn optimal_tunnel_count(baseline_bps: u64, burst_bps: u64) -> u32 {
    if baseline_bps == 0 {
        return 0;
    }
    let efficiency = burst_bps as f64 / baseline_bps as f64;
    (efficiency * TUNNEL_HEADROOM) as u32
}

/// Compose the ordered recommendation list
pub fn recommendations(
    optimal_mtu: u32,
    baseline_bps: u64,
    burst_bps: u64,
    bottleneck: BottleneckLocation,
    region_latencies: &HashMap<String, Duration>,
) -> Vec<String> {
    let mut recs = Vec::new();

    if optimal_mtu > 1500 {
        let gain = f64::from(optimal_mtu - 1500) / 1500.0 * 100.0;
        recs.push(format!(
            "Enable large frames (MTU {optimal_mtu}) for +{gain:.1}% frame efficiency"
        ));
    }

    let tunnels = optimal_tunnel_count(baseline_bps, burst_bps);
    if tunnels >= 2 {
        let efficiency = burst_bps as f64 / baseline_bps as f64;
        recs.push(format!(
            "Use {tunnels} parallel tunnels for optimal throughput ({efficiency:.1}x scaling efficiency)"
        ));
    }

    recs.push(match bottleneck {
        BottleneckLocation::Local => {
            "Local interface is limiting - consider a NIC upgrade".to_string()
        }
        BottleneckLocation::Campus => {
            "Campus network is limiting - ask about available upstream bandwidth".to_string()
        }
        BottleneckLocation::Internet => {
            "Internet transit is limiting - consider a dedicated connection".to_string()
        }
        BottleneckLocation::Cloud => {
            "Cloud ingress is limiting - use enhanced-networking instance types".to_string()
        }
    });

    let mut slow_regions: Vec<(&String, &Duration)> = region_latencies
        .iter()
        .filter(|(_, latency)| **latency > HIGH_LATENCY)
        .collect();
    slow_regions.sort_by_key(|(region, _)| (*region).clone());
    for (region, latency) in slow_regions {
        recs.push(format!(
            "High latency to {region} ({}ms) - enable BBR congestion control",
            latency.as_millis()
        ));
    }

    recs
}

/// Render the line-oriented human report
pub fn render(results: &ProbeResults) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Network performance summary");
    let _ = writeln!(
        out,
        "  Interface: {} ({}, {})",
        results.local_interface.name,
        results.local_interface.driver,
        format_bits(results.local_interface.link_speed_bps),
    );
    let _ = writeln!(out, "  Optimal MTU: {} bytes", results.optimal_mtu);
    let _ = writeln!(
        out,
        "  Baseline bandwidth: {} (1 stream)",
        format_bits(results.baseline_bandwidth_bps)
    );
    let _ = writeln!(
        out,
        "  Burst bandwidth: {} ({} streams)",
        format_bits(results.burst_bandwidth_bps),
        results.optimal_stream_count
    );
    let _ = writeln!(out, "  Primary bottleneck: {}", results.bottleneck_location);
    if results.synthetic_bandwidth {
        let _ = writeln!(
            out,
            "  NOTE: bandwidth figures follow the deterministic scaling model (no test tool found)"
        );
    }

    if !results.region_latencies.is_empty() {
        let _ = writeln!(out, "Region latencies:");
        let mut regions: Vec<_> = results.region_latencies.iter().collect();
        regions.sort_by_key(|(region, _)| (*region).clone());
        for (region, latency) in regions {
            let _ = writeln!(out, "  {region}: {}ms", latency.as_millis());
        }
    }

    if !results.recommendations.is_empty() {
        let _ = writeln!(out, "Recommendations:");
        for rec in &results.recommendations {
            let _ = writeln!(out, "  - {rec}");
        }
    }

    out
}

/// Persist results as JSON under the user config directory with a
/// timestamped filename. Returns the path written.
pub async fn save(results: &ProbeResults, dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            let home = std::env::var("HOME")?;
            PathBuf::from(home).join(".burrow")
        }
    };
    tokio::fs::create_dir_all(&dir).await?;
    let filename = format!(
        "probe-{}.json",
        results.timestamp.format("%Y%m%d-%H%M%S")
    );
    let path = dir.join(filename);
    let json = serde_json::to_vec_pretty(results)?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}

/// Human formatting for bit rates, decimal units
pub fn format_bits(bps: u64) -> String {
    const UNIT: f64 = 1000.0;
    let bps_f = bps as f64;
    if bps_f < UNIT {
        return format!("{bps} bps");
    }
    let units = ["Kbps", "Mbps", "Gbps", "Tbps"];
    let exp = (bps_f.ln() / UNIT.ln()).floor() as usize;
    let exp = exp.min(units.len());
    format!("{:.1} {}", bps_f / UNIT.powi(exp as i32), units[exp - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetailedMetrics, LocalInterface};
    use chrono::Utc;

    const GBPS: u64 = 1_000_000_000;
    const MBPS: u64 = 1_000_000;

    #[test]
    fn test_bottleneck_classification_table() {
        // 10G link, 100M baseline: transit-bound
        assert_eq!(
            classify_bottleneck(10 * GBPS, 100 * MBPS, 200 * MBPS),
            BottleneckLocation::Internet
        );
        // 10G link, 2G baseline: campus-bound
        assert_eq!(
            classify_bottleneck(10 * GBPS, 2 * GBPS, 4 * GBPS),
            BottleneckLocation::Campus
        );
        // 10G link, 5G baseline, poor multi-stream scaling: cloud-bound
        assert_eq!(
            classify_bottleneck(10 * GBPS, 5 * GBPS, 6 * GBPS),
            BottleneckLocation::Cloud
        );
        // 1G link, 800M baseline, 2x scaling: the NIC is the ceiling
        assert_eq!(
            classify_bottleneck(GBPS, 800 * MBPS, 1_600 * MBPS),
            BottleneckLocation::Local
        );
    }

    #[test]
    fn test_classification_boundaries() {
        // Exactly L/10 is campus, not internet
        assert_eq!(
            classify_bottleneck(10 * GBPS, GBPS, 10 * GBPS),
            BottleneckLocation::Campus
        );
        // Exactly L/2 with strong scaling is local
        assert_eq!(
            classify_bottleneck(10 * GBPS, 5 * GBPS, 10 * GBPS),
            BottleneckLocation::Local
        );
    }

    #[test]
    fn test_optimal_tunnel_count() {
        // 4x efficiency scaled by 0.8 floors to 3
        assert_eq!(optimal_tunnel_count(GBPS, 4 * GBPS), 3);
        assert_eq!(optimal_tunnel_count(GBPS, GBPS), 0);
        assert_eq!(optimal_tunnel_count(0, GBPS), 0);
    }

    #[test]
    fn test_large_frame_recommendation() {
        let recs = recommendations(9000, GBPS, 2 * GBPS, BottleneckLocation::Local, &HashMap::new());
        assert!(recs[0].contains("MTU 9000"));
        assert!(recs[0].contains("+500.0%"));
    }

    #[test]
    fn test_tunnel_recommendation_at_4x() {
        let recs =
            recommendations(1500, GBPS, 4 * GBPS, BottleneckLocation::Local, &HashMap::new());
        assert!(recs.iter().any(|r| r.contains("Use 3 parallel tunnels")));
    }

    #[test]
    fn test_bbr_recommendation_for_slow_regions() {
        let mut latencies = HashMap::new();
        latencies.insert("eu-west-1".to_string(), Duration::from_millis(140));
        latencies.insert("us-west-2".to_string(), Duration::from_millis(12));
        let recs = recommendations(1500, GBPS, GBPS, BottleneckLocation::Cloud, &latencies);

        let bbr: Vec<&String> = recs.iter().filter(|r| r.contains("BBR")).collect();
        assert_eq!(bbr.len(), 1);
        assert!(bbr[0].contains("eu-west-1"));
        assert!(bbr[0].contains("140ms"));
    }

    #[test]
    fn test_bottleneck_message_always_present() {
        for bottleneck in [
            BottleneckLocation::Local,
            BottleneckLocation::Campus,
            BottleneckLocation::Internet,
            BottleneckLocation::Cloud,
        ] {
            let recs = recommendations(1500, GBPS, GBPS, bottleneck, &HashMap::new());
            assert!(!recs.is_empty());
        }
    }

    #[test]
    fn test_format_bits() {
        assert_eq!(format_bits(500), "500 bps");
        assert_eq!(format_bits(1_500), "1.5 Kbps");
        assert_eq!(format_bits(800 * MBPS), "800.0 Mbps");
        assert_eq!(format_bits(10 * GBPS), "10.0 Gbps");
    }

    fn sample_results() -> ProbeResults {
        ProbeResults {
            timestamp: Utc::now(),
            local_interface: LocalInterface {
                name: "enp5s0".to_string(),
                link_speed_bps: 10 * GBPS,
                current_mtu: 1500,
                driver: "mlx5_core".to_string(),
                queue_count: 8,
                offload_features: HashMap::new(),
            },
            optimal_mtu: 9000,
            baseline_bandwidth_bps: GBPS,
            burst_bandwidth_bps: 4 * GBPS,
            optimal_stream_count: 4,
            bottleneck_location: BottleneckLocation::Campus,
            region_latencies: HashMap::from([(
                "us-west-2".to_string(),
                Duration::from_millis(15),
            )]),
            recommendations: vec!["Use 3 parallel tunnels".to_string()],
            synthetic_bandwidth: true,
            detailed_metrics: DetailedMetrics::default(),
        }
    }

    #[test]
    fn test_render_report_mentions_synthetic_figures() {
        let report = render(&sample_results());
        assert!(report.contains("Optimal MTU: 9000"));
        assert!(report.contains("deterministic scaling model"));
        assert!(report.contains("us-west-2: 15ms"));
    }

    #[tokio::test]
    async fn test_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let results = sample_results();
        let path = save(&results, Some(dir.path().to_path_buf())).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let loaded: ProbeResults = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.optimal_mtu, results.optimal_mtu);
        assert_eq!(loaded.bottleneck_location, results.bottleneck_location);
    }
}
