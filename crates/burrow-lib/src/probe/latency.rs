//! Round-trip latency measurement against region endpoints

use std::time::Duration;

use tokio::net::lookup_host;
use tokio::process::Command;

use crate::models::LatencyTestResult;

use super::ProbeError;

/// Well-known reachable endpoint for a region, if we have one
pub fn region_endpoint(region: &str) -> Option<String> {
    const KNOWN: &[&str] = &[
        "us-west-1",
        "us-west-2",
        "us-east-1",
        "us-east-2",
        "eu-west-1",
        "eu-central-1",
        "ap-northeast-1",
        "ap-southeast-2",
    ];
    KNOWN
        .contains(&region)
        .then(|| format!("ec2.{region}.amazonaws.com"))
}

/// Resolve an endpoint name, surfacing DNS failures
pub async fn resolve(endpoint: &str) -> std::io::Result<()> {
    lookup_host((endpoint, 443)).await?;
    Ok(())
}

/// Send `count` probes at a short interval and parse the rtt summary
pub async fn measure(
    region: &str,
    endpoint: &str,
    count: u32,
) -> Result<LatencyTestResult, ProbeError> {
    resolve(endpoint)
        .await
        .map_err(|e| ProbeError::Latency(format!("{endpoint}: {e}")))?;

    let output = Command::new("ping")
        .args(["-c", &count.to_string(), "-i", "0.01", "-q", endpoint])
        .output()
        .await
        .map_err(|e| ProbeError::Latency(format!("ping: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    let (min, avg, max, stddev) = parse_rtt_summary(&stdout)
        .ok_or_else(|| ProbeError::Latency(format!("could not parse ping output for {endpoint}")))?;
    let packet_loss_fraction = parse_packet_loss(&stdout).unwrap_or(0.0);

    if packet_loss_fraction >= 1.0 {
        return Err(ProbeError::Latency(format!("all probes to {endpoint} lost")));
    }

    Ok(LatencyTestResult {
        region: region.to_string(),
        min,
        avg,
        max,
        stddev,
        packet_loss_fraction,
    })
}

/// Parse the `rtt min/avg/max/mdev = a/b/c/d ms` summary line
pub fn parse_rtt_summary(output: &str) -> Option<(Duration, Duration, Duration, Duration)> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let values = line.split(" = ").nth(1)?;
    let values = values.trim_end_matches(" ms").trim();
    let mut parts = values.split('/');

    let mut next_ms = || -> Option<Duration> {
        let ms: f64 = parts.next()?.parse().ok()?;
        Some(Duration::from_secs_f64(ms / 1000.0))
    };
    let min = next_ms()?;
    let avg = next_ms()?;
    let max = next_ms()?;
    let mdev = next_ms()?;
    Some((min, avg, max, mdev))
}

/// Parse the `X% packet loss` figure as a fraction
pub fn parse_packet_loss(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("packet loss"))?;
    let pct = line
        .split(',')
        .find(|part| part.contains("packet loss"))?
        .trim()
        .split('%')
        .next()?
        .trim();
    pct.parse::<f64>().ok().map(|p| p / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_OUTPUT: &str = "\
PING ec2.us-west-2.amazonaws.com (52.94.5.1) 56(84) bytes of data.

--- ec2.us-west-2.amazonaws.com ping statistics ---
100 packets transmitted, 98 received, 2% packet loss, time 1012ms
rtt min/avg/max/mdev = 11.903/14.502/29.855/2.040 ms
";

    #[test]
    fn test_parse_rtt_summary() {
        let (min, avg, max, mdev) = parse_rtt_summary(PING_OUTPUT).unwrap();
        assert_eq!(min, Duration::from_micros(11_903));
        assert_eq!(avg, Duration::from_micros(14_502));
        assert_eq!(max, Duration::from_micros(29_855));
        assert_eq!(mdev, Duration::from_micros(2_040));
    }

    #[test]
    fn test_parse_rtt_summary_rejects_garbage() {
        assert!(parse_rtt_summary("no statistics here").is_none());
        assert!(parse_rtt_summary("rtt min/avg/max/mdev = bogus ms").is_none());
    }

    #[test]
    fn test_parse_packet_loss() {
        assert_eq!(parse_packet_loss(PING_OUTPUT), Some(0.02));
        assert_eq!(
            parse_packet_loss("5 packets transmitted, 0 received, 100% packet loss, time 80ms"),
            Some(1.0)
        );
        assert_eq!(parse_packet_loss("nothing useful"), None);
    }

    #[test]
    fn test_region_endpoint() {
        assert_eq!(
            region_endpoint("us-west-2"),
            Some("ec2.us-west-2.amazonaws.com".to_string())
        );
        assert_eq!(region_endpoint("mars-north-1"), None);
    }
}
