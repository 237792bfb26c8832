//! `burrow probe` - network performance discovery

use std::time::Duration;

use anyhow::{Context, Result};
use burrow_lib::probe::{report, NetworkProber};

use crate::config::BurrowConfig;
use crate::output::{print_info, print_success, OutputFormat};

pub async fn run(
    config: &BurrowConfig,
    region: Option<String>,
    save: bool,
    quick: bool,
    format: OutputFormat,
) -> Result<()> {
    let region = region.unwrap_or_else(|| config.region.clone());
    let mut probe_config = config.probe_config();

    if quick {
        probe_config.mtu_candidates.retain(|&mtu| mtu <= 1500);
        probe_config.latency_sample_count = probe_config.latency_sample_count.min(10);
        probe_config.test_duration = probe_config.test_duration.min(Duration::from_secs(5));
        print_info("quick probe: reduced MTU candidates and sample counts");
    }

    let prober = NetworkProber::new(probe_config);
    let results = prober
        .probe(&region)
        .await
        .with_context(|| format!("network probing against {region} failed"))?;

    match format {
        OutputFormat::Table => {
            print!("{}", report::render(&results));
            println!();
            print_info(&format!(
                "suggested deployment: burrow up --region {region} --tunnels {}",
                results.optimal_stream_count
            ));
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    if save {
        let path = report::save(&results, None).await?;
        print_success(&format!("results saved to {}", path.display()));
    }

    Ok(())
}
