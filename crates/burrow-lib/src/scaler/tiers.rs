//! Bastion instance tier catalog and selection
//!
//! A small static table of burstable and sustained-throughput tiers.
//! Selection walks the catalog cheapest-first: sustained capacity wins
//! over burst capacity, and a blown budget falls back to the cheapest
//! tier with a warning.

use serde::Serialize;
use tracing::warn;

/// One row of the tier catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceTier {
    pub name: &'static str,
    /// Sustained bandwidth in decimal Mbps
    pub baseline_bandwidth_mbps: u64,
    /// Burst bandwidth in decimal Mbps
    pub burst_bandwidth_mbps: u64,
    pub monthly_cost_usd: f64,
    pub recommended_max_tunnels: u32,
}

/// Catalog in ascending cost order
pub const CATALOG: &[InstanceTier] = &[
    InstanceTier {
        name: "t4g.nano",
        baseline_bandwidth_mbps: 32,
        burst_bandwidth_mbps: 5_000,
        monthly_cost_usd: 1.31,
        recommended_max_tunnels: 1,
    },
    InstanceTier {
        name: "t4g.micro",
        baseline_bandwidth_mbps: 62,
        burst_bandwidth_mbps: 5_000,
        monthly_cost_usd: 2.63,
        recommended_max_tunnels: 2,
    },
    InstanceTier {
        name: "t4g.small",
        baseline_bandwidth_mbps: 125,
        burst_bandwidth_mbps: 5_000,
        monthly_cost_usd: 5.26,
        recommended_max_tunnels: 4,
    },
    InstanceTier {
        name: "c6gn.medium",
        baseline_bandwidth_mbps: 3_125,
        burst_bandwidth_mbps: 12_500,
        monthly_cost_usd: 27.00,
        recommended_max_tunnels: 6,
    },
    InstanceTier {
        name: "c6gn.large",
        baseline_bandwidth_mbps: 6_250,
        burst_bandwidth_mbps: 25_000,
        monthly_cost_usd: 54.00,
        recommended_max_tunnels: 8,
    },
];

/// Pick the cheapest tier for a target throughput (bytes/s) within a
/// monthly budget.
///
/// Two passes: first a tier whose sustained bandwidth covers the target,
/// then one whose burst bandwidth does. If neither fits the budget, the
/// cheapest tier is returned and the shortfall logged.
pub fn select_tier(target_bytes_per_sec: u64, budget_usd: f64) -> &'static InstanceTier {
    let target_mbps = target_bytes_per_sec * 8 / 1_000_000;

    for tier in CATALOG {
        if tier.baseline_bandwidth_mbps >= target_mbps && tier.monthly_cost_usd <= budget_usd {
            return tier;
        }
    }
    for tier in CATALOG {
        if tier.burst_bandwidth_mbps >= target_mbps && tier.monthly_cost_usd <= budget_usd {
            warn!(
                tier = tier.name,
                target_mbps, "tier covers the target only in burst, not sustained"
            );
            return tier;
        }
    }

    warn!(
        target_mbps,
        budget_usd, "no tier fits the target within budget; falling back to the cheapest"
    );
    &CATALOG[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_cost_ordered() {
        for pair in CATALOG.windows(2) {
            assert!(pair[0].monthly_cost_usd < pair[1].monthly_cost_usd);
        }
    }

    #[test]
    fn test_selects_first_sustained_fit() {
        // 500 Mbps target, $30 budget: the burstable tiers cannot sustain
        // it, so the first sustained fit wins
        let tier = select_tier(62_500_000, 30.0);
        assert_eq!(tier.name, "c6gn.medium");
    }

    #[test]
    fn test_small_target_lands_on_cheapest_fit() {
        // 30 Mbps sustained fits the nano tier
        let tier = select_tier(3_750_000, 10.0);
        assert_eq!(tier.name, "t4g.nano");
    }

    #[test]
    fn test_burst_pass_used_when_sustained_cannot_cover() {
        // 10 Gbps target with a generous budget: nothing sustains it, the
        // first tier bursting that high is c6gn.medium
        let tier = select_tier(1_250_000_000, 100.0);
        assert_eq!(tier.name, "c6gn.medium");
    }

    #[test]
    fn test_blown_budget_falls_back_to_cheapest() {
        // 10 Gbps target, fifty-cent budget
        let tier = select_tier(1_250_000_000, 0.5);
        assert_eq!(tier.name, "t4g.nano");
    }
}
