//! Liquidity tier definitions and per-tier rebalancing bounds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Bps;

/// Liquidity tier of the fund.
///
/// L1 holds cash and short-dated yield, L2 money-market instruments,
/// L3 high-yield RWA positions. Liquidation cost rises with the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    L1,
    L2,
    L3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::L1, Tier::L2, Tier::L3];

    /// Numeric depth used for waterfall ordering (L1 = 1).
    #[must_use]
    pub fn depth(&self) -> u8 {
        match self {
            Tier::L1 => 1,
            Tier::L2 => 2,
            Tier::L3 => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::L1 => write!(f, "L1"),
            Tier::L2 => write!(f, "L2"),
            Tier::L3 => write!(f, "L3"),
        }
    }
}

/// Target allocation and bounds for one tier, in basis points of total assets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierConfig {
    /// Target share of total assets.
    pub target: Bps,
    /// Lower bound before a refill is required.
    pub low: Bps,
    /// Upper bound before a drain is required.
    pub high: Bps,
    /// Deviation from target that triggers threshold-based rebalancing.
    pub rebalance_threshold: Bps,
}

impl TierConfig {
    /// Check whether a current ratio sits inside [low, high].
    #[must_use]
    pub fn within_bounds(&self, ratio: Bps) -> bool {
        ratio >= self.low && ratio <= self.high
    }

    /// Check whether a current ratio is within the rebalance threshold of target.
    #[must_use]
    pub fn within_threshold(&self, ratio: Bps) -> bool {
        ratio.diff(self.target).abs() <= self.rebalance_threshold
    }
}

/// Per-tier configuration table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierTargets {
    pub l1: TierConfig,
    pub l2: TierConfig,
    pub l3: TierConfig,
}

impl TierTargets {
    #[must_use]
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::L1 => &self.l1,
            Tier::L2 => &self.l2,
            Tier::L3 => &self.l3,
        }
    }

    /// Sum of tier targets; a well-formed table sums to ~100%.
    #[must_use]
    pub fn target_sum(&self) -> Bps {
        Bps(self.l1.target.0 + self.l2.target.0 + self.l3.target.0)
    }
}

impl Default for TierTargets {
    fn default() -> Self {
        // L1 10%, L2 30%, L3 60%.
        Self {
            l1: TierConfig {
                target: Bps(1_000),
                low: Bps(800),
                high: Bps(1_500),
                rebalance_threshold: Bps(200),
            },
            l2: TierConfig {
                target: Bps(3_000),
                low: Bps(2_500),
                high: Bps(3_500),
                rebalance_threshold: Bps(300),
            },
            l3: TierConfig {
                target: Bps(6_000),
                low: Bps(5_500),
                high: Bps(6_500),
                rebalance_threshold: Bps(300),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_targets_sum_to_one() {
        let targets = TierTargets::default();
        assert_eq!(targets.target_sum(), Bps::ONE);
    }

    #[test]
    fn test_within_bounds() {
        let cfg = TierTargets::default();
        assert!(cfg.l1.within_bounds(Bps(1_000)));
        assert!(cfg.l1.within_bounds(Bps(800)));
        assert!(!cfg.l1.within_bounds(Bps(799)));
        assert!(!cfg.l1.within_bounds(Bps(1_501)));
    }

    #[test]
    fn test_within_threshold() {
        let cfg = TierTargets::default();
        assert!(cfg.l1.within_threshold(Bps(1_199)));
        assert!(cfg.l1.within_threshold(Bps(1_200)));
        assert!(!cfg.l1.within_threshold(Bps(1_201)));
    }

    #[test]
    fn test_waterfall_depth_order() {
        assert!(Tier::L1.depth() < Tier::L2.depth());
        assert!(Tier::L2.depth() < Tier::L3.depth());
    }
}
