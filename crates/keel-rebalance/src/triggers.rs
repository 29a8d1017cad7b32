//! Trigger evaluation: per-tier deviation from target.

use keel_core::{Tier, TierDeviation, TierState, TierTargets};

/// Evaluates tier deviations against the configured bounds.
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    targets: TierTargets,
}

impl TriggerEvaluator {
    #[must_use]
    pub fn new(targets: TierTargets) -> Self {
        Self { targets }
    }

    #[must_use]
    pub fn targets(&self) -> &TierTargets {
        &self.targets
    }

    /// Deviation of every tier from its target.
    #[must_use]
    pub fn evaluate(&self, state: &TierState) -> Vec<TierDeviation> {
        Tier::ALL
            .iter()
            .map(|&tier| {
                let config = self.targets.get(tier);
                let current = state.ratio(tier);
                let deviation = current.diff(config.target);
                TierDeviation {
                    tier,
                    current_ratio: current,
                    target_ratio: config.target,
                    deviation,
                    amount_to_adjust: state.total.mul_bps(deviation.abs()),
                    needs_rebalance: !config.within_threshold(current),
                    within_bounds: config.within_bounds(current),
                }
            })
            .collect()
    }

    /// True when any tier drifted past its rebalance threshold.
    #[must_use]
    pub fn needs_rebalancing(&self, deviations: &[TierDeviation]) -> bool {
        deviations.iter().any(|d| d.needs_rebalance)
    }

    /// True when any tier left its hard bounds.
    #[must_use]
    pub fn out_of_bounds(&self, deviations: &[TierDeviation]) -> bool {
        deviations.iter().any(|d| !d.within_bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Amount, Bps};

    fn state(l1: u64, l2: u64, l3: u64) -> TierState {
        TierState {
            l1: Amount::from_units(l1),
            l2: Amount::from_units(l2),
            l3: Amount::from_units(l3),
            total: Amount::from_units(l1 + l2 + l3),
        }
    }

    #[test]
    fn test_balanced_state_needs_nothing() {
        let evaluator = TriggerEvaluator::new(TierTargets::default());
        let deviations = evaluator.evaluate(&state(100, 300, 600));
        assert!(!evaluator.needs_rebalancing(&deviations));
        assert!(!evaluator.out_of_bounds(&deviations));
        assert!(deviations.iter().all(|d| d.deviation == Bps::ZERO));
    }

    #[test]
    fn test_l1_shortfall_flags_rebalance() {
        let evaluator = TriggerEvaluator::new(TierTargets::default());
        // L1 at 5% against a 10% target and 8% floor.
        let deviations = evaluator.evaluate(&state(50, 330, 620));
        let l1 = deviations.iter().find(|d| d.tier == Tier::L1).unwrap();
        assert_eq!(l1.current_ratio, Bps(500));
        assert_eq!(l1.deviation, Bps(-500));
        assert!(l1.needs_rebalance);
        assert!(!l1.within_bounds);
        assert!(evaluator.needs_rebalancing(&deviations));
        assert!(evaluator.out_of_bounds(&deviations));
    }

    #[test]
    fn test_deviation_amount_is_signed_magnitude() {
        let evaluator = TriggerEvaluator::new(TierTargets::default());
        let deviations = evaluator.evaluate(&state(50, 330, 620));
        let l1 = deviations.iter().find(|d| d.tier == Tier::L1).unwrap();
        // 5% of 1000 units.
        assert_eq!(l1.amount_to_adjust, Amount::from_units(50));
    }

    #[test]
    fn test_within_threshold_is_not_flagged() {
        let evaluator = TriggerEvaluator::new(TierTargets::default());
        // L1 at 11%, threshold is ±2%.
        let deviations = evaluator.evaluate(&state(110, 295, 595));
        let l1 = deviations.iter().find(|d| d.tier == Tier::L1).unwrap();
        assert!(!l1.needs_rebalance);
        assert!(l1.within_bounds);
    }
}
