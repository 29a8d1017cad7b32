//! Plan generation.
//!
//! Actions are emitted in priority order 0 (highest) to 3:
//! 0. pending-redemption preparation (waterfall on the deficit)
//! 1. L1 refill (L2 surplus first, then L3 redemption)
//! 2. L1 drain (purchase into L3 shortfall, then L2)
//! 3. buffer rebalancing between L2 and L3
//!
//! Actions below `min_rebalance_amount` are dropped; plans whose total
//! exceeds `approval_threshold` require approval.

use alloy::primitives::Address;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info};

use keel_core::{
    new_plan_id, Amount, Bps, PlanStatus, PlannedAction, PurchaseMethod, RebalanceAction,
    RebalancePlan, RebalanceTrigger, Tier, TierState,
};
use keel_store::Holding;

use crate::triggers::TriggerEvaluator;

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Actions below this are dropped.
    pub min_rebalance_amount: Amount,
    /// Plans above this total require approval.
    pub approval_threshold: Amount,
    /// Slippage limit stamped onto purchase actions.
    pub default_max_slippage: Bps,
    /// Outflow coverage ratio that arms waterfall preparation.
    pub outflow_coverage: Bps,
    /// Flat per-action gas estimate, base units.
    pub gas_per_action: Amount,
    /// Slippage assumed per purchase/redeem leg for the plan estimate.
    pub slippage_per_trade: Bps,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_rebalance_amount: Amount::from_units(10_000),
            approval_threshold: Amount::from_units(50_000),
            default_max_slippage: Bps(200),
            outflow_coverage: Bps(8_000),
            gas_per_action: Amount::from_base(2 * 10u128.pow(15)),
            slippage_per_trade: Bps(30),
        }
    }
}

/// Generates plans from tier state and pending-outflow pressure.
pub struct Planner {
    evaluator: TriggerEvaluator,
    config: PlannerConfig,
}

impl Planner {
    #[must_use]
    pub fn new(evaluator: TriggerEvaluator, config: PlannerConfig) -> Self {
        Self { evaluator, config }
    }

    #[must_use]
    pub fn evaluator(&self) -> &TriggerEvaluator {
        &self.evaluator
    }

    /// Build a plan. Returns `None` when no action survives the minimum
    /// amount filter.
    #[must_use]
    pub fn generate(
        &self,
        trigger: RebalanceTrigger,
        state: TierState,
        pending_outflow_7d: Amount,
        holdings: &[Holding],
    ) -> Option<RebalancePlan> {
        let targets = self.evaluator.targets();
        let deviations = self.evaluator.evaluate(&state);
        let mut actions: Vec<PlannedAction> = Vec::new();
        let mut index = 0u32;
        let mut push = |actions: &mut Vec<PlannedAction>, priority: u8, action: RebalanceAction, note: &str| {
            if action.amount() < self.config.min_rebalance_amount {
                debug!(%priority, note, amount = %action.amount(), "Dropping dust action");
                return;
            }
            actions.push(PlannedAction {
                index,
                priority,
                action,
                note: Some(note.to_string()),
            });
            index += 1;
        };

        // Priority 0: pending redemption preparation.
        let liquid = state.l1.saturating_add(state.l2);
        let covered = liquid.mul_bps(self.config.outflow_coverage);
        if pending_outflow_7d > covered {
            let deficit = pending_outflow_7d.saturating_sub(covered);
            push(
                &mut actions,
                0,
                RebalanceAction::Waterfall {
                    amount_needed: deficit,
                    max_tier: Tier::L3,
                },
                "confirmed 7d outflow exceeds liquid coverage",
            );
        }

        let l1 = targets.get(Tier::L1);
        let l1_ratio = state.ratio(Tier::L1);

        // Priority 1: L1 refill.
        if l1_ratio < l1.low {
            let mut deficit = state.total.mul_bps(l1.target.diff(l1_ratio));
            let l2_ratio = state.ratio(Tier::L2);
            let l2_target = targets.get(Tier::L2).target;
            if l2_ratio > l2_target {
                let surplus = state.total.mul_bps(l2_ratio.diff(l2_target));
                let transfer = deficit.min(surplus);
                push(
                    &mut actions,
                    1,
                    RebalanceAction::Transfer {
                        from_tier: Tier::L2,
                        to_tier: Tier::L1,
                        amount: transfer,
                    },
                    "refill L1 from L2 surplus",
                );
                deficit = deficit.saturating_sub(transfer);
            }
            if !deficit.is_zero() {
                if let Some(asset) = largest_holding(holdings, Tier::L3) {
                    push(
                        &mut actions,
                        1,
                        RebalanceAction::Redeem {
                            asset,
                            amount: deficit,
                            to_tier: Tier::L1,
                        },
                        "redeem L3 to cover remaining L1 deficit",
                    );
                }
            }
        }

        // Priority 2: L1 drain.
        if l1_ratio > l1.high {
            let mut excess = state.total.mul_bps(l1_ratio.diff(l1.target));
            let l3_ratio = state.ratio(Tier::L3);
            let l3_target = targets.get(Tier::L3).target;
            if l3_ratio < l3_target {
                let shortfall = state.total.mul_bps(l3_target.diff(l3_ratio));
                let amount = excess.min(shortfall);
                if let Some(asset) = largest_holding(holdings, Tier::L3) {
                    push(
                        &mut actions,
                        2,
                        RebalanceAction::Purchase {
                            asset,
                            from_tier: Tier::L1,
                            usdt_amount: amount,
                            method: PurchaseMethod::Direct,
                            max_slippage: self.config.default_max_slippage,
                        },
                        "deploy L1 excess into L3 shortfall",
                    );
                    excess = excess.saturating_sub(amount);
                }
            }
            if !excess.is_zero() {
                match largest_holding(holdings, Tier::L2) {
                    Some(asset) => push(
                        &mut actions,
                        2,
                        RebalanceAction::Purchase {
                            asset,
                            from_tier: Tier::L1,
                            usdt_amount: excess,
                            method: PurchaseMethod::Direct,
                            max_slippage: self.config.default_max_slippage,
                        },
                        "deploy remaining L1 excess into L2",
                    ),
                    None => push(
                        &mut actions,
                        2,
                        RebalanceAction::Transfer {
                            from_tier: Tier::L1,
                            to_tier: Tier::L2,
                            amount: excess,
                        },
                        "park remaining L1 excess in L2",
                    ),
                }
            }
        }

        // Priority 3: L2/L3 buffer when L1 sits inside its bounds.
        if l1_ratio >= l1.low && l1_ratio <= l1.high {
            for deviation in &deviations {
                if deviation.tier == Tier::L2 && deviation.needs_rebalance {
                    let (from, to) = if deviation.deviation.inner() > 0 {
                        (Tier::L2, Tier::L3)
                    } else {
                        (Tier::L3, Tier::L2)
                    };
                    push(
                        &mut actions,
                        3,
                        RebalanceAction::Transfer {
                            from_tier: from,
                            to_tier: to,
                            amount: deviation.amount_to_adjust,
                        },
                        "buffer rebalance between L2 and L3",
                    );
                }
            }
        }

        if actions.is_empty() {
            return None;
        }
        actions.sort_by_key(|a| (a.priority, a.index));

        let total_amount: Amount = actions.iter().map(|a| a.action.amount()).sum();
        let trades = actions
            .iter()
            .filter(|a| {
                matches!(
                    a.action,
                    RebalanceAction::Purchase { .. }
                        | RebalanceAction::Redeem { .. }
                        | RebalanceAction::Waterfall { .. }
                )
            })
            .count() as i64;
        let requires_approval = total_amount > self.config.approval_threshold;

        // The state the plan intends to reach: its own actions applied at
        // par. Simulation compares its predicted outputs against this.
        let target_state =
            crate::simulator::project_state(&state, &actions, holdings, &HashMap::new());
        let now = Utc::now();
        let plan = RebalancePlan {
            id: new_plan_id(),
            trigger,
            pre_state: state,
            target_state,
            deviations,
            actions,
            total_amount,
            estimated_gas_cost: Amount::from_base(
                self.config.gas_per_action.inner().to::<u128>()
                    * u128::from(index.max(1)),
            ),
            estimated_slippage: Bps(self.config.slippage_per_trade.inner() * trades),
            requires_approval,
            approval_ticket_id: None,
            status: PlanStatus::Draft,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        info!(
            plan = %plan.id,
            trigger = %trigger,
            actions = plan.actions.len(),
            total = %plan.total_amount,
            requires_approval,
            "Plan generated"
        );
        Some(plan)
    }
}

fn largest_holding(holdings: &[Holding], tier: Tier) -> Option<Address> {
    holdings
        .iter()
        .filter(|h| h.tier == tier)
        .max_by_key(|h| h.value)
        .map(|h| h.asset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::TierTargets;

    fn planner() -> Planner {
        Planner::new(
            TriggerEvaluator::new(TierTargets::default()),
            PlannerConfig::default(),
        )
    }

    fn holdings() -> Vec<Holding> {
        vec![
            Holding {
                asset: Address::with_last_byte(0x22),
                tier: Tier::L2,
                value: Amount::from_units(300_000),
            },
            Holding {
                asset: Address::with_last_byte(0x33),
                tier: Tier::L3,
                value: Amount::from_units(600_000),
            },
        ]
    }

    fn state(l1: u64, l2: u64, l3: u64) -> TierState {
        TierState {
            l1: Amount::from_units(l1),
            l2: Amount::from_units(l2),
            l3: Amount::from_units(l3),
            total: Amount::from_units(l1 + l2 + l3),
        }
    }

    #[test]
    fn test_balanced_state_yields_no_plan() {
        let plan = planner().generate(
            RebalanceTrigger::Threshold,
            state(100_000, 300_000, 600_000),
            Amount::ZERO,
            &holdings(),
        );
        assert!(plan.is_none());
    }

    #[test]
    fn test_l1_refill_prefers_l2_surplus_then_l3() {
        // L1 5%, L2 35% (surplus 5%), L3 60%.
        let plan = planner()
            .generate(
                RebalanceTrigger::Liquidity,
                state(50_000, 350_000, 600_000),
                Amount::ZERO,
                &holdings(),
            )
            .unwrap();

        assert_eq!(plan.actions.len(), 1, "L2 surplus covers the deficit");
        match &plan.actions[0].action {
            RebalanceAction::Transfer {
                from_tier,
                to_tier,
                amount,
            } => {
                assert_eq!(*from_tier, Tier::L2);
                assert_eq!(*to_tier, Tier::L1);
                assert_eq!(*amount, Amount::from_units(50_000));
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert!(plan.amounts_consistent());
    }

    #[test]
    fn test_l1_refill_falls_through_to_l3_redeem() {
        // L1 4%, L2 at target, L3 66%: no L2 surplus.
        let plan = planner()
            .generate(
                RebalanceTrigger::Liquidity,
                state(40_000, 300_000, 660_000),
                Amount::ZERO,
                &holdings(),
            )
            .unwrap();

        let redeem = plan
            .actions
            .iter()
            .find(|a| matches!(a.action, RebalanceAction::Redeem { .. }))
            .expect("redeem leg present");
        match &redeem.action {
            RebalanceAction::Redeem { amount, to_tier, .. } => {
                assert_eq!(*to_tier, Tier::L1);
                assert_eq!(*amount, Amount::from_units(60_000));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_waterfall_preparation_outranks_refill() {
        let state = state(50_000, 350_000, 600_000);
        // 7d confirmed outflow 500k vs 80% of 400k liquid = 320k.
        let plan = planner()
            .generate(
                RebalanceTrigger::Liquidity,
                state,
                Amount::from_units(500_000),
                &holdings(),
            )
            .unwrap();

        assert_eq!(plan.actions[0].priority, 0);
        match &plan.actions[0].action {
            RebalanceAction::Waterfall {
                amount_needed,
                max_tier,
            } => {
                assert_eq!(*amount_needed, Amount::from_units(180_000));
                assert_eq!(*max_tier, Tier::L3);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_min_amount_boundary() {
        // A 10k action exactly at the minimum is kept: 100k book, empty L1,
        // L2 surplus of exactly 10%.
        let plan = planner()
            .generate(
                RebalanceTrigger::Threshold,
                state(0, 40_000, 60_000),
                Amount::ZERO,
                &holdings(),
            )
            .expect("action at the minimum survives");
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].action.amount(), Amount::from_units(10_000));

        // Scale the book down 1%: the lone action falls below the minimum
        // and the plan collapses.
        let none = planner().generate(
            RebalanceTrigger::Threshold,
            state(0, 39_600, 59_400),
            Amount::ZERO,
            &holdings(),
        );
        assert!(none.is_none());
    }

    #[test]
    fn test_approval_threshold_gate() {
        // Exactly 50k total does not exceed the threshold.
        let at_threshold = planner()
            .generate(
                RebalanceTrigger::Threshold,
                state(50_000, 350_000, 600_000),
                Amount::ZERO,
                &holdings(),
            )
            .unwrap();
        assert_eq!(at_threshold.total_amount, Amount::from_units(50_000));
        assert!(!at_threshold.requires_approval);

        // A 60k plan does.
        let over = planner()
            .generate(
                RebalanceTrigger::Threshold,
                state(40_000, 360_000, 600_000),
                Amount::ZERO,
                &holdings(),
            )
            .unwrap();
        assert_eq!(over.total_amount, Amount::from_units(60_000));
        assert!(over.requires_approval);
    }

    #[test]
    fn test_l1_drain_purchases_into_l3_shortfall() {
        // L1 20%, L3 52% (shortfall 8%).
        let plan = planner()
            .generate(
                RebalanceTrigger::Threshold,
                state(200_000, 280_000, 520_000),
                Amount::ZERO,
                &holdings(),
            )
            .unwrap();

        let purchase = plan
            .actions
            .iter()
            .find(|a| matches!(a.action, RebalanceAction::Purchase { .. }))
            .expect("purchase leg present");
        match &purchase.action {
            RebalanceAction::Purchase {
                from_tier,
                usdt_amount,
                max_slippage,
                ..
            } => {
                assert_eq!(*from_tier, Tier::L1);
                // Excess 10% = 100k, L3 shortfall 8% = 80k.
                assert_eq!(*usdt_amount, Amount::from_units(80_000));
                assert_eq!(*max_slippage, Bps(200));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
