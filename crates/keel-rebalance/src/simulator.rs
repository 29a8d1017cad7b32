//! Simulation gate.
//!
//! Every action dry-runs against latest state before any execution. A revert
//! or a predicted slippage above the action's limit fails the whole plan, and
//! the post-state projected from simulated outputs must land within the
//! drift tolerance of the plan's target state.

use alloy::primitives::Address;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use keel_chain::ChainGateway;
use keel_core::{Amount, Bps, PlannedAction, RebalanceAction, RebalancePlan, Tier, TierState};
use keel_store::Holding;

use crate::error::{RebalanceError, RebalanceResult};

/// Drift tolerance between projected and target state (1%).
pub const DRIFT_TOLERANCE: Bps = Bps(100);

/// Plan simulator.
pub struct Simulator {
    gateway: Arc<dyn ChainGateway>,
    vault: Address,
}

impl Simulator {
    #[must_use]
    pub fn new(gateway: Arc<dyn ChainGateway>, vault: Address) -> Self {
        Self { gateway, vault }
    }

    /// Call encoding for one action; shared with the executor so the dry-run
    /// and the send hit the same method.
    #[must_use]
    pub fn call_for(action: &RebalanceAction) -> (&'static str, Value) {
        match action {
            RebalanceAction::Transfer {
                from_tier,
                to_tier,
                amount,
            } => (
                "allocateToLayer(uint8,uint8,uint256)",
                json!([from_tier.depth(), to_tier.depth(), amount.to_string()]),
            ),
            RebalanceAction::Purchase {
                asset, usdt_amount, ..
            } => (
                "purchaseAsset(address,uint256)",
                json!([format!("{asset:#x}"), usdt_amount.to_string()]),
            ),
            RebalanceAction::Redeem {
                asset,
                amount,
                to_tier,
            } => (
                "redeemAsset(address,uint256,uint8)",
                json!([format!("{asset:#x}"), amount.to_string(), to_tier.depth()]),
            ),
            RebalanceAction::Waterfall {
                amount_needed,
                max_tier,
            } => (
                "executeWaterfallLiquidation(uint256,uint8)",
                json!([amount_needed.to_string(), max_tier.depth()]),
            ),
        }
    }

    /// Simulate the whole plan. Any failure fails the plan before any write.
    pub async fn simulate_plan(
        &self,
        plan: &RebalancePlan,
        holdings: &[Holding],
    ) -> RebalanceResult<()> {
        let mut actuals: HashMap<u32, Amount> = HashMap::new();
        for planned in &plan.actions {
            if let Some(actual_out) = self.simulate_action(planned).await? {
                actuals.insert(planned.index, actual_out);
            }
        }

        let projected = project_state(&plan.pre_state, &plan.actions, holdings, &actuals);
        for tier in Tier::ALL {
            let drift = projected
                .ratio(tier)
                .diff(plan.target_state.ratio(tier))
                .abs();
            if drift > DRIFT_TOLERANCE {
                return Err(RebalanceError::ProjectedDrift {
                    drift,
                    tolerance: DRIFT_TOLERANCE,
                });
            }
        }
        Ok(())
    }

    /// Simulate one action. Returns the simulated output amount for trades
    /// (`[amountOut, slippageBps]` convention), `None` for transfers.
    async fn simulate_action(&self, planned: &PlannedAction) -> RebalanceResult<Option<Amount>> {
        let (method, args) = Self::call_for(&planned.action);
        let simulation = self.gateway.simulate(self.vault, method, args).await?;

        if !simulation.success {
            let reason = simulation
                .revert_reason
                .unwrap_or_else(|| "no revert reason".to_string());
            warn!(index = planned.index, method, %reason, "Action simulation reverted");
            return Err(RebalanceError::SimulationReverted(reason));
        }

        let word = |position: usize| {
            simulation
                .output
                .get(position)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let max_slippage = match &planned.action {
            RebalanceAction::Purchase { max_slippage, .. } => Some(*max_slippage),
            RebalanceAction::Redeem { .. } => None,
            _ => None,
        };
        if let Some(limit) = max_slippage {
            let predicted = word(1)
                .and_then(|s| s.parse::<i64>().ok())
                .map(Bps)
                .unwrap_or(Bps::ZERO);
            if predicted > limit {
                return Err(RebalanceError::SlippageExceeded {
                    predicted,
                    limit,
                });
            }
        }

        debug!(index = planned.index, method, "Action simulated clean");
        let actual_out = match &planned.action {
            RebalanceAction::Transfer { .. } => None,
            _ => word(0).and_then(|s| s.parse().ok()),
        };
        Ok(actual_out)
    }
}

/// Tier an asset's value belongs to; unknown assets default to L3.
#[must_use]
pub fn asset_tier(holdings: &[Holding], asset: Address) -> Tier {
    holdings
        .iter()
        .find(|h| h.asset == asset)
        .map(|h| h.tier)
        .unwrap_or(Tier::L3)
}

/// Apply planned tier movements to a state copy.
///
/// `actuals` overrides the credited side per action index (simulated or
/// executed output amounts); absent entries move at par.
#[must_use]
pub fn project_state(
    pre: &TierState,
    actions: &[PlannedAction],
    holdings: &[Holding],
    actuals: &HashMap<u32, Amount>,
) -> TierState {
    fn credit(state: &mut TierState, tier: Tier, amount: Amount) {
        match tier {
            Tier::L1 => state.l1 = state.l1.saturating_add(amount),
            Tier::L2 => state.l2 = state.l2.saturating_add(amount),
            Tier::L3 => state.l3 = state.l3.saturating_add(amount),
        }
    }
    fn debit(state: &mut TierState, tier: Tier, amount: Amount) {
        match tier {
            Tier::L1 => state.l1 = state.l1.saturating_sub(amount),
            Tier::L2 => state.l2 = state.l2.saturating_sub(amount),
            Tier::L3 => state.l3 = state.l3.saturating_sub(amount),
        }
    }

    let mut state = *pre;
    for planned in actions {
        let out = actuals
            .get(&planned.index)
            .copied()
            .unwrap_or(planned.action.amount());
        match &planned.action {
            RebalanceAction::Transfer {
                from_tier,
                to_tier,
                amount,
            } => {
                debit(&mut state, *from_tier, *amount);
                credit(&mut state, *to_tier, *amount);
            }
            RebalanceAction::Purchase {
                asset,
                from_tier,
                usdt_amount,
                ..
            } => {
                debit(&mut state, *from_tier, *usdt_amount);
                credit(&mut state, asset_tier(holdings, *asset), out);
            }
            RebalanceAction::Redeem {
                asset,
                amount,
                to_tier,
            } => {
                debit(&mut state, asset_tier(holdings, *asset), *amount);
                credit(&mut state, *to_tier, out);
            }
            RebalanceAction::Waterfall { amount_needed, .. } => {
                debit(&mut state, Tier::L3, *amount_needed);
                credit(&mut state, Tier::L1, out);
            }
        }
    }
    state
}
