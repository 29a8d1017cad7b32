//! Rebalance plans, actions, and deviation reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use alloy::primitives::Address;

use crate::amount::{Amount, Bps};
use crate::tier::Tier;

/// What caused a plan to be generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceTrigger {
    /// Hourly threshold check.
    Threshold,
    /// 5-minute liquidity check or risk-engine invocation.
    Liquidity,
    /// Daily strategic check.
    Strategic,
    /// NAV update.
    NavUpdate,
    /// Large deposit or redemption flow.
    LargeFlow,
    /// Operator command.
    Manual,
    /// Emergency driver.
    Emergency,
}

impl fmt::Display for RebalanceTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threshold => write!(f, "THRESHOLD"),
            Self::Liquidity => write!(f, "LIQUIDITY"),
            Self::Strategic => write!(f, "STRATEGIC"),
            Self::NavUpdate => write!(f, "NAV_UPDATE"),
            Self::LargeFlow => write!(f, "LARGE_FLOW"),
            Self::Manual => write!(f, "MANUAL"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// How a purchase is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseMethod {
    Direct,
    Dex,
}

/// One step of a plan. Lower `priority` executes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceAction {
    Transfer {
        from_tier: Tier,
        to_tier: Tier,
        amount: Amount,
    },
    Purchase {
        asset: Address,
        from_tier: Tier,
        usdt_amount: Amount,
        method: PurchaseMethod,
        max_slippage: Bps,
    },
    Redeem {
        asset: Address,
        amount: Amount,
        to_tier: Tier,
    },
    Waterfall {
        amount_needed: Amount,
        max_tier: Tier,
    },
}

impl RebalanceAction {
    /// Monetary size of the action.
    #[must_use]
    pub fn amount(&self) -> Amount {
        match self {
            Self::Transfer { amount, .. } => *amount,
            Self::Purchase { usdt_amount, .. } => *usdt_amount,
            Self::Redeem { amount, .. } => *amount,
            Self::Waterfall { amount_needed, .. } => *amount_needed,
        }
    }

    /// Tier the action draws from, if any.
    #[must_use]
    pub fn from_tier(&self) -> Option<Tier> {
        match self {
            Self::Transfer { from_tier, .. } => Some(*from_tier),
            Self::Purchase { from_tier, .. } => Some(*from_tier),
            Self::Redeem { .. } => None,
            Self::Waterfall { .. } => None,
        }
    }

    /// Tier the action credits, if any.
    #[must_use]
    pub fn to_tier(&self) -> Option<Tier> {
        match self {
            Self::Transfer { to_tier, .. } => Some(*to_tier),
            Self::Purchase { .. } => None,
            Self::Redeem { to_tier, .. } => Some(*to_tier),
            Self::Waterfall { .. } => None,
        }
    }

    /// Two actions are independent when their tier sets are disjoint.
    ///
    /// Waterfall actions touch every tier up to `max_tier` and are never
    /// independent of anything.
    #[must_use]
    pub fn independent_of(&self, other: &RebalanceAction) -> bool {
        if matches!(self, Self::Waterfall { .. }) || matches!(other, Self::Waterfall { .. }) {
            return false;
        }
        let mine = [self.from_tier(), self.to_tier()];
        let theirs = [other.from_tier(), other.to_tier()];
        for a in mine.into_iter().flatten() {
            for b in theirs.into_iter().flatten() {
                if a == b {
                    return false;
                }
            }
        }
        true
    }
}

/// A prioritized action within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// Position within the plan, unique per plan.
    pub index: u32,
    /// Execution priority; 0 executes first.
    pub priority: u8,
    pub action: RebalanceAction,
    pub note: Option<String>,
}

/// Result of executing one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub index: u32,
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Plan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl PlanStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "DRAFT"),
            Self::PendingApproval => write!(f, "PENDING_APPROVAL"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Point-in-time tier allocation snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierState {
    pub l1: Amount,
    pub l2: Amount,
    pub l3: Amount,
    pub total: Amount,
}

impl TierState {
    #[must_use]
    pub fn value(&self, tier: Tier) -> Amount {
        match tier {
            Tier::L1 => self.l1,
            Tier::L2 => self.l2,
            Tier::L3 => self.l3,
        }
    }

    #[must_use]
    pub fn ratio(&self, tier: Tier) -> Bps {
        self.value(tier).ratio_bps(self.total)
    }
}

/// Deviation of one tier from its target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierDeviation {
    pub tier: Tier,
    pub current_ratio: Bps,
    pub target_ratio: Bps,
    /// Signed: positive means over-allocated.
    pub deviation: Bps,
    pub amount_to_adjust: Amount,
    pub needs_rebalance: bool,
    pub within_bounds: bool,
}

/// A rebalance plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub id: String,
    pub trigger: RebalanceTrigger,
    pub pre_state: TierState,
    pub target_state: TierState,
    pub deviations: Vec<TierDeviation>,
    /// Ordered by ascending priority, then index.
    pub actions: Vec<PlannedAction>,
    pub total_amount: Amount,
    pub estimated_gas_cost: Amount,
    pub estimated_slippage: Bps,
    pub requires_approval: bool,
    pub approval_ticket_id: Option<String>,
    pub status: PlanStatus,
    pub results: Vec<ActionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RebalancePlan {
    /// Invariant: the sum of action amounts equals `total_amount`.
    #[must_use]
    pub fn amounts_consistent(&self) -> bool {
        let sum: Amount = self.actions.iter().map(|a| a.action.amount()).sum();
        sum == self.total_amount
    }
}

/// Generate a plan id: `RBL-` + 8 uppercase hex chars.
#[must_use]
pub fn new_plan_id() -> String {
    format!(
        "RBL-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: Tier, to: Tier, units: u64) -> RebalanceAction {
        RebalanceAction::Transfer {
            from_tier: from,
            to_tier: to,
            amount: Amount::from_units(units),
        }
    }

    #[test]
    fn test_action_independence() {
        let a = transfer(Tier::L2, Tier::L1, 100);
        let b = transfer(Tier::L3, Tier::L2, 100);
        // Share L2.
        assert!(!a.independent_of(&b));

        let c = RebalanceAction::Redeem {
            asset: Address::ZERO,
            amount: Amount::from_units(50),
            to_tier: Tier::L3,
        };
        assert!(a.independent_of(&c));
        assert!(c.independent_of(&a));
    }

    #[test]
    fn test_waterfall_never_independent() {
        let w = RebalanceAction::Waterfall {
            amount_needed: Amount::from_units(1000),
            max_tier: Tier::L3,
        };
        let t = transfer(Tier::L2, Tier::L1, 100);
        assert!(!w.independent_of(&t));
        assert!(!t.independent_of(&w));
    }

    #[test]
    fn test_tier_state_ratio() {
        let state = TierState {
            l1: Amount::from_units(100),
            l2: Amount::from_units(300),
            l3: Amount::from_units(600),
            total: Amount::from_units(1000),
        };
        assert_eq!(state.ratio(Tier::L1), Bps(1000));
        assert_eq!(state.ratio(Tier::L3), Bps(6000));
    }

    #[test]
    fn test_plan_id_format() {
        let id = new_plan_id();
        assert!(id.starts_with("RBL-"));
        assert_eq!(id.len(), 12);
    }
}
