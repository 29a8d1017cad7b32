//! Rebalance engine facade: check, plan, gate, execute.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::info;

use keel_core::{
    new_plan_id, Amount, PlanStatus, PlannedAction, RebalanceAction, RebalancePlan,
    RebalanceTrigger, Tier,
};
use keel_store::{PlanStore, ProjectionStore, RedemptionStore, Store};

use crate::error::{RebalanceError, RebalanceResult};
use crate::executor::Executor;
use crate::planner::Planner;

/// Outcome of a trigger check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Tiers within thresholds and no outflow pressure.
    NoAction,
    /// A plan was generated and persisted.
    Planned {
        plan_id: String,
        requires_approval: bool,
        total_amount: Amount,
    },
}

/// The rebalance engine.
pub struct RebalanceEngine {
    store: Arc<dyn Store>,
    planner: Planner,
    executor: Executor,
}

impl RebalanceEngine {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, planner: Planner, executor: Executor) -> Self {
        Self {
            store,
            planner,
            executor,
        }
    }

    /// Evaluate triggers and persist a plan when one is warranted.
    ///
    /// Scheduled ticks, NAV updates, and large flows all come through here;
    /// manual triggers always attempt plan generation.
    pub async fn run_check(&self, trigger: RebalanceTrigger) -> RebalanceResult<CheckOutcome> {
        let fund = self.store.fund().await?;
        let state = fund.tier_state();
        if state.total.is_zero() {
            return Ok(CheckOutcome::NoAction);
        }

        let deviations = self.planner.evaluator().evaluate(&state);
        let pending_outflow = self
            .store
            .pending_outflow_within(Utc::now() + ChronoDuration::days(7))
            .await?;

        let forced = matches!(
            trigger,
            RebalanceTrigger::Manual | RebalanceTrigger::Emergency
        );
        if !forced && !self.planner.evaluator().needs_rebalancing(&deviations) {
            // Outflow pressure alone can still warrant a waterfall plan.
            let liquid = state.l1.saturating_add(state.l2);
            if pending_outflow <= liquid.mul_bps(keel_core::Bps(8_000)) {
                return Ok(CheckOutcome::NoAction);
            }
        }

        let holdings = self.store.holdings().await?;
        let Some(plan) = self
            .planner
            .generate(trigger, state, pending_outflow, &holdings)
        else {
            return Ok(CheckOutcome::NoAction);
        };

        let plan_id = plan.id.clone();
        let requires_approval = plan.requires_approval;
        let total_amount = plan.total_amount;
        self.store.insert_plan(&plan).await?;
        if requires_approval {
            self.store
                .transition_plan(&plan_id, &[PlanStatus::Draft], PlanStatus::PendingApproval)
                .await?;
        }

        Ok(CheckOutcome::Planned {
            plan_id,
            requires_approval,
            total_amount,
        })
    }

    /// Generate a plan without persisting it (the `PreviewPlan` command).
    pub async fn preview(
        &self,
        trigger: RebalanceTrigger,
    ) -> RebalanceResult<Option<RebalancePlan>> {
        let fund = self.store.fund().await?;
        let state = fund.tier_state();
        let pending_outflow = self
            .store
            .pending_outflow_within(Utc::now() + ChronoDuration::days(7))
            .await?;
        let holdings = self.store.holdings().await?;
        Ok(self
            .planner
            .generate(trigger, state, pending_outflow, &holdings))
    }

    /// Execute an approved (or approval-free) plan.
    pub async fn execute(&self, plan_id: &str) -> RebalanceResult<PlanStatus> {
        self.executor.execute(plan_id).await
    }

    /// Build and persist an emergency waterfall plan for a shortfall.
    ///
    /// Emergency plans bypass the approval gate; the incident lease is the
    /// control.
    pub async fn emergency_waterfall(&self, shortfall: Amount) -> RebalanceResult<String> {
        self.waterfall_plan(shortfall, RebalanceTrigger::Emergency, false)
            .await
    }

    /// Waterfall preparation outside an incident: the plan goes through the
    /// approval gate before anything executes.
    pub async fn prepare_waterfall(&self, shortfall: Amount) -> RebalanceResult<String> {
        let plan_id = self
            .waterfall_plan(shortfall, RebalanceTrigger::Liquidity, true)
            .await?;
        self.store
            .transition_plan(&plan_id, &[PlanStatus::Draft], PlanStatus::PendingApproval)
            .await?;
        Ok(plan_id)
    }

    async fn waterfall_plan(
        &self,
        shortfall: Amount,
        trigger: RebalanceTrigger,
        requires_approval: bool,
    ) -> RebalanceResult<String> {
        if shortfall.is_zero() {
            return Err(RebalanceError::Validation(
                "waterfall shortfall must be positive".to_string(),
            ));
        }
        let fund = self.store.fund().await?;
        let state = fund.tier_state();
        let now = Utc::now();
        let action = PlannedAction {
            index: 0,
            priority: 0,
            action: RebalanceAction::Waterfall {
                amount_needed: shortfall,
                max_tier: Tier::L3,
            },
            note: Some("emergency liquidity shortfall".to_string()),
        };
        let holdings = self.store.holdings().await?;
        let target_state = crate::simulator::project_state(
            &state,
            std::slice::from_ref(&action),
            &holdings,
            &std::collections::HashMap::new(),
        );
        let plan = RebalancePlan {
            id: new_plan_id(),
            trigger,
            pre_state: state,
            target_state,
            deviations: self.planner.evaluator().evaluate(&state),
            actions: vec![action],
            total_amount: shortfall,
            estimated_gas_cost: Amount::ZERO,
            estimated_slippage: keel_core::Bps::ZERO,
            requires_approval,
            approval_ticket_id: None,
            status: PlanStatus::Draft,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_plan(&plan).await?;
        info!(plan = %plan.id, %shortfall, %trigger, "Waterfall plan persisted");
        Ok(plan.id)
    }
}
