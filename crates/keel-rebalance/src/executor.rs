//! Plan execution.
//!
//! Actions execute strictly in priority order. A same-priority group whose
//! actions are pairwise independent (disjoint tiers) runs concurrently; any
//! overlap serializes the group. Chain transactions are irreversible, so a
//! failure never rolls back: priority-0 failures fail the plan and halt,
//! anything else records the failure, skips dependents, and ends PARTIAL.

use alloy::primitives::Address;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use keel_chain::{ChainGateway, SendRequest, SignerRegistry, SignerRole};
use keel_core::{
    new_risk_event_id, ActionResult, Bps, PlanStatus, PlannedAction, RebalancePlan, RiskEvent,
    RiskLevel, Tier,
};
use keel_store::{PlanStore, ProjectionStore, RiskStore, Store};

use crate::error::{RebalanceError, RebalanceResult};
use crate::simulator::{project_state, Simulator, DRIFT_TOLERANCE};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-action send attempt budget.
    pub send_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { send_attempts: 3 }
    }
}

/// Executes approved plans through the gateway.
pub struct Executor {
    config: ExecutorConfig,
    gateway: Arc<dyn ChainGateway>,
    store: Arc<dyn Store>,
    signers: Arc<SignerRegistry>,
    vault: Address,
    simulator: Simulator,
}

impl Executor {
    #[must_use]
    pub fn new(
        config: ExecutorConfig,
        gateway: Arc<dyn ChainGateway>,
        store: Arc<dyn Store>,
        signers: Arc<SignerRegistry>,
        vault: Address,
    ) -> Self {
        let simulator = Simulator::new(gateway.clone(), vault);
        Self {
            config,
            gateway,
            store,
            signers,
            vault,
            simulator,
        }
    }

    /// Execute a plan end to end; returns the terminal status.
    pub async fn execute(&self, plan_id: &str) -> RebalanceResult<PlanStatus> {
        let plan = self
            .store
            .plan(plan_id)
            .await?
            .ok_or_else(|| RebalanceError::NotFound(plan_id.to_string()))?;

        let executable: &[PlanStatus] = if plan.requires_approval {
            &[PlanStatus::Approved]
        } else {
            &[PlanStatus::Draft, PlanStatus::Approved]
        };
        let moved = self
            .store
            .transition_plan(plan_id, executable, PlanStatus::Executing)
            .await?;
        if !moved {
            return Err(RebalanceError::Validation(format!(
                "plan {plan_id} is not executable from {}",
                plan.status
            )));
        }

        let holdings = self.store.holdings().await?;

        // Simulation gate: no partial execution on a failed simulation.
        if let Err(e) = self.simulator.simulate_plan(&plan, &holdings).await {
            error!(plan = %plan_id, error = %e, "Simulation gate failed, plan fails whole");
            self.store
                .transition_plan(plan_id, &[PlanStatus::Executing], PlanStatus::Failed)
                .await?;
            return Err(e);
        }

        let status = self.run_actions(&plan).await?;
        self.store
            .transition_plan(plan_id, &[PlanStatus::Executing], status)
            .await?;
        info!(plan = %plan_id, status = %status, "Plan finished");

        self.verify(&plan, &holdings).await?;
        Ok(status)
    }

    async fn run_actions(&self, plan: &RebalancePlan) -> RebalanceResult<PlanStatus> {
        let mut failed: Vec<PlannedAction> = Vec::new();
        let mut any_failure = false;

        let mut priorities: Vec<u8> = plan.actions.iter().map(|a| a.priority).collect();
        priorities.sort_unstable();
        priorities.dedup();

        for priority in priorities {
            let group: Vec<&PlannedAction> = plan
                .actions
                .iter()
                .filter(|a| a.priority == priority)
                .collect();

            // Skip actions dependent on anything that already failed.
            let mut runnable = Vec::new();
            for planned in group {
                let blocked = failed
                    .iter()
                    .any(|f| !planned.action.independent_of(&f.action));
                if blocked {
                    warn!(
                        plan = %plan.id,
                        index = planned.index,
                        "Skipping action dependent on a failed action"
                    );
                    self.store
                        .append_action_result(
                            &plan.id,
                            &ActionResult {
                                index: planned.index,
                                success: false,
                                tx_hash: None,
                                error: Some("skipped: depends on failed action".to_string()),
                                executed_at: Utc::now(),
                            },
                        )
                        .await?;
                    any_failure = true;
                } else {
                    runnable.push(planned);
                }
            }

            let pairwise_independent = runnable.iter().enumerate().all(|(i, a)| {
                runnable
                    .iter()
                    .skip(i + 1)
                    .all(|b| a.action.independent_of(&b.action))
            });

            if pairwise_independent && runnable.len() > 1 {
                // Whole group concurrent; each send still serializes on the
                // gateway's per-signer queue.
                let outcomes = join_all(runnable.iter().map(|planned| async {
                    (*planned, self.send_action(plan, planned).await)
                }))
                .await;
                for (planned, outcome) in outcomes {
                    if !self.record_outcome(plan, planned, outcome).await? {
                        any_failure = true;
                        failed.push(planned.clone());
                        if priority == 0 {
                            error!(plan = %plan.id, "Priority-0 action failed, halting plan");
                            return Ok(PlanStatus::Failed);
                        }
                    }
                }
            } else {
                for planned in &runnable {
                    let outcome = self.send_action(plan, planned).await;
                    if !self.record_outcome(plan, planned, outcome).await? {
                        any_failure = true;
                        failed.push((*planned).clone());
                        if priority == 0 {
                            error!(plan = %plan.id, "Priority-0 action failed, halting plan");
                            return Ok(PlanStatus::Failed);
                        }
                    }
                }
            }
        }

        Ok(if any_failure {
            PlanStatus::Partial
        } else {
            PlanStatus::Completed
        })
    }

    /// Persist one action outcome; returns whether it succeeded.
    async fn record_outcome(
        &self,
        plan: &RebalancePlan,
        planned: &PlannedAction,
        outcome: Result<String, RebalanceError>,
    ) -> RebalanceResult<bool> {
        match outcome {
            Ok(tx_hash) => {
                self.store
                    .append_action_result(
                        &plan.id,
                        &ActionResult {
                            index: planned.index,
                            success: true,
                            tx_hash: Some(tx_hash),
                            error: None,
                            executed_at: Utc::now(),
                        },
                    )
                    .await?;
                Ok(true)
            }
            Err(e) => {
                error!(plan = %plan.id, index = planned.index, error = %e, "Action failed");
                self.store
                    .append_action_result(
                        &plan.id,
                        &ActionResult {
                            index: planned.index,
                            success: false,
                            tx_hash: None,
                            error: Some(e.to_string()),
                            executed_at: Utc::now(),
                        },
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    /// Send one action with the per-action attempt budget. Returns the tx
    /// hash on success.
    async fn send_action(
        &self,
        plan: &RebalancePlan,
        planned: &PlannedAction,
    ) -> Result<String, RebalanceError> {
        let (method, args) = Simulator::call_for(&planned.action);
        let signer = self.signers.signer_for_role(SignerRole::Rebalancer)?;
        let request = SendRequest::new(self.vault, method, args, signer)
            .with_value(planned.action.amount());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.gateway.send(request.clone()).await {
                Ok(outcome) => {
                    info!(
                        plan = %plan.id,
                        index = planned.index,
                        method,
                        tx = %outcome.tx_hash,
                        "Action confirmed"
                    );
                    return Ok(format!("{:#x}", outcome.tx_hash));
                }
                Err(e) if e.is_transient() && attempt < self.config.send_attempts => {
                    warn!(
                        plan = %plan.id,
                        index = planned.index,
                        attempt,
                        error = %e,
                        "Send failed, retrying within budget"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Post-execution verification: compare fresh projection ratios to the
    /// plan's target; drift past 1% raises a warning-level risk event.
    async fn verify(&self, plan: &RebalancePlan, holdings: &[keel_store::Holding]) -> RebalanceResult<()> {
        let fund = self.store.fund().await?;
        let actual = fund.tier_state();
        let expected = project_state(&plan.pre_state, &plan.actions, holdings, &HashMap::new());

        let mut worst = Bps::ZERO;
        for tier in Tier::ALL {
            let drift = actual.ratio(tier).diff(expected.ratio(tier)).abs();
            if drift > worst {
                worst = drift;
            }
        }

        if worst > DRIFT_TOLERANCE {
            warn!(plan = %plan.id, drift = %worst, "Post-execution drift beyond tolerance");
            self.store
                .append_risk_event(&RiskEvent {
                    id: new_risk_event_id(),
                    level: RiskLevel::Elevated,
                    source: "rebalance_verification".to_string(),
                    message: format!(
                        "Plan {} post-execution drift {worst} exceeds {DRIFT_TOLERANCE}",
                        plan.id
                    ),
                    details: json!({ "planId": plan.id, "driftBps": worst.inner() }),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }
}
