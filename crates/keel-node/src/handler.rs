//! Task handler: routes queued work into the engines.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use keel_approval::{ApprovalEngine, ApprovalError};
use keel_chain::{ChainGateway, SendRequest, SignerRegistry, SignerRole};
use keel_core::{
    ForecastHorizon, LiquidityRecommendation, RebalanceTrigger, ReportPeriod, TaskKind,
};
use keel_projection::{Dispatcher, ProjectionError};
use keel_rebalance::{CheckOutcome, RebalanceEngine, RebalanceError};
use keel_risk::{Forecaster, RiskMonitor};
use keel_store::{AuditEntry, AuditStore, ProjectionStore, Store};
use keel_tasks::{TaskError, TaskHandler, TaskQueue, TaskResult};
use keel_telemetry::metrics;

use crate::approval_link::request_rebalance_approval;

/// The node's task routing.
pub struct NodeTaskHandler {
    pub dispatcher: Arc<Dispatcher>,
    pub approval: Arc<ApprovalEngine>,
    pub rebalance: Arc<RebalanceEngine>,
    pub monitor: Arc<RiskMonitor>,
    pub forecaster: Arc<Forecaster>,
    pub gateway: Arc<dyn ChainGateway>,
    pub signers: Arc<SignerRegistry>,
    pub store: Arc<dyn Store>,
    pub queue: TaskQueue,
    pub vault: Address,
}

#[async_trait]
impl TaskHandler for NodeTaskHandler {
    async fn handle(&self, kind: &TaskKind) -> TaskResult {
        let timer = metrics::TASK_SECONDS
            .with_label_values(&[kind.label()])
            .start_timer();
        let result = self.route(kind).await;
        timer.observe_duration();
        result
    }
}

impl NodeTaskHandler {
    async fn route(&self, kind: &TaskKind) -> TaskResult {
        match kind {
            TaskKind::ProcessEvent { event } => {
                match self.dispatcher.dispatch(event).await {
                    Ok(_) => {
                        metrics::EVENTS_ENQUEUED
                            .with_label_values(&[event.kind().as_str()])
                            .inc();
                        Ok(())
                    }
                    // Invariant violations stop the worker's lane until
                    // cleared; everything else retries.
                    Err(ProjectionError::InvariantViolated { drift_bps }) => Err(
                        TaskError::fatal(format!("projection drift {drift_bps}bp")),
                    ),
                    Err(e) => Err(TaskError::retryable(e.to_string())),
                }
            }

            TaskKind::TicketSlaWarning { ticket_id } => self
                .approval
                .on_sla_warning(ticket_id)
                .await
                .map_err(approval_task_error),
            TaskKind::TicketSlaEscalation { ticket_id } => self
                .approval
                .on_sla_escalation(ticket_id)
                .await
                .map_err(approval_task_error),
            TaskKind::TicketSlaDeadline { ticket_id } => self
                .approval
                .on_sla_deadline(ticket_id)
                .await
                .map_err(approval_task_error),
            TaskKind::ProcessApprovalResult { ticket_id } => self
                .approval
                .results()
                .process(ticket_id)
                .await
                .map_err(approval_task_error),

            TaskKind::ExecutePlan { plan_id } => match self.rebalance.execute(plan_id).await {
                Ok(status) => {
                    metrics::PLANS_FINISHED
                        .with_label_values(&[&status.to_string()])
                        .inc();
                    Ok(())
                }
                // Simulation failures already marked the plan FAILED; that is
                // a terminal business outcome, not a task failure.
                Err(
                    RebalanceError::SimulationReverted(_)
                    | RebalanceError::SlippageExceeded { .. }
                    | RebalanceError::ProjectedDrift { .. },
                ) => {
                    metrics::PLANS_FINISHED.with_label_values(&["FAILED"]).inc();
                    Ok(())
                }
                Err(RebalanceError::Validation(reason)) => {
                    warn!(plan = %plan_id, %reason, "Plan not executable");
                    Ok(())
                }
                Err(e) => Err(TaskError::retryable(e.to_string())),
            },

            TaskKind::RebalanceCheck { trigger } => self.rebalance_check(*trigger).await,
            TaskKind::LiquidityCheck => self.rebalance_check(RebalanceTrigger::Liquidity).await,

            TaskKind::RiskIndicatorTick => match self.monitor.tick().await {
                Ok(snapshot) => {
                    metrics::RISK_LEVEL.set(f64::from(snapshot.level as u8));
                    metrics::RISK_SCORE.set(snapshot.score);
                    Ok(())
                }
                Err(e) => Err(TaskError::retryable(e.to_string())),
            },

            TaskKind::LiquidityForecast => {
                for horizon in [ForecastHorizon::D1, ForecastHorizon::D7, ForecastHorizon::D30] {
                    let forecast = self
                        .forecaster
                        .forecast(horizon)
                        .await
                        .map_err(|e| TaskError::retryable(e.to_string()))?;
                    if matches!(
                        forecast.recommendation,
                        LiquidityRecommendation::PrepareLiquidity
                            | LiquidityRecommendation::Emergency
                    ) {
                        info!(
                            horizon = %horizon,
                            suggested = %forecast.suggested_amount,
                            "Forecast recommends raising liquidity"
                        );
                    }
                }
                Ok(())
            }

            TaskKind::OverdueLiabilityBatch { days_back } => {
                let signer = self
                    .signers
                    .signer_for_role(SignerRole::Admin)
                    .map_err(|e| TaskError::fatal(e.to_string()))?;
                self.gateway
                    .send(SendRequest::new(
                        self.vault,
                        "processOverdueLiabilityBatch(uint256)",
                        json!([days_back]),
                        signer,
                    ))
                    .await
                    .map_err(|e| {
                        if e.is_transient() {
                            TaskError::retryable(e.to_string())
                        } else {
                            TaskError::fatal(e.to_string())
                        }
                    })?;
                Ok(())
            }

            TaskKind::GenerateReport { period } => self.generate_report(*period).await,
            TaskKind::IncidentReport { incident_id } => {
                // Rendering and delivery are external; the summary audit row
                // is the hand-off.
                self.store
                    .append_audit(
                        &AuditEntry::new("report.incident", "incident", incident_id)
                            .with_detail(json!({ "incidentId": incident_id })),
                    )
                    .await
                    .map_err(|e| TaskError::retryable(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn rebalance_check(&self, trigger: RebalanceTrigger) -> TaskResult {
        match self.rebalance.run_check(trigger).await {
            Ok(CheckOutcome::NoAction) => Ok(()),
            Ok(CheckOutcome::Planned {
                plan_id,
                requires_approval,
                total_amount,
            }) => {
                if requires_approval {
                    request_rebalance_approval(
                        &self.approval,
                        &self.store,
                        &plan_id,
                        total_amount,
                    )
                    .await
                    .map_err(approval_task_error)?;
                } else {
                    self.queue.push(keel_tasks::TaskEnvelope::new(
                        format!("execute_plan:{plan_id}"),
                        TaskKind::ExecutePlan { plan_id },
                    ));
                }
                Ok(())
            }
            Err(e) => Err(TaskError::retryable(e.to_string())),
        }
    }

    async fn generate_report(&self, period: ReportPeriod) -> TaskResult {
        let fund = self
            .store
            .fund()
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        self.store
            .append_audit(
                &AuditEntry::new("report.generated", "fund", "1").with_detail(json!({
                    "period": format!("{period:?}"),
                    "totalAssets": fund.total_assets.to_string(),
                    "emergencyMode": fund.emergency_mode,
                })),
            )
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        Ok(())
    }
}

fn approval_task_error(error: ApprovalError) -> TaskError {
    match error {
        ApprovalError::Chain(ref chain) if chain.is_transient() => {
            TaskError::retryable(error.to_string())
        }
        ApprovalError::Store(_) => TaskError::retryable(error.to_string()),
        other => TaskError::fatal(other.to_string()),
    }
}
