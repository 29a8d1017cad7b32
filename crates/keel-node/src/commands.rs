//! Command surface.
//!
//! Commands carry an idempotency key and a requester; responses report a
//! stable code plus any created entity id, distinct from internal error
//! text. RBAC sits in front of this layer; the engines re-check roles where
//! it matters.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use keel_approval::{ApprovalEngine, ApprovalError};
use keel_core::{
    ApprovalAction, ForecastHorizon, RebalanceTrigger, RedemptionChannel, TaskKind,
};
use keel_ingest::IngestCommand;
use keel_rebalance::{CheckOutcome, RebalanceEngine, RebalanceError};
use keel_risk::Forecaster;
use keel_tasks::{TaskEnvelope, TaskQueue};

/// A command from the API layer.
#[derive(Debug, Clone)]
pub enum Command {
    ApproveTicket {
        ticket_id: String,
        reason: Option<String>,
    },
    RejectTicket {
        ticket_id: String,
        reason: Option<String>,
    },
    CancelTicket {
        ticket_id: String,
    },
    PreviewPlan,
    ExecutePlan {
        plan_id: String,
    },
    TriggerRebalance,
    TriggerForecast {
        horizon: ForecastHorizon,
    },
    Resync {
        from_block: u64,
    },
    /// Off-chain intake gate check for a STANDARD redemption request.
    CheckStandardIntake {
        channel: RedemptionChannel,
    },
}

/// Stable command response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandResponse {
    /// `OK`, `ACCEPTED`, or a stable error code.
    pub code: String,
    pub message: String,
    /// Id of any created or affected entity.
    pub entity_id: Option<String>,
}

impl CommandResponse {
    fn ok(message: impl Into<String>, entity_id: Option<String>) -> Self {
        Self {
            code: "OK".to_string(),
            message: message.into(),
            entity_id,
        }
    }

    fn accepted(message: impl Into<String>, entity_id: Option<String>) -> Self {
        Self {
            code: "ACCEPTED".to_string(),
            message: message.into(),
            entity_id,
        }
    }

    fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            entity_id: None,
        }
    }
}

/// Executes commands against the engines.
pub struct CommandBus {
    approval: Arc<ApprovalEngine>,
    rebalance: Arc<RebalanceEngine>,
    forecaster: Arc<Forecaster>,
    queue: TaskQueue,
    ingest_commands: mpsc::Sender<IngestCommand>,
    intake_paused: Arc<AtomicBool>,
    /// Responses by idempotency key; duplicates replay the original answer.
    seen: DashMap<String, CommandResponse>,
}

impl CommandBus {
    #[must_use]
    pub fn new(
        approval: Arc<ApprovalEngine>,
        rebalance: Arc<RebalanceEngine>,
        forecaster: Arc<Forecaster>,
        queue: TaskQueue,
        ingest_commands: mpsc::Sender<IngestCommand>,
        intake_paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            approval,
            rebalance,
            forecaster,
            queue,
            ingest_commands,
            intake_paused,
            seen: DashMap::new(),
        }
    }

    /// Execute one command.
    pub async fn execute(
        &self,
        idempotency_key: &str,
        requester: Address,
        command: Command,
    ) -> CommandResponse {
        if let Some(previous) = self.seen.get(idempotency_key) {
            return previous.clone();
        }

        info!(key = %idempotency_key, requester = %requester, ?command, "Command");
        let response = self.dispatch(requester, command).await;
        self.seen
            .insert(idempotency_key.to_string(), response.clone());
        response
    }

    async fn dispatch(&self, requester: Address, command: Command) -> CommandResponse {
        match command {
            Command::ApproveTicket { ticket_id, reason } => {
                match self
                    .approval
                    .act(&ticket_id, requester, ApprovalAction::Approve, reason)
                    .await
                {
                    Ok(status) => {
                        CommandResponse::ok(format!("ticket {status}"), Some(ticket_id))
                    }
                    Err(e) => approval_error(&e),
                }
            }
            Command::RejectTicket { ticket_id, reason } => {
                match self
                    .approval
                    .act(&ticket_id, requester, ApprovalAction::Reject, reason)
                    .await
                {
                    Ok(status) => {
                        CommandResponse::ok(format!("ticket {status}"), Some(ticket_id))
                    }
                    Err(e) => approval_error(&e),
                }
            }
            Command::CancelTicket { ticket_id } => {
                match self.approval.cancel(&ticket_id, requester).await {
                    Ok(()) => CommandResponse::ok("ticket cancelled", Some(ticket_id)),
                    Err(e) => approval_error(&e),
                }
            }
            Command::PreviewPlan => match self.rebalance.preview(RebalanceTrigger::Manual).await {
                Ok(Some(plan)) => CommandResponse::ok(
                    format!(
                        "{} actions totalling {}",
                        plan.actions.len(),
                        plan.total_amount
                    ),
                    Some(plan.id),
                ),
                Ok(None) => CommandResponse::ok("no rebalancing needed", None),
                Err(e) => rebalance_error(&e),
            },
            Command::ExecutePlan { plan_id } => {
                self.queue.push(TaskEnvelope::new(
                    format!("execute_plan:{plan_id}"),
                    TaskKind::ExecutePlan {
                        plan_id: plan_id.clone(),
                    },
                ));
                CommandResponse::accepted("execution queued", Some(plan_id))
            }
            Command::TriggerRebalance => {
                match self.rebalance.run_check(RebalanceTrigger::Manual).await {
                    Ok(CheckOutcome::Planned {
                        plan_id,
                        requires_approval,
                        ..
                    }) => {
                        if !requires_approval {
                            self.queue.push(TaskEnvelope::new(
                                format!("execute_plan:{plan_id}"),
                                TaskKind::ExecutePlan {
                                    plan_id: plan_id.clone(),
                                },
                            ));
                        }
                        CommandResponse::accepted(
                            if requires_approval {
                                "plan pending approval"
                            } else {
                                "plan queued for execution"
                            },
                            Some(plan_id),
                        )
                    }
                    Ok(CheckOutcome::NoAction) => {
                        CommandResponse::ok("tiers within thresholds", None)
                    }
                    Err(e) => rebalance_error(&e),
                }
            }
            Command::TriggerForecast { horizon } => {
                match self.forecaster.forecast(horizon).await {
                    Ok(forecast) => CommandResponse::ok(
                        format!(
                            "shortfall probability {:.1}%, recommendation {:?}",
                            forecast.shortfall_probability * 100.0,
                            forecast.recommendation
                        ),
                        None,
                    ),
                    Err(e) => CommandResponse::error("FORECAST_ERROR", e.to_string()),
                }
            }
            Command::Resync { from_block } => {
                match self
                    .ingest_commands
                    .send(IngestCommand::Resync { from_block })
                    .await
                {
                    Ok(()) => CommandResponse::accepted(
                        format!("resync from block {from_block} queued"),
                        None,
                    ),
                    Err(_) => {
                        CommandResponse::error("INGESTOR_DOWN", "ingestor not running")
                    }
                }
            }
            Command::CheckStandardIntake { channel } => {
                if channel == RedemptionChannel::Standard
                    && self.intake_paused.load(Ordering::SeqCst)
                {
                    CommandResponse::error(
                        "INTAKE_PAUSED",
                        "standard redemption intake is paused by the risk engine",
                    )
                } else {
                    CommandResponse::ok("intake open", None)
                }
            }
        }
    }
}

fn approval_error(error: &ApprovalError) -> CommandResponse {
    CommandResponse::error(error.code(), error.to_string())
}

fn rebalance_error(error: &RebalanceError) -> CommandResponse {
    CommandResponse::error(error.code(), error.to_string())
}
