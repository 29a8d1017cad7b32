//! Result processor: what happens after a ticket resolves.
//!
//! Runs as a queued task with at-least-once semantics. For redemptions the
//! on-chain commit is idempotent because the contract rejects duplicate
//! approvals; for rebalance plans the hand-off is a CAS status transition.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use keel_core::{PlanStatus, ReferenceType, TaskKind, TicketResult};
use keel_chain::{ChainGateway, SendRequest, SignerRegistry, SignerRole};
use keel_store::{PlanStore, Store, TicketStore};
use keel_tasks::{TaskEnvelope, TaskQueue};

use alloy::primitives::Address;

use crate::error::{ApprovalError, ApprovalResult};

/// Processes resolved tickets by reference type.
pub struct ResultProcessor {
    store: Arc<dyn Store>,
    gateway: Arc<dyn ChainGateway>,
    signers: Arc<SignerRegistry>,
    /// The vault contract commits land on.
    vault: Address,
    queue: TaskQueue,
}

impl ResultProcessor {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn ChainGateway>,
        signers: Arc<SignerRegistry>,
        vault: Address,
        queue: TaskQueue,
    ) -> Self {
        Self {
            store,
            gateway,
            signers,
            vault,
            queue,
        }
    }

    /// Process a resolved ticket.
    pub async fn process(&self, ticket_id: &str) -> ApprovalResult<()> {
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(ticket_id.to_string()))?;

        let Some(result) = ticket.result else {
            warn!(ticket = %ticket_id, "Result processor invoked on unresolved ticket");
            return Ok(());
        };

        match ticket.reference_type {
            ReferenceType::Redemption => {
                self.process_redemption(ticket_id, &ticket.reference_id, result, &ticket)
                    .await
            }
            ReferenceType::Rebalance => {
                self.process_rebalance(ticket_id, &ticket.reference_id, result)
                    .await
            }
            other => Err(ApprovalError::UnsupportedReference(other.to_string())),
        }
    }

    async fn process_redemption(
        &self,
        ticket_id: &str,
        reference_id: &str,
        result: TicketResult,
        ticket: &keel_core::ApprovalTicket,
    ) -> ApprovalResult<()> {
        let request_id: u64 = reference_id.parse().map_err(|_| {
            ApprovalError::Validation(format!("bad redemption reference {reference_id}"))
        })?;
        let signer = self.signers.signer_for_role(SignerRole::VipApprover)?;

        match result {
            TicketResult::Approved => {
                // Optional operator-supplied settlement override.
                let custom_settlement = ticket
                    .request_data
                    .get("customSettlementTime")
                    .and_then(serde_json::Value::as_u64);
                let (method, args) = match custom_settlement {
                    Some(at) => (
                        "approveRedemption(uint256,uint256)",
                        json!([request_id, at]),
                    ),
                    None => ("approveRedemption(uint256)", json!([request_id])),
                };
                let outcome = self
                    .gateway
                    .send(SendRequest::new(self.vault, method, args, signer))
                    .await?;
                info!(
                    ticket = %ticket_id,
                    request_id,
                    tx = %outcome.tx_hash,
                    "approveRedemption committed"
                );
            }
            TicketResult::Rejected | TicketResult::Expired => {
                let reason = match result {
                    TicketResult::Expired => "approval window expired".to_string(),
                    _ => ticket
                        .records
                        .iter()
                        .rev()
                        .find_map(|r| r.reason.clone())
                        .unwrap_or_else(|| "rejected by approver".to_string()),
                };
                let outcome = self
                    .gateway
                    .send(SendRequest::new(
                        self.vault,
                        "rejectRedemption(uint256,string)",
                        json!([request_id, reason]),
                        signer,
                    ))
                    .await?;
                info!(
                    ticket = %ticket_id,
                    request_id,
                    tx = %outcome.tx_hash,
                    "rejectRedemption committed"
                );
            }
            TicketResult::Cancelled => {
                // Off-chain only by design.
                info!(ticket = %ticket_id, request_id, "Cancelled ticket, no on-chain commit");
            }
        }
        Ok(())
    }

    async fn process_rebalance(
        &self,
        ticket_id: &str,
        reference_id: &str,
        result: TicketResult,
    ) -> ApprovalResult<()> {
        match result {
            TicketResult::Approved => {
                let moved = self
                    .store
                    .transition_plan(
                        reference_id,
                        &[PlanStatus::PendingApproval],
                        PlanStatus::Approved,
                    )
                    .await?;
                if moved {
                    self.queue.push(TaskEnvelope::new(
                        format!("execute_plan:{reference_id}"),
                        TaskKind::ExecutePlan {
                            plan_id: reference_id.to_string(),
                        },
                    ));
                    info!(ticket = %ticket_id, plan = %reference_id, "Plan approved, execution queued");
                } else {
                    warn!(plan = %reference_id, "Plan not pending approval, skipping hand-off");
                }
            }
            TicketResult::Rejected | TicketResult::Expired | TicketResult::Cancelled => {
                let moved = self
                    .store
                    .transition_plan(
                        reference_id,
                        &[PlanStatus::PendingApproval],
                        PlanStatus::Cancelled,
                    )
                    .await?;
                if moved {
                    info!(ticket = %ticket_id, plan = %reference_id, "Plan cancelled on rejection");
                }
            }
        }
        Ok(())
    }
}
