//! Glue between the rebalance engine and the approval workflow.
//!
//! Plans over the approval threshold get a REBALANCING ticket whose
//! `reference_id` is the plan id; resolution hands the plan back to the
//! executor through the result processor.

use alloy::primitives::Address;
use serde_json::json;
use std::sync::Arc;

use keel_approval::{ApprovalEngine, ApprovalRequest, ApprovalResult};
use keel_core::{Amount, ReferenceType, TicketType};
use keel_store::{PlanStore, Store};

/// Open (or reuse) the approval ticket gating a plan and link it.
pub async fn request_rebalance_approval(
    approval: &Arc<ApprovalEngine>,
    store: &Arc<dyn Store>,
    plan_id: &str,
    total_amount: Amount,
) -> ApprovalResult<String> {
    let created = approval
        .create_ticket(ApprovalRequest {
            ticket_type: TicketType::Rebalancing,
            reference_type: ReferenceType::Rebalance,
            reference_id: plan_id.to_string(),
            // System-generated plans carry the zero address as requester.
            requester: Address::ZERO,
            amount: Some(total_amount),
            channel: None,
            description: Some(format!("rebalance plan {plan_id}")),
            request_data: json!({ "planId": plan_id }),
        })
        .await?;
    store.set_plan_ticket(plan_id, &created.id).await?;
    Ok(created.id)
}
