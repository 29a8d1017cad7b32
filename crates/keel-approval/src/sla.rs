//! SLA timer handlers.
//!
//! The engine never runs its own timer threads: the three deferred jobs are
//! registered with the scheduler at ticket creation, so pending SLA events
//! survive restarts and are cancelled when the ticket resolves early.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use keel_core::{NotifySeverity, TaskKind, TicketResult, TicketStatus};
use keel_store::{AuditEntry, AuditStore, TicketStore};
use keel_tasks::TaskEnvelope;

use crate::engine::ApprovalEngine;
use crate::error::ApprovalResult;

impl ApprovalEngine {
    /// Warning job: notification only, no state change.
    pub async fn on_sla_warning(&self, ticket_id: &str) -> ApprovalResult<()> {
        let Some(ticket) = self.store().ticket(ticket_id).await? else {
            return Ok(());
        };
        if ticket.status.is_terminal() {
            return Ok(());
        }

        self.notify(
            NotifySeverity::Warning,
            format!("Approval {ticket_id} nearing SLA deadline"),
            format!(
                "{} approvals of {} received; deadline {}",
                ticket.current_approvals, ticket.required_approvals, ticket.sla_deadline_at
            ),
        )
        .await;
        Ok(())
    }

    /// Escalation job: record the escalation and page the next role up. No
    /// state-machine change.
    pub async fn on_sla_escalation(&self, ticket_id: &str) -> ApprovalResult<()> {
        let Some(ticket) = self.store().ticket(ticket_id).await? else {
            return Ok(());
        };
        if ticket.status.is_terminal() || ticket.escalated_at.is_some() {
            return Ok(());
        }

        let escalate_to = ticket
            .rule_snapshot
            .escalate_to
            .unwrap_or(ticket.rule_snapshot.required_role);
        self.store()
            .mark_escalated(ticket_id, escalate_to, Utc::now())
            .await?;
        self.store()
            .append_audit(
                &AuditEntry::new("approval.escalated", "approval_ticket", ticket_id)
                    .with_detail(json!({ "escalatedTo": escalate_to.to_string() })),
            )
            .await?;
        info!(ticket = %ticket_id, to = %escalate_to, "Ticket escalated");

        self.notify(
            NotifySeverity::Warning,
            format!("Approval {ticket_id} escalated to {escalate_to}"),
            format!(
                "No resolution after the escalation window; deadline {}",
                ticket.sla_deadline_at
            ),
        )
        .await;
        Ok(())
    }

    /// Deadline job: expire with rejection side effects when the rule says
    /// auto-reject, otherwise page critically and leave the ticket live.
    pub async fn on_sla_deadline(&self, ticket_id: &str) -> ApprovalResult<()> {
        let Some(ticket) = self.store().ticket(ticket_id).await? else {
            return Ok(());
        };
        if ticket.status.is_terminal() {
            return Ok(());
        }

        if ticket.rule_snapshot.sla.auto_reject {
            let applied = self
                .store()
                .resolve_ticket(
                    ticket_id,
                    TicketStatus::Expired,
                    TicketResult::Expired,
                    "system",
                )
                .await?;
            if applied {
                warn!(ticket = %ticket_id, "Ticket expired, auto-rejecting");
                self.store()
                    .append_audit(&AuditEntry::new(
                        "approval.expired",
                        "approval_ticket",
                        ticket_id,
                    ))
                    .await?;
                self.queue().push(TaskEnvelope::new(
                    format!("approval_result:{ticket_id}"),
                    TaskKind::ProcessApprovalResult {
                        ticket_id: ticket_id.to_string(),
                    },
                ));
            }
            return Ok(());
        }

        // No auto-reject: expire without an on-chain commit and page.
        let applied = self
            .store()
            .resolve_ticket(
                ticket_id,
                TicketStatus::Expired,
                TicketResult::Expired,
                "system",
            )
            .await?;
        if applied {
            self.store()
                .append_audit(&AuditEntry::new(
                    "approval.expired",
                    "approval_ticket",
                    ticket_id,
                ))
                .await?;
            self.notify(
                NotifySeverity::Critical,
                format!("Approval {ticket_id} breached its SLA deadline"),
                format!(
                    "{} approvals of {} received before {}; no on-chain action taken",
                    ticket.current_approvals, ticket.required_approvals, ticket.sla_deadline_at
                ),
            )
            .await;
        }
        Ok(())
    }
}
