//! Ticket lifecycle: creation, approver actions, cancellation.

use alloy::primitives::Address;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use keel_core::{
    new_ticket_id, Amount, ApprovalAction, ApprovalRecord, ApprovalTicket, ApproverRole,
    Notification, NotifySeverity, RedemptionChannel, ReferenceType, RequestFacts, RuleSnapshot,
    TaskKind, TicketResult, TicketStatus, TicketType,
};
use keel_store::{AuditEntry, AuditStore, Store, TicketActOutcome, TicketStore};
use keel_tasks::{Scheduler, TaskEnvelope, TaskQueue};

use crate::error::{ApprovalError, ApprovalResult};
use crate::result::ResultProcessor;
use crate::rules::RuleTable;

/// Registry of approver addresses and their roles.
///
/// RBAC proper sits in front of the command surface; this directory backs the
/// engine's own role check on each action.
#[derive(Default)]
pub struct ApproverDirectory {
    roles: DashMap<Address, ApproverRole>,
}

impl ApproverDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_role(&self, approver: Address, role: ApproverRole) {
        info!(approver = %approver, role = %role, "Approver role set");
        self.roles.insert(approver, role);
    }

    #[must_use]
    pub fn role_of(&self, approver: Address) -> Option<ApproverRole> {
        self.roles.get(&approver).map(|r| *r)
    }
}

/// A new approval request entering the engine.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub ticket_type: TicketType,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    pub requester: Address,
    pub amount: Option<Amount>,
    pub channel: Option<RedemptionChannel>,
    pub description: Option<String>,
    pub request_data: serde_json::Value,
}

/// Outcome of ticket creation.
#[derive(Debug, Clone)]
pub struct CreatedTicket {
    pub id: String,
    pub status: TicketStatus,
    /// True when an existing open ticket for the reference was reused.
    pub reused: bool,
}

/// The approval workflow engine.
pub struct ApprovalEngine {
    store: Arc<dyn Store>,
    rules: RuleTable,
    directory: Arc<ApproverDirectory>,
    scheduler: Scheduler,
    queue: TaskQueue,
    results: Arc<ResultProcessor>,
    notifications: mpsc::Sender<Notification>,
}

impl ApprovalEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        rules: RuleTable,
        directory: Arc<ApproverDirectory>,
        scheduler: Scheduler,
        queue: TaskQueue,
        results: Arc<ResultProcessor>,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            store,
            rules,
            directory,
            scheduler,
            queue,
            results,
            notifications,
        }
    }

    /// Create a ticket for a request, or reuse the open one for the same
    /// reference.
    ///
    /// Auto-approve rules create the ticket directly in APPROVED and run
    /// result processing synchronously in-line.
    pub async fn create_ticket(&self, request: ApprovalRequest) -> ApprovalResult<CreatedTicket> {
        if let Some(existing) = self
            .store
            .open_ticket_for_reference(request.reference_type, &request.reference_id)
            .await?
        {
            warn!(
                reference = %request.reference_id,
                ticket = %existing,
                "Open ticket exists for reference, reusing"
            );
            return Ok(CreatedTicket {
                id: existing,
                status: TicketStatus::Pending,
                reused: true,
            });
        }

        let facts = RequestFacts {
            amount: request.amount,
            channel: request.channel,
        };
        let rule = self
            .rules
            .match_first(request.ticket_type, &facts)
            .ok_or(ApprovalError::NoRuleMatched)?;

        let now = Utc::now();
        let auto = rule.auto_approves(&facts);
        let id = new_ticket_id();
        let ticket = ApprovalTicket {
            id: id.clone(),
            ticket_type: request.ticket_type,
            reference_type: request.reference_type,
            reference_id: request.reference_id.clone(),
            requester: request.requester,
            amount: request.amount,
            description: request.description.clone(),
            request_data: request.request_data.clone(),
            rule_snapshot: RuleSnapshot::from(rule),
            required_approvals: rule.total_required,
            current_approvals: 0,
            current_rejections: 0,
            sla_warning_at: rule.sla.warning_at(now),
            sla_deadline_at: rule.sla.deadline_at(now),
            escalation_at: rule.sla.escalation_at(now),
            escalated_at: None,
            escalated_to: None,
            status: if auto {
                TicketStatus::Approved
            } else {
                TicketStatus::Pending
            },
            result: auto.then_some(TicketResult::Approved),
            resolved_at: auto.then_some(now),
            resolved_by: auto.then(|| "system".to_string()),
            records: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.store.insert_ticket(&ticket).await?;
        self.store
            .append_audit(
                &AuditEntry::new("approval.created", "approval_ticket", &id)
                    .with_actor(format!("{:#x}", request.requester))
                    .with_detail(json!({
                        "ticketType": format!("{:?}", request.ticket_type),
                        "rule": rule.name,
                        "requiredApprovals": rule.total_required,
                        "autoApproved": auto,
                    })),
            )
            .await?;

        if auto {
            info!(ticket = %id, "Ticket auto-approved, processing result in-line");
            self.results.process(&id).await?;
        } else {
            self.schedule_sla_jobs(&ticket);
            info!(
                ticket = %id,
                rule = %rule.name,
                required = rule.total_required,
                deadline = %ticket.sla_deadline_at,
                "Ticket created"
            );
        }

        Ok(CreatedTicket {
            id,
            status: ticket.status,
            reused: false,
        })
    }

    /// Process one approve/reject action.
    pub async fn act(
        &self,
        ticket_id: &str,
        approver: Address,
        action: ApprovalAction,
        reason: Option<String>,
    ) -> ApprovalResult<TicketStatus> {
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(ticket_id.to_string()))?;

        if ticket.status.is_terminal() {
            return Err(ApprovalError::Validation(format!(
                "ticket {ticket_id} is {}",
                ticket.status
            )));
        }
        if ticket.has_acted(approver) {
            return Err(ApprovalError::Validation(format!(
                "{approver:#x} already acted on {ticket_id}"
            )));
        }
        let role = self.directory.role_of(approver).ok_or_else(|| {
            ApprovalError::Validation(format!("{approver:#x} is not a registered approver"))
        })?;
        if !role.satisfies(ticket.rule_snapshot.required_role) {
            return Err(ApprovalError::Validation(format!(
                "role {role} does not satisfy required {}",
                ticket.rule_snapshot.required_role
            )));
        }

        let record = ApprovalRecord {
            approver,
            action,
            reason: reason.clone(),
            timestamp: Utc::now(),
        };
        let outcome = self.store.act_on_ticket(ticket_id, record).await?;

        let ticket = match outcome {
            TicketActOutcome::Applied(ticket) => *ticket,
            // The pre-checks above raced another actor; surface as the same
            // validation errors.
            TicketActOutcome::Terminal(status) => {
                return Err(ApprovalError::Validation(format!(
                    "ticket {ticket_id} is {status}"
                )));
            }
            TicketActOutcome::DuplicateActor => {
                return Err(ApprovalError::Validation(format!(
                    "{approver:#x} already acted on {ticket_id}"
                )));
            }
        };

        self.store
            .append_audit(
                &AuditEntry::new("approval.action", "approval_ticket", ticket_id)
                    .with_actor(format!("{approver:#x}"))
                    .with_detail(json!({
                        "action": format!("{action:?}"),
                        "reason": reason,
                        "approvals": ticket.current_approvals,
                        "required": ticket.required_approvals,
                        "status": ticket.status.to_string(),
                    })),
            )
            .await?;

        if ticket.status.is_terminal() {
            self.cancel_sla_jobs(ticket_id);
            self.queue.push(TaskEnvelope::new(
                format!("approval_result:{ticket_id}"),
                TaskKind::ProcessApprovalResult {
                    ticket_id: ticket_id.to_string(),
                },
            ));
            info!(ticket = %ticket_id, status = %ticket.status, "Ticket resolved");
        } else {
            info!(
                ticket = %ticket_id,
                approvals = ticket.current_approvals,
                required = ticket.required_approvals,
                "Ticket partially approved"
            );
        }

        Ok(ticket.status)
    }

    /// Cancellation by the requester. Allowed only in PENDING and
    /// PARTIALLY_APPROVED; never commits anything on-chain.
    pub async fn cancel(&self, ticket_id: &str, requester: Address) -> ApprovalResult<()> {
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(ticket_id.to_string()))?;

        if ticket.requester != requester {
            return Err(ApprovalError::Validation(format!(
                "only the requester may cancel {ticket_id}"
            )));
        }
        if !ticket.status.is_cancellable() {
            return Err(ApprovalError::Validation(format!(
                "ticket {ticket_id} is {} and cannot be cancelled",
                ticket.status
            )));
        }

        let applied = self
            .store
            .resolve_ticket(
                ticket_id,
                TicketStatus::Cancelled,
                TicketResult::Cancelled,
                &format!("{requester:#x}"),
            )
            .await?;
        if applied {
            self.cancel_sla_jobs(ticket_id);
            self.store
                .append_audit(
                    &AuditEntry::new("approval.cancelled", "approval_ticket", ticket_id)
                        .with_actor(format!("{requester:#x}")),
                )
                .await?;
            info!(ticket = %ticket_id, "Ticket cancelled by requester");
        }
        Ok(())
    }

    fn schedule_sla_jobs(&self, ticket: &ApprovalTicket) {
        let now = Utc::now();
        let delay = |at: chrono::DateTime<Utc>| (at - now).to_std().unwrap_or_default();

        self.scheduler.schedule_after(
            TaskEnvelope::new(
                format!("sla_warning:{}", ticket.id),
                TaskKind::TicketSlaWarning {
                    ticket_id: ticket.id.clone(),
                },
            ),
            delay(ticket.sla_warning_at),
        );
        if let Some(escalation_at) = ticket.escalation_at {
            self.scheduler.schedule_after(
                TaskEnvelope::new(
                    format!("sla_escalation:{}", ticket.id),
                    TaskKind::TicketSlaEscalation {
                        ticket_id: ticket.id.clone(),
                    },
                ),
                delay(escalation_at),
            );
        }
        self.scheduler.schedule_after(
            TaskEnvelope::new(
                format!("sla_deadline:{}", ticket.id),
                TaskKind::TicketSlaDeadline {
                    ticket_id: ticket.id.clone(),
                },
            ),
            delay(ticket.sla_deadline_at),
        );
    }

    fn cancel_sla_jobs(&self, ticket_id: &str) {
        self.scheduler.cancel(&format!("sla_warning:{ticket_id}"));
        self.scheduler.cancel(&format!("sla_escalation:{ticket_id}"));
        self.scheduler.cancel(&format!("sla_deadline:{ticket_id}"));
    }

    pub(crate) async fn notify(&self, severity: NotifySeverity, title: String, body: String) {
        if self
            .notifications
            .send(Notification::new(severity, title, body))
            .await
            .is_err()
        {
            warn!("Notification receiver dropped");
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The result processor, exposed so the node's task handler can route
    /// `ProcessApprovalResult` tasks back into it.
    #[must_use]
    pub fn results(&self) -> &Arc<ResultProcessor> {
        &self.results
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}
