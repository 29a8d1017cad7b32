//! Shared ticket accounting applied under the row lock.
//!
//! Both store implementations load the row, run this pure step, and persist
//! the result inside their transaction, so the accounting rules live in one
//! place.

use chrono::Utc;

use keel_core::{
    ApprovalAction, ApprovalRecord, ApprovalTicket, TicketResult, TicketStatus,
};

use crate::traits::TicketActOutcome;

/// Apply one approve/reject record to a loaded ticket.
///
/// Mutates the ticket in place and reports the outcome. Callers must hold the
/// row lock for the duration of the surrounding transaction.
pub fn apply_ticket_action(ticket: &mut ApprovalTicket, record: ApprovalRecord) -> TicketActOutcome {
    if ticket.status.is_terminal() {
        return TicketActOutcome::Terminal(ticket.status);
    }
    if ticket.has_acted(record.approver) {
        return TicketActOutcome::DuplicateActor;
    }

    let approver = format!("{:#x}", record.approver);
    let action = record.action;
    ticket.records.push(record);
    ticket.updated_at = Utc::now();

    match action {
        ApprovalAction::Reject => {
            ticket.current_rejections += 1;
            ticket.status = TicketStatus::Rejected;
            ticket.result = Some(TicketResult::Rejected);
            ticket.resolved_at = Some(ticket.updated_at);
            ticket.resolved_by = Some(approver);
        }
        ApprovalAction::Approve => {
            ticket.current_approvals += 1;
            if ticket.current_approvals >= ticket.required_approvals {
                ticket.status = TicketStatus::Approved;
                ticket.result = Some(TicketResult::Approved);
                ticket.resolved_at = Some(ticket.updated_at);
                ticket.resolved_by = Some(approver);
            } else {
                ticket.status = TicketStatus::PartiallyApproved;
            }
        }
    }

    TicketActOutcome::Applied(Box::new(ticket.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use keel_core::{
        ApproverRole, ReferenceType, RuleSnapshot, SlaConfig, TicketType,
    };

    fn ticket(required: u32) -> ApprovalTicket {
        let now = Utc::now();
        let sla = SlaConfig {
            warning_secs: 3600,
            deadline_secs: 86_400,
            escalation_secs: None,
            auto_reject: false,
        };
        ApprovalTicket {
            id: "APR-TEST0001".into(),
            ticket_type: TicketType::Redemption,
            reference_type: ReferenceType::Redemption,
            reference_id: "42".into(),
            requester: Address::with_last_byte(1),
            amount: None,
            description: None,
            request_data: serde_json::Value::Null,
            rule_snapshot: RuleSnapshot {
                rule_name: "test".into(),
                required_role: ApproverRole::Manager,
                total_required: required,
                sla,
                escalate_to: None,
            },
            required_approvals: required,
            current_approvals: 0,
            current_rejections: 0,
            sla_warning_at: sla.warning_at(now),
            sla_deadline_at: sla.deadline_at(now),
            escalation_at: None,
            escalated_at: None,
            escalated_to: None,
            status: TicketStatus::Pending,
            result: None,
            resolved_at: None,
            resolved_by: None,
            records: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn record(approver: u8, action: ApprovalAction) -> ApprovalRecord {
        ApprovalRecord {
            approver: Address::with_last_byte(approver),
            action,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_single_approval_resolves() {
        let mut t = ticket(1);
        match apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve)) {
            TicketActOutcome::Applied(after) => {
                assert_eq!(after.status, TicketStatus::Approved);
                assert_eq!(after.current_approvals, 1);
                assert_eq!(after.result, Some(TicketResult::Approved));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_partial_then_full_approval() {
        let mut t = ticket(2);
        apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve));
        assert_eq!(t.status, TicketStatus::PartiallyApproved);

        apply_ticket_action(&mut t, record(0xa2, ApprovalAction::Approve));
        assert_eq!(t.status, TicketStatus::Approved);
        assert_eq!(t.current_approvals, 2);
    }

    #[test]
    fn test_any_rejection_is_terminal() {
        let mut t = ticket(2);
        apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve));
        apply_ticket_action(&mut t, record(0xa2, ApprovalAction::Reject));
        assert_eq!(t.status, TicketStatus::Rejected);
        assert_eq!(t.result, Some(TicketResult::Rejected));
    }

    #[test]
    fn test_duplicate_actor_rejected() {
        let mut t = ticket(2);
        apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve));
        match apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve)) {
            TicketActOutcome::DuplicateActor => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Accounting untouched.
        assert_eq!(t.current_approvals, 1);
        assert_eq!(t.records.len(), 1);
    }

    #[test]
    fn test_terminal_ticket_refuses_action() {
        let mut t = ticket(1);
        apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve));
        match apply_ticket_action(&mut t, record(0xa2, ApprovalAction::Approve)) {
            TicketActOutcome::Terminal(TicketStatus::Approved) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_approvals_never_exceed_required() {
        let mut t = ticket(1);
        apply_ticket_action(&mut t, record(0xa1, ApprovalAction::Approve));
        apply_ticket_action(&mut t, record(0xa2, ApprovalAction::Approve));
        assert!(t.current_approvals <= t.required_approvals);
    }
}
