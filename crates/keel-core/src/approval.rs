//! Approval tickets, rules, and the condition language rules match on.

use alloy::primitives::Address;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Amount;
use crate::redemption::RedemptionChannel;

/// Approver role hierarchy. A higher role satisfies a lower requirement.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApproverRole {
    Operator,
    Manager,
    Admin,
    Emergency,
}

impl ApproverRole {
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Operator => 1,
            Self::Manager => 2,
            Self::Admin => 3,
            Self::Emergency => 4,
        }
    }

    /// Whether this role satisfies `required`.
    #[must_use]
    pub fn satisfies(&self, required: ApproverRole) -> bool {
        self.rank() >= required.rank()
    }
}

impl fmt::Display for ApproverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator => write!(f, "OPERATOR"),
            Self::Manager => write!(f, "MANAGER"),
            Self::Admin => write!(f, "ADMIN"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// What kind of operation a ticket gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketType {
    Redemption,
    EmergencyRedemption,
    Rebalancing,
    AssetAdd,
    AssetRemove,
    ConfigChange,
}

/// What entity the ticket resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Redemption,
    Rebalance,
    AssetConfig,
    ConfigChange,
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redemption => write!(f, "REDEMPTION"),
            Self::Rebalance => write!(f, "REBALANCE"),
            Self::AssetConfig => write!(f, "ASSET_CONFIG"),
            Self::ConfigChange => write!(f, "CONFIG_CHANGE"),
        }
    }
}

/// Ticket status. Approved/Rejected/Expired/Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    PartiallyApproved,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl TicketStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::Expired | Self::Cancelled
        )
    }

    /// Cancellation by the requester is allowed only while live.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::PartiallyApproved)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::PartiallyApproved => write!(f, "PARTIALLY_APPROVED"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One approver's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

/// Append-only record of one approver's action on a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver: Address,
    pub action: ApprovalAction,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Condition language
// ============================================================================

/// Comparison operator of a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

/// Typed field a condition reads from the request facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Amount,
    Channel,
}

/// Typed comparison value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionValue {
    Amount(Amount),
    Channel(RedemptionChannel),
}

/// The typed facts a rule evaluates against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFacts {
    pub amount: Option<Amount>,
    pub channel: Option<RedemptionChannel>,
}

/// A single rule condition.
///
/// Evaluation is total: a missing fact or a field/value type mismatch
/// evaluates to false rather than erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalCondition {
    pub field: ConditionField,
    pub op: ConditionOp,
    pub value: ConditionValue,
}

impl ApprovalCondition {
    #[must_use]
    pub fn evaluate(&self, facts: &RequestFacts) -> bool {
        match (self.field, &self.value) {
            (ConditionField::Amount, ConditionValue::Amount(rhs)) => match facts.amount {
                Some(lhs) => compare(self.op, lhs, *rhs),
                None => false,
            },
            (ConditionField::Channel, ConditionValue::Channel(rhs)) => match facts.channel {
                // Channels only support equality comparisons.
                Some(lhs) => match self.op {
                    ConditionOp::Eq => lhs == *rhs,
                    ConditionOp::Ne => lhs != *rhs,
                    _ => false,
                },
                None => false,
            },
            _ => false,
        }
    }
}

fn compare<T: PartialOrd + PartialEq>(op: ConditionOp, lhs: T, rhs: T) -> bool {
    match op {
        ConditionOp::Gt => lhs > rhs,
        ConditionOp::Lt => lhs < rhs,
        ConditionOp::Ge => lhs >= rhs,
        ConditionOp::Le => lhs <= rhs,
        ConditionOp::Eq => lhs == rhs,
        ConditionOp::Ne => lhs != rhs,
    }
}

// ============================================================================
// Rules
// ============================================================================

/// SLA durations for a rule, in seconds from ticket creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlaConfig {
    pub warning_secs: u64,
    pub deadline_secs: u64,
    /// Escalation point; None disables escalation.
    pub escalation_secs: Option<u64>,
    /// Resolve as EXPIRED (with rejection side effects) at the deadline.
    pub auto_reject: bool,
}

impl SlaConfig {
    #[must_use]
    pub fn warning_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + Duration::seconds(self.warning_secs as i64)
    }

    #[must_use]
    pub fn deadline_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + Duration::seconds(self.deadline_secs as i64)
    }

    #[must_use]
    pub fn escalation_at(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.escalation_secs
            .map(|s| from + Duration::seconds(s as i64))
    }
}

/// Auto-approve clause of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprove {
    pub enabled: bool,
    /// All conditions must hold for the ticket to auto-approve.
    pub conditions: Vec<ApprovalCondition>,
}

/// A declarative approval rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub name: String,
    pub ticket_type: TicketType,
    /// All conditions must hold for the rule to match.
    pub conditions: Vec<ApprovalCondition>,
    pub required_role: ApproverRole,
    pub total_required: u32,
    pub sla: SlaConfig,
    pub auto_approve: Option<AutoApprove>,
    pub escalate_to: Option<ApproverRole>,
}

impl ApprovalRule {
    /// Whether this rule matches the given facts.
    #[must_use]
    pub fn matches(&self, ticket_type: TicketType, facts: &RequestFacts) -> bool {
        self.ticket_type == ticket_type && self.conditions.iter().all(|c| c.evaluate(facts))
    }

    /// Whether the auto-approve clause applies to the given facts.
    #[must_use]
    pub fn auto_approves(&self, facts: &RequestFacts) -> bool {
        self.auto_approve
            .as_ref()
            .is_some_and(|a| a.enabled && a.conditions.iter().all(|c| c.evaluate(facts)))
    }
}

/// The fields of the matched rule frozen onto the ticket at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub rule_name: String,
    pub required_role: ApproverRole,
    pub total_required: u32,
    pub sla: SlaConfig,
    pub escalate_to: Option<ApproverRole>,
}

impl From<&ApprovalRule> for RuleSnapshot {
    fn from(rule: &ApprovalRule) -> Self {
        Self {
            rule_name: rule.name.clone(),
            required_role: rule.required_role,
            total_required: rule.total_required,
            sla: rule.sla,
            escalate_to: rule.escalate_to,
        }
    }
}

// ============================================================================
// Tickets
// ============================================================================

/// Terminal outcome of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketResult {
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

/// An approval ticket with its accounting state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub id: String,
    pub ticket_type: TicketType,
    pub reference_type: ReferenceType,
    /// Identifier of the gated entity (request id, plan id).
    pub reference_id: String,
    pub requester: Address,
    pub amount: Option<Amount>,
    pub description: Option<String>,
    /// Opaque payload recorded for auditing; rules evaluate `facts`, not this.
    pub request_data: serde_json::Value,
    pub rule_snapshot: RuleSnapshot,
    pub required_approvals: u32,
    pub current_approvals: u32,
    pub current_rejections: u32,
    pub sla_warning_at: DateTime<Utc>,
    pub sla_deadline_at: DateTime<Utc>,
    pub escalation_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalated_to: Option<ApproverRole>,
    pub status: TicketStatus,
    pub result: Option<TicketResult>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Approver address, or "system" for auto-approval.
    pub resolved_by: Option<String>,
    pub records: Vec<ApprovalRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalTicket {
    /// Whether `approver` already appears in the append-only records.
    #[must_use]
    pub fn has_acted(&self, approver: Address) -> bool {
        self.records.iter().any(|r| r.approver == approver)
    }
}

/// Generate a ticket id: `APR-` + 8 uppercase hex chars.
#[must_use]
pub fn new_ticket_id() -> String {
    format!(
        "APR-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount_gt(units: u64) -> ApprovalCondition {
        ApprovalCondition {
            field: ConditionField::Amount,
            op: ConditionOp::Gt,
            value: ConditionValue::Amount(Amount::from_units(units)),
        }
    }

    #[test]
    fn test_role_hierarchy() {
        assert!(ApproverRole::Admin.satisfies(ApproverRole::Operator));
        assert!(ApproverRole::Emergency.satisfies(ApproverRole::Admin));
        assert!(!ApproverRole::Operator.satisfies(ApproverRole::Manager));
        assert!(ApproverRole::Manager.satisfies(ApproverRole::Manager));
    }

    #[test]
    fn test_condition_eval_total() {
        let cond = amount_gt(50_000);
        // Missing fact evaluates false, never errors.
        assert!(!cond.evaluate(&RequestFacts::default()));
        assert!(cond.evaluate(&RequestFacts {
            amount: Some(Amount::from_units(50_001)),
            channel: None,
        }));
        assert!(!cond.evaluate(&RequestFacts {
            amount: Some(Amount::from_units(50_000)),
            channel: None,
        }));
    }

    #[test]
    fn test_channel_condition_only_supports_equality() {
        let cond = ApprovalCondition {
            field: ConditionField::Channel,
            op: ConditionOp::Gt,
            value: ConditionValue::Channel(RedemptionChannel::Emergency),
        };
        let facts = RequestFacts {
            amount: None,
            channel: Some(RedemptionChannel::Emergency),
        };
        assert!(!cond.evaluate(&facts));

        let eq = ApprovalCondition {
            op: ConditionOp::Eq,
            ..cond
        };
        assert!(eq.evaluate(&facts));
    }

    #[test]
    fn test_rule_match_requires_all_conditions() {
        let rule = ApprovalRule {
            name: "large-standard".into(),
            ticket_type: TicketType::Redemption,
            conditions: vec![
                amount_gt(100_000),
                ApprovalCondition {
                    field: ConditionField::Channel,
                    op: ConditionOp::Eq,
                    value: ConditionValue::Channel(RedemptionChannel::Standard),
                },
            ],
            required_role: ApproverRole::Manager,
            total_required: 2,
            sla: SlaConfig {
                warning_secs: 7_200,
                deadline_secs: 43_200,
                escalation_secs: None,
                auto_reject: false,
            },
            auto_approve: None,
            escalate_to: None,
        };

        let matching = RequestFacts {
            amount: Some(Amount::from_units(150_000)),
            channel: Some(RedemptionChannel::Standard),
        };
        assert!(rule.matches(TicketType::Redemption, &matching));
        assert!(!rule.matches(TicketType::Rebalancing, &matching));

        let wrong_channel = RequestFacts {
            channel: Some(RedemptionChannel::Emergency),
            ..matching
        };
        assert!(!rule.matches(TicketType::Redemption, &wrong_channel));
    }

    #[test]
    fn test_sla_instants() {
        let sla = SlaConfig {
            warning_secs: 3_600,
            deadline_secs: 86_400,
            escalation_secs: Some(7_200),
            auto_reject: true,
        };
        let now = Utc::now();
        assert_eq!(sla.warning_at(now), now + Duration::hours(1));
        assert_eq!(sla.deadline_at(now), now + Duration::hours(24));
        assert_eq!(sla.escalation_at(now), Some(now + Duration::hours(2)));
    }

    #[test]
    fn test_ticket_id_format() {
        let id = new_ticket_id();
        assert!(id.starts_with("APR-"));
        assert_eq!(id.len(), 12);
    }

    #[test]
    fn test_ticket_status_terminality() {
        assert!(TicketStatus::Approved.is_terminal());
        assert!(TicketStatus::Cancelled.is_terminal());
        assert!(!TicketStatus::PartiallyApproved.is_terminal());
        assert!(TicketStatus::PartiallyApproved.is_cancellable());
        assert!(!TicketStatus::Approved.is_cancellable());
    }
}
