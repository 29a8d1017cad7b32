//! Rule table and the default ruleset.
//!
//! Rules evaluate first-match against typed request facts. The default table
//! follows the fund's product tiers: small standard redemptions auto-approve,
//! mid-size ones take a single operator, large ones a manager, emergency
//! redemptions an emergency approver with auto-reject at the deadline.

use keel_core::{
    Amount, ApprovalCondition, ApprovalRule, ApproverRole, AutoApprove, ConditionField,
    ConditionOp, ConditionValue, RequestFacts, SlaConfig, TicketType,
};

/// Ordered rule table; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<ApprovalRule>,
}

impl RuleTable {
    #[must_use]
    pub fn new(rules: Vec<ApprovalRule>) -> Self {
        Self { rules }
    }

    /// First rule matching the ticket type and facts.
    #[must_use]
    pub fn match_first(&self, ticket_type: TicketType, facts: &RequestFacts) -> Option<&ApprovalRule> {
        self.rules.iter().find(|r| r.matches(ticket_type, facts))
    }

    #[must_use]
    pub fn rules(&self) -> &[ApprovalRule] {
        &self.rules
    }
}

fn amount_cond(op: ConditionOp, units: u64) -> ApprovalCondition {
    ApprovalCondition {
        field: ConditionField::Amount,
        op,
        value: ConditionValue::Amount(Amount::from_units(units)),
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(vec![
            // Large standard redemptions: one manager, 24h SLA, escalate to
            // admin half-way.
            ApprovalRule {
                name: "redemption-large".into(),
                ticket_type: TicketType::Redemption,
                conditions: vec![amount_cond(ConditionOp::Gt, 100_000)],
                required_role: ApproverRole::Manager,
                total_required: 1,
                sla: SlaConfig {
                    warning_secs: 2 * 3600,
                    deadline_secs: 24 * 3600,
                    escalation_secs: Some(12 * 3600),
                    auto_reject: false,
                },
                auto_approve: None,
                escalate_to: Some(ApproverRole::Admin),
            },
            // Mid-size standard redemptions: one operator.
            ApprovalRule {
                name: "redemption-standard".into(),
                ticket_type: TicketType::Redemption,
                conditions: vec![amount_cond(ConditionOp::Gt, 30_000)],
                required_role: ApproverRole::Operator,
                total_required: 1,
                sla: SlaConfig {
                    warning_secs: 4 * 3600,
                    deadline_secs: 24 * 3600,
                    escalation_secs: None,
                    auto_reject: false,
                },
                auto_approve: None,
                escalate_to: None,
            },
            // Small gated redemptions auto-approve.
            ApprovalRule {
                name: "redemption-small".into(),
                ticket_type: TicketType::Redemption,
                conditions: vec![amount_cond(ConditionOp::Le, 30_000)],
                required_role: ApproverRole::Operator,
                total_required: 1,
                sla: SlaConfig {
                    warning_secs: 4 * 3600,
                    deadline_secs: 24 * 3600,
                    escalation_secs: None,
                    auto_reject: false,
                },
                auto_approve: Some(AutoApprove {
                    enabled: true,
                    conditions: vec![amount_cond(ConditionOp::Le, 30_000)],
                }),
                escalate_to: None,
            },
            // Emergency redemptions: urgent, auto-reject at the deadline.
            ApprovalRule {
                name: "redemption-emergency".into(),
                ticket_type: TicketType::EmergencyRedemption,
                conditions: Vec::new(),
                required_role: ApproverRole::Emergency,
                total_required: 1,
                sla: SlaConfig {
                    warning_secs: 1800,
                    deadline_secs: 2 * 3600,
                    escalation_secs: Some(1800),
                    auto_reject: true,
                },
                auto_approve: None,
                escalate_to: Some(ApproverRole::Emergency),
            },
            // Rebalance plans over the approval threshold: two managers.
            ApprovalRule {
                name: "rebalancing".into(),
                ticket_type: TicketType::Rebalancing,
                conditions: Vec::new(),
                required_role: ApproverRole::Manager,
                total_required: 2,
                sla: SlaConfig {
                    warning_secs: 2 * 3600,
                    deadline_secs: 12 * 3600,
                    escalation_secs: None,
                    auto_reject: false,
                },
                auto_approve: None,
                escalate_to: None,
            },
            ApprovalRule {
                name: "asset-add".into(),
                ticket_type: TicketType::AssetAdd,
                conditions: Vec::new(),
                required_role: ApproverRole::Admin,
                total_required: 2,
                sla: SlaConfig {
                    warning_secs: 12 * 3600,
                    deadline_secs: 48 * 3600,
                    escalation_secs: None,
                    auto_reject: false,
                },
                auto_approve: None,
                escalate_to: None,
            },
            ApprovalRule {
                name: "asset-remove".into(),
                ticket_type: TicketType::AssetRemove,
                conditions: Vec::new(),
                required_role: ApproverRole::Admin,
                total_required: 3,
                sla: SlaConfig {
                    warning_secs: 12 * 3600,
                    deadline_secs: 48 * 3600,
                    escalation_secs: None,
                    auto_reject: false,
                },
                auto_approve: None,
                escalate_to: None,
            },
            ApprovalRule {
                name: "config-change".into(),
                ticket_type: TicketType::ConfigChange,
                conditions: Vec::new(),
                required_role: ApproverRole::Admin,
                total_required: 2,
                sla: SlaConfig {
                    warning_secs: 4 * 3600,
                    deadline_secs: 24 * 3600,
                    escalation_secs: None,
                    auto_reject: false,
                },
                auto_approve: None,
                escalate_to: None,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::RedemptionChannel;

    fn facts(units: u64) -> RequestFacts {
        RequestFacts {
            amount: Some(Amount::from_units(units)),
            channel: Some(RedemptionChannel::Standard),
        }
    }

    #[test]
    fn test_first_match_by_size() {
        let table = RuleTable::default();
        assert_eq!(
            table
                .match_first(TicketType::Redemption, &facts(150_000))
                .unwrap()
                .name,
            "redemption-large"
        );
        assert_eq!(
            table
                .match_first(TicketType::Redemption, &facts(50_000))
                .unwrap()
                .name,
            "redemption-standard"
        );
        assert_eq!(
            table
                .match_first(TicketType::Redemption, &facts(10_000))
                .unwrap()
                .name,
            "redemption-small"
        );
    }

    #[test]
    fn test_boundary_amounts() {
        let table = RuleTable::default();
        // Exactly 100k is not "greater than 100k".
        assert_eq!(
            table
                .match_first(TicketType::Redemption, &facts(100_000))
                .unwrap()
                .name,
            "redemption-standard"
        );
        // Exactly 30k auto-approves.
        let rule = table
            .match_first(TicketType::Redemption, &facts(30_000))
            .unwrap();
        assert_eq!(rule.name, "redemption-small");
        assert!(rule.auto_approves(&facts(30_000)));
    }

    #[test]
    fn test_no_rule_without_amount_fact() {
        let table = RuleTable::default();
        let no_amount = RequestFacts::default();
        assert!(table.match_first(TicketType::Redemption, &no_amount).is_none());
    }

    #[test]
    fn test_emergency_rule_auto_rejects() {
        let table = RuleTable::default();
        let rule = table
            .match_first(TicketType::EmergencyRedemption, &facts(50_000))
            .unwrap();
        assert!(rule.sla.auto_reject);
        assert_eq!(rule.required_role, ApproverRole::Emergency);
    }
}
