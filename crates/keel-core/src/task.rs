//! Task vocabulary shared between the runtime and the engines.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::{ChainEvent, Priority};
use crate::rebalance::RebalanceTrigger;

/// Reporting period for scheduled reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Daily,
    Weekly,
    Monthly,
}

/// Every kind of work the task runtime can carry.
///
/// Payloads are self-contained so a task survives process restarts and can be
/// retried by any worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskKind {
    /// Dispatch one confirmed chain event into the projection.
    ProcessEvent { event: Box<ChainEvent> },
    /// SLA warning notification for a ticket.
    TicketSlaWarning { ticket_id: String },
    /// SLA escalation for a ticket.
    TicketSlaEscalation { ticket_id: String },
    /// SLA deadline handling for a ticket.
    TicketSlaDeadline { ticket_id: String },
    /// Post-resolution processing (on-chain commit / plan hand-off).
    ProcessApprovalResult { ticket_id: String },
    /// Execute an approved rebalance plan.
    ExecutePlan { plan_id: String },
    /// Evaluate rebalance triggers.
    RebalanceCheck { trigger: RebalanceTrigger },
    /// Compute risk indicators and append a snapshot.
    RiskIndicatorTick,
    /// 5-minute liquidity check.
    LiquidityCheck,
    /// Hourly liquidity forecast over all horizons.
    LiquidityForecast,
    /// Daily overdue-liability batch on-chain call.
    OverdueLiabilityBatch { days_back: u32 },
    /// Scheduled report generation.
    GenerateReport { period: ReportPeriod },
    /// Post-incident report after an emergency closes.
    IncidentReport { incident_id: String },
}

impl TaskKind {
    /// Default queue priority for this work.
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            TaskKind::ProcessEvent { event } => event.priority(),
            TaskKind::TicketSlaDeadline { .. } | TaskKind::ProcessApprovalResult { .. } => {
                Priority::High
            }
            TaskKind::ExecutePlan { .. } => Priority::High,
            TaskKind::TicketSlaWarning { .. } | TaskKind::TicketSlaEscalation { .. } => {
                Priority::Normal
            }
            TaskKind::RebalanceCheck { .. }
            | TaskKind::RiskIndicatorTick
            | TaskKind::LiquidityCheck
            | TaskKind::LiquidityForecast => Priority::Normal,
            TaskKind::OverdueLiabilityBatch { .. }
            | TaskKind::GenerateReport { .. }
            | TaskKind::IncidentReport { .. } => Priority::Low,
        }
    }

    /// Sequential lane key, when ordering within a lane matters.
    ///
    /// Events share a lane per contract so per-contract `(block, log_index)`
    /// order is preserved across workers.
    #[must_use]
    pub fn lane(&self) -> Option<String> {
        match self {
            TaskKind::ProcessEvent { event } => Some(format!("contract:{}", event.contract)),
            TaskKind::ExecutePlan { plan_id } => Some(format!("plan:{plan_id}")),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::ProcessEvent { .. } => "process_event",
            TaskKind::TicketSlaWarning { .. } => "sla_warning",
            TaskKind::TicketSlaEscalation { .. } => "sla_escalation",
            TaskKind::TicketSlaDeadline { .. } => "sla_deadline",
            TaskKind::ProcessApprovalResult { .. } => "approval_result",
            TaskKind::ExecutePlan { .. } => "execute_plan",
            TaskKind::RebalanceCheck { .. } => "rebalance_check",
            TaskKind::RiskIndicatorTick => "risk_tick",
            TaskKind::LiquidityCheck => "liquidity_check",
            TaskKind::LiquidityForecast => "liquidity_forecast",
            TaskKind::OverdueLiabilityBatch { .. } => "overdue_liability_batch",
            TaskKind::GenerateReport { .. } => "generate_report",
            TaskKind::IncidentReport { .. } => "incident_report",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sla_deadline_outranks_warning() {
        let warning = TaskKind::TicketSlaWarning {
            ticket_id: "APR-1".into(),
        };
        let deadline = TaskKind::TicketSlaDeadline {
            ticket_id: "APR-1".into(),
        };
        assert!(deadline.priority() < warning.priority());
    }

    #[test]
    fn test_reports_are_low_priority() {
        let report = TaskKind::GenerateReport {
            period: ReportPeriod::Daily,
        };
        assert_eq!(report.priority(), Priority::Low);
    }
}
