//! Redemption request model and its status machine.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Amount;
use crate::error::CoreError;

/// Redemption channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RedemptionChannel {
    Standard,
    Emergency,
    Scheduled,
}

impl fmt::Display for RedemptionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "STANDARD"),
            Self::Emergency => write!(f, "EMERGENCY"),
            Self::Scheduled => write!(f, "SCHEDULED"),
        }
    }
}

/// Redemption request status.
///
/// `Settled`, `Rejected`, `Expired` and `Cancelled` are terminal; no edge
/// leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionStatus {
    Pending,
    PendingApproval,
    Approved,
    Settled,
    Rejected,
    Expired,
    Cancelled,
}

impl RedemptionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Settled | Self::Rejected | Self::Expired | Self::Cancelled
        )
    }

    /// Whether the transition `self -> to` is an edge of the status machine.
    #[must_use]
    pub fn can_transition(&self, to: RedemptionStatus) -> bool {
        use RedemptionStatus::*;
        matches!(
            (self, to),
            (Pending, Settled)
                | (Pending, Cancelled)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (PendingApproval, Expired)
                | (PendingApproval, Cancelled)
                | (Approved, Settled)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(&self, to: RedemptionStatus) -> Result<RedemptionStatus, CoreError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(CoreError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::PendingApproval => write!(f, "PENDING_APPROVAL"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Off-chain record of an on-chain redemption request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRequest {
    /// Chain-assigned unique identifier.
    pub request_id: u64,
    pub owner: Address,
    pub receiver: Address,
    pub shares: Amount,
    pub gross_amount: Amount,
    /// NAV locked at request time.
    pub locked_nav: Amount,
    pub estimated_fee: Amount,
    pub request_time: DateTime<Utc>,
    pub settlement_time: DateTime<Utc>,
    pub channel: RedemptionChannel,
    pub requires_approval: bool,
    pub window_id: Option<u64>,
    pub voucher_token_id: Option<u64>,
    pub status: RedemptionStatus,
    /// Net amount actually paid out at settlement.
    pub settled_amount: Option<Amount>,
    /// Fee charged at settlement.
    pub settled_fee: Option<Amount>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Linked approval ticket, when `requires_approval`.
    pub approval_ticket_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RedemptionRequest {
    /// Initial status for a freshly observed request.
    #[must_use]
    pub fn initial_status(requires_approval: bool) -> RedemptionStatus {
        if requires_approval {
            RedemptionStatus::PendingApproval
        } else {
            RedemptionStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        assert_eq!(
            RedemptionRequest::initial_status(false),
            RedemptionStatus::Pending
        );
        assert_eq!(
            RedemptionRequest::initial_status(true),
            RedemptionStatus::PendingApproval
        );
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        use RedemptionStatus::*;
        let all = [
            Pending,
            PendingApproval,
            Approved,
            Settled,
            Rejected,
            Expired,
            Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(
                    !from.can_transition(to),
                    "terminal {from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn test_valid_paths() {
        use RedemptionStatus::*;
        assert!(Pending.can_transition(Settled));
        assert!(PendingApproval.can_transition(Approved));
        assert!(PendingApproval.can_transition(Rejected));
        assert!(PendingApproval.can_transition(Expired));
        assert!(Approved.can_transition(Settled));
    }

    #[test]
    fn test_invalid_edges_rejected() {
        use RedemptionStatus::*;
        assert!(Pending.transition(Approved).is_err());
        assert!(Settled.transition(Pending).is_err());
        assert!(Approved.transition(Rejected).is_err());
    }
}
