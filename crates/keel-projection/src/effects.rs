//! Side effects handlers emit after their transaction commits.
//!
//! The dispatcher never calls other engines directly; it emits typed effects
//! the node routes. Effects fire only on `Applied` commits, so replayed
//! events produce no duplicate side effects.

use alloy::primitives::Address;

use keel_core::{Amount, Bps, RedemptionChannel};

/// Routed side effects.
#[derive(Debug, Clone)]
pub enum DomainEffect {
    /// A redemption arrived flagged `requires_approval`: open a ticket.
    RequestApproval {
        request_id: u64,
        owner: Address,
        gross_amount: Amount,
        channel: RedemptionChannel,
    },
    /// The chain resolved a gated redemption; mark the linked ticket.
    RedemptionResolvedOnChain { request_id: u64, approved: bool },
    /// NAV moved: wake the risk evaluator.
    WakeRisk,
    /// Emergency mode flipped on-chain.
    EmergencyMode { enabled: bool },
    /// Liquidity alert passed the duplicate-suppression cooldown.
    LiquidityAlert {
        critical: bool,
        ratio: Bps,
        threshold: Bps,
        available: Amount,
    },
    /// A deposit or redemption large enough to re-evaluate rebalance
    /// triggers.
    LargeFlow { amount: Amount },
}
