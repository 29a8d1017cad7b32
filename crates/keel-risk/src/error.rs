//! Error types for keel-risk.

use thiserror::Error;

/// Risk engine errors.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error(transparent)]
    Store(#[from] keel_store::StoreError),

    #[error(transparent)]
    Chain(#[from] keel_chain::ChainError),

    #[error(transparent)]
    Rebalance(#[from] keel_rebalance::RebalanceError),

    /// Another driver already holds the incident lease.
    #[error("Incident {0} already has an active driver")]
    IncidentHeld(String),
}

/// Result type alias for risk operations.
pub type RiskResult<T> = std::result::Result<T, RiskError>;
