//! Error types for keel-rebalance.

use thiserror::Error;

use keel_core::Bps;

/// Rebalance engine errors.
///
/// Simulation failures (`SimulationReverted`, `SlippageExceeded`,
/// `ProjectedDrift`) fail the plan before any on-chain write.
#[derive(Debug, Error)]
pub enum RebalanceError {
    #[error("Simulation reverted: {0}")]
    SimulationReverted(String),

    #[error("Predicted slippage {predicted} exceeds limit {limit}")]
    SlippageExceeded { predicted: Bps, limit: Bps },

    #[error("Projected state drifts {drift} from target, tolerance {tolerance}")]
    ProjectedDrift { drift: Bps, tolerance: Bps },

    #[error("Plan not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] keel_store::StoreError),

    #[error(transparent)]
    Chain(#[from] keel_chain::ChainError),
}

impl RebalanceError {
    /// Stable error code for command responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SimulationReverted(_) => "SIMULATION_REVERTED",
            Self::SlippageExceeded { .. } => "SLIPPAGE_EXCEEDED",
            Self::ProjectedDrift { .. } => "PROJECTED_DRIFT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Chain(_) => "CHAIN_ERROR",
        }
    }
}

/// Result type alias for rebalance operations.
pub type RebalanceResult<T> = std::result::Result<T, RebalanceError>;
