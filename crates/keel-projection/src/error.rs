//! Error types for keel-projection.

use thiserror::Error;

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] keel_store::StoreError),

    #[error(transparent)]
    Core(#[from] keel_core::CoreError),

    /// The accounting identity drifted beyond tolerance. Fatal for the
    /// dispatcher until manually cleared.
    #[error("Projection invariant violated: drift {drift_bps}bp exceeds tolerance")]
    InvariantViolated { drift_bps: i64 },
}

/// Result type alias for projection operations.
pub type ProjectionResult<T> = std::result::Result<T, ProjectionError>;
