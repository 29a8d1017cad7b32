//! Error types for keel-node.

use thiserror::Error;

/// Node-level errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Chain(#[from] keel_chain::ChainError),

    #[error(transparent)]
    Store(#[from] keel_store::StoreError),

    #[error(transparent)]
    Ingest(#[from] keel_ingest::IngestError),

    #[error(transparent)]
    Telemetry(#[from] keel_telemetry::TelemetryError),
}

/// Result type alias for node operations.
pub type NodeResult<T> = std::result::Result<T, NodeError>;
