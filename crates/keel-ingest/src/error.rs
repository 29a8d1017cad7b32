//! Error types for keel-ingest.

use thiserror::Error;

/// Ingestor errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Chain(#[from] keel_chain::ChainError),

    #[error(transparent)]
    Store(#[from] keel_store::StoreError),

    /// A previously confirmed block disappeared from the canonical chain.
    /// Fatal: the ingestor halts until manually cleared.
    #[error("Reorg detected at block {block} for {contract}")]
    ReorgDetected { contract: String, block: u64 },

    /// The singleton lease was lost; the loop exits and a replacement
    /// resumes from the persisted checkpoint.
    #[error("Ingestor lease lost")]
    LeaseLost,
}

/// Result type alias for ingestor operations.
pub type IngestResult<T> = std::result::Result<T, IngestError>;
