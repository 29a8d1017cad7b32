//! Error types for keel-approval.

use thiserror::Error;

/// Approval engine errors.
///
/// `NoRuleMatched`, `UnsupportedReference`, and `Validation` surface to the
/// command caller with stable codes; store and chain failures follow the
/// usual retry policies.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("No approval rule matched the request")]
    NoRuleMatched,

    #[error("Unsupported reference type: {0}")]
    UnsupportedReference(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Ticket not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] keel_store::StoreError),

    #[error(transparent)]
    Chain(#[from] keel_chain::ChainError),
}

impl ApprovalError {
    /// Stable error code for command responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRuleMatched => "NO_RULE_MATCHED",
            Self::UnsupportedReference(_) => "UNSUPPORTED_REFERENCE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Store(_) => "STORE_ERROR",
            Self::Chain(_) => "CHAIN_ERROR",
        }
    }
}

/// Result type alias for approval operations.
pub type ApprovalResult<T> = std::result::Result<T, ApprovalError>;
