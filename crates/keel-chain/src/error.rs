//! Error types for keel-chain.

use thiserror::Error;

/// Chain gateway errors.
///
/// Transient kinds (`TransientRpc`, `RpcTimeout`, `RpcRateLimited`,
/// `DeadlineExceeded`) are retried with backoff; a failure streak opens the
/// circuit breaker. Send failures are terminal for the attempt and reported
/// to the caller's retry budget.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Transient RPC error: {0}")]
    TransientRpc(String),

    #[error("RPC timeout after {0}s")]
    RpcTimeout(u64),

    #[error("RPC rate limited")]
    RpcRateLimited,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Transaction dropped by reorg: {0}")]
    ReorgDropped(String),

    #[error("Rejected by key service policy: {0}")]
    RejectedByPolicy(String),

    #[error("Send timed out waiting for receipt: {0}")]
    SendTimeout(String),

    #[error("Transaction reverted on-chain: {0}")]
    ReceiptFailed(String),

    #[error("Nonce exhausted for signer {0}")]
    NonceExhausted(String),

    #[error("Simulation reverted: {0}")]
    SimulationReverted(String),

    #[error("Unknown signer: {0}")]
    UnknownSigner(String),

    #[error("Log decode error: {0}")]
    Decode(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl ChainError {
    /// Whether a retry at the call site can reasonably succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::TransientRpc(_)
                | ChainError::RpcTimeout(_)
                | ChainError::RpcRateLimited
                | ChainError::DeadlineExceeded(_)
                | ChainError::SendTimeout(_)
        )
    }
}

/// Result type alias for gateway operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;
