//! The `ChainGateway` trait: the typed read/write facade over the chain.
//!
//! Everything above this crate talks to the chain exclusively through this
//! trait, which keeps the engines testable against mock gateways.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use keel_core::{Amount, LogRecord};

use crate::error::ChainResult;
use crate::signer::SignerId;

/// Block selector for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Latest,
    Number(u64),
}

/// Outcome of a dry-run call against latest state.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub success: bool,
    pub revert_reason: Option<String>,
    /// Decoded expected output; purchase/redeem simulations include a
    /// `slippageBps` field.
    pub output: Value,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub status: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// A signed write request.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub contract: Address,
    pub method: String,
    pub args: Value,
    pub signer: SignerId,
    /// Monetary value the key service checks against per-tx and daily caps.
    pub value: Amount,
    /// Overall deadline for submit + confirmation, seconds.
    pub deadline_secs: u64,
}

impl SendRequest {
    #[must_use]
    pub fn new(contract: Address, method: impl Into<String>, args: Value, signer: SignerId) -> Self {
        Self {
            contract,
            method: method.into(),
            args,
            signer,
            value: Amount::ZERO,
            deadline_secs: 60,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: Amount) -> Self {
        self.value = value;
        self
    }
}

/// Result of a confirmed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub tx_hash: B256,
    pub receipt: TxReceipt,
}

/// Typed read/write facade over RPC/WS.
///
/// Writes go through the external key service; the gateway serializes sends
/// per `(contract, signer)` to prevent nonce conflicts and waits for the
/// configured confirmation depth before reporting success.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Current chain head.
    async fn block_number(&self) -> ChainResult<u64>;

    /// Canonical hash of a block, `None` if the node no longer knows it.
    async fn block_hash(&self, number: u64) -> ChainResult<Option<B256>>;

    /// Batched range fetch of decoded logs, inclusive bounds.
    async fn get_logs(
        &self,
        contracts: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<LogRecord>>;

    /// Unbounded lazy stream of decoded logs, restartable from any block.
    ///
    /// The subscription is a latency optimization; correctness relies on the
    /// caller's polling loop.
    async fn subscribe_logs(
        &self,
        contracts: &[Address],
        from_block: u64,
    ) -> ChainResult<mpsc::Receiver<LogRecord>>;

    /// Read call, latest or historical.
    async fn call(
        &self,
        contract: Address,
        method: &str,
        args: Value,
        block: BlockRef,
    ) -> ChainResult<Value>;

    /// Dry-run against latest state: expected output or revert reason.
    async fn simulate(&self, contract: Address, method: &str, args: Value)
        -> ChainResult<Simulation>;

    /// Signed write; returns after the configured confirmation depth.
    async fn send(&self, request: SendRequest) -> ChainResult<SendOutcome>;
}
