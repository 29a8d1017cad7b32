//! In-memory gateway for engine tests.
//!
//! Scriptable: tests seed logs, canned simulations, and send failures, then
//! assert on the recorded write calls.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use keel_core::LogRecord;

use crate::error::{ChainError, ChainResult};
use crate::gateway::{BlockRef, ChainGateway, SendOutcome, SendRequest, Simulation, TxReceipt};

/// Scriptable mock gateway.
#[derive(Default)]
pub struct MockGateway {
    head: AtomicU64,
    tx_counter: AtomicU64,
    block_hashes: Mutex<HashMap<u64, B256>>,
    logs: Mutex<Vec<LogRecord>>,
    simulations: Mutex<HashMap<String, Simulation>>,
    call_results: Mutex<HashMap<String, Value>>,
    send_failures: Mutex<VecDeque<ChainError>>,
    sends: Mutex<Vec<SendRequest>>,
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_block_hash(&self, number: u64, hash: B256) {
        self.block_hashes.lock().insert(number, hash);
    }

    pub fn remove_block(&self, number: u64) {
        self.block_hashes.lock().remove(&number);
    }

    pub fn push_log(&self, record: LogRecord) {
        self.logs.lock().push(record);
    }

    /// Seed a simulation outcome for a method signature.
    pub fn script_simulation(&self, method: &str, simulation: Simulation) {
        self.simulations.lock().insert(method.to_string(), simulation);
    }

    pub fn script_call(&self, method: &str, result: Value) {
        self.call_results.lock().insert(method.to_string(), result);
    }

    /// Queue an error for the next send; subsequent sends succeed.
    pub fn fail_next_send(&self, error: ChainError) {
        self.send_failures.lock().push_back(error);
    }

    /// All writes observed so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SendRequest> {
        self.sends.lock().clone()
    }

    /// Methods of all writes observed so far.
    #[must_use]
    pub fn sent_methods(&self) -> Vec<String> {
        self.sends.lock().iter().map(|s| s.method.clone()).collect()
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn block_number(&self) -> ChainResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_hash(&self, number: u64) -> ChainResult<Option<B256>> {
        Ok(self.block_hashes.lock().get(&number).copied())
    }

    async fn get_logs(
        &self,
        contracts: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<LogRecord>> {
        let mut records: Vec<LogRecord> = self
            .logs
            .lock()
            .iter()
            .filter(|r| {
                r.block_number >= from_block
                    && r.block_number <= to_block
                    && (contracts.is_empty() || contracts.contains(&r.contract))
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.block_number, r.log_index));
        Ok(records)
    }

    async fn subscribe_logs(
        &self,
        _contracts: &[Address],
        _from_block: u64,
    ) -> ChainResult<mpsc::Receiver<LogRecord>> {
        // Tests drive the poller path; the subscription stays silent.
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn call(
        &self,
        _contract: Address,
        method: &str,
        _args: Value,
        _block: BlockRef,
    ) -> ChainResult<Value> {
        Ok(self
            .call_results
            .lock()
            .get(method)
            .cloned()
            .unwrap_or(Value::Array(Vec::new())))
    }

    async fn simulate(
        &self,
        _contract: Address,
        method: &str,
        _args: Value,
    ) -> ChainResult<Simulation> {
        Ok(self.simulations.lock().get(method).cloned().unwrap_or(
            Simulation {
                success: true,
                revert_reason: None,
                output: Value::Array(Vec::new()),
            },
        ))
    }

    async fn send(&self, request: SendRequest) -> ChainResult<SendOutcome> {
        if let Some(error) = self.send_failures.lock().pop_front() {
            return Err(error);
        }
        self.sends.lock().push(request);
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendOutcome {
            tx_hash: B256::with_last_byte(n as u8),
            receipt: TxReceipt {
                status: true,
                block_number: self.head.load(Ordering::SeqCst),
                gas_used: 21_000,
            },
        })
    }
}
