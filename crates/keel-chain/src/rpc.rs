//! JSON-RPC client over HTTP.
//!
//! Thin transport used by the live gateway: request shaping, deadline
//! enforcement, circuit breaker accounting, and hex plumbing. Retry policy
//! belongs to callers; transient errors are typed so they can tell.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::codec::RawLog;
use crate::error::{ChainError, ChainResult};

/// Default RPC deadline (30 s).
pub const RPC_DEADLINE: Duration = Duration::from_secs(30);

/// JSON-RPC client with breaker accounting.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    breaker: Arc<CircuitBreaker>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, breaker: Arc<CircuitBreaker>) -> ChainResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_DEADLINE)
            .build()
            .map_err(|e| ChainError::TransientRpc(format!("http client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            breaker,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one JSON-RPC request.
    pub async fn request(&self, method: &str, params: Value) -> ChainResult<Value> {
        if !self.breaker.allow() {
            return Err(ChainError::CircuitOpen);
        }

        let result = self.request_inner(method, params).await;
        self.breaker.record(result.is_ok());
        result
    }

    async fn request_inner(&self, method: &str, params: Value) -> ChainResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "RPC request");
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::RpcTimeout(RPC_DEADLINE.as_secs())
                } else {
                    ChainError::TransientRpc(e.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(ChainError::RpcRateLimited);
        }
        if response.status().is_server_error() {
            return Err(ChainError::TransientRpc(format!(
                "status {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ChainError::TransientRpc(format!("bad response body: {e}")))?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(ChainError::Rpc { code, message });
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::TransientRpc("missing result".to_string()))
    }

    /// `eth_blockNumber`.
    pub async fn block_number(&self) -> ChainResult<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&result)
    }

    /// `eth_getBlockByNumber`: canonical hash and timestamp.
    pub async fn block_header(&self, number: u64) -> ChainResult<Option<(B256, DateTime<Utc>)>> {
        let result = self
            .request(
                "eth_getBlockByNumber",
                json!([hex_u64(number), false]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let hash = parse_hex_b256(&result["hash"])?;
        let timestamp = parse_hex_u64(&result["timestamp"])?;
        let time = Utc
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .ok_or_else(|| ChainError::Decode(format!("bad block timestamp {timestamp}")))?;
        Ok(Some((hash, time)))
    }

    /// `eth_getLogs` over an inclusive block range.
    pub async fn get_logs(
        &self,
        contracts: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RawLog>> {
        let addresses: Vec<String> = contracts.iter().map(|a| format!("{a:#x}")).collect();
        let result = self
            .request(
                "eth_getLogs",
                json!([{
                    "address": addresses,
                    "fromBlock": hex_u64(from_block),
                    "toBlock": hex_u64(to_block),
                }]),
            )
            .await?;

        let entries = result
            .as_array()
            .ok_or_else(|| ChainError::Decode("eth_getLogs result not an array".to_string()))?;
        entries.iter().map(parse_raw_log).collect()
    }

    /// `eth_call` with pre-encoded calldata.
    pub async fn eth_call(
        &self,
        contract: Address,
        calldata: &[u8],
        block: &str,
    ) -> ChainResult<Vec<u8>> {
        let result = self
            .request(
                "eth_call",
                json!([{
                    "to": format!("{contract:#x}"),
                    "data": hex_bytes(calldata),
                }, block]),
            )
            .await?;
        parse_hex_bytes(&result)
    }

    /// `eth_getTransactionReceipt`.
    pub async fn transaction_receipt(&self, tx_hash: B256) -> ChainResult<Option<Value>> {
        let result = self
            .request("eth_getTransactionReceipt", json!([format!("{tx_hash:#x}")]))
            .await?;
        Ok(if result.is_null() { None } else { Some(result) })
    }
}

/// Retry a fallible async operation with jittered exponential backoff.
///
/// Only transient errors are retried; the final error is returned once
/// `max_attempts` is exhausted.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    mut op: F,
) -> ChainResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ChainResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                attempt += 1;
                let exp = base_delay.saturating_mul(1u32 << attempt.min(10));
                let capped = exp.min(max_delay);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                warn!(
                    label,
                    attempt,
                    delay_ms = capped.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(capped + jitter).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Hex plumbing
// ============================================================================

pub(crate) fn hex_u64(value: u64) -> String {
    format!("{value:#x}")
}

pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("0x");
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub(crate) fn parse_hex_u64(value: &Value) -> ChainResult<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected hex string, got {value}")))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("bad hex u64 {s}: {e}")))
}

pub(crate) fn parse_hex_b256(value: &Value) -> ChainResult<B256> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected hex string, got {value}")))?;
    s.parse()
        .map_err(|_| ChainError::Decode(format!("bad hash {s}")))
}

pub(crate) fn parse_hex_bytes(value: &Value) -> ChainResult<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected hex string, got {value}")))?;
    let s = s.trim_start_matches("0x");
    if s.len() % 2 != 0 {
        return Err(ChainError::Decode("odd-length hex".to_string()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| ChainError::Decode(format!("bad hex byte: {e}")))
        })
        .collect()
}

pub(crate) fn parse_raw_log(entry: &Value) -> ChainResult<RawLog> {
    let topics = entry["topics"]
        .as_array()
        .ok_or_else(|| ChainError::Decode("log without topics".to_string()))?
        .iter()
        .map(parse_hex_b256)
        .collect::<ChainResult<Vec<_>>>()?;

    let address: Address = entry["address"]
        .as_str()
        .ok_or_else(|| ChainError::Decode("log without address".to_string()))?
        .parse()
        .map_err(|_| ChainError::Decode("bad log address".to_string()))?;

    Ok(RawLog {
        address,
        topics,
        data: parse_hex_bytes(&entry["data"])?,
        block_number: parse_hex_u64(&entry["blockNumber"])?,
        block_hash: parse_hex_b256(&entry["blockHash"])?,
        tx_hash: parse_hex_b256(&entry["transactionHash"])?,
        log_index: parse_hex_u64(&entry["logIndex"])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(hex_u64(255), "0xff");
        assert_eq!(parse_hex_u64(&json!("0xff")).unwrap(), 255);
        assert_eq!(hex_bytes(&[0xde, 0xad]), "0xdead");
        assert_eq!(parse_hex_bytes(&json!("0xdead")).unwrap(), vec![0xde, 0xad]);
    }

    #[test]
    fn test_parse_hex_bytes_rejects_odd_length() {
        assert!(parse_hex_bytes(&json!("0xabc")).is_err());
    }

    #[test]
    fn test_parse_raw_log() {
        let entry = json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "topics": ["0x00000000000000000000000000000000000000000000000000000000000000ff"],
            "data": "0x",
            "blockNumber": "0x10",
            "blockHash": "0x00000000000000000000000000000000000000000000000000000000000000ee",
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000dd",
            "logIndex": "0x2",
        });
        let raw = parse_raw_log(&entry).unwrap();
        assert_eq!(raw.block_number, 16);
        assert_eq!(raw.log_index, 2);
        assert_eq!(raw.topics.len(), 1);
        assert!(raw.data.is_empty());
    }
}
