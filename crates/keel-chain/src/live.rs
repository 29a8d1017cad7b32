//! Live gateway: `ChainGateway` over JSON-RPC + WS with signed writes.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::LogRecord;

use crate::abi::{decode_words, encode_call};
use crate::breaker::CircuitBreaker;
use crate::codec::{EventCodec, RawLog};
use crate::error::{ChainError, ChainResult};
use crate::gateway::{BlockRef, ChainGateway, SendOutcome, SendRequest, Simulation, TxReceipt};
use crate::rpc::{parse_hex_u64, RpcClient};
use crate::signer::{DynKeyService, SignerRegistry, SignerTx};
use crate::ws::{LogSubscription, WsConfig};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rpc_url: String,
    pub ws_url: String,
    /// Blocks behind head before a transaction counts as confirmed.
    pub confirmations: u64,
    /// Receipt polling interval while waiting for a send.
    pub receipt_poll: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            ws_url: String::new(),
            confirmations: 15,
            receipt_poll: Duration::from_secs(3),
        }
    }
}

/// Production gateway.
pub struct LiveGateway {
    config: GatewayConfig,
    rpc: Arc<RpcClient>,
    codec: Arc<EventCodec>,
    signers: Arc<SignerRegistry>,
    key_service: DynKeyService,
    /// Header cache: block number -> (hash, timestamp).
    headers: DashMap<u64, (B256, DateTime<Utc>)>,
    shutdown: CancellationToken,
}

impl LiveGateway {
    pub fn new(
        config: GatewayConfig,
        signers: Arc<SignerRegistry>,
        key_service: DynKeyService,
        shutdown: CancellationToken,
    ) -> ChainResult<Self> {
        let breaker = Arc::new(CircuitBreaker::default());
        let rpc = Arc::new(RpcClient::new(config.rpc_url.clone(), breaker)?);
        Ok(Self {
            config,
            rpc,
            codec: Arc::new(EventCodec::new()),
            signers,
            key_service,
            headers: DashMap::new(),
            shutdown,
        })
    }

    async fn header(&self, number: u64) -> ChainResult<(B256, DateTime<Utc>)> {
        if let Some(cached) = self.headers.get(&number) {
            return Ok(*cached);
        }
        let header = self
            .rpc
            .block_header(number)
            .await?
            .ok_or_else(|| ChainError::TransientRpc(format!("block {number} not found")))?;
        // Bounded cache: drop far-past entries opportunistically.
        if self.headers.len() > 4096 {
            self.headers.retain(|k, _| *k + 8192 > number);
        }
        self.headers.insert(number, header);
        Ok(header)
    }

    async fn decode_raw(&self, raw: RawLog) -> Option<LogRecord> {
        let (_, block_time) = match self.header(raw.block_number).await {
            Ok(h) => h,
            Err(e) => {
                warn!(block = raw.block_number, error = %e, "Header fetch failed for log");
                return None;
            }
        };
        match self.codec.decode(&raw, block_time) {
            Ok(record) => Some(record),
            Err(e) => {
                // Unknown or malformed logs never block ingestion.
                warn!(tx = %raw.tx_hash, index = raw.log_index, error = %e, "Skipping undecodable log");
                None
            }
        }
    }

    async fn wait_for_receipt(&self, tx_hash: B256, deadline: Duration) -> ChainResult<TxReceipt> {
        let started = Instant::now();
        let mut mined_block: Option<u64> = None;

        loop {
            if started.elapsed() > deadline {
                return Err(ChainError::SendTimeout(format!(
                    "{tx_hash} not confirmed within {}s",
                    deadline.as_secs()
                )));
            }

            match self.rpc.transaction_receipt(tx_hash).await? {
                Some(receipt) => {
                    let block_number = parse_hex_u64(&receipt["blockNumber"])?;
                    let status = parse_hex_u64(&receipt["status"])? == 1;
                    let gas_used = parse_hex_u64(&receipt["gasUsed"]).unwrap_or(0);
                    mined_block = Some(block_number);

                    let head = self.rpc.block_number().await?;
                    if head >= block_number + self.config.confirmations {
                        if !status {
                            return Err(ChainError::ReceiptFailed(format!(
                                "{tx_hash} reverted in block {block_number}"
                            )));
                        }
                        return Ok(TxReceipt {
                            status,
                            block_number,
                            gas_used,
                        });
                    }
                    debug!(
                        tx = %tx_hash,
                        mined = block_number,
                        head,
                        "Waiting for confirmations"
                    );
                }
                None => {
                    if mined_block.is_some() {
                        // Receipt existed and disappeared before confirmation.
                        return Err(ChainError::ReorgDropped(format!(
                            "{tx_hash} vanished from canonical chain"
                        )));
                    }
                }
            }

            tokio::time::sleep(self.config.receipt_poll).await;
        }
    }
}

#[async_trait]
impl ChainGateway for LiveGateway {
    async fn block_number(&self) -> ChainResult<u64> {
        self.rpc.block_number().await
    }

    async fn block_hash(&self, number: u64) -> ChainResult<Option<B256>> {
        Ok(self.rpc.block_header(number).await?.map(|(hash, _)| hash))
    }

    async fn get_logs(
        &self,
        contracts: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<LogRecord>> {
        let raws = self.rpc.get_logs(contracts, from_block, to_block).await?;
        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            if let Some(record) = self.decode_raw(raw).await {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn subscribe_logs(
        &self,
        contracts: &[Address],
        from_block: u64,
    ) -> ChainResult<mpsc::Receiver<LogRecord>> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawLog>(1024);
        let (out_tx, out_rx) = mpsc::channel::<LogRecord>(1024);

        // Backlog first, so the stream is restartable from any block.
        let head = self.rpc.block_number().await?;
        if from_block <= head {
            let backlog = self.get_logs(contracts, from_block, head).await?;
            info!(count = backlog.len(), from_block, head, "Subscription backlog");
            for record in backlog {
                if out_tx.send(record).await.is_err() {
                    return Err(ChainError::SubscriptionClosed);
                }
            }
        }

        let subscription = LogSubscription::new(
            WsConfig {
                url: self.config.ws_url.clone(),
                ..WsConfig::default()
            },
            contracts.to_vec(),
            raw_tx,
            self.shutdown.clone(),
        );
        tokio::spawn(subscription.run());

        // Decode live logs on a separate task so slow header fetches do not
        // stall the socket.
        let codec = self.codec.clone();
        let rpc = self.rpc.clone();
        let headers = DashMap::new();
        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                let block_time = match headers.get(&raw.block_number).map(|e| *e) {
                    Some(t) => t,
                    None => match rpc.block_header(raw.block_number).await {
                        Ok(Some((_, time))) => {
                            headers.insert(raw.block_number, time);
                            time
                        }
                        Ok(None) | Err(_) => {
                            warn!(block = raw.block_number, "No header for live log");
                            continue;
                        }
                    },
                };
                match codec.decode(&raw, block_time) {
                    Ok(record) => {
                        if out_tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping undecodable live log"),
                }
            }
        });

        Ok(out_rx)
    }

    async fn call(
        &self,
        contract: Address,
        method: &str,
        args: Value,
        block: BlockRef,
    ) -> ChainResult<Value> {
        let calldata = encode_call(method, &args)?;
        let block_tag = match block {
            BlockRef::Latest => "latest".to_string(),
            BlockRef::Number(n) => format!("{n:#x}"),
        };
        let output = self.rpc.eth_call(contract, &calldata, &block_tag).await?;
        Ok(decode_words(&output))
    }

    async fn simulate(
        &self,
        contract: Address,
        method: &str,
        args: Value,
    ) -> ChainResult<Simulation> {
        let calldata = encode_call(method, &args)?;
        match self.rpc.eth_call(contract, &calldata, "latest").await {
            Ok(output) => Ok(Simulation {
                success: true,
                revert_reason: None,
                output: decode_words(&output),
            }),
            Err(ChainError::Rpc { message, .. }) => Ok(Simulation {
                success: false,
                revert_reason: Some(message),
                output: Value::Null,
            }),
            Err(other) => Err(other),
        }
    }

    async fn send(&self, request: SendRequest) -> ChainResult<SendOutcome> {
        let account = self.signers.account(&request.signer)?;
        self.signers.authorize(&request.signer, request.value)?;

        let calldata = encode_call(&request.method, &request.args)?;
        let lock = self.signers.send_lock(request.contract, &request.signer);
        let _guard = lock.lock().await;

        info!(
            contract = %request.contract,
            method = %request.method,
            signer = %account.id,
            "Submitting transaction"
        );
        let tx_hash = self
            .key_service
            .submit(&SignerTx {
                signer: request.signer.clone(),
                contract: request.contract,
                calldata,
                value: request.value,
            })
            .await?;

        let receipt = self
            .wait_for_receipt(tx_hash, Duration::from_secs(request.deadline_secs))
            .await?;
        info!(tx = %tx_hash, block = receipt.block_number, "Transaction confirmed");
        Ok(SendOutcome { tx_hash, receipt })
    }
}
