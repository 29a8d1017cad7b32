//! WebSocket log subscription.
//!
//! Maintains an `eth_subscribe("logs")` stream and forwards raw logs to a
//! channel. Disconnects trigger immediate reconnection with exponential
//! backoff (1 s base, 30 s cap) while the caller's polling loop keeps
//! correctness; the subscription is purely a latency optimization.

use alloy::primitives::Address;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::RawLog;
use crate::error::{ChainError, ChainResult};
use crate::rpc::parse_raw_log;

/// Subscription configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    /// Base delay for reconnect backoff.
    pub reconnect_base: Duration,
    /// Cap for reconnect backoff.
    pub reconnect_max: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Long-lived subscription task.
pub struct LogSubscription {
    config: WsConfig,
    contracts: Vec<Address>,
    out: mpsc::Sender<RawLog>,
    shutdown: CancellationToken,
}

impl LogSubscription {
    #[must_use]
    pub fn new(
        config: WsConfig,
        contracts: Vec<Address>,
        out: mpsc::Sender<RawLog>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            contracts,
            out,
            shutdown,
        }
    }

    /// Run until shutdown. Reconnects forever; never returns an error to the
    /// caller because the poller is the correctness path.
    pub async fn run(self) {
        let mut attempt = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                info!("Log subscription shutting down");
                return;
            }

            match self.connect_once().await {
                Ok(()) => {
                    info!("Log subscription closed, reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    error!(error = %e, "Log subscription error");
                    attempt = attempt.saturating_add(1);
                }
            }

            let delay = backoff_delay(
                self.config.reconnect_base,
                self.config.reconnect_max,
                attempt,
            );
            warn!(attempt, delay_ms = delay.as_millis() as u64, "WS reconnect");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn connect_once(&self) -> ChainResult<()> {
        info!(url = %self.config.url, "Connecting log subscription");
        let (ws_stream, _) = connect_async(&self.config.url)
            .await
            .map_err(|e| ChainError::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let addresses: Vec<String> = self.contracts.iter().map(|a| format!("{a:#x}")).collect();
        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", {"address": addresses}],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| ChainError::WebSocket(e.to_string()))?;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| ChainError::WebSocket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("Log subscription closed by server");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(ChainError::WebSocket(e.to_string())),
                        None => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unparseable WS message");
                return;
            }
        };

        // Subscription confirmations carry a result id; log notifications
        // carry params.result.
        let Some(result) = payload.pointer("/params/result") else {
            debug!("WS control message");
            return;
        };

        match parse_raw_log(result) {
            Ok(raw) => {
                if self.out.send(raw).await.is_err() {
                    warn!("Log receiver dropped");
                }
            }
            Err(e) => warn!(error = %e, "Undecodable WS log entry"),
        }
    }
}

fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(10);
    let delay = base.saturating_mul(1u32 << exponent).min(max);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    delay + jitter
}
