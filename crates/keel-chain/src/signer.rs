//! Signer accounts and the key-service boundary.
//!
//! Private keys never live in this process: signing and policy enforcement
//! belong to the external key service, reached per call through `KeyService`.
//! This module tracks the local side of the contract: signer identity and
//! role, client-side cap accounting, and per-`(contract, signer)`
//! serialization so concurrent sends cannot produce nonce conflicts.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use keel_core::Amount;

use crate::error::{ChainError, ChainResult};

/// Role a signer may act under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignerRole {
    Admin,
    VipApprover,
    Rebalancer,
}

/// Custody tier of a signer account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerTier {
    /// Single-sig, low limits.
    Hot,
    /// Multi-sig 2/3, medium limits.
    Warm,
    /// Multi-sig 3/5, large amounts and recovery.
    Cold,
}

/// Stable identifier of a signer registered with the key service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SignerId(pub String);

impl SignerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SignerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transaction handed to the key service for signing and broadcast.
#[derive(Debug, Clone)]
pub struct SignerTx {
    pub signer: SignerId,
    pub contract: Address,
    pub calldata: Vec<u8>,
    /// Monetary value the key service checks against its caps.
    pub value: Amount,
}

/// External key service: signs and broadcasts with per-call authorization.
///
/// Returns the broadcast transaction hash; policy rejections surface as
/// `ChainError::RejectedByPolicy`.
#[async_trait]
pub trait KeyService: Send + Sync {
    async fn submit(&self, tx: &SignerTx) -> ChainResult<B256>;
}

/// Static description of one signer account.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignerAccount {
    pub id: SignerId,
    pub role: SignerRole,
    pub tier: SignerTier,
    /// Cap on a single transaction's value.
    pub per_tx_cap: Amount,
    /// Cap on total value per UTC day.
    pub daily_cap: Amount,
}

struct DailySpend {
    day: NaiveDate,
    spent: Amount,
}

/// Signer registry with cap pre-checks and per-(contract, signer) locks.
///
/// The key service is authoritative on caps; the local pre-check exists so an
/// over-cap plan fails before a transaction is composed at all.
pub struct SignerRegistry {
    accounts: DashMap<SignerId, SignerAccount>,
    spend: DashMap<SignerId, SyncMutex<DailySpend>>,
    send_locks: DashMap<(Address, SignerId), Arc<Mutex<()>>>,
}

impl SignerRegistry {
    #[must_use]
    pub fn new(accounts: Vec<SignerAccount>) -> Self {
        let registry = Self {
            accounts: DashMap::new(),
            spend: DashMap::new(),
            send_locks: DashMap::new(),
        };
        for account in accounts {
            registry.accounts.insert(account.id.clone(), account);
        }
        registry
    }

    pub fn account(&self, id: &SignerId) -> ChainResult<SignerAccount> {
        self.accounts
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| ChainError::UnknownSigner(id.to_string()))
    }

    /// First signer carrying the given role.
    pub fn signer_for_role(&self, role: SignerRole) -> ChainResult<SignerId> {
        self.accounts
            .iter()
            .find(|entry| entry.role == role)
            .map(|entry| entry.id.clone())
            .ok_or_else(|| ChainError::UnknownSigner(format!("no signer with role {role:?}")))
    }

    /// Check caps and reserve the amount against today's budget.
    pub fn authorize(&self, id: &SignerId, value: Amount) -> ChainResult<()> {
        let account = self.account(id)?;
        if value > account.per_tx_cap {
            return Err(ChainError::RejectedByPolicy(format!(
                "value {value} exceeds per-tx cap {} for {id}",
                account.per_tx_cap
            )));
        }

        let today = Utc::now().date_naive();
        let entry = self.spend.entry(id.clone()).or_insert_with(|| {
            SyncMutex::new(DailySpend {
                day: today,
                spent: Amount::ZERO,
            })
        });
        let mut spend = entry.lock();
        if spend.day != today {
            spend.day = today;
            spend.spent = Amount::ZERO;
        }
        let projected = spend.spent.saturating_add(value);
        if projected > account.daily_cap {
            return Err(ChainError::RejectedByPolicy(format!(
                "daily cap {} exhausted for {id}",
                account.daily_cap
            )));
        }
        spend.spent = projected;
        Ok(())
    }

    /// Serialization lock for `(contract, signer)`.
    ///
    /// Holding the lock across submit + receipt wait keeps nonces ordered.
    pub fn send_lock(&self, contract: Address, id: &SignerId) -> Arc<Mutex<()>> {
        self.send_locks
            .entry((contract, id.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// HTTP client for the external key service.
///
/// The service signs with per-call authorization and enforces its own per-tx
/// and daily caps; policy rejections come back as 403.
pub struct HttpKeyService {
    http: reqwest::Client,
    url: String,
}

impl HttpKeyService {
    /// Signer deadline: 60 s per call.
    const DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);

    pub fn new(url: impl Into<String>) -> ChainResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::DEADLINE)
            .build()
            .map_err(|e| ChainError::TransientRpc(format!("key service client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl KeyService for HttpKeyService {
    async fn submit(&self, tx: &SignerTx) -> ChainResult<B256> {
        let calldata: String = {
            let mut s = String::with_capacity(2 + tx.calldata.len() * 2);
            s.push_str("0x");
            for byte in &tx.calldata {
                s.push_str(&format!("{byte:02x}"));
            }
            s
        };
        let response = self
            .http
            .post(format!("{}/v1/transactions", self.url))
            .json(&serde_json::json!({
                "signerId": tx.signer.0,
                "contract": format!("{:#x}", tx.contract),
                "calldata": calldata,
                "value": tx.value.to_string(),
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::SendTimeout("key service deadline".to_string())
                } else {
                    ChainError::TransientRpc(e.to_string())
                }
            })?;

        match response.status().as_u16() {
            403 => {
                let reason = response.text().await.unwrap_or_default();
                Err(ChainError::RejectedByPolicy(reason))
            }
            status if status >= 500 => Err(ChainError::TransientRpc(format!(
                "key service status {status}"
            ))),
            _ => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ChainError::TransientRpc(e.to_string()))?;
                body.get("txHash")
                    .and_then(serde_json::Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        ChainError::TransientRpc("key service returned no txHash".to_string())
                    })
            }
        }
    }
}

/// No-op key service used in tests and dry-run environments.
pub struct NullKeyService;

#[async_trait]
impl KeyService for NullKeyService {
    async fn submit(&self, tx: &SignerTx) -> ChainResult<B256> {
        Err(ChainError::RejectedByPolicy(format!(
            "null key service refuses {} for {}",
            tx.contract, tx.signer
        )))
    }
}

/// Shared key-service handle used by the gateway.
pub type DynKeyService = Arc<dyn KeyService>;

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SignerRegistry {
        SignerRegistry::new(vec![SignerAccount {
            id: SignerId::new("hot-rebalancer"),
            role: SignerRole::Rebalancer,
            tier: SignerTier::Hot,
            per_tx_cap: Amount::from_units(100_000),
            daily_cap: Amount::from_units(250_000),
        }])
    }

    #[test]
    fn test_per_tx_cap() {
        let registry = registry();
        let id = SignerId::new("hot-rebalancer");
        assert!(registry.authorize(&id, Amount::from_units(100_000)).is_ok());
        assert!(matches!(
            registry.authorize(&id, Amount::from_units(100_001)),
            Err(ChainError::RejectedByPolicy(_))
        ));
    }

    #[test]
    fn test_daily_cap_accumulates() {
        let registry = registry();
        let id = SignerId::new("hot-rebalancer");
        assert!(registry.authorize(&id, Amount::from_units(100_000)).is_ok());
        assert!(registry.authorize(&id, Amount::from_units(100_000)).is_ok());
        // 200k spent; 100k more would breach the 250k daily cap.
        assert!(matches!(
            registry.authorize(&id, Amount::from_units(100_000)),
            Err(ChainError::RejectedByPolicy(_))
        ));
        assert!(registry.authorize(&id, Amount::from_units(50_000)).is_ok());
    }

    #[test]
    fn test_unknown_signer() {
        let registry = registry();
        assert!(matches!(
            registry.account(&SignerId::new("nobody")),
            Err(ChainError::UnknownSigner(_))
        ));
    }

    #[test]
    fn test_role_lookup() {
        let registry = registry();
        assert!(registry.signer_for_role(SignerRole::Rebalancer).is_ok());
        assert!(registry.signer_for_role(SignerRole::Admin).is_err());
    }
}
