//! Node configuration.
//!
//! Loaded from a TOML file (`KEEL_CONFIG`, default `config/keel.toml`).
//! The recognized option set is closed; unknown keys fail the load.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;

use keel_chain::{SignerAccount, SignerId, SignerRole, SignerTier};
use keel_core::{Amount, ApproverRole, Bps, TierConfig, TierTargets};

use crate::error::{NodeError, NodeResult};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub chain: ChainSection,
    pub store: StoreSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub tiers: TiersSection,
    #[serde(default)]
    pub rebalance: RebalanceSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub approvers: Vec<ApproverEntry>,
    #[serde(default)]
    pub signers: Vec<SignerEntry>,
    #[serde(default)]
    pub tasks: TasksSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSection {
    pub rpc_url: String,
    pub ws_url: String,
    /// External key service endpoint.
    pub key_service_url: String,
    /// Vault contract commits land on.
    pub vault: String,
    /// Watched contracts.
    pub contracts: Vec<String>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default)]
    pub genesis_block: u64,
}

fn default_confirmations() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    pub database_url: String,
    pub redis_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngestSection {
    pub poll_interval_secs: u64,
    pub batch_size: u64,
    pub dedup_ttl_secs: u64,
    pub lease_ttl_secs: u64,
    pub lease_renew_secs: u64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            batch_size: 1000,
            dedup_ttl_secs: 7 * 24 * 3600,
            lease_ttl_secs: 30,
            lease_renew_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TierSection {
    pub target_bps: i64,
    pub low_bps: i64,
    pub high_bps: i64,
    pub threshold_bps: i64,
}

impl TierSection {
    fn to_config(self) -> TierConfig {
        TierConfig {
            target: Bps(self.target_bps),
            low: Bps(self.low_bps),
            high: Bps(self.high_bps),
            rebalance_threshold: Bps(self.threshold_bps),
        }
    }
}

impl Default for TierSection {
    fn default() -> Self {
        Self {
            target_bps: 0,
            low_bps: 0,
            high_bps: 0,
            threshold_bps: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TiersSection {
    pub l1: Option<TierSection>,
    pub l2: Option<TierSection>,
    pub l3: Option<TierSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RebalanceSection {
    pub min_rebalance_amount_units: u64,
    pub approval_threshold_units: u64,
    pub max_slippage_bps: i64,
}

impl Default for RebalanceSection {
    fn default() -> Self {
        Self {
            min_rebalance_amount_units: 10_000,
            approval_threshold_units: 50_000,
            max_slippage_bps: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskSection {
    pub monte_carlo_trials: u32,
    pub history_window_days: u32,
    pub watch_interval_secs: u64,
    /// L1 floor as a fraction; the ELEVATED response uses it.
    pub l1_low: f64,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            monte_carlo_trials: 1_000,
            history_window_days: 90,
            watch_interval_secs: 300,
            l1_low: 0.08,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproverEntry {
    pub address: String,
    pub role: ApproverRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignerEntry {
    pub id: String,
    pub role: SignerRole,
    pub tier: SignerTier,
    pub per_tx_cap_units: u64,
    pub daily_cap_units: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TasksSection {
    pub workers: usize,
    pub overdue_days_back: u32,
    pub large_flow_threshold_units: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            workers: 4,
            overdue_days_back: 30,
            large_flow_threshold_units: 100_000,
        }
    }
}

impl NodeConfig {
    /// Load from `KEEL_CONFIG` or the default path.
    pub fn load() -> NodeResult<Self> {
        let path =
            std::env::var("KEEL_CONFIG").unwrap_or_else(|_| "config/keel.toml".to_string());
        if !Path::new(&path).exists() {
            return Err(NodeError::Config(format!("config file not found: {path}")));
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &str) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read {path}: {e}")))?;
        toml::from_str(&content).map_err(|e| NodeError::Config(format!("failed to parse: {e}")))
    }

    pub fn vault(&self) -> NodeResult<Address> {
        self.chain
            .vault
            .parse()
            .map_err(|_| NodeError::Config(format!("bad vault address {}", self.chain.vault)))
    }

    pub fn contracts(&self) -> NodeResult<Vec<Address>> {
        self.chain
            .contracts
            .iter()
            .map(|c| {
                c.parse()
                    .map_err(|_| NodeError::Config(format!("bad contract address {c}")))
            })
            .collect()
    }

    #[must_use]
    pub fn tier_targets(&self) -> TierTargets {
        let mut targets = TierTargets::default();
        if let Some(l1) = self.tiers.l1 {
            targets.l1 = l1.to_config();
        }
        if let Some(l2) = self.tiers.l2 {
            targets.l2 = l2.to_config();
        }
        if let Some(l3) = self.tiers.l3 {
            targets.l3 = l3.to_config();
        }
        targets
    }

    pub fn signer_accounts(&self) -> Vec<SignerAccount> {
        self.signers
            .iter()
            .map(|s| SignerAccount {
                id: SignerId::new(&s.id),
                role: s.role,
                tier: s.tier,
                per_tx_cap: Amount::from_units(s.per_tx_cap_units),
                daily_cap: Amount::from_units(s.daily_cap_units),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [chain]
        rpc_url = "http://localhost:8545"
        ws_url = "ws://localhost:8546"
        key_service_url = "http://localhost:9100"
        vault = "0x00000000000000000000000000000000000000f0"
        contracts = ["0x00000000000000000000000000000000000000f0"]

        [store]
        database_url = "postgres://keel@localhost/keel"
        redis_url = "redis://localhost"

        [tiers.l1]
        target_bps = 1000
        low_bps = 800
        high_bps = 1500
        threshold_bps = 200

        [[signers]]
        id = "hot-rebalancer"
        role = "REBALANCER"
        tier = "hot"
        per_tx_cap_units = 100000
        daily_cap_units = 250000

        [[approvers]]
        address = "0x00000000000000000000000000000000000000a1"
        role = "MANAGER"
    "#;

    #[test]
    fn test_parse_sample() {
        let config: NodeConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.chain.confirmations, 15);
        assert_eq!(config.ingest.poll_interval_secs, 3);
        assert_eq!(config.tier_targets().l1.low, Bps(800));
        assert_eq!(config.signer_accounts().len(), 1);
        assert!(config.vault().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let bad = format!("{SAMPLE}\nnot_an_option = true\n");
        assert!(toml::from_str::<NodeConfig>(&bad).is_err());
    }
}
