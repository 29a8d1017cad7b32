//! Decoded chain events.
//!
//! The gateway delivers ABI-decoded log records; this module turns them into
//! the closed set of typed domain events the dispatcher routes on, and maps
//! every event kind to its ingestion priority.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::amount::{Amount, Bps};
use crate::error::CoreError;
use crate::redemption::RedemptionChannel;
use crate::tier::Tier;

/// Ingestion priority. Per-priority FIFO; no ordering across priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Unique identity of a log: `(tx_hash, log_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub tx_hash: B256,
    pub log_index: u64,
}

impl EventKey {
    #[must_use]
    pub fn new(tx_hash: B256, log_index: u64) -> Self {
        Self { tx_hash, log_index }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// An ABI-decoded log record as delivered by the chain gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub contract: Address,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_time: DateTime<Utc>,
    /// Stable event name per contract ABI.
    pub name: String,
    /// Decoded named arguments.
    pub params: Value,
}

impl LogRecord {
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tx_hash, self.log_index)
    }
}

/// Fully decoded domain event with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub key: EventKey,
    pub contract: Address,
    pub block_number: u64,
    pub block_time: DateTime<Utc>,
    pub body: EventBody,
}

impl ChainEvent {
    /// Decode a raw log record into a typed event.
    ///
    /// Unknown event names are reported as `CoreError::UnknownEvent` so the
    /// ingestor can skip them without blocking the checkpoint.
    pub fn decode(log: &LogRecord) -> Result<Self, CoreError> {
        let body = EventBody::decode(&log.name, &log.params)?;
        Ok(Self {
            key: log.key(),
            contract: log.contract,
            block_number: log.block_number,
            block_time: log.block_time,
            body,
        })
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.body.kind().priority()
    }
}

macro_rules! event_kinds {
    ($($name:ident),+ $(,)?) => {
        /// Closed set of recognized event names.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventKind {
            $($name,)+
        }

        impl EventKind {
            pub const ALL: &'static [EventKind] = &[$(EventKind::$name,)+];

            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventKind::$name => stringify!($name),)+
                }
            }
        }

        impl FromStr for EventKind {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($name) => Ok(EventKind::$name),)+
                    other => Err(CoreError::UnknownEvent(other.to_string())),
                }
            }
        }
    };
}

event_kinds! {
    DepositProcessed,
    SharesLocked,
    SharesUnlocked,
    SharesBurned,
    RedemptionFeeAdded,
    RedemptionFeeReduced,
    NavUpdated,
    EmergencyModeChanged,
    RedemptionRequested,
    RedemptionSettled,
    RedemptionApproved,
    RedemptionRejected,
    LowLiquidityAlert,
    CriticalLiquidityAlert,
    AssetAdded,
    AssetRemoved,
    AssetAllocationUpdated,
    AssetPurchased,
    AssetRedeemed,
    WaterfallLiquidation,
    BufferPoolRebalanced,
    ManagementFeeCollected,
    PerformanceFeeCollected,
    VoucherMinted,
    DailyLiabilityAdded,
    LiabilityRemoved,
    SettlementWaterfallTriggered,
    BaseRedemptionFeeUpdated,
    EmergencyPenaltyFeeUpdated,
    VoucherThresholdUpdated,
    PendingApprovalSharesAdded,
    PendingApprovalSharesRemoved,
    PendingApprovalSharesConverted,
    EmergencyQuotaRefreshed,
    EmergencyQuotaRestored,
    LockedMintAssetsReset,
    StandardQuotaRatioUpdated,
}

impl EventKind {
    /// Queue priority per event kind.
    ///
    /// CRITICAL: emergency / liquidity alerts. HIGH: redemption lifecycle,
    /// NAV, fee parameter changes. NORMAL: everything else.
    #[must_use]
    pub fn priority(&self) -> Priority {
        use EventKind::*;
        match self {
            EmergencyModeChanged | CriticalLiquidityAlert | LowLiquidityAlert => Priority::Critical,
            RedemptionRequested
            | VoucherMinted
            | SettlementWaterfallTriggered
            | NavUpdated
            | BaseRedemptionFeeUpdated
            | EmergencyPenaltyFeeUpdated => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EventBody {
    DepositProcessed {
        owner: Address,
        assets: Amount,
        shares: Amount,
    },
    SharesLocked {
        owner: Address,
        request_id: u64,
        shares: Amount,
    },
    SharesUnlocked {
        owner: Address,
        request_id: u64,
        shares: Amount,
    },
    SharesBurned {
        owner: Address,
        request_id: u64,
        shares: Amount,
    },
    RedemptionFeeAdded {
        request_id: u64,
        fee: Amount,
    },
    RedemptionFeeReduced {
        request_id: u64,
        fee: Amount,
    },
    NavUpdated {
        share_price: Amount,
        total_assets: Amount,
    },
    EmergencyModeChanged {
        enabled: bool,
    },
    RedemptionRequested {
        request_id: u64,
        owner: Address,
        receiver: Address,
        shares: Amount,
        gross_amount: Amount,
        locked_nav: Amount,
        estimated_fee: Amount,
        channel: RedemptionChannel,
        requires_approval: bool,
        settlement_time: DateTime<Utc>,
        window_id: Option<u64>,
    },
    RedemptionSettled {
        request_id: u64,
        net_amount: Amount,
        fee: Amount,
    },
    RedemptionApproved {
        request_id: u64,
        approver: Address,
    },
    RedemptionRejected {
        request_id: u64,
        reason: String,
    },
    LowLiquidityAlert {
        ratio: Bps,
        threshold: Bps,
        available: Amount,
    },
    CriticalLiquidityAlert {
        ratio: Bps,
        threshold: Bps,
        available: Amount,
    },
    AssetAdded {
        asset: Address,
        tier: Tier,
    },
    AssetRemoved {
        asset: Address,
    },
    AssetAllocationUpdated {
        asset: Address,
        allocation: Bps,
    },
    AssetPurchased {
        asset: Address,
        tier: Tier,
        usdt_amount: Amount,
        asset_amount: Amount,
    },
    AssetRedeemed {
        asset: Address,
        tier: Tier,
        asset_amount: Amount,
        usdt_amount: Amount,
    },
    WaterfallLiquidation {
        amount_needed: Amount,
        liquidated: Amount,
        max_tier: Tier,
    },
    BufferPoolRebalanced {
        from_tier: Tier,
        to_tier: Tier,
        amount: Amount,
    },
    ManagementFeeCollected {
        amount: Amount,
    },
    PerformanceFeeCollected {
        amount: Amount,
    },
    VoucherMinted {
        request_id: u64,
        token_id: u64,
        owner: Address,
    },
    DailyLiabilityAdded {
        amount: Amount,
    },
    LiabilityRemoved {
        amount: Amount,
    },
    SettlementWaterfallTriggered {
        amount_needed: Amount,
        max_tier: Tier,
    },
    BaseRedemptionFeeUpdated {
        fee: Bps,
    },
    EmergencyPenaltyFeeUpdated {
        fee: Bps,
    },
    VoucherThresholdUpdated {
        threshold_secs: u64,
    },
    PendingApprovalSharesAdded {
        owner: Address,
        shares: Amount,
    },
    PendingApprovalSharesRemoved {
        owner: Address,
        shares: Amount,
    },
    PendingApprovalSharesConverted {
        owner: Address,
        shares: Amount,
    },
    EmergencyQuotaRefreshed {
        quota: Amount,
    },
    EmergencyQuotaRestored {
        quota: Amount,
    },
    LockedMintAssetsReset {
        amount: Amount,
    },
    StandardQuotaRatioUpdated {
        ratio: Bps,
    },
}

impl EventBody {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        use EventBody as B;
        use EventKind as K;
        match self {
            B::DepositProcessed { .. } => K::DepositProcessed,
            B::SharesLocked { .. } => K::SharesLocked,
            B::SharesUnlocked { .. } => K::SharesUnlocked,
            B::SharesBurned { .. } => K::SharesBurned,
            B::RedemptionFeeAdded { .. } => K::RedemptionFeeAdded,
            B::RedemptionFeeReduced { .. } => K::RedemptionFeeReduced,
            B::NavUpdated { .. } => K::NavUpdated,
            B::EmergencyModeChanged { .. } => K::EmergencyModeChanged,
            B::RedemptionRequested { .. } => K::RedemptionRequested,
            B::RedemptionSettled { .. } => K::RedemptionSettled,
            B::RedemptionApproved { .. } => K::RedemptionApproved,
            B::RedemptionRejected { .. } => K::RedemptionRejected,
            B::LowLiquidityAlert { .. } => K::LowLiquidityAlert,
            B::CriticalLiquidityAlert { .. } => K::CriticalLiquidityAlert,
            B::AssetAdded { .. } => K::AssetAdded,
            B::AssetRemoved { .. } => K::AssetRemoved,
            B::AssetAllocationUpdated { .. } => K::AssetAllocationUpdated,
            B::AssetPurchased { .. } => K::AssetPurchased,
            B::AssetRedeemed { .. } => K::AssetRedeemed,
            B::WaterfallLiquidation { .. } => K::WaterfallLiquidation,
            B::BufferPoolRebalanced { .. } => K::BufferPoolRebalanced,
            B::ManagementFeeCollected { .. } => K::ManagementFeeCollected,
            B::PerformanceFeeCollected { .. } => K::PerformanceFeeCollected,
            B::VoucherMinted { .. } => K::VoucherMinted,
            B::DailyLiabilityAdded { .. } => K::DailyLiabilityAdded,
            B::LiabilityRemoved { .. } => K::LiabilityRemoved,
            B::SettlementWaterfallTriggered { .. } => K::SettlementWaterfallTriggered,
            B::BaseRedemptionFeeUpdated { .. } => K::BaseRedemptionFeeUpdated,
            B::EmergencyPenaltyFeeUpdated { .. } => K::EmergencyPenaltyFeeUpdated,
            B::VoucherThresholdUpdated { .. } => K::VoucherThresholdUpdated,
            B::PendingApprovalSharesAdded { .. } => K::PendingApprovalSharesAdded,
            B::PendingApprovalSharesRemoved { .. } => K::PendingApprovalSharesRemoved,
            B::PendingApprovalSharesConverted { .. } => K::PendingApprovalSharesConverted,
            B::EmergencyQuotaRefreshed { .. } => K::EmergencyQuotaRefreshed,
            B::EmergencyQuotaRestored { .. } => K::EmergencyQuotaRestored,
            B::LockedMintAssetsReset { .. } => K::LockedMintAssetsReset,
            B::StandardQuotaRatioUpdated { .. } => K::StandardQuotaRatioUpdated,
        }
    }

    /// Decode a named event from its decoded ABI arguments.
    pub fn decode(name: &str, params: &Value) -> Result<Self, CoreError> {
        let kind: EventKind = name.parse()?;
        let p = Params(params);
        use EventKind as K;
        let body = match kind {
            K::DepositProcessed => EventBody::DepositProcessed {
                owner: p.address("owner")?,
                assets: p.amount("assets")?,
                shares: p.amount("shares")?,
            },
            K::SharesLocked => EventBody::SharesLocked {
                owner: p.address("owner")?,
                request_id: p.u64("requestId")?,
                shares: p.amount("shares")?,
            },
            K::SharesUnlocked => EventBody::SharesUnlocked {
                owner: p.address("owner")?,
                request_id: p.u64("requestId")?,
                shares: p.amount("shares")?,
            },
            K::SharesBurned => EventBody::SharesBurned {
                owner: p.address("owner")?,
                request_id: p.u64("requestId")?,
                shares: p.amount("shares")?,
            },
            K::RedemptionFeeAdded => EventBody::RedemptionFeeAdded {
                request_id: p.u64("requestId")?,
                fee: p.amount("fee")?,
            },
            K::RedemptionFeeReduced => EventBody::RedemptionFeeReduced {
                request_id: p.u64("requestId")?,
                fee: p.amount("fee")?,
            },
            K::NavUpdated => EventBody::NavUpdated {
                share_price: p.amount("sharePrice")?,
                total_assets: p.amount("totalAssets")?,
            },
            K::EmergencyModeChanged => EventBody::EmergencyModeChanged {
                enabled: p.bool("enabled")?,
            },
            K::RedemptionRequested => EventBody::RedemptionRequested {
                request_id: p.u64("requestId")?,
                owner: p.address("owner")?,
                receiver: p.address("receiver")?,
                shares: p.amount("shares")?,
                gross_amount: p.amount("grossAmount")?,
                locked_nav: p.amount("lockedNav")?,
                estimated_fee: p.amount("estimatedFee")?,
                channel: p.channel("channel")?,
                requires_approval: p.bool("requiresApproval")?,
                settlement_time: p.timestamp("settlementTime")?,
                // Zero means "no window" in the contract encoding.
                window_id: p.opt_u64("windowId").filter(|id| *id != 0),
            },
            K::RedemptionSettled => EventBody::RedemptionSettled {
                request_id: p.u64("requestId")?,
                net_amount: p.amount("netAmount")?,
                fee: p.amount("fee")?,
            },
            K::RedemptionApproved => EventBody::RedemptionApproved {
                request_id: p.u64("requestId")?,
                approver: p.address("approver")?,
            },
            K::RedemptionRejected => EventBody::RedemptionRejected {
                request_id: p.u64("requestId")?,
                reason: p.string("reason")?,
            },
            K::LowLiquidityAlert => EventBody::LowLiquidityAlert {
                ratio: p.bps("ratio")?,
                threshold: p.bps("threshold")?,
                available: p.amount("available")?,
            },
            K::CriticalLiquidityAlert => EventBody::CriticalLiquidityAlert {
                ratio: p.bps("ratio")?,
                threshold: p.bps("threshold")?,
                available: p.amount("available")?,
            },
            K::AssetAdded => EventBody::AssetAdded {
                asset: p.address("asset")?,
                tier: p.tier("tier")?,
            },
            K::AssetRemoved => EventBody::AssetRemoved {
                asset: p.address("asset")?,
            },
            K::AssetAllocationUpdated => EventBody::AssetAllocationUpdated {
                asset: p.address("asset")?,
                allocation: p.bps("allocation")?,
            },
            K::AssetPurchased => EventBody::AssetPurchased {
                asset: p.address("asset")?,
                tier: p.tier("tier")?,
                usdt_amount: p.amount("usdtAmount")?,
                asset_amount: p.amount("assetAmount")?,
            },
            K::AssetRedeemed => EventBody::AssetRedeemed {
                asset: p.address("asset")?,
                tier: p.tier("tier")?,
                asset_amount: p.amount("assetAmount")?,
                usdt_amount: p.amount("usdtAmount")?,
            },
            K::WaterfallLiquidation => EventBody::WaterfallLiquidation {
                amount_needed: p.amount("amountNeeded")?,
                liquidated: p.amount("liquidated")?,
                max_tier: p.tier("maxTier")?,
            },
            K::BufferPoolRebalanced => EventBody::BufferPoolRebalanced {
                from_tier: p.tier("fromTier")?,
                to_tier: p.tier("toTier")?,
                amount: p.amount("amount")?,
            },
            K::ManagementFeeCollected => EventBody::ManagementFeeCollected {
                amount: p.amount("amount")?,
            },
            K::PerformanceFeeCollected => EventBody::PerformanceFeeCollected {
                amount: p.amount("amount")?,
            },
            K::VoucherMinted => EventBody::VoucherMinted {
                request_id: p.u64("requestId")?,
                token_id: p.u64("tokenId")?,
                owner: p.address("owner")?,
            },
            K::DailyLiabilityAdded => EventBody::DailyLiabilityAdded {
                amount: p.amount("amount")?,
            },
            K::LiabilityRemoved => EventBody::LiabilityRemoved {
                amount: p.amount("amount")?,
            },
            K::SettlementWaterfallTriggered => EventBody::SettlementWaterfallTriggered {
                amount_needed: p.amount("amountNeeded")?,
                max_tier: p.tier("maxTier")?,
            },
            K::BaseRedemptionFeeUpdated => EventBody::BaseRedemptionFeeUpdated {
                fee: p.bps("fee")?,
            },
            K::EmergencyPenaltyFeeUpdated => EventBody::EmergencyPenaltyFeeUpdated {
                fee: p.bps("fee")?,
            },
            K::VoucherThresholdUpdated => EventBody::VoucherThresholdUpdated {
                threshold_secs: p.u64("threshold")?,
            },
            K::PendingApprovalSharesAdded => EventBody::PendingApprovalSharesAdded {
                owner: p.address("owner")?,
                shares: p.amount("shares")?,
            },
            K::PendingApprovalSharesRemoved => EventBody::PendingApprovalSharesRemoved {
                owner: p.address("owner")?,
                shares: p.amount("shares")?,
            },
            K::PendingApprovalSharesConverted => EventBody::PendingApprovalSharesConverted {
                owner: p.address("owner")?,
                shares: p.amount("shares")?,
            },
            K::EmergencyQuotaRefreshed => EventBody::EmergencyQuotaRefreshed {
                quota: p.amount("quota")?,
            },
            K::EmergencyQuotaRestored => EventBody::EmergencyQuotaRestored {
                quota: p.amount("quota")?,
            },
            K::LockedMintAssetsReset => EventBody::LockedMintAssetsReset {
                amount: p.amount("amount")?,
            },
            K::StandardQuotaRatioUpdated => EventBody::StandardQuotaRatioUpdated {
                ratio: p.bps("ratio")?,
            },
        };
        Ok(body)
    }
}

/// Typed accessors over decoded ABI arguments.
///
/// Numeric arguments arrive as decimal strings (uint256) or JSON numbers
/// (small uints); both forms are accepted.
struct Params<'a>(&'a Value);

impl Params<'_> {
    fn field(&self, name: &str) -> Result<&Value, CoreError> {
        self.0
            .get(name)
            .ok_or_else(|| CoreError::Decode(format!("missing field {name}")))
    }

    fn amount(&self, name: &str) -> Result<Amount, CoreError> {
        let v = self.field(name)?;
        match v {
            Value::String(s) => s.parse(),
            Value::Number(n) => n
                .as_u64()
                .map(|u| Amount::from_base(u as u128))
                .ok_or_else(|| CoreError::Decode(format!("field {name} is not a uint"))),
            _ => Err(CoreError::Decode(format!("field {name} is not an amount"))),
        }
        .map_err(|e| CoreError::Decode(format!("field {name}: {e}")))
    }

    fn u64(&self, name: &str) -> Result<u64, CoreError> {
        let v = self.field(name)?;
        match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| CoreError::Decode(format!("field {name} is not a u64")))
    }

    fn opt_u64(&self, name: &str) -> Option<u64> {
        self.u64(name).ok()
    }

    fn bool(&self, name: &str) -> Result<bool, CoreError> {
        self.field(name)?
            .as_bool()
            .ok_or_else(|| CoreError::Decode(format!("field {name} is not a bool")))
    }

    fn string(&self, name: &str) -> Result<String, CoreError> {
        self.field(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CoreError::Decode(format!("field {name} is not a string")))
    }

    fn address(&self, name: &str) -> Result<Address, CoreError> {
        let s = self.string(name)?;
        s.parse()
            .map_err(|_| CoreError::Decode(format!("field {name} is not an address: {s}")))
    }

    fn bps(&self, name: &str) -> Result<Bps, CoreError> {
        Ok(Bps(self.u64(name)? as i64))
    }

    fn tier(&self, name: &str) -> Result<Tier, CoreError> {
        match self.u64(name)? {
            1 => Ok(Tier::L1),
            2 => Ok(Tier::L2),
            3 => Ok(Tier::L3),
            other => Err(CoreError::Decode(format!("field {name}: bad tier {other}"))),
        }
    }

    fn channel(&self, name: &str) -> Result<RedemptionChannel, CoreError> {
        match self.u64(name)? {
            0 => Ok(RedemptionChannel::Standard),
            1 => Ok(RedemptionChannel::Emergency),
            2 => Ok(RedemptionChannel::Scheduled),
            other => Err(CoreError::Decode(format!(
                "field {name}: bad channel {other}"
            ))),
        }
    }

    fn timestamp(&self, name: &str) -> Result<DateTime<Utc>, CoreError> {
        let secs = self.u64(name)?;
        Utc.timestamp_opt(secs as i64, 0)
            .single()
            .ok_or_else(|| CoreError::Decode(format!("field {name}: bad timestamp {secs}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(name: &str, params: Value) -> LogRecord {
        LogRecord {
            contract: Address::ZERO,
            tx_hash: B256::with_last_byte(1),
            log_index: 0,
            block_number: 100,
            block_hash: B256::with_last_byte(2),
            block_time: Utc::now(),
            name: name.to_string(),
            params,
        }
    }

    #[test]
    fn test_decode_redemption_requested() {
        let record = log(
            "RedemptionRequested",
            json!({
                "requestId": 42,
                "owner": "0x00000000000000000000000000000000000000aa",
                "receiver": "0x00000000000000000000000000000000000000bb",
                "shares": "10000000000000000000000",
                "grossAmount": "10500000000000000000000",
                "lockedNav": "1050000000000000000",
                "estimatedFee": "50000000000000000000",
                "channel": 0,
                "requiresApproval": false,
                "settlementTime": 1_700_000_000u64,
            }),
        );
        let event = ChainEvent::decode(&record).unwrap();
        assert_eq!(event.kind(), EventKind::RedemptionRequested);
        assert_eq!(event.priority(), Priority::High);
        match event.body {
            EventBody::RedemptionRequested {
                request_id,
                shares,
                requires_approval,
                channel,
                window_id,
                ..
            } => {
                assert_eq!(request_id, 42);
                assert_eq!(shares, Amount::from_units(10_000));
                assert!(!requires_approval);
                assert_eq!(channel, RedemptionChannel::Standard);
                assert_eq!(window_id, None);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_event() {
        let record = log("TotallyUnknown", json!({}));
        let err = ChainEvent::decode(&record).unwrap_err();
        assert!(matches!(err, CoreError::UnknownEvent(_)));
    }

    #[test]
    fn test_decode_missing_field() {
        let record = log("ManagementFeeCollected", json!({}));
        let err = ChainEvent::decode(&record).unwrap_err();
        assert!(matches!(err, CoreError::Decode(_)));
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(
            EventKind::EmergencyModeChanged.priority(),
            Priority::Critical
        );
        assert_eq!(
            EventKind::CriticalLiquidityAlert.priority(),
            Priority::Critical
        );
        assert_eq!(EventKind::LowLiquidityAlert.priority(), Priority::Critical);
        assert_eq!(EventKind::RedemptionRequested.priority(), Priority::High);
        assert_eq!(EventKind::NavUpdated.priority(), Priority::High);
        assert_eq!(
            EventKind::BaseRedemptionFeeUpdated.priority(),
            Priority::High
        );
        assert_eq!(
            EventKind::EmergencyPenaltyFeeUpdated.priority(),
            Priority::High
        );
        // Threshold updates are parameter changes, not fee changes.
        assert_eq!(
            EventKind::VoucherThresholdUpdated.priority(),
            Priority::Normal
        );
        assert_eq!(EventKind::DepositProcessed.priority(), Priority::Normal);
        assert_eq!(EventKind::RedemptionSettled.priority(), Priority::Normal);
    }

    #[test]
    fn test_event_key_display() {
        let key = EventKey::new(B256::with_last_byte(0xab), 7);
        assert!(key.to_string().ends_with("ab:7"));
    }
}
