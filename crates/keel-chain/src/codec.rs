//! Log decoding for the closed vault event set.
//!
//! Each recognized event is declared once with its solidity signature layout;
//! `topic0` is derived from the canonical signature with `keccak256`. Decoded
//! arguments are emitted as named JSON values (uints as decimal strings) that
//! `keel_core::event` turns into typed events.

use alloy::primitives::{keccak256, Address, B256, U256};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

use keel_core::{EventKind, LogRecord};

use crate::error::{ChainError, ChainResult};

/// A raw log as returned by `eth_getLogs` / the log subscription.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Solidity parameter layout of one event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamType {
    Uint256,
    Uint8,
    Address,
    Bool,
    Str,
}

impl ParamType {
    fn sol_name(self) -> &'static str {
        match self {
            ParamType::Uint256 => "uint256",
            ParamType::Uint8 => "uint8",
            ParamType::Address => "address",
            ParamType::Bool => "bool",
            ParamType::Str => "string",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EventField {
    name: &'static str,
    ty: ParamType,
    indexed: bool,
}

const fn field(name: &'static str, ty: ParamType, indexed: bool) -> EventField {
    EventField { name, ty, indexed }
}

struct EventSpec {
    kind: EventKind,
    fields: &'static [EventField],
}

impl EventSpec {
    fn signature(&self) -> String {
        let args: Vec<&str> = self.fields.iter().map(|f| f.ty.sol_name()).collect();
        format!("{}({})", self.kind.as_str(), args.join(","))
    }
}

use ParamType::{Address as Addr, Bool, Str, Uint256 as U, Uint8 as U8};

static EVENT_SPECS: &[EventSpec] = &[
    EventSpec {
        kind: EventKind::DepositProcessed,
        fields: &[
            field("owner", Addr, true),
            field("assets", U, false),
            field("shares", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::SharesLocked,
        fields: &[
            field("owner", Addr, true),
            field("requestId", U, true),
            field("shares", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::SharesUnlocked,
        fields: &[
            field("owner", Addr, true),
            field("requestId", U, true),
            field("shares", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::SharesBurned,
        fields: &[
            field("owner", Addr, true),
            field("requestId", U, true),
            field("shares", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::RedemptionFeeAdded,
        fields: &[field("requestId", U, true), field("fee", U, false)],
    },
    EventSpec {
        kind: EventKind::RedemptionFeeReduced,
        fields: &[field("requestId", U, true), field("fee", U, false)],
    },
    EventSpec {
        kind: EventKind::NavUpdated,
        fields: &[field("sharePrice", U, false), field("totalAssets", U, false)],
    },
    EventSpec {
        kind: EventKind::EmergencyModeChanged,
        fields: &[field("enabled", Bool, false)],
    },
    EventSpec {
        kind: EventKind::RedemptionRequested,
        fields: &[
            field("requestId", U, true),
            field("owner", Addr, true),
            field("receiver", Addr, false),
            field("shares", U, false),
            field("grossAmount", U, false),
            field("lockedNav", U, false),
            field("estimatedFee", U, false),
            field("channel", U8, false),
            field("requiresApproval", Bool, false),
            field("settlementTime", U, false),
            field("windowId", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::RedemptionSettled,
        fields: &[
            field("requestId", U, true),
            field("netAmount", U, false),
            field("fee", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::RedemptionApproved,
        fields: &[field("requestId", U, true), field("approver", Addr, true)],
    },
    EventSpec {
        kind: EventKind::RedemptionRejected,
        fields: &[field("requestId", U, true), field("reason", Str, false)],
    },
    EventSpec {
        kind: EventKind::LowLiquidityAlert,
        fields: &[
            field("ratio", U, false),
            field("threshold", U, false),
            field("available", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::CriticalLiquidityAlert,
        fields: &[
            field("ratio", U, false),
            field("threshold", U, false),
            field("available", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::AssetAdded,
        fields: &[field("asset", Addr, true), field("tier", U8, false)],
    },
    EventSpec {
        kind: EventKind::AssetRemoved,
        fields: &[field("asset", Addr, true)],
    },
    EventSpec {
        kind: EventKind::AssetAllocationUpdated,
        fields: &[field("asset", Addr, true), field("allocation", U, false)],
    },
    EventSpec {
        kind: EventKind::AssetPurchased,
        fields: &[
            field("asset", Addr, true),
            field("tier", U8, false),
            field("usdtAmount", U, false),
            field("assetAmount", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::AssetRedeemed,
        fields: &[
            field("asset", Addr, true),
            field("tier", U8, false),
            field("assetAmount", U, false),
            field("usdtAmount", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::WaterfallLiquidation,
        fields: &[
            field("amountNeeded", U, false),
            field("liquidated", U, false),
            field("maxTier", U8, false),
        ],
    },
    EventSpec {
        kind: EventKind::BufferPoolRebalanced,
        fields: &[
            field("fromTier", U8, false),
            field("toTier", U8, false),
            field("amount", U, false),
        ],
    },
    EventSpec {
        kind: EventKind::ManagementFeeCollected,
        fields: &[field("amount", U, false)],
    },
    EventSpec {
        kind: EventKind::PerformanceFeeCollected,
        fields: &[field("amount", U, false)],
    },
    EventSpec {
        kind: EventKind::VoucherMinted,
        fields: &[
            field("requestId", U, true),
            field("tokenId", U, true),
            field("owner", Addr, true),
        ],
    },
    EventSpec {
        kind: EventKind::DailyLiabilityAdded,
        fields: &[field("amount", U, false)],
    },
    EventSpec {
        kind: EventKind::LiabilityRemoved,
        fields: &[field("amount", U, false)],
    },
    EventSpec {
        kind: EventKind::SettlementWaterfallTriggered,
        fields: &[field("amountNeeded", U, false), field("maxTier", U8, false)],
    },
    EventSpec {
        kind: EventKind::BaseRedemptionFeeUpdated,
        fields: &[field("fee", U, false)],
    },
    EventSpec {
        kind: EventKind::EmergencyPenaltyFeeUpdated,
        fields: &[field("fee", U, false)],
    },
    EventSpec {
        kind: EventKind::VoucherThresholdUpdated,
        fields: &[field("threshold", U, false)],
    },
    EventSpec {
        kind: EventKind::PendingApprovalSharesAdded,
        fields: &[field("owner", Addr, true), field("shares", U, false)],
    },
    EventSpec {
        kind: EventKind::PendingApprovalSharesRemoved,
        fields: &[field("owner", Addr, true), field("shares", U, false)],
    },
    EventSpec {
        kind: EventKind::PendingApprovalSharesConverted,
        fields: &[field("owner", Addr, true), field("shares", U, false)],
    },
    EventSpec {
        kind: EventKind::EmergencyQuotaRefreshed,
        fields: &[field("quota", U, false)],
    },
    EventSpec {
        kind: EventKind::EmergencyQuotaRestored,
        fields: &[field("quota", U, false)],
    },
    EventSpec {
        kind: EventKind::LockedMintAssetsReset,
        fields: &[field("amount", U, false)],
    },
    EventSpec {
        kind: EventKind::StandardQuotaRatioUpdated,
        fields: &[field("ratio", U, false)],
    },
];

/// Decoder for the known event set.
pub struct EventCodec {
    by_topic: HashMap<B256, &'static EventSpec>,
}

impl EventCodec {
    #[must_use]
    pub fn new() -> Self {
        let by_topic = EVENT_SPECS
            .iter()
            .map(|spec| (keccak256(spec.signature().as_bytes()), spec))
            .collect();
        Self { by_topic }
    }

    /// topic0 values of all recognized events, for subscription filters.
    #[must_use]
    pub fn topics(&self) -> Vec<B256> {
        self.by_topic.keys().copied().collect()
    }

    /// topic0 of a specific event kind, for tests and filters.
    #[must_use]
    pub fn topic_of(&self, kind: EventKind) -> Option<B256> {
        self.by_topic
            .iter()
            .find(|(_, spec)| spec.kind == kind)
            .map(|(topic, _)| *topic)
    }

    /// Decode a raw log into a named record.
    ///
    /// `Err(ChainError::Decode)` covers both unknown topic0 and malformed
    /// payloads; callers log at warn and skip without blocking the checkpoint.
    pub fn decode(&self, raw: &RawLog, block_time: DateTime<Utc>) -> ChainResult<LogRecord> {
        let topic0 = raw
            .topics
            .first()
            .ok_or_else(|| ChainError::Decode("log has no topics".to_string()))?;
        let spec = self
            .by_topic
            .get(topic0)
            .ok_or_else(|| ChainError::Decode(format!("unknown topic0 {topic0}")))?;

        let mut params = Map::new();
        let mut topic_cursor = 1usize;
        let mut word_cursor = 0usize;

        for field in spec.fields {
            let value = if field.indexed {
                let topic = raw.topics.get(topic_cursor).ok_or_else(|| {
                    ChainError::Decode(format!(
                        "{}: missing topic for {}",
                        spec.kind, field.name
                    ))
                })?;
                topic_cursor += 1;
                decode_word(field.ty, topic.as_slice(), &raw.data, spec.kind, field.name)?
            } else {
                let word = data_word(&raw.data, word_cursor).ok_or_else(|| {
                    ChainError::Decode(format!("{}: truncated data at {}", spec.kind, field.name))
                })?;
                word_cursor += 1;
                decode_word(field.ty, word, &raw.data, spec.kind, field.name)?
            };
            params.insert(field.name.to_string(), value);
        }

        Ok(LogRecord {
            contract: raw.address,
            tx_hash: raw.tx_hash,
            log_index: raw.log_index,
            block_number: raw.block_number,
            block_hash: raw.block_hash,
            block_time,
            name: spec.kind.as_str().to_string(),
            params: Value::Object(params),
        })
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn data_word(data: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * 32;
    data.get(start..start + 32)
}

fn decode_word(
    ty: ParamType,
    word: &[u8],
    data: &[u8],
    kind: EventKind,
    name: &str,
) -> ChainResult<Value> {
    let err = |msg: &str| ChainError::Decode(format!("{kind}.{name}: {msg}"));
    match ty {
        ParamType::Uint256 | ParamType::Uint8 => {
            let v = U256::from_be_slice(word);
            Ok(Value::String(v.to_string()))
        }
        ParamType::Address => {
            let addr = Address::from_slice(&word[12..32]);
            Ok(Value::String(format!("{addr:#x}")))
        }
        ParamType::Bool => Ok(Value::Bool(word[31] != 0)),
        ParamType::Str => {
            // Dynamic string: the word holds the byte offset of the tail.
            let offset = U256::from_be_slice(word);
            let offset: usize = offset.try_into().map_err(|_| err("offset overflow"))?;
            let len_word = data
                .get(offset..offset + 32)
                .ok_or_else(|| err("string length out of bounds"))?;
            let len: usize = U256::from_be_slice(len_word)
                .try_into()
                .map_err(|_| err("length overflow"))?;
            let bytes = data
                .get(offset + 32..offset + 32 + len)
                .ok_or_else(|| err("string body out of bounds"))?;
            String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|_| err("invalid utf-8"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ChainEvent, EventBody};

    fn word_u64(v: u64) -> [u8; 32] {
        let mut w = [0u8; 32];
        w[24..].copy_from_slice(&v.to_be_bytes());
        w
    }

    fn word_u256(v: U256) -> [u8; 32] {
        v.to_be_bytes()
    }

    fn topic_u64(v: u64) -> B256 {
        B256::from(word_u64(v))
    }

    #[test]
    fn test_decode_management_fee_collected() {
        let codec = EventCodec::new();
        let topic0 = codec.topic_of(EventKind::ManagementFeeCollected).unwrap();

        let amount = U256::from(10u64).pow(U256::from(21u64)); // 1,000 units
        let raw = RawLog {
            address: Address::ZERO,
            topics: vec![topic0],
            data: word_u256(amount).to_vec(),
            block_number: 10,
            block_hash: B256::with_last_byte(9),
            tx_hash: B256::with_last_byte(1),
            log_index: 3,
        };

        let record = codec.decode(&raw, Utc::now()).unwrap();
        assert_eq!(record.name, "ManagementFeeCollected");
        assert_eq!(
            record.params["amount"],
            Value::String("1000000000000000000000".to_string())
        );
        // Round-trips through the typed layer.
        let event = ChainEvent::decode(&record).unwrap();
        assert_eq!(event.kind(), EventKind::ManagementFeeCollected);
    }

    #[test]
    fn test_decode_indexed_and_data_fields() {
        let codec = EventCodec::new();
        let topic0 = codec.topic_of(EventKind::SharesLocked).unwrap();
        let owner = Address::with_last_byte(0xaa);

        let mut owner_topic = [0u8; 32];
        owner_topic[12..].copy_from_slice(owner.as_slice());

        let raw = RawLog {
            address: Address::ZERO,
            topics: vec![topic0, B256::from(owner_topic), topic_u64(42)],
            data: word_u256(U256::from(5u64)).to_vec(),
            block_number: 10,
            block_hash: B256::with_last_byte(9),
            tx_hash: B256::with_last_byte(1),
            log_index: 0,
        };

        let record = codec.decode(&raw, Utc::now()).unwrap();
        assert_eq!(record.params["owner"], Value::String(format!("{owner:#x}")));
        assert_eq!(record.params["requestId"], Value::String("42".to_string()));
        assert_eq!(record.params["shares"], Value::String("5".to_string()));
    }

    #[test]
    fn test_decode_dynamic_string() {
        let codec = EventCodec::new();
        let topic0 = codec.topic_of(EventKind::RedemptionRejected).unwrap();

        // data: [offset=0x20][len=13]["over exposure"]
        let mut data = Vec::new();
        data.extend_from_slice(&word_u64(0x20));
        data.extend_from_slice(&word_u64(13));
        let mut body = b"over exposure".to_vec();
        body.resize(32, 0);
        data.extend_from_slice(&body);

        let raw = RawLog {
            address: Address::ZERO,
            topics: vec![topic0, topic_u64(7)],
            data,
            block_number: 10,
            block_hash: B256::with_last_byte(9),
            tx_hash: B256::with_last_byte(2),
            log_index: 1,
        };

        let record = codec.decode(&raw, Utc::now()).unwrap();
        let event = ChainEvent::decode(&record).unwrap();
        match event.body {
            EventBody::RedemptionRejected { request_id, reason } => {
                assert_eq!(request_id, 7);
                assert_eq!(reason, "over exposure");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_topic_is_decode_error() {
        let codec = EventCodec::new();
        let raw = RawLog {
            address: Address::ZERO,
            topics: vec![B256::with_last_byte(0xff)],
            data: Vec::new(),
            block_number: 1,
            block_hash: B256::ZERO,
            tx_hash: B256::ZERO,
            log_index: 0,
        };
        assert!(matches!(
            codec.decode(&raw, Utc::now()),
            Err(ChainError::Decode(_))
        ));
    }

    #[test]
    fn test_all_specs_have_unique_topics() {
        let codec = EventCodec::new();
        assert_eq!(codec.topics().len(), EVENT_SPECS.len());
    }
}
