//! Chain gateway for the keel control plane.
//!
//! Provides the typed read/write facade over RPC/WS:
//! - `ChainGateway`: the trait every engine talks to the chain through
//! - `LiveGateway`: JSON-RPC + WS implementation with per-signer
//!   serialization, confirmation waits, and a tier-wide circuit breaker
//! - `EventCodec`: decoding of the closed vault event set
//! - `KeyService`: the external signing boundary (keys never live here)
//! - `MockGateway`: scriptable in-memory gateway for tests

pub mod abi;
pub mod breaker;
pub mod codec;
pub mod error;
pub mod gateway;
pub mod live;
pub mod rpc;
pub mod signer;
pub mod testing;
pub mod ws;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use codec::{EventCodec, RawLog};
pub use error::{ChainError, ChainResult};
pub use gateway::{
    BlockRef, ChainGateway, SendOutcome, SendRequest, Simulation, TxReceipt,
};
pub use live::{GatewayConfig, LiveGateway};
pub use rpc::{with_backoff, RpcClient};
pub use signer::{
    DynKeyService, HttpKeyService, KeyService, NullKeyService, SignerAccount, SignerId,
    SignerRegistry, SignerRole, SignerTier, SignerTx,
};
pub use testing::MockGateway;
pub use ws::{LogSubscription, WsConfig};
