//! Dispatcher behavior against the in-memory store.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use keel_core::{Amount, ChainEvent, LogRecord, RedemptionStatus};
use keel_projection::{Dispatcher, DispatcherConfig, DomainEffect};
use keel_store::{CommitOutcome, MemoryStore, ProjectionStore, RedemptionStore};

fn dispatcher(store: Arc<MemoryStore>) -> (Dispatcher, mpsc::Receiver<DomainEffect>) {
    let (tx, rx) = mpsc::channel(64);
    (
        Dispatcher::new(store, tx, DispatcherConfig::default()),
        rx,
    )
}

fn event(name: &str, tx_byte: u8, log_index: u64, params: serde_json::Value) -> ChainEvent {
    let record = LogRecord {
        contract: Address::with_last_byte(0x11),
        tx_hash: B256::with_last_byte(tx_byte),
        log_index,
        block_number: 100,
        block_hash: B256::with_last_byte(9),
        block_time: Utc::now(),
        name: name.to_string(),
        params,
    };
    ChainEvent::decode(&record).expect("valid test event")
}

fn deposit(tx_byte: u8, units: u64) -> ChainEvent {
    event(
        "DepositProcessed",
        tx_byte,
        0,
        json!({
            "owner": "0x00000000000000000000000000000000000000aa",
            "assets": Amount::from_units(units).to_string(),
            "shares": Amount::from_units(units).to_string(),
        }),
    )
}

fn redemption_requested(tx_byte: u8, request_id: u64, units: u64, approval: bool) -> ChainEvent {
    event(
        "RedemptionRequested",
        tx_byte,
        0,
        json!({
            "requestId": request_id,
            "owner": "0x00000000000000000000000000000000000000aa",
            "receiver": "0x00000000000000000000000000000000000000bb",
            "shares": Amount::from_units(units).to_string(),
            "grossAmount": Amount::from_units(units).to_string(),
            "lockedNav": Amount::from_units(1).to_string(),
            "estimatedFee": "0",
            "channel": 0,
            "requiresApproval": approval,
            "settlementTime": (Utc::now() + ChronoDuration::days(7)).timestamp(),
        }),
    )
}

#[tokio::test]
async fn test_deposit_updates_projection() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, _rx) = dispatcher(store.clone());

    let outcome = dispatcher.dispatch(&deposit(1, 50_000)).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Applied);

    let fund = store.fund().await.unwrap();
    assert_eq!(fund.total_assets, Amount::from_units(50_000));
    assert_eq!(fund.l1_cash, Amount::from_units(50_000));
    assert_eq!(fund.last_block, 100);
}

#[tokio::test]
async fn test_replay_leaves_projection_unchanged() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, _rx) = dispatcher(store.clone());

    let e = deposit(1, 50_000);
    dispatcher.dispatch(&e).await.unwrap();
    let before = store.fund().await.unwrap();

    let replay = dispatcher.dispatch(&e).await.unwrap();
    assert_eq!(replay, CommitOutcome::AlreadyProcessed);
    assert_eq!(store.fund().await.unwrap(), before);
}

#[tokio::test]
async fn test_standard_redemption_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut rx) = dispatcher(store.clone());

    dispatcher.dispatch(&deposit(1, 100_000)).await.unwrap();
    dispatcher
        .dispatch(&redemption_requested(2, 42, 10_000, false))
        .await
        .unwrap();

    let request = store.redemption(42).await.unwrap().unwrap();
    assert_eq!(request.status, RedemptionStatus::Pending);
    assert!(!request.requires_approval);

    // Settlement arrives seven days later.
    let settled = event(
        "RedemptionSettled",
        3,
        0,
        json!({
            "requestId": 42,
            "netAmount": Amount::from_units(9_950).to_string(),
            "fee": Amount::from_units(50).to_string(),
        }),
    );
    dispatcher.dispatch(&settled).await.unwrap();

    let request = store.redemption(42).await.unwrap().unwrap();
    assert_eq!(request.status, RedemptionStatus::Settled);
    assert_eq!(request.settled_amount, Some(Amount::from_units(9_950)));
    assert_eq!(request.settled_fee, Some(Amount::from_units(50)));

    // No approval effect was emitted for the standard request.
    while let Ok(effect) = rx.try_recv() {
        assert!(
            !matches!(effect, DomainEffect::RequestApproval { .. }),
            "standard redemption must not open a ticket"
        );
    }
}

#[tokio::test]
async fn test_gated_redemption_emits_approval_effect() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut rx) = dispatcher(store.clone());

    dispatcher.dispatch(&deposit(1, 1_000_000)).await.unwrap();
    dispatcher
        .dispatch(&redemption_requested(2, 43, 150_000, true))
        .await
        .unwrap();

    let request = store.redemption(43).await.unwrap().unwrap();
    assert_eq!(request.status, RedemptionStatus::PendingApproval);

    let mut saw_approval = false;
    while let Ok(effect) = rx.try_recv() {
        if let DomainEffect::RequestApproval {
            request_id,
            gross_amount,
            ..
        } = effect
        {
            assert_eq!(request_id, 43);
            assert_eq!(gross_amount, Amount::from_units(150_000));
            saw_approval = true;
        }
    }
    assert!(saw_approval);
}

#[tokio::test]
async fn test_on_chain_approval_advances_request() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut rx) = dispatcher(store.clone());

    dispatcher.dispatch(&deposit(1, 1_000_000)).await.unwrap();
    dispatcher
        .dispatch(&redemption_requested(2, 43, 150_000, true))
        .await
        .unwrap();

    let approved = event(
        "RedemptionApproved",
        3,
        0,
        json!({
            "requestId": 43,
            "approver": "0x00000000000000000000000000000000000000cc",
        }),
    );
    dispatcher.dispatch(&approved).await.unwrap();

    let request = store.redemption(43).await.unwrap().unwrap();
    assert_eq!(request.status, RedemptionStatus::Approved);

    let mut resolved = false;
    while let Ok(effect) = rx.try_recv() {
        if let DomainEffect::RedemptionResolvedOnChain {
            request_id,
            approved,
        } = effect
        {
            assert_eq!(request_id, 43);
            assert!(approved);
            resolved = true;
        }
    }
    assert!(resolved);
}

#[tokio::test]
async fn test_liquidity_alert_cooldown_suppresses_duplicates() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut rx) = dispatcher(store.clone());

    let alert = |tx_byte| {
        event(
            "LowLiquidityAlert",
            tx_byte,
            0,
            json!({ "ratio": 900, "threshold": 1000, "available": "1000000" }),
        )
    };

    dispatcher.dispatch(&alert(1)).await.unwrap();
    dispatcher.dispatch(&alert(2)).await.unwrap();

    let mut alerts = 0;
    while let Ok(effect) = rx.try_recv() {
        if matches!(effect, DomainEffect::LiquidityAlert { .. }) {
            alerts += 1;
        }
    }
    assert_eq!(alerts, 1, "second alert within the hour is suppressed");
    assert_eq!(store.risk_event_sources(), vec!["low_liquidity"]);
}

#[tokio::test]
async fn test_nav_update_wakes_risk_and_appends_series() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut rx) = dispatcher(store.clone());

    dispatcher.dispatch(&deposit(1, 1_000)).await.unwrap();
    let nav = event(
        "NavUpdated",
        2,
        0,
        json!({
            "sharePrice": Amount::from_units(1).to_string(),
            "totalAssets": Amount::from_units(1_010).to_string(),
        }),
    );
    dispatcher.dispatch(&nav).await.unwrap();

    let fund = store.fund().await.unwrap();
    assert_eq!(fund.total_assets, Amount::from_units(1_010));
    let since = Utc::now() - ChronoDuration::hours(1);
    assert_eq!(store.nav_history(since).await.unwrap().len(), 1);

    let mut woke = false;
    while let Ok(effect) = rx.try_recv() {
        if matches!(effect, DomainEffect::WakeRisk) {
            woke = true;
        }
    }
    assert!(woke);
}

#[tokio::test]
async fn test_event_key_uniqueness_across_log_indices() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, _rx) = dispatcher(store.clone());

    // Same tx hash, different log indices: both apply.
    let fee = |log_index| {
        event(
            "ManagementFeeCollected",
            7,
            log_index,
            json!({ "amount": Amount::from_units(10).to_string() }),
        )
    };
    assert_eq!(
        dispatcher.dispatch(&fee(0)).await.unwrap(),
        CommitOutcome::Applied
    );
    assert_eq!(
        dispatcher.dispatch(&fee(1)).await.unwrap(),
        CommitOutcome::Applied
    );
    assert_eq!(
        store.fund().await.unwrap().withdrawable_fees,
        Amount::from_units(20)
    );
    assert_eq!(store.processed_count(), 2);
}
