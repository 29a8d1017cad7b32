//! Emergency incident lifecycle against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keel_chain::{MockGateway, SignerAccount, SignerId, SignerRegistry, SignerRole, SignerTier};
use keel_core::{
    Amount, FundProjection, RiskLevel, RiskSnapshot, TierTargets,
};
use keel_rebalance::{
    Executor, ExecutorConfig, Planner, PlannerConfig, RebalanceEngine, TriggerEvaluator,
};
use keel_risk::{EmergencyConfig, EmergencyDriver, ForecastConfig, Forecaster, RiskError};
use keel_store::{LeaseStore, MemoryStore, ProjectionStore, RedemptionStore, RiskStore};

fn vault() -> Address {
    Address::with_last_byte(0xf0)
}

fn signers() -> Arc<SignerRegistry> {
    Arc::new(SignerRegistry::new(vec![
        SignerAccount {
            id: SignerId::new("cold-admin"),
            role: SignerRole::Admin,
            tier: SignerTier::Cold,
            per_tx_cap: Amount::from_units(10_000_000),
            daily_cap: Amount::from_units(50_000_000),
        },
        SignerAccount {
            id: SignerId::new("hot-rebalancer"),
            role: SignerRole::Rebalancer,
            tier: SignerTier::Hot,
            per_tx_cap: Amount::from_units(10_000_000),
            daily_cap: Amount::from_units(50_000_000),
        },
    ]))
}

fn driver(
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
) -> (EmergencyDriver, mpsc::Receiver<keel_core::Notification>) {
    let signers = signers();
    let planner = Planner::new(
        TriggerEvaluator::new(TierTargets::default()),
        PlannerConfig::default(),
    );
    let executor = Executor::new(
        ExecutorConfig::default(),
        gateway.clone(),
        store.clone(),
        signers.clone(),
        vault(),
    );
    let rebalance = Arc::new(RebalanceEngine::new(store.clone(), planner, executor));
    let forecaster = Arc::new(Forecaster::new(
        store.clone(),
        ForecastConfig {
            trials: 200,
            history_window_days: 90,
            seed: Some(7),
        },
    ));
    let (notify_tx, notify_rx) = mpsc::channel(16);
    let driver = EmergencyDriver::new(
        EmergencyConfig {
            watch_interval: Duration::from_millis(30),
            lease_ttl_secs: 30,
            calm_snapshots: 2,
        },
        store.clone(),
        store,
        gateway,
        signers,
        vault(),
        rebalance,
        forecaster,
        notify_tx,
        keel_tasks::TaskQueue::new(),
    );
    (driver, notify_rx)
}

async fn seed_fund(store: &MemoryStore) {
    let mut fund = FundProjection::genesis();
    fund.total_assets = Amount::from_units(1_000_000);
    fund.l1_cash = Amount::from_units(100_000);
    fund.l2 = Amount::from_units(300_000);
    fund.l3 = Amount::from_units(600_000);
    store.put_fund(&fund).await.unwrap();
}

fn calm_snapshot() -> RiskSnapshot {
    RiskSnapshot {
        timestamp: Utc::now(),
        readings: Vec::new(),
        level: RiskLevel::Elevated,
        score: 20.0,
    }
}

#[tokio::test]
async fn test_incident_contains_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    seed_fund(&store).await;

    // Two calm snapshots already observed: recovery closes on the first
    // watcher tick.
    store.append_snapshot(&calm_snapshot()).await.unwrap();
    store.append_snapshot(&calm_snapshot()).await.unwrap();

    let (driver, mut notifications) = driver(store.clone(), gateway.clone());
    driver
        .run_incident("INC-TEST", CancellationToken::new())
        .await
        .unwrap();

    let methods = gateway.sent_methods();
    // Containment pair and recovery pair, order within each pair is
    // concurrent.
    assert!(methods.contains(&"setEmergencyMode(bool)".to_string()));
    assert!(methods.contains(&"pause()".to_string()));
    assert!(methods.contains(&"unpause()".to_string()));
    assert_eq!(
        methods
            .iter()
            .filter(|m| m.as_str() == "setEmergencyMode(bool)")
            .count(),
        2,
        "mode set on open and cleared on close"
    );

    let sent = gateway.sent();
    let mode_args: Vec<_> = sent
        .iter()
        .filter(|s| s.method == "setEmergencyMode(bool)")
        .map(|s| s.args.clone())
        .collect();
    assert!(mode_args.contains(&serde_json::json!([true])));
    assert!(mode_args.contains(&serde_json::json!([false])));

    // Incident open/close recorded, critical page sent.
    let sources = store.risk_event_sources();
    assert_eq!(
        sources.iter().filter(|s| s.as_str() == "emergency_driver").count(),
        2
    );
    let page = notifications.try_recv().expect("critical page");
    assert_eq!(page.severity, keel_core::NotifySeverity::Critical);
}

#[tokio::test]
async fn test_incident_lease_is_exclusive() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    seed_fund(&store).await;

    // Another driver already holds the incident lease.
    store
        .acquire("incident:INC-HELD", "someone-else", 30)
        .await
        .unwrap();

    let (driver, _rx) = driver(store.clone(), gateway.clone());
    let err = driver
        .run_incident("INC-HELD", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RiskError::IncidentHeld(_)));
    assert!(gateway.sent().is_empty(), "no on-chain action without the lease");
}

#[tokio::test]
async fn test_waterfall_covers_forecast_gap() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());

    // Liquid 100k, confirmed outflow 400k within 7d: gap 300k.
    let mut fund = FundProjection::genesis();
    fund.total_assets = Amount::from_units(1_000_000);
    fund.l1_cash = Amount::from_units(100_000);
    fund.l3 = Amount::from_units(900_000);
    store.put_fund(&fund).await.unwrap();
    let now = Utc::now();
    store
        .upsert_redemption(&keel_core::RedemptionRequest {
            request_id: 9,
            owner: Address::with_last_byte(1),
            receiver: Address::with_last_byte(1),
            shares: Amount::from_units(400_000),
            gross_amount: Amount::from_units(400_000),
            locked_nav: Amount::from_units(1),
            estimated_fee: Amount::ZERO,
            request_time: now,
            settlement_time: now + chrono::Duration::days(2),
            channel: keel_core::RedemptionChannel::Standard,
            requires_approval: false,
            window_id: None,
            voucher_token_id: None,
            status: keel_core::RedemptionStatus::Pending,
            settled_amount: None,
            settled_fee: None,
            settled_at: None,
            approval_ticket_id: None,
            updated_at: now,
        })
        .await
        .unwrap();

    store.append_snapshot(&calm_snapshot()).await.unwrap();
    store.append_snapshot(&calm_snapshot()).await.unwrap();

    let (driver, _rx) = driver(store.clone(), gateway.clone());
    driver
        .run_incident("INC-GAP", CancellationToken::new())
        .await
        .unwrap();

    let methods = gateway.sent_methods();
    assert!(
        methods.contains(&"executeWaterfallLiquidation(uint256,uint8)".to_string()),
        "waterfall plan executed for the gap: {methods:?}"
    );
}
