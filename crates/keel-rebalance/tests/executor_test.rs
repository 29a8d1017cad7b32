//! Executor semantics: simulation gate, partial failure, verification.

use std::sync::Arc;

use alloy::primitives::Address;
use chrono::Utc;
use serde_json::{json, Value};

use keel_chain::{
    ChainError, MockGateway, SignerAccount, SignerId, SignerRegistry, SignerRole, SignerTier,
    Simulation,
};
use keel_core::{
    Amount, Bps, FundProjection, PlanStatus, PlannedAction, PurchaseMethod, RebalanceAction,
    RebalancePlan, RebalanceTrigger, Tier, TierState, TierTargets,
};
use keel_rebalance::{
    Executor, ExecutorConfig, Planner, PlannerConfig, RebalanceEngine, RebalanceError,
    TriggerEvaluator,
};
use keel_store::{MemoryStore, PlanStore, ProjectionStore};

fn vault() -> Address {
    Address::with_last_byte(0xf0)
}

fn signers() -> Arc<SignerRegistry> {
    Arc::new(SignerRegistry::new(vec![SignerAccount {
        id: SignerId::new("hot-rebalancer"),
        role: SignerRole::Rebalancer,
        tier: SignerTier::Hot,
        per_tx_cap: Amount::from_units(10_000_000),
        daily_cap: Amount::from_units(50_000_000),
    }]))
}

fn engine(store: Arc<MemoryStore>, gateway: Arc<MockGateway>) -> RebalanceEngine {
    let planner = Planner::new(
        TriggerEvaluator::new(TierTargets::default()),
        PlannerConfig::default(),
    );
    let executor = Executor::new(
        ExecutorConfig::default(),
        gateway,
        store.clone(),
        signers(),
        vault(),
    );
    RebalanceEngine::new(store, planner, executor)
}

fn state(l1: u64, l2: u64, l3: u64) -> TierState {
    TierState {
        l1: Amount::from_units(l1),
        l2: Amount::from_units(l2),
        l3: Amount::from_units(l3),
        total: Amount::from_units(l1 + l2 + l3),
    }
}

async fn seed_fund(store: &MemoryStore, s: TierState) {
    let fund = FundProjection {
        total_assets: s.total,
        l1_cash: s.l1,
        l1_yield: Amount::ZERO,
        l2: s.l2,
        l3: s.l3,
        ..FundProjection::genesis()
    };
    store.put_fund(&fund).await.unwrap();
}

fn manual_plan(actions: Vec<PlannedAction>, pre: TierState) -> RebalancePlan {
    let now = Utc::now();
    let total: Amount = actions.iter().map(|a| a.action.amount()).sum();
    let target = keel_rebalance::project_state(&pre, &actions, &[], &Default::default());
    RebalancePlan {
        id: keel_core::new_plan_id(),
        trigger: RebalanceTrigger::Manual,
        pre_state: pre,
        target_state: target,
        deviations: Vec::new(),
        actions,
        total_amount: total,
        estimated_gas_cost: Amount::ZERO,
        estimated_slippage: Bps::ZERO,
        requires_approval: false,
        approval_ticket_id: None,
        status: PlanStatus::Draft,
        results: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_simulation_slippage_fails_plan_before_any_send() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    seed_fund(&store, state(100_000, 300_000, 600_000)).await;

    // REDEEM-like purchase with max 200bp while the simulation predicts 3%.
    gateway.script_simulation(
        "purchaseAsset(address,uint256)",
        Simulation {
            success: true,
            revert_reason: None,
            output: json!([Amount::from_units(48_500).to_string(), "300"]),
        },
    );

    let plan = manual_plan(
        vec![PlannedAction {
            index: 0,
            priority: 1,
            action: RebalanceAction::Purchase {
                asset: Address::with_last_byte(0x33),
                from_tier: Tier::L1,
                usdt_amount: Amount::from_units(50_000),
                method: PurchaseMethod::Direct,
                max_slippage: Bps(200),
            },
            note: None,
        }],
        state(100_000, 300_000, 600_000),
    );
    store.insert_plan(&plan).await.unwrap();

    let engine = engine(store.clone(), gateway.clone());
    let err = engine.execute(&plan.id).await.unwrap_err();
    assert!(matches!(err, RebalanceError::SlippageExceeded { .. }));

    // DRAFT -> FAILED with zero on-chain sends.
    let stored = store.plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PlanStatus::Failed);
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_simulation_revert_fails_plan_whole() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    seed_fund(&store, state(100_000, 300_000, 600_000)).await;

    gateway.script_simulation(
        "allocateToLayer(uint8,uint8,uint256)",
        Simulation {
            success: false,
            revert_reason: Some("insufficient L2 balance".to_string()),
            output: Value::Null,
        },
    );

    let plan = manual_plan(
        vec![PlannedAction {
            index: 0,
            priority: 1,
            action: RebalanceAction::Transfer {
                from_tier: Tier::L2,
                to_tier: Tier::L1,
                amount: Amount::from_units(50_000),
            },
            note: None,
        }],
        state(100_000, 300_000, 600_000),
    );
    store.insert_plan(&plan).await.unwrap();

    let engine = engine(store.clone(), gateway.clone());
    let err = engine.execute(&plan.id).await.unwrap_err();
    assert!(matches!(err, RebalanceError::SimulationReverted(_)));
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_successful_plan_completes_with_results_in_order() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let pre = state(50_000, 350_000, 600_000);
    seed_fund(&store, pre).await;

    let plan = manual_plan(
        vec![PlannedAction {
            index: 0,
            priority: 1,
            action: RebalanceAction::Transfer {
                from_tier: Tier::L2,
                to_tier: Tier::L1,
                amount: Amount::from_units(50_000),
            },
            note: None,
        }],
        pre,
    );
    store.insert_plan(&plan).await.unwrap();

    let engine = engine(store.clone(), gateway.clone());
    let status = engine.execute(&plan.id).await.unwrap();
    assert_eq!(status, PlanStatus::Completed);

    let stored = store.plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PlanStatus::Completed);
    assert_eq!(stored.results.len(), 1);
    assert!(stored.results[0].success);
    assert_eq!(gateway.sent_methods(), vec![
        "allocateToLayer(uint8,uint8,uint256)".to_string()
    ]);
}

#[tokio::test]
async fn test_non_priority_zero_failure_ends_partial() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let pre = state(50_000, 400_000, 550_000);
    seed_fund(&store, pre).await;

    // Two actions at different priorities; the first send fails terminally.
    let plan = manual_plan(
        vec![
            PlannedAction {
                index: 0,
                priority: 1,
                action: RebalanceAction::Transfer {
                    from_tier: Tier::L2,
                    to_tier: Tier::L1,
                    amount: Amount::from_units(50_000),
                },
                note: None,
            },
            PlannedAction {
                index: 1,
                priority: 2,
                action: RebalanceAction::Redeem {
                    asset: Address::with_last_byte(0x33),
                    amount: Amount::from_units(20_000),
                    to_tier: Tier::L2,
                },
                note: None,
            },
        ],
        pre,
    );
    store.insert_plan(&plan).await.unwrap();
    gateway.fail_next_send(ChainError::ReceiptFailed("reverted".to_string()));

    let engine = engine(store.clone(), gateway.clone());
    let status = engine.execute(&plan.id).await.unwrap();
    assert_eq!(status, PlanStatus::Partial);

    let stored = store.plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(stored.results.len(), 2);
    let first = stored.results.iter().find(|r| r.index == 0).unwrap();
    assert!(!first.success);
    // The second action shares no tier with the failed transfer beyond L2...
    // it does share L2, so it is skipped as dependent.
    let second = stored.results.iter().find(|r| r.index == 1).unwrap();
    assert!(!second.success);
    assert!(second.error.as_deref().unwrap_or_default().contains("skipped"));
}

#[tokio::test]
async fn test_priority_zero_failure_fails_plan_and_halts() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let pre = state(50_000, 350_000, 600_000);
    seed_fund(&store, pre).await;

    let plan = manual_plan(
        vec![
            PlannedAction {
                index: 0,
                priority: 0,
                action: RebalanceAction::Waterfall {
                    amount_needed: Amount::from_units(100_000),
                    max_tier: Tier::L3,
                },
                note: None,
            },
            PlannedAction {
                index: 1,
                priority: 1,
                action: RebalanceAction::Transfer {
                    from_tier: Tier::L2,
                    to_tier: Tier::L1,
                    amount: Amount::from_units(50_000),
                },
                note: None,
            },
        ],
        pre,
    );
    store.insert_plan(&plan).await.unwrap();
    gateway.fail_next_send(ChainError::SendTimeout("timeout".to_string()));
    gateway.fail_next_send(ChainError::SendTimeout("timeout".to_string()));
    gateway.fail_next_send(ChainError::SendTimeout("timeout".to_string()));

    let engine = engine(store.clone(), gateway.clone());
    let status = engine.execute(&plan.id).await.unwrap();
    assert_eq!(status, PlanStatus::Failed);

    // The priority-1 transfer never ran.
    let stored = store.plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(stored.results.len(), 1);
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_run_check_persists_plan_and_gates_approval() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    // L1 at 4%: well under the floor, 60k deficit on a 1M book.
    seed_fund(&store, state(40_000, 360_000, 600_000)).await;

    let engine = engine(store.clone(), gateway);
    let outcome = engine
        .run_check(RebalanceTrigger::Liquidity)
        .await
        .unwrap();
    match outcome {
        keel_rebalance::CheckOutcome::Planned {
            plan_id,
            requires_approval,
            total_amount,
        } => {
            assert!(requires_approval, "60k exceeds the 50k approval threshold");
            assert_eq!(total_amount, Amount::from_units(60_000));
            let stored = store.plan(&plan_id).await.unwrap().unwrap();
            assert_eq!(stored.status, PlanStatus::PendingApproval);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_run_check_no_action_when_balanced() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    seed_fund(&store, state(100_000, 300_000, 600_000)).await;

    let engine = engine(store.clone(), gateway);
    let outcome = engine
        .run_check(RebalanceTrigger::Threshold)
        .await
        .unwrap();
    assert!(matches!(outcome, keel_rebalance::CheckOutcome::NoAction));
}
