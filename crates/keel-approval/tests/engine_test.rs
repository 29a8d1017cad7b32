//! Approval engine behavior end to end against the in-memory store and a
//! scripted gateway.

use std::sync::Arc;

use alloy::primitives::Address;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keel_approval::{
    ApprovalEngine, ApprovalError, ApprovalRequest, ApproverDirectory, ResultProcessor, RuleTable,
};
use keel_chain::{MockGateway, SignerAccount, SignerId, SignerRegistry, SignerRole, SignerTier};
use keel_core::{
    Amount, ApprovalAction, ApproverRole, Notification, RedemptionChannel, ReferenceType,
    TicketStatus, TicketType,
};
use keel_store::{MemoryStore, TicketStore};
use keel_tasks::{Scheduler, TaskQueue};

struct Harness {
    engine: ApprovalEngine,
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
    queue: TaskQueue,
    notifications: mpsc::Receiver<Notification>,
    directory: Arc<ApproverDirectory>,
}

fn vault() -> Address {
    Address::with_last_byte(0xf0)
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let queue = TaskQueue::new();
    let scheduler = Scheduler::spawn(queue.clone(), CancellationToken::new());
    let signers = Arc::new(SignerRegistry::new(vec![SignerAccount {
        id: SignerId::new("warm-vip"),
        role: SignerRole::VipApprover,
        tier: SignerTier::Warm,
        per_tx_cap: Amount::from_units(1_000_000),
        daily_cap: Amount::from_units(5_000_000),
    }]));
    let results = Arc::new(ResultProcessor::new(
        store.clone(),
        gateway.clone(),
        signers,
        vault(),
        queue.clone(),
    ));
    let directory = Arc::new(ApproverDirectory::new());
    let (notify_tx, notifications) = mpsc::channel(64);
    let engine = ApprovalEngine::new(
        store.clone(),
        RuleTable::default(),
        directory.clone(),
        scheduler,
        queue.clone(),
        results,
        notify_tx,
    );
    Harness {
        engine,
        store,
        gateway,
        queue,
        notifications,
        directory,
    }
}

fn redemption_request(request_id: u64, units: u64) -> ApprovalRequest {
    ApprovalRequest {
        ticket_type: TicketType::Redemption,
        reference_type: ReferenceType::Redemption,
        reference_id: request_id.to_string(),
        requester: Address::with_last_byte(0x01),
        amount: Some(Amount::from_units(units)),
        channel: Some(RedemptionChannel::Standard),
        description: None,
        request_data: json!({}),
    }
}

#[tokio::test]
async fn test_large_redemption_single_approval_commits_on_chain() {
    let h = harness();
    let manager = Address::with_last_byte(0xa1);
    h.directory.set_role(manager, ApproverRole::Manager);

    // requestId=43, gross=150k: matches the large rule, one manager needed.
    let created = h
        .engine
        .create_ticket(redemption_request(43, 150_000))
        .await
        .unwrap();
    assert_eq!(created.status, TicketStatus::Pending);
    assert!(!created.reused);

    let ticket = h.store.ticket(&created.id).await.unwrap().unwrap();
    assert_eq!(ticket.required_approvals, 1);

    let status = h
        .engine
        .act(&created.id, manager, ApprovalAction::Approve, None)
        .await
        .unwrap();
    assert_eq!(status, TicketStatus::Approved);

    // The result processor task was queued; run it.
    let task = h.queue.try_pop().expect("result task queued");
    match &task.kind {
        keel_core::TaskKind::ProcessApprovalResult { ticket_id } => {
            assert_eq!(ticket_id, &created.id);
        }
        other => panic!("unexpected task: {other:?}"),
    }
    h.engine
        .results()
        .process(&created.id)
        .await
        .unwrap();

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "approveRedemption(uint256)");
    assert_eq!(sent[0].args, json!([43]));
}

#[tokio::test]
async fn test_rejection_is_terminal_and_commits_rejection() {
    let h = harness();
    let manager = Address::with_last_byte(0xa1);
    h.directory.set_role(manager, ApproverRole::Manager);

    let created = h
        .engine
        .create_ticket(redemption_request(44, 150_000))
        .await
        .unwrap();
    let status = h
        .engine
        .act(
            &created.id,
            manager,
            ApprovalAction::Reject,
            Some("insufficient liquidity".into()),
        )
        .await
        .unwrap();
    assert_eq!(status, TicketStatus::Rejected);

    h.engine
        .results()
        .process(&created.id)
        .await
        .unwrap();
    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "rejectRedemption(uint256,string)");
}

#[tokio::test]
async fn test_duplicate_actor_rejected() {
    let h = harness();
    let admin = Address::with_last_byte(0xa2);
    h.directory.set_role(admin, ApproverRole::Admin);

    // Rebalancing needs two approvals; the same admin cannot supply both.
    let created = h
        .engine
        .create_ticket(ApprovalRequest {
            ticket_type: TicketType::Rebalancing,
            reference_type: ReferenceType::Rebalance,
            reference_id: "RBL-TEST0001".into(),
            requester: Address::with_last_byte(0x01),
            amount: Some(Amount::from_units(80_000)),
            channel: None,
            description: None,
            request_data: json!({}),
        })
        .await
        .unwrap();

    let status = h
        .engine
        .act(&created.id, admin, ApprovalAction::Approve, None)
        .await
        .unwrap();
    assert_eq!(status, TicketStatus::PartiallyApproved);

    let err = h
        .engine
        .act(&created.id, admin, ApprovalAction::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Validation(_)));

    let ticket = h.store.ticket(&created.id).await.unwrap().unwrap();
    assert_eq!(ticket.current_approvals, 1);
    assert_eq!(ticket.records.len(), 1);
}

#[tokio::test]
async fn test_insufficient_role_rejected() {
    let h = harness();
    let operator = Address::with_last_byte(0xa3);
    h.directory.set_role(operator, ApproverRole::Operator);

    let created = h
        .engine
        .create_ticket(redemption_request(45, 150_000))
        .await
        .unwrap();
    let err = h
        .engine
        .act(&created.id, operator, ApprovalAction::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Validation(_)));
}

#[tokio::test]
async fn test_auto_approve_equals_manual_approval_path() {
    let h = harness();

    // Small gated redemption auto-approves and commits in-line.
    let created = h
        .engine
        .create_ticket(redemption_request(46, 20_000))
        .await
        .unwrap();
    assert_eq!(created.status, TicketStatus::Approved);

    let ticket = h.store.ticket(&created.id).await.unwrap().unwrap();
    assert_eq!(ticket.resolved_by.as_deref(), Some("system"));

    // Same terminal state and on-chain call a manual approval would produce.
    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "approveRedemption(uint256)");
    assert_eq!(sent[0].args, json!([46]));
}

#[tokio::test]
async fn test_open_ticket_reused_for_same_reference() {
    let h = harness();
    let first = h
        .engine
        .create_ticket(redemption_request(47, 150_000))
        .await
        .unwrap();
    let second = h
        .engine
        .create_ticket(redemption_request(47, 150_000))
        .await
        .unwrap();
    assert!(second.reused);
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn test_no_rule_matched_surfaces() {
    let h = harness();
    let err = h
        .engine
        .create_ticket(ApprovalRequest {
            amount: None,
            ..redemption_request(48, 0)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::NoRuleMatched));
    assert_eq!(err.code(), "NO_RULE_MATCHED");
}

#[tokio::test]
async fn test_sla_deadline_without_auto_reject_expires_quietly() {
    let mut h = harness();
    let created = h
        .engine
        .create_ticket(redemption_request(49, 150_000))
        .await
        .unwrap();

    h.engine.on_sla_deadline(&created.id).await.unwrap();

    let ticket = h.store.ticket(&created.id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Expired);
    // No on-chain call for a non-auto-reject expiry.
    assert!(h.gateway.sent().is_empty());
    // Critical notification went out.
    let mut saw_critical = false;
    while let Ok(notification) = h.notifications.try_recv() {
        if notification.severity == keel_core::NotifySeverity::Critical {
            saw_critical = true;
        }
    }
    assert!(saw_critical);
}

#[tokio::test]
async fn test_cancellation_only_by_requester_and_off_chain() {
    let h = harness();
    let requester = Address::with_last_byte(0x01);
    let created = h
        .engine
        .create_ticket(redemption_request(50, 150_000))
        .await
        .unwrap();

    let err = h
        .engine
        .cancel(&created.id, Address::with_last_byte(0x99))
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Validation(_)));

    h.engine.cancel(&created.id, requester).await.unwrap();
    let ticket = h.store.ticket(&created.id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Cancelled);
    assert!(h.gateway.sent().is_empty());
}
