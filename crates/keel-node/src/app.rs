//! Node wiring: builds every component and routes effects between them.
//!
//! The engines never call each other directly; they emit typed effects and
//! signals that this module routes, which keeps ownership boundaries exactly
//! as designed: the ingestor owns checkpoints, the dispatcher owns
//! projections, the approval engine owns tickets, the rebalance engine owns
//! plans.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel_approval::{
    ApprovalEngine, ApprovalRequest, ApproverDirectory, ResultProcessor, RuleTable,
};
use keel_chain::{
    ChainGateway, GatewayConfig, HttpKeyService, LiveGateway, SignerRegistry,
};
use keel_core::{
    new_risk_event_id, Notification, NotifySeverity, RedemptionChannel, ReferenceType, RiskEvent,
    RiskLevel, TaskKind, TicketResult, TicketStatus, TicketType,
};
use keel_ingest::{IngestAlert, IngestCommand, IngestConfig, Ingestor};
use keel_projection::{Dispatcher, DispatcherConfig, DomainEffect};
use keel_rebalance::{
    Executor, ExecutorConfig, Planner, PlannerConfig, RebalanceEngine, TriggerEvaluator,
};
use keel_risk::{
    incident_id_for, EmergencyConfig, EmergencyDriver, ForecastConfig, Forecaster,
    IndicatorConfig, RiskMonitor, RiskSignal,
};
use keel_store::{
    create_pool, DbPoolConfig, PgStore, RedisKv, RedemptionStore, RiskStore, Store, TicketStore,
};
use keel_tasks::{Scheduler, TaskEnvelope, TaskQueue, WorkerConfig, WorkerPool};

use keel_core::Amount;

use crate::commands::CommandBus;
use crate::config::NodeConfig;
use crate::error::NodeResult;
use crate::handler::NodeTaskHandler;

/// Run the node until interrupted.
pub async fn run(config: NodeConfig) -> NodeResult<()> {
    let shutdown = CancellationToken::new();

    // ---- persistence --------------------------------------------------
    let pool = create_pool(&config.store.database_url, DbPoolConfig::default()).await?;
    let pg = Arc::new(PgStore::new(pool));
    pg.migrate().await?;
    let store: Arc<dyn Store> = pg.clone();
    let checkpoints: Arc<dyn keel_store::CheckpointStore> = pg;
    let kv = Arc::new(RedisKv::connect(&config.store.redis_url, "keel").await?);

    // ---- chain --------------------------------------------------------
    let vault = config.vault()?;
    let contracts = config.contracts()?;
    let signers = Arc::new(SignerRegistry::new(config.signer_accounts()));
    let key_service = Arc::new(HttpKeyService::new(&config.chain.key_service_url)?);
    let gateway: Arc<dyn ChainGateway> = Arc::new(LiveGateway::new(
        GatewayConfig {
            rpc_url: config.chain.rpc_url.clone(),
            ws_url: config.chain.ws_url.clone(),
            confirmations: config.chain.confirmations,
            receipt_poll: Duration::from_secs(3),
        },
        signers.clone(),
        key_service,
        shutdown.clone(),
    )?);

    // ---- task runtime -------------------------------------------------
    let queue = TaskQueue::new();
    let scheduler = Scheduler::spawn(queue.clone(), shutdown.clone());

    // ---- channels -----------------------------------------------------
    let (effects_tx, effects_rx) = mpsc::channel::<DomainEffect>(256);
    let (signals_tx, signals_rx) = mpsc::channel::<RiskSignal>(64);
    let (alerts_tx, alerts_rx) = mpsc::channel::<IngestAlert>(64);
    let (notify_tx, notify_rx) = mpsc::channel::<Notification>(256);
    let (ingest_cmd_tx, ingest_cmd_rx) = mpsc::channel::<IngestCommand>(16);

    // ---- engines ------------------------------------------------------
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        effects_tx,
        DispatcherConfig {
            large_flow_threshold: Amount::from_units(config.tasks.large_flow_threshold_units),
            ..DispatcherConfig::default()
        },
    ));

    let directory = Arc::new(ApproverDirectory::new());
    for entry in &config.approvers {
        match entry.address.parse() {
            Ok(address) => directory.set_role(address, entry.role),
            Err(_) => warn!(address = %entry.address, "Bad approver address in config"),
        }
    }
    let results = Arc::new(ResultProcessor::new(
        store.clone(),
        gateway.clone(),
        signers.clone(),
        vault,
        queue.clone(),
    ));
    let approval = Arc::new(ApprovalEngine::new(
        store.clone(),
        RuleTable::default(),
        directory,
        scheduler.clone(),
        queue.clone(),
        results,
        notify_tx.clone(),
    ));

    let targets = config.tier_targets();
    let planner = Planner::new(
        TriggerEvaluator::new(targets),
        PlannerConfig {
            min_rebalance_amount: Amount::from_units(config.rebalance.min_rebalance_amount_units),
            approval_threshold: Amount::from_units(config.rebalance.approval_threshold_units),
            default_max_slippage: keel_core::Bps(config.rebalance.max_slippage_bps),
            ..PlannerConfig::default()
        },
    );
    let executor = Executor::new(
        ExecutorConfig::default(),
        gateway.clone(),
        store.clone(),
        signers.clone(),
        vault,
    );
    let rebalance = Arc::new(RebalanceEngine::new(store.clone(), planner, executor));

    let monitor = Arc::new(RiskMonitor::new(
        store.clone(),
        IndicatorConfig::default(),
        signals_tx,
        notify_tx.clone(),
        config.risk.l1_low,
    ));
    let forecaster = Arc::new(Forecaster::new(
        store.clone(),
        ForecastConfig {
            trials: config.risk.monte_carlo_trials,
            history_window_days: config.risk.history_window_days,
            seed: None,
        },
    ));
    let emergency = Arc::new(EmergencyDriver::new(
        EmergencyConfig {
            watch_interval: Duration::from_secs(config.risk.watch_interval_secs),
            ..EmergencyConfig::default()
        },
        store.clone(),
        kv.clone(),
        gateway.clone(),
        signers.clone(),
        vault,
        rebalance.clone(),
        forecaster.clone(),
        notify_tx.clone(),
        queue.clone(),
    ));

    // ---- workers ------------------------------------------------------
    let handler = Arc::new(NodeTaskHandler {
        dispatcher,
        approval: approval.clone(),
        rebalance: rebalance.clone(),
        monitor: monitor.clone(),
        forecaster: forecaster.clone(),
        gateway: gateway.clone(),
        signers,
        store: store.clone(),
        queue: queue.clone(),
        vault,
    });
    WorkerPool::new(
        WorkerConfig {
            workers: config.tasks.workers,
            ..WorkerConfig::default()
        },
        queue.clone(),
        scheduler.clone(),
        handler,
        shutdown.clone(),
    )
    .start();

    // ---- scheduled declarations --------------------------------------
    spawn_schedules(&scheduler, &queue, &config, &shutdown);

    // ---- ingestor -----------------------------------------------------
    let ingestor = Ingestor::new(
        IngestConfig {
            contracts,
            genesis_block: config.chain.genesis_block,
            confirmations: config.chain.confirmations,
            poll_interval: Duration::from_secs(config.ingest.poll_interval_secs),
            batch_size: config.ingest.batch_size,
            dedup_ttl_secs: config.ingest.dedup_ttl_secs,
            lease_ttl_secs: config.ingest.lease_ttl_secs,
            lease_renew_interval: Duration::from_secs(config.ingest.lease_renew_secs),
            ..IngestConfig::default()
        },
        gateway.clone(),
        kv.clone(),
        kv.clone(),
        checkpoints,
        queue.clone(),
        alerts_tx,
        shutdown.clone(),
    )
    .await?;
    tokio::spawn(async move {
        if let Err(e) = ingestor.run_with_commands(ingest_cmd_rx).await {
            error!(error = %e, "Ingestor exited");
        }
    });

    // ---- routing loops ------------------------------------------------
    let command_bus = Arc::new(CommandBus::new(
        approval.clone(),
        rebalance.clone(),
        forecaster,
        queue.clone(),
        ingest_cmd_tx,
        monitor.intake_gate(),
    ));
    // The API server (out of scope here) would hold `command_bus`.
    let _ = command_bus;

    tokio::spawn(route_effects(
        effects_rx,
        store.clone(),
        approval.clone(),
        queue.clone(),
        emergency.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(route_signals(
        signals_rx,
        rebalance,
        approval,
        store.clone(),
        queue.clone(),
        emergency,
        shutdown.clone(),
    ));
    tokio::spawn(route_alerts(alerts_rx, store.clone(), notify_tx));
    tokio::spawn(log_notifications(notify_rx));

    info!("keel node running");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| crate::error::NodeError::Config(format!("signal handler: {e}")))?;
    info!("Interrupt received, shutting down");
    shutdown.cancel();
    Ok(())
}

fn spawn_schedules(
    scheduler: &Scheduler,
    queue: &TaskQueue,
    config: &NodeConfig,
    shutdown: &CancellationToken,
) {
    let minute = Duration::from_secs(60);
    let stamp = || Utc::now().timestamp();

    scheduler.spawn_periodic(
        "risk_tick",
        minute,
        queue.clone(),
        shutdown.clone(),
        move || TaskEnvelope::new(format!("risk_tick:{}", stamp()), TaskKind::RiskIndicatorTick),
    );
    scheduler.spawn_periodic(
        "liquidity_check",
        5 * minute,
        queue.clone(),
        shutdown.clone(),
        move || TaskEnvelope::new(format!("liquidity_check:{}", stamp()), TaskKind::LiquidityCheck),
    );
    scheduler.spawn_periodic(
        "deviation_check",
        60 * minute,
        queue.clone(),
        shutdown.clone(),
        move || {
            TaskEnvelope::new(
                format!("deviation_check:{}", stamp()),
                TaskKind::RebalanceCheck {
                    trigger: keel_core::RebalanceTrigger::Threshold,
                },
            )
        },
    );
    scheduler.spawn_periodic(
        "strategic_check",
        24 * 60 * minute,
        queue.clone(),
        shutdown.clone(),
        move || {
            TaskEnvelope::new(
                format!("strategic_check:{}", stamp()),
                TaskKind::RebalanceCheck {
                    trigger: keel_core::RebalanceTrigger::Strategic,
                },
            )
        },
    );
    scheduler.spawn_periodic(
        "forecast",
        60 * minute,
        queue.clone(),
        shutdown.clone(),
        move || TaskEnvelope::new(format!("forecast:{}", stamp()), TaskKind::LiquidityForecast),
    );
    let days_back = config.tasks.overdue_days_back;
    scheduler.spawn_periodic(
        "overdue_liability",
        24 * 60 * minute,
        queue.clone(),
        shutdown.clone(),
        move || {
            TaskEnvelope::new(
                format!("overdue_liability:{}", stamp()),
                TaskKind::OverdueLiabilityBatch { days_back },
            )
        },
    );
    for (label, period, every) in [
        ("report_daily", keel_core::ReportPeriod::Daily, 24 * 60),
        ("report_weekly", keel_core::ReportPeriod::Weekly, 7 * 24 * 60),
        (
            "report_monthly",
            keel_core::ReportPeriod::Monthly,
            30 * 24 * 60,
        ),
    ] {
        scheduler.spawn_periodic(
            label,
            every * minute,
            queue.clone(),
            shutdown.clone(),
            move || {
                TaskEnvelope::new(
                    format!("{label}:{}", Utc::now().timestamp()),
                    TaskKind::GenerateReport { period },
                )
            },
        );
    }
}

async fn route_effects(
    mut effects: mpsc::Receiver<DomainEffect>,
    store: Arc<dyn Store>,
    approval: Arc<ApprovalEngine>,
    queue: TaskQueue,
    emergency: Arc<EmergencyDriver>,
    shutdown: CancellationToken,
) {
    while let Some(effect) = effects.recv().await {
        match effect {
            DomainEffect::RequestApproval {
                request_id,
                owner,
                gross_amount,
                channel,
            } => {
                let ticket_type = match channel {
                    RedemptionChannel::Emergency => TicketType::EmergencyRedemption,
                    _ => TicketType::Redemption,
                };
                match approval
                    .create_ticket(ApprovalRequest {
                        ticket_type,
                        reference_type: ReferenceType::Redemption,
                        reference_id: request_id.to_string(),
                        requester: owner,
                        amount: Some(gross_amount),
                        channel: Some(channel),
                        description: None,
                        request_data: json!({ "requestId": request_id }),
                    })
                    .await
                {
                    Ok(created) => {
                        // Narrow, typed back-link from the request to its
                        // ticket.
                        if let Ok(Some(mut request)) = store.redemption(request_id).await {
                            request.approval_ticket_id = Some(created.id);
                            store.upsert_redemption(&request).await.ok();
                        }
                    }
                    Err(e) => error!(request_id, error = %e, "Ticket creation failed"),
                }
            }
            DomainEffect::RedemptionResolvedOnChain {
                request_id,
                approved,
            } => {
                // An externally committed resolution closes any still-open
                // ticket for the request.
                if let Ok(Some(ticket_id)) = store
                    .open_ticket_for_reference(ReferenceType::Redemption, &request_id.to_string())
                    .await
                {
                    let (status, result) = if approved {
                        (TicketStatus::Approved, TicketResult::Approved)
                    } else {
                        (TicketStatus::Rejected, TicketResult::Rejected)
                    };
                    if let Err(e) = store
                        .resolve_ticket(&ticket_id, status, result, "chain")
                        .await
                    {
                        warn!(ticket = %ticket_id, error = %e, "On-chain resolution sync failed");
                    }
                }
            }
            DomainEffect::WakeRisk => {
                queue.push(TaskEnvelope::new(
                    format!("risk_tick:wake:{}", Utc::now().timestamp_millis()),
                    TaskKind::RiskIndicatorTick,
                ));
            }
            DomainEffect::EmergencyMode { enabled } => {
                if enabled {
                    spawn_incident(&emergency, &shutdown);
                }
            }
            DomainEffect::LiquidityAlert { critical, .. } => {
                if critical {
                    spawn_incident(&emergency, &shutdown);
                } else {
                    queue.push(TaskEnvelope::new(
                        format!("liquidity_check:alert:{}", Utc::now().timestamp_millis()),
                        TaskKind::LiquidityCheck,
                    ));
                }
            }
            DomainEffect::LargeFlow { amount } => {
                info!(%amount, "Large flow, re-evaluating rebalance triggers");
                queue.push(TaskEnvelope::new(
                    format!("rebalance_check:flow:{}", Utc::now().timestamp_millis()),
                    TaskKind::RebalanceCheck {
                        trigger: keel_core::RebalanceTrigger::LargeFlow,
                    },
                ));
            }
        }
    }
}

async fn route_signals(
    mut signals: mpsc::Receiver<RiskSignal>,
    rebalance: Arc<RebalanceEngine>,
    approval: Arc<ApprovalEngine>,
    store: Arc<dyn Store>,
    queue: TaskQueue,
    emergency: Arc<EmergencyDriver>,
    shutdown: CancellationToken,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            RiskSignal::TriggerRebalance(trigger) => {
                queue.push(TaskEnvelope::new(
                    format!("rebalance_check:risk:{}", Utc::now().timestamp_millis()),
                    TaskKind::RebalanceCheck { trigger },
                ));
            }
            RiskSignal::PrepareWaterfall { shortfall } => {
                match rebalance.prepare_waterfall(shortfall).await {
                    Ok(plan_id) => {
                        info!(plan = %plan_id, %shortfall, "Waterfall preparation pending approval");
                        if let Err(e) = crate::approval_link::request_rebalance_approval(
                            &approval,
                            &store,
                            &plan_id,
                            shortfall,
                        )
                        .await
                        {
                            error!(plan = %plan_id, error = %e, "Waterfall approval request failed");
                        }
                    }
                    Err(e) => error!(error = %e, "Waterfall preparation failed"),
                }
            }
            RiskSignal::Emergency { snapshot } => {
                store
                    .append_risk_event(&RiskEvent {
                        id: new_risk_event_id(),
                        level: RiskLevel::Critical,
                        source: "risk_monitor".to_string(),
                        message: "Critical risk level observed".to_string(),
                        details: json!({ "score": snapshot.score }),
                        created_at: Utc::now(),
                    })
                    .await
                    .ok();
                spawn_incident(&emergency, &shutdown);
            }
        }
    }
}

fn spawn_incident(emergency: &Arc<EmergencyDriver>, shutdown: &CancellationToken) {
    let incident_id = incident_id_for(Utc::now());
    let driver = emergency.clone();
    let token = shutdown.child_token();
    tokio::spawn(async move {
        match driver.run_incident(&incident_id, token).await {
            Ok(()) => info!(incident = %incident_id, "Incident finished"),
            Err(keel_risk::RiskError::IncidentHeld(_)) => {
                info!(incident = %incident_id, "Incident already driven elsewhere");
            }
            Err(e) => error!(incident = %incident_id, error = %e, "Incident driver failed"),
        }
    });
}

async fn route_alerts(
    mut alerts: mpsc::Receiver<IngestAlert>,
    store: Arc<dyn Store>,
    notify: mpsc::Sender<Notification>,
) {
    while let Some(alert) = alerts.recv().await {
        match alert {
            IngestAlert::ReorgDetected { contract, block } => {
                store
                    .append_risk_event(&RiskEvent {
                        id: new_risk_event_id(),
                        level: RiskLevel::Critical,
                        source: "reorg_detected".to_string(),
                        message: format!("Reorg at block {block} for {contract}; ingestion halted"),
                        details: json!({ "contract": contract, "block": block }),
                        created_at: Utc::now(),
                    })
                    .await
                    .ok();
                notify
                    .send(Notification::new(
                        NotifySeverity::Critical,
                        "REORG DETECTED".to_string(),
                        format!(
                            "Block {block} of {contract} left the canonical chain. \
                             Ingestion is halted until manually cleared."
                        ),
                    ))
                    .await
                    .ok();
            }
            IngestAlert::PollFailing { error } => {
                notify
                    .send(Notification::new(
                        NotifySeverity::Critical,
                        "Event polling failing".to_string(),
                        error,
                    ))
                    .await
                    .ok();
            }
            IngestAlert::LeaseLost => {
                warn!("Ingestor lease lost; a replacement instance will resume");
            }
        }
    }
}

/// Notification sink. Transports (Slack/email/phone) are external; the node
/// logs what it would deliver.
async fn log_notifications(mut notifications: mpsc::Receiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        match notification.severity {
            NotifySeverity::Critical => {
                error!(title = %notification.title, body = %notification.body, "NOTIFY")
            }
            NotifySeverity::Warning => {
                warn!(title = %notification.title, body = %notification.body, "NOTIFY")
            }
            NotifySeverity::Info => {
                info!(title = %notification.title, body = %notification.body, "NOTIFY")
            }
        }
    }
}
