//! Risk monitor: snapshot appending and the leveled response.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use keel_core::{
    new_risk_event_id, Amount, Notification, NotifySeverity, RebalanceTrigger, RiskEvent,
    RiskLevel, RiskSnapshot,
};
use keel_store::{ProjectionStore, RedemptionStore, RiskStore, Store};

use crate::error::RiskResult;
use crate::indicators::{evaluate, overall_level, score, IndicatorConfig, IndicatorInputs};

/// Signals the monitor raises for the node to route.
#[derive(Debug, Clone)]
pub enum RiskSignal {
    /// Invoke the rebalance engine with the LIQUIDITY trigger.
    TriggerRebalance(RebalanceTrigger),
    /// Schedule L3 waterfall preparation for the 7-day gap.
    PrepareWaterfall { shortfall: Amount },
    /// Start (or continue) an emergency incident.
    Emergency { snapshot: RiskSnapshot },
}

/// The risk monitor.
pub struct RiskMonitor {
    store: Arc<dyn Store>,
    config: IndicatorConfig,
    signals: mpsc::Sender<RiskSignal>,
    notifications: mpsc::Sender<Notification>,
    /// Off-chain gate on new STANDARD redemption acceptance. Requests already
    /// on-chain pass through; command-level intake consults this flag.
    standard_intake_paused: Arc<AtomicBool>,
    /// L1 floor (fraction) below which ELEVATED already triggers rebalancing.
    l1_low: f64,
}

impl RiskMonitor {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        config: IndicatorConfig,
        signals: mpsc::Sender<RiskSignal>,
        notifications: mpsc::Sender<Notification>,
        l1_low: f64,
    ) -> Self {
        Self {
            store,
            config,
            signals,
            notifications,
            standard_intake_paused: Arc::new(AtomicBool::new(false)),
            l1_low,
        }
    }

    /// Shared intake gate, consulted by the command surface.
    #[must_use]
    pub fn intake_gate(&self) -> Arc<AtomicBool> {
        self.standard_intake_paused.clone()
    }

    /// One evaluation tick: compute indicators, append the snapshot, and run
    /// the leveled response.
    pub async fn tick(&self) -> RiskResult<RiskSnapshot> {
        let inputs = self.gather().await?;
        let readings = evaluate(&self.config, &inputs);
        let level = overall_level(&readings);
        let snapshot = RiskSnapshot {
            timestamp: Utc::now(),
            level,
            score: score(&self.config, &readings),
            readings,
        };
        self.store.append_snapshot(&snapshot).await?;

        match level {
            RiskLevel::Normal => {
                if self.standard_intake_paused.swap(false, Ordering::SeqCst) {
                    info!("Risk back to NORMAL, standard intake resumed");
                }
            }
            RiskLevel::Elevated => {
                self.respond_elevated(&snapshot).await?;
            }
            RiskLevel::High => {
                self.respond_elevated(&snapshot).await?;
                self.respond_high(&snapshot, &inputs).await?;
            }
            RiskLevel::Critical => {
                self.respond_elevated(&snapshot).await?;
                self.respond_high(&snapshot, &inputs).await?;
                warn!(score = snapshot.score, "CRITICAL risk level, raising emergency");
                self.signal(RiskSignal::Emergency {
                    snapshot: snapshot.clone(),
                })
                .await;
            }
        }
        Ok(snapshot)
    }

    async fn gather(&self) -> RiskResult<IndicatorInputs> {
        let now = Utc::now();
        Ok(IndicatorInputs {
            fund: self.store.fund().await?,
            holdings: self.store.holdings().await?,
            stats: self.store.redemption_stats().await?,
            nav_history: self
                .store
                .nav_history(now - ChronoDuration::hours(24))
                .await?,
            pending_outflow_7d: self
                .store
                .pending_outflow_within(now + ChronoDuration::days(7))
                .await?,
            now,
        })
    }

    async fn respond_elevated(&self, snapshot: &RiskSnapshot) -> RiskResult<()> {
        self.notifications
            .send(Notification::new(
                NotifySeverity::Warning,
                format!("Risk level {}", snapshot.level),
                format!("Composite score {:.1}", snapshot.score),
            ))
            .await
            .ok();

        let l1_ratio = snapshot
            .readings
            .iter()
            .find(|r| r.kind == keel_core::IndicatorKind::L1Ratio)
            .map(|r| r.value)
            .unwrap_or(1.0);
        if l1_ratio < self.l1_low {
            info!(l1_ratio, "L1 under its floor, invoking rebalance");
            self.signal(RiskSignal::TriggerRebalance(RebalanceTrigger::Liquidity))
                .await;
        }

        Ok(())
    }

    async fn respond_high(
        &self,
        snapshot: &RiskSnapshot,
        inputs: &IndicatorInputs,
    ) -> RiskResult<()> {
        if !self.standard_intake_paused.swap(true, Ordering::SeqCst) {
            warn!("Risk HIGH: pausing new STANDARD redemption acceptance");
            self.store
                .append_risk_event(&RiskEvent {
                    id: new_risk_event_id(),
                    level: snapshot.level,
                    source: "risk_monitor".to_string(),
                    message: "Standard redemption intake paused".to_string(),
                    details: json!({ "score": snapshot.score }),
                    created_at: Utc::now(),
                })
                .await?;
        }

        let liquid = inputs.fund.l1_total().saturating_add(inputs.fund.l2);
        let shortfall = inputs.pending_outflow_7d.saturating_sub(liquid);
        if !shortfall.is_zero() {
            self.signal(RiskSignal::PrepareWaterfall { shortfall }).await;
        }

        self.notifications
            .send(Notification::new(
                NotifySeverity::Critical,
                "Fund manager attention required".to_string(),
                format!(
                    "Risk {} with score {:.1}; 7d shortfall {}",
                    snapshot.level, snapshot.score, shortfall
                ),
            ))
            .await
            .ok();
        Ok(())
    }

    async fn signal(&self, signal: RiskSignal) {
        if self.signals.send(signal).await.is_err() {
            warn!("Risk signal receiver dropped");
        }
    }
}
