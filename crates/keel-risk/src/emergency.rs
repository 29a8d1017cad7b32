//! Emergency driver and recovery watcher.
//!
//! Exactly one driver runs per incident id, enforced by an incident-scoped
//! lease that survives rolling restarts. The driver commits the emergency
//! mode flips, raises the alarm, covers the liquidity gap through a waterfall
//! plan, and watches for recovery: two consecutive snapshots at ELEVATED or
//! lower close the incident.

use alloy::primitives::Address;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel_chain::{ChainGateway, SendRequest, SignerRegistry, SignerRole};
use keel_core::{
    new_risk_event_id, ForecastHorizon, Notification, NotifySeverity, RiskEvent, RiskLevel,
    TaskKind,
};
use keel_rebalance::RebalanceEngine;
use keel_store::{LeaseStore, RiskStore, Store};
use keel_tasks::{TaskEnvelope, TaskQueue};

use crate::error::{RiskError, RiskResult};
use crate::forecast::Forecaster;

/// Emergency driver configuration.
#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    /// Recovery watcher interval.
    pub watch_interval: Duration,
    /// Incident lease TTL, seconds.
    pub lease_ttl_secs: u64,
    /// Consecutive calm snapshots required to close the incident.
    pub calm_snapshots: usize,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            watch_interval: Duration::from_secs(300),
            lease_ttl_secs: 30,
            calm_snapshots: 2,
        }
    }
}

/// Drives one emergency incident at a time.
pub struct EmergencyDriver {
    config: EmergencyConfig,
    store: Arc<dyn Store>,
    leases: Arc<dyn LeaseStore>,
    gateway: Arc<dyn ChainGateway>,
    signers: Arc<SignerRegistry>,
    vault: Address,
    rebalance: Arc<RebalanceEngine>,
    forecaster: Arc<Forecaster>,
    notifications: tokio::sync::mpsc::Sender<Notification>,
    queue: TaskQueue,
    instance_id: String,
}

impl EmergencyDriver {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: EmergencyConfig,
        store: Arc<dyn Store>,
        leases: Arc<dyn LeaseStore>,
        gateway: Arc<dyn ChainGateway>,
        signers: Arc<SignerRegistry>,
        vault: Address,
        rebalance: Arc<RebalanceEngine>,
        forecaster: Arc<Forecaster>,
        notifications: tokio::sync::mpsc::Sender<Notification>,
        queue: TaskQueue,
    ) -> Self {
        Self {
            config,
            store,
            leases,
            gateway,
            signers,
            vault,
            rebalance,
            forecaster,
            notifications,
            queue,
            instance_id: format!("driver-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Run one incident to completion (or shutdown).
    ///
    /// Returns `IncidentHeld` when another driver owns the incident lease.
    pub async fn run_incident(
        &self,
        incident_id: &str,
        shutdown: CancellationToken,
    ) -> RiskResult<()> {
        let lease_key = format!("incident:{incident_id}");
        let acquired = self
            .leases
            .acquire(&lease_key, &self.instance_id, self.config.lease_ttl_secs)
            .await?;
        if !acquired {
            return Err(RiskError::IncidentHeld(incident_id.to_string()));
        }
        info!(incident = %incident_id, "Emergency driver engaged");

        self.store
            .append_risk_event(&RiskEvent {
                id: new_risk_event_id(),
                level: RiskLevel::Critical,
                source: "emergency_driver".to_string(),
                message: format!("Incident {incident_id} opened"),
                details: json!({ "incidentId": incident_id }),
                created_at: Utc::now(),
            })
            .await?;

        // Containment steps run concurrently: mode flip + pause, the page,
        // and the gap assessment.
        let containment = self.contain();
        let page = self.notifications.send(Notification::new(
            NotifySeverity::Critical,
            format!("EMERGENCY: incident {incident_id}"),
            "Emergency mode engaged; vault paused; assessing liquidity gap".to_string(),
        ));
        let (containment, _) = tokio::join!(containment, page);
        containment?;

        self.cover_gap(incident_id).await?;
        self.watch_recovery(incident_id, &lease_key, shutdown).await
    }

    /// Commit `setEmergencyMode(true)` and `pause()` concurrently.
    async fn contain(&self) -> RiskResult<()> {
        let signer = self.signers.signer_for_role(SignerRole::Admin)?;
        let set_mode = self.gateway.send(SendRequest::new(
            self.vault,
            "setEmergencyMode(bool)",
            json!([true]),
            signer.clone(),
        ));
        let pause = self.gateway.send(SendRequest::new(
            self.vault,
            "pause()",
            json!([]),
            signer,
        ));
        let (set_mode, pause) = tokio::join!(set_mode, pause);
        set_mode?;
        pause?;
        info!("Vault paused and emergency mode set");
        Ok(())
    }

    /// Assess the 7-day gap and run a waterfall plan for the shortfall.
    async fn cover_gap(&self, incident_id: &str) -> RiskResult<()> {
        let forecast = self.forecaster.forecast(ForecastHorizon::D7).await?;
        if forecast.liquidity_gap.is_zero() {
            info!(incident = %incident_id, "No liquidity gap to cover");
            return Ok(());
        }

        let plan_id = self
            .rebalance
            .emergency_waterfall(forecast.liquidity_gap)
            .await?;
        match self.rebalance.execute(&plan_id).await {
            Ok(status) => {
                info!(incident = %incident_id, plan = %plan_id, %status, "Waterfall plan finished");
            }
            Err(e) => {
                // The incident stays open; the watcher keeps running and
                // operators are already paged.
                error!(incident = %incident_id, plan = %plan_id, error = %e, "Waterfall plan failed");
            }
        }
        Ok(())
    }

    /// 5-minute recovery watcher. Terminates when the observed level is
    /// ELEVATED or lower for two consecutive snapshots.
    async fn watch_recovery(
        &self,
        incident_id: &str,
        lease_key: &str,
        shutdown: CancellationToken,
    ) -> RiskResult<()> {
        let mut ticker = tokio::time::interval(self.config.watch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(incident = %incident_id, "Watcher shutting down, lease released");
                    self.leases.release(lease_key, &self.instance_id).await?;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if !self
                        .leases
                        .renew(lease_key, &self.instance_id, self.config.lease_ttl_secs)
                        .await?
                    {
                        warn!(incident = %incident_id, "Incident lease lost, watcher exiting");
                        return Ok(());
                    }

                    let recent = self
                        .store
                        .recent_snapshots(self.config.calm_snapshots as i64)
                        .await?;
                    let calm = recent.len() >= self.config.calm_snapshots
                        && recent.iter().all(|s| s.level <= RiskLevel::Elevated);
                    if calm {
                        self.close_incident(incident_id, lease_key).await?;
                        return Ok(());
                    }
                    info!(incident = %incident_id, observed = recent.len(), "Still in emergency");
                }
            }
        }
    }

    async fn close_incident(&self, incident_id: &str, lease_key: &str) -> RiskResult<()> {
        info!(incident = %incident_id, "Risk recovered, closing incident");
        let signer = self.signers.signer_for_role(SignerRole::Admin)?;
        let clear_mode = self.gateway.send(SendRequest::new(
            self.vault,
            "setEmergencyMode(bool)",
            json!([false]),
            signer.clone(),
        ));
        let unpause = self.gateway.send(SendRequest::new(
            self.vault,
            "unpause()",
            json!([]),
            signer,
        ));
        let (clear_mode, unpause) = tokio::join!(clear_mode, unpause);
        clear_mode?;
        unpause?;

        self.store
            .append_risk_event(&RiskEvent {
                id: new_risk_event_id(),
                level: RiskLevel::Elevated,
                source: "emergency_driver".to_string(),
                message: format!("Incident {incident_id} closed"),
                details: json!({ "incidentId": incident_id }),
                created_at: Utc::now(),
            })
            .await?;
        self.queue.push(TaskEnvelope::new(
            format!("incident_report:{incident_id}"),
            TaskKind::IncidentReport {
                incident_id: incident_id.to_string(),
            },
        ));
        self.leases.release(lease_key, &self.instance_id).await?;
        Ok(())
    }
}

/// Build an incident id from a risk snapshot timestamp.
#[must_use]
pub fn incident_id_for(at: chrono::DateTime<Utc>) -> String {
    format!("INC-{}", at.format("%Y%m%d%H%M%S"))
}
