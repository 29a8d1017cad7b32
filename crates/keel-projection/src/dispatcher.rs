//! Event dispatcher: routes decoded events into projection writes.
//!
//! Every handler's writes go through `Store::commit_event`, one transaction
//! per event together with the `event_processed` row, so replaying any
//! already-processed event leaves the projection unchanged. Handlers consult
//! current projection state and are commutative across contracts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use keel_core::{
    new_risk_event_id, Amount, ChainEvent, EventBody, FundProjection, RedemptionRequest,
    RedemptionStatus, RiskEvent, RiskLevel, Tier,
};
use keel_store::{
    AuditEntry, CommitOutcome, FlowDelta, HoldingDelta, ProjectionStore, ProjectionUpdate,
    RedemptionStore, Store,
};

use crate::effects::DomainEffect;
use crate::error::{ProjectionError, ProjectionResult};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Flows at or above this re-evaluate rebalance triggers.
    pub large_flow_threshold: Amount,
    /// Duplicate-suppression window for liquidity alerts.
    pub alert_cooldown: ChronoDuration,
    /// Accounting-identity drift beyond this is fatal.
    pub drift_tolerance_bps: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            large_flow_threshold: Amount::from_units(100_000),
            alert_cooldown: ChronoDuration::hours(1),
            drift_tolerance_bps: 200,
        }
    }
}

/// Routes events to projection handlers.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    effects: mpsc::Sender<DomainEffect>,
    config: DispatcherConfig,
    alert_cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        effects: mpsc::Sender<DomainEffect>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            effects,
            config,
            alert_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Process one confirmed event.
    ///
    /// Re-applying an already-processed `(tx_hash, log_index)` returns
    /// `AlreadyProcessed` with no state change and no side effects.
    pub async fn dispatch(&self, event: &ChainEvent) -> ProjectionResult<CommitOutcome> {
        let fund = self.store.fund().await?;
        let (update, effects) = self.build_update(event, fund).await?;

        if let Some(fund) = &update.fund {
            let drift = fund.invariant_drift_bps();
            if drift.inner() > self.config.drift_tolerance_bps {
                return Err(ProjectionError::InvariantViolated {
                    drift_bps: drift.inner(),
                });
            }
        }

        let outcome = self
            .store
            .commit_event(
                event.key,
                event.kind().as_str(),
                event.block_number,
                update,
            )
            .await?;

        match outcome {
            CommitOutcome::Applied => {
                debug!(key = %event.key, kind = %event.kind(), "Event applied");
                for effect in effects {
                    if self.effects.send(effect).await.is_err() {
                        warn!("Effect receiver dropped");
                    }
                }
            }
            CommitOutcome::AlreadyProcessed => {
                debug!(key = %event.key, "Replay dropped by event_processed");
            }
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_lines)]
    async fn build_update(
        &self,
        event: &ChainEvent,
        mut fund: FundProjection,
    ) -> ProjectionResult<(ProjectionUpdate, Vec<DomainEffect>)> {
        let mut update = ProjectionUpdate::default();
        let mut effects = Vec::new();
        let touch_fund = |fund: &mut FundProjection, block: u64| {
            fund.last_block = fund.last_block.max(block);
            fund.updated_at = Utc::now();
        };

        match &event.body {
            EventBody::DepositProcessed {
                owner,
                assets,
                shares,
            } => {
                fund.total_assets = fund.total_assets.saturating_add(*assets);
                fund.l1_cash = fund.l1_cash.saturating_add(*assets);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                update.flow = Some(FlowDelta {
                    deposits: *assets,
                    redemptions: Amount::ZERO,
                });
                update.audits.push(
                    AuditEntry::new("event.deposit_processed", "fund", "1")
                        .with_actor(format!("{owner:#x}"))
                        .with_detail(json!({
                            "assets": assets.to_string(),
                            "shares": shares.to_string(),
                        })),
                );
                if *assets >= self.config.large_flow_threshold {
                    effects.push(DomainEffect::LargeFlow { amount: *assets });
                }
            }

            EventBody::SharesLocked { shares, .. } => {
                fund.total_locked_shares = fund.total_locked_shares.saturating_add(*shares);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
            }
            EventBody::SharesUnlocked { shares, .. } | EventBody::SharesBurned { shares, .. } => {
                fund.total_locked_shares = fund.total_locked_shares.saturating_sub(*shares);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
            }

            EventBody::RedemptionFeeAdded { request_id, fee } => {
                fund.withdrawable_fees = fund.withdrawable_fees.saturating_add(*fee);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                if let Some(mut request) = self.store.redemption(*request_id).await? {
                    request.estimated_fee = request.estimated_fee.saturating_add(*fee);
                    request.updated_at = Utc::now();
                    update.redemption = Some(request);
                }
            }
            EventBody::RedemptionFeeReduced { request_id, fee } => {
                fund.withdrawable_fees = fund.withdrawable_fees.saturating_sub(*fee);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                if let Some(mut request) = self.store.redemption(*request_id).await? {
                    request.estimated_fee = request.estimated_fee.saturating_sub(*fee);
                    request.updated_at = Utc::now();
                    update.redemption = Some(request);
                }
            }

            EventBody::DailyLiabilityAdded { amount } => {
                fund.total_redemption_liability =
                    fund.total_redemption_liability.saturating_add(*amount);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
            }
            EventBody::LiabilityRemoved { amount } => {
                fund.total_redemption_liability =
                    fund.total_redemption_liability.saturating_sub(*amount);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
            }

            EventBody::RedemptionRequested {
                request_id,
                owner,
                receiver,
                shares,
                gross_amount,
                locked_nav,
                estimated_fee,
                channel,
                requires_approval,
                settlement_time,
                window_id,
            } => {
                let status = RedemptionRequest::initial_status(*requires_approval);
                let request = RedemptionRequest {
                    request_id: *request_id,
                    owner: *owner,
                    receiver: *receiver,
                    shares: *shares,
                    gross_amount: *gross_amount,
                    locked_nav: *locked_nav,
                    estimated_fee: *estimated_fee,
                    request_time: event.block_time,
                    settlement_time: *settlement_time,
                    channel: *channel,
                    requires_approval: *requires_approval,
                    window_id: *window_id,
                    voucher_token_id: None,
                    status,
                    settled_amount: None,
                    settled_fee: None,
                    settled_at: None,
                    approval_ticket_id: None,
                    updated_at: Utc::now(),
                };
                update.redemption = Some(request);
                update.audits.push(
                    AuditEntry::new(
                        "event.redemption_requested",
                        "redemption",
                        request_id.to_string(),
                    )
                    .with_actor(format!("{owner:#x}"))
                    .with_detail(json!({
                        "gross": gross_amount.to_string(),
                        "channel": channel.to_string(),
                        "requiresApproval": requires_approval,
                    })),
                );
                if *requires_approval {
                    effects.push(DomainEffect::RequestApproval {
                        request_id: *request_id,
                        owner: *owner,
                        gross_amount: *gross_amount,
                        channel: *channel,
                    });
                }
                if *gross_amount >= self.config.large_flow_threshold {
                    effects.push(DomainEffect::LargeFlow {
                        amount: *gross_amount,
                    });
                }
            }

            EventBody::RedemptionApproved { request_id, .. } => {
                if let Some(request) = self
                    .advance_redemption(*request_id, RedemptionStatus::Approved)
                    .await?
                {
                    update.redemption = Some(request);
                }
                effects.push(DomainEffect::RedemptionResolvedOnChain {
                    request_id: *request_id,
                    approved: true,
                });
            }
            EventBody::RedemptionRejected { request_id, reason } => {
                if let Some(request) = self
                    .advance_redemption(*request_id, RedemptionStatus::Rejected)
                    .await?
                {
                    update.redemption = Some(request);
                    update.audits.push(
                        AuditEntry::new(
                            "event.redemption_rejected",
                            "redemption",
                            request_id.to_string(),
                        )
                        .with_detail(json!({ "reason": reason })),
                    );
                }
                effects.push(DomainEffect::RedemptionResolvedOnChain {
                    request_id: *request_id,
                    approved: false,
                });
            }
            EventBody::RedemptionSettled {
                request_id,
                net_amount,
                fee,
            } => {
                if let Some(mut request) = self
                    .advance_redemption(*request_id, RedemptionStatus::Settled)
                    .await?
                {
                    request.settled_amount = Some(*net_amount);
                    request.settled_fee = Some(*fee);
                    request.settled_at = Some(event.block_time);
                    update.redemption = Some(request);
                }
                fund.total_assets = fund.total_assets.saturating_sub(*net_amount);
                fund.l1_cash = fund.l1_cash.saturating_sub(*net_amount);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                update.flow = Some(FlowDelta {
                    deposits: Amount::ZERO,
                    redemptions: *net_amount,
                });
            }

            EventBody::VoucherMinted {
                request_id,
                token_id,
                ..
            } => {
                if let Some(mut request) = self.store.redemption(*request_id).await? {
                    request.voucher_token_id = Some(*token_id);
                    request.updated_at = Utc::now();
                    update.redemption = Some(request);
                }
            }

            EventBody::NavUpdated {
                share_price,
                total_assets,
            } => {
                // NAV reprices the whole book: rescale tier values pro-rata
                // so the accounting identity holds until per-asset events
                // land.
                if !fund.total_assets.is_zero() {
                    let ratio = total_assets.ratio_bps(fund.total_assets);
                    fund.l1_cash = fund.l1_cash.mul_bps(ratio);
                    fund.l1_yield = fund.l1_yield.mul_bps(ratio);
                    fund.l2 = fund.l2.mul_bps(ratio);
                    fund.l3 = fund.l3.mul_bps(ratio);
                } else {
                    fund.l1_cash = *total_assets;
                }
                fund.total_assets = *total_assets;
                fund.share_price = *share_price;
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                update.nav_point = Some((event.block_time, *share_price));
                effects.push(DomainEffect::WakeRisk);
            }

            EventBody::EmergencyModeChanged { enabled } => {
                fund.emergency_mode = *enabled;
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                update.risk_event = Some(RiskEvent {
                    id: new_risk_event_id(),
                    level: if *enabled {
                        RiskLevel::Critical
                    } else {
                        RiskLevel::Elevated
                    },
                    source: "emergency_mode".to_string(),
                    message: format!("Emergency mode set to {enabled} on-chain"),
                    details: json!({ "enabled": enabled }),
                    created_at: Utc::now(),
                });
                effects.push(DomainEffect::EmergencyMode { enabled: *enabled });
            }

            EventBody::LowLiquidityAlert {
                ratio,
                threshold,
                available,
            }
            | EventBody::CriticalLiquidityAlert {
                ratio,
                threshold,
                available,
            } => {
                let critical = matches!(event.body, EventBody::CriticalLiquidityAlert { .. });
                let kind = if critical { "critical_liquidity" } else { "low_liquidity" };
                if self.cooldown_passed(kind) {
                    update.risk_event = Some(RiskEvent {
                        id: new_risk_event_id(),
                        level: if critical {
                            RiskLevel::Critical
                        } else {
                            RiskLevel::High
                        },
                        source: kind.to_string(),
                        message: format!(
                            "On-chain liquidity alert: ratio {ratio} below threshold {threshold}"
                        ),
                        details: json!({
                            "ratio": ratio.inner(),
                            "threshold": threshold.inner(),
                            "available": available.to_string(),
                        }),
                        created_at: Utc::now(),
                    });
                    effects.push(DomainEffect::LiquidityAlert {
                        critical,
                        ratio: *ratio,
                        threshold: *threshold,
                        available: *available,
                    });
                } else {
                    debug!(kind, "Liquidity alert suppressed by cooldown");
                }
            }

            EventBody::AssetPurchased {
                asset,
                tier,
                usdt_amount,
                ..
            } => {
                fund.l1_cash = fund.l1_cash.saturating_sub(*usdt_amount);
                match tier {
                    Tier::L1 => fund.l1_yield = fund.l1_yield.saturating_add(*usdt_amount),
                    Tier::L2 => fund.l2 = fund.l2.saturating_add(*usdt_amount),
                    Tier::L3 => fund.l3 = fund.l3.saturating_add(*usdt_amount),
                }
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                update.holding = Some(HoldingDelta {
                    asset: *asset,
                    tier: *tier,
                    credit: *usdt_amount,
                    debit: Amount::ZERO,
                });
            }
            EventBody::AssetRedeemed {
                asset,
                tier,
                usdt_amount,
                ..
            } => {
                match tier {
                    Tier::L1 => fund.l1_yield = fund.l1_yield.saturating_sub(*usdt_amount),
                    Tier::L2 => fund.l2 = fund.l2.saturating_sub(*usdt_amount),
                    Tier::L3 => fund.l3 = fund.l3.saturating_sub(*usdt_amount),
                }
                fund.l1_cash = fund.l1_cash.saturating_add(*usdt_amount);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
                update.holding = Some(HoldingDelta {
                    asset: *asset,
                    tier: *tier,
                    credit: Amount::ZERO,
                    debit: *usdt_amount,
                });
            }

            EventBody::BufferPoolRebalanced {
                from_tier,
                to_tier,
                amount,
            } => {
                let take = |fund: &mut FundProjection, tier: Tier, amount: Amount| match tier {
                    Tier::L1 => fund.l1_cash = fund.l1_cash.saturating_sub(amount),
                    Tier::L2 => fund.l2 = fund.l2.saturating_sub(amount),
                    Tier::L3 => fund.l3 = fund.l3.saturating_sub(amount),
                };
                let give = |fund: &mut FundProjection, tier: Tier, amount: Amount| match tier {
                    Tier::L1 => fund.l1_cash = fund.l1_cash.saturating_add(amount),
                    Tier::L2 => fund.l2 = fund.l2.saturating_add(amount),
                    Tier::L3 => fund.l3 = fund.l3.saturating_add(amount),
                };
                take(&mut fund, *from_tier, *amount);
                give(&mut fund, *to_tier, *amount);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
            }

            EventBody::ManagementFeeCollected { amount }
            | EventBody::PerformanceFeeCollected { amount } => {
                fund.withdrawable_fees = fund.withdrawable_fees.saturating_add(*amount);
                touch_fund(&mut fund, event.block_number);
                update.fund = Some(fund);
            }

            EventBody::WaterfallLiquidation {
                amount_needed,
                liquidated,
                max_tier,
            } => {
                // Per-asset AssetRedeemed events carry the accounting; this
                // summary event is recorded for the audit trail.
                update.risk_event = Some(RiskEvent {
                    id: new_risk_event_id(),
                    level: RiskLevel::High,
                    source: "waterfall_liquidation".to_string(),
                    message: format!(
                        "Waterfall liquidated {liquidated} of {amount_needed} needed up to {max_tier}"
                    ),
                    details: json!({
                        "amountNeeded": amount_needed.to_string(),
                        "liquidated": liquidated.to_string(),
                        "maxTier": max_tier.to_string(),
                    }),
                    created_at: Utc::now(),
                });
            }
            EventBody::SettlementWaterfallTriggered {
                amount_needed,
                max_tier,
            } => {
                update.risk_event = Some(RiskEvent {
                    id: new_risk_event_id(),
                    level: RiskLevel::High,
                    source: "settlement_waterfall".to_string(),
                    message: format!(
                        "Settlement waterfall triggered for {amount_needed} up to {max_tier}"
                    ),
                    details: json!({ "amountNeeded": amount_needed.to_string() }),
                    created_at: Utc::now(),
                });
            }

            EventBody::AssetAdded { asset, tier } => {
                update.holding = Some(HoldingDelta {
                    asset: *asset,
                    tier: *tier,
                    credit: Amount::ZERO,
                    debit: Amount::ZERO,
                });
                update.audits.push(
                    AuditEntry::new("event.asset_added", "asset", format!("{asset:#x}"))
                        .with_detail(json!({ "tier": tier.to_string() })),
                );
            }

            // Parameter and quota changes mirror into the audit trail only;
            // the projection row carries no contract config.
            EventBody::AssetRemoved { asset } => {
                update.audits.push(AuditEntry::new(
                    "event.asset_removed",
                    "asset",
                    format!("{asset:#x}"),
                ));
            }
            EventBody::AssetAllocationUpdated { asset, allocation } => {
                update.audits.push(
                    AuditEntry::new(
                        "event.asset_allocation_updated",
                        "asset",
                        format!("{asset:#x}"),
                    )
                    .with_detail(json!({ "allocation": allocation.inner() })),
                );
            }
            EventBody::BaseRedemptionFeeUpdated { fee }
            | EventBody::EmergencyPenaltyFeeUpdated { fee } => {
                update.audits.push(
                    AuditEntry::new("event.fee_updated", "config", event.kind().as_str())
                        .with_detail(json!({ "fee": fee.inner() })),
                );
            }
            EventBody::VoucherThresholdUpdated { threshold_secs } => {
                update.audits.push(
                    AuditEntry::new("event.config_updated", "config", event.kind().as_str())
                        .with_detail(json!({ "thresholdSecs": threshold_secs })),
                );
            }
            EventBody::StandardQuotaRatioUpdated { ratio } => {
                update.audits.push(
                    AuditEntry::new("event.config_updated", "config", event.kind().as_str())
                        .with_detail(json!({ "ratio": ratio.inner() })),
                );
            }
            EventBody::PendingApprovalSharesAdded { owner, shares }
            | EventBody::PendingApprovalSharesRemoved { owner, shares }
            | EventBody::PendingApprovalSharesConverted { owner, shares } => {
                update.audits.push(
                    AuditEntry::new("event.pending_shares", "fund", event.kind().as_str())
                        .with_actor(format!("{owner:#x}"))
                        .with_detail(json!({ "shares": shares.to_string() })),
                );
            }
            EventBody::EmergencyQuotaRefreshed { quota }
            | EventBody::EmergencyQuotaRestored { quota } => {
                update.audits.push(
                    AuditEntry::new("event.quota_updated", "config", event.kind().as_str())
                        .with_detail(json!({ "quota": quota.to_string() })),
                );
            }
            EventBody::LockedMintAssetsReset { amount } => {
                update.audits.push(
                    AuditEntry::new("event.locked_mint_reset", "fund", event.kind().as_str())
                        .with_detail(json!({ "amount": amount.to_string() })),
                );
            }
        }

        Ok((update, effects))
    }

    /// Load a redemption and advance its status if the edge is valid.
    ///
    /// Invalid edges (stale or cross-ordered events) are logged and skipped
    /// so the event still marks processed.
    async fn advance_redemption(
        &self,
        request_id: u64,
        to: RedemptionStatus,
    ) -> ProjectionResult<Option<RedemptionRequest>> {
        let Some(mut request) = self.store.redemption(request_id).await? else {
            warn!(request_id, "Event for unknown redemption request");
            return Ok(None);
        };
        match request.status.transition(to) {
            Ok(next) => {
                request.status = next;
                request.updated_at = Utc::now();
                info!(request_id, status = %next, "Redemption advanced");
                Ok(Some(request))
            }
            Err(e) => {
                warn!(request_id, error = %e, "Ignoring invalid redemption transition");
                Ok(None)
            }
        }
    }

    /// True when the alert kind is out of its suppression window; arms the
    /// cooldown as a side effect.
    fn cooldown_passed(&self, kind: &str) -> bool {
        let mut cooldowns = self.alert_cooldowns.lock();
        let now = Utc::now();
        match cooldowns.get(kind) {
            Some(last) if now - *last < self.config.alert_cooldown => false,
            _ => {
                cooldowns.insert(kind.to_string(), now);
                true
            }
        }
    }
}
