//! Postgres store.
//!
//! Entities keep their queryable fields in typed columns and the full record
//! in a JSONB `body`; every event handler's writes commit in one transaction
//! with the `event_processed` row. Amounts are NUMERIC(78,0).

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::warn;

use keel_core::{
    ActionResult, Amount, ApprovalRecord, ApprovalTicket, ApproverRole, EventKey, FundProjection,
    PlanStatus, RebalancePlan, RedemptionRequest, RedemptionStatus, ReferenceType, RiskEvent,
    RiskSnapshot, Tier, TicketResult, TicketStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::ticket_logic::apply_ticket_action;
use crate::traits::{
    AuditEntry, AuditStore, Checkpoint, CheckpointStore, CommitOutcome, FlowRates, Holding,
    PlanStore, ProjectionStore, ProjectionUpdate, RedemptionStats, RedemptionStore, RiskStore,
    TicketActOutcome, TicketStore,
};

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Corrupt(format!("migration failed: {e}")))?;
        Ok(())
    }
}

// ---- value plumbing --------------------------------------------------------

fn big(amount: Amount) -> BigDecimal {
    // Amounts are decimal strings of a U256; NUMERIC(78,0) holds the range.
    BigDecimal::from_str(&amount.to_string()).expect("amount is a valid decimal")
}

fn amount_col(row: &PgRow, col: &str) -> StoreResult<Amount> {
    let value: BigDecimal = row.try_get(col)?;
    // NUMERIC(78,0) columns are integers; normalize the scale so Display
    // yields plain digits.
    value
        .with_scale(0)
        .to_string()
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("bad amount in {col}: {e}")))
}

fn addr_text(address: Address) -> String {
    format!("{address:#x}")
}

fn parse_addr(s: &str) -> StoreResult<Address> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad address {s}")))
}

fn hash_text(hash: B256) -> String {
    format!("{hash:#x}")
}

fn parse_hash(s: &str) -> StoreResult<B256> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad hash {s}")))
}

fn from_body<T: serde::de::DeserializeOwned>(row: &PgRow) -> StoreResult<T> {
    let body: serde_json::Value = row.try_get("body")?;
    Ok(serde_json::from_value(body)?)
}

fn to_body<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

type PgTx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

async fn write_fund(tx: &mut PgTx<'_>, fund: &FundProjection) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO fund_projection
            (id, total_assets, l1_cash, l1_yield, l2, l3,
             total_redemption_liability, total_locked_shares, withdrawable_fees,
             share_price, emergency_mode, last_block, updated_at)
        VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO UPDATE SET
            total_assets = EXCLUDED.total_assets,
            l1_cash = EXCLUDED.l1_cash,
            l1_yield = EXCLUDED.l1_yield,
            l2 = EXCLUDED.l2,
            l3 = EXCLUDED.l3,
            total_redemption_liability = EXCLUDED.total_redemption_liability,
            total_locked_shares = EXCLUDED.total_locked_shares,
            withdrawable_fees = EXCLUDED.withdrawable_fees,
            share_price = EXCLUDED.share_price,
            emergency_mode = EXCLUDED.emergency_mode,
            last_block = GREATEST(fund_projection.last_block, EXCLUDED.last_block),
            updated_at = EXCLUDED.updated_at
        ",
    )
    .bind(big(fund.total_assets))
    .bind(big(fund.l1_cash))
    .bind(big(fund.l1_yield))
    .bind(big(fund.l2))
    .bind(big(fund.l3))
    .bind(big(fund.total_redemption_liability))
    .bind(big(fund.total_locked_shares))
    .bind(big(fund.withdrawable_fees))
    .bind(big(fund.share_price))
    .bind(fund.emergency_mode)
    .bind(fund.last_block as i64)
    .bind(fund.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_redemption(tx: &mut PgTx<'_>, request: &RedemptionRequest) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO redemption_requests
            (request_id, status, channel, settlement_time, gross_amount,
             settled_at, settled_amount, body, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (request_id) DO UPDATE SET
            status = EXCLUDED.status,
            settlement_time = EXCLUDED.settlement_time,
            settled_at = EXCLUDED.settled_at,
            settled_amount = EXCLUDED.settled_amount,
            body = EXCLUDED.body,
            updated_at = NOW()
        ",
    )
    .bind(request.request_id as i64)
    .bind(request.status.to_string())
    .bind(request.channel.to_string())
    .bind(request.settlement_time)
    .bind(big(request.gross_amount))
    .bind(request.settled_at)
    .bind(request.settled_amount.map(big))
    .bind(to_body(request)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_audit(tx: &mut PgTx<'_>, entry: &AuditEntry) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO audit_logs (action, resource_type, resource_id, actor, detail)
        VALUES ($1, $2, $3, $4, $5)
        ",
    )
    .bind(&entry.action)
    .bind(&entry.resource_type)
    .bind(&entry.resource_id)
    .bind(&entry.actor)
    .bind(&entry.detail)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_risk_event(tx: &mut PgTx<'_>, event: &RiskEvent) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO risk_events (id, level, source, message, details, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO NOTHING
        ",
    )
    .bind(&event.id)
    .bind(event.level.to_string())
    .bind(&event.source)
    .bind(&event.message)
    .bind(&event.details)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn read_fund(row: &PgRow) -> StoreResult<FundProjection> {
    Ok(FundProjection {
        total_assets: amount_col(row, "total_assets")?,
        l1_cash: amount_col(row, "l1_cash")?,
        l1_yield: amount_col(row, "l1_yield")?,
        l2: amount_col(row, "l2")?,
        l3: amount_col(row, "l3")?,
        total_redemption_liability: amount_col(row, "total_redemption_liability")?,
        total_locked_shares: amount_col(row, "total_locked_shares")?,
        withdrawable_fees: amount_col(row, "withdrawable_fees")?,
        share_price: amount_col(row, "share_price")?,
        emergency_mode: row.try_get("emergency_mode")?,
        last_block: row.try_get::<i64, _>("last_block")? as u64,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ProjectionStore for PgStore {
    async fn fund(&self) -> StoreResult<FundProjection> {
        let row = sqlx::query("SELECT * FROM fund_projection WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => read_fund(&row),
            None => Ok(FundProjection::genesis()),
        }
    }

    async fn commit_event(
        &self,
        key: EventKey,
        kind: &str,
        block_number: u64,
        update: ProjectionUpdate,
    ) -> StoreResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO event_processed (tx_hash, log_index, kind, block_number)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tx_hash, log_index) DO NOTHING
            ",
        )
        .bind(hash_text(key.tx_hash))
        .bind(key.log_index as i64)
        .bind(kind)
        .bind(block_number as i64)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::AlreadyProcessed);
        }

        if let Some(mut fund) = update.fund {
            fund.last_block = fund.last_block.max(block_number);
            write_fund(&mut tx, &fund).await?;
        }
        if let Some(redemption) = update.redemption {
            write_redemption(&mut tx, &redemption).await?;
        }
        if let Some(delta) = update.holding {
            sqlx::query(
                r"
                INSERT INTO holdings (asset, tier, value, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (asset) DO UPDATE SET
                    tier = EXCLUDED.tier,
                    value = GREATEST(holdings.value + $3 - $4, 0),
                    updated_at = NOW()
                ",
            )
            .bind(addr_text(delta.asset))
            .bind(delta.tier.to_string())
            .bind(big(delta.credit))
            .bind(big(delta.debit))
            .execute(&mut *tx)
            .await?;
        }
        if let Some((at, price)) = update.nav_point {
            sqlx::query("INSERT INTO nav_snapshots (ts, share_price) VALUES ($1, $2)")
                .bind(at)
                .bind(big(price))
                .execute(&mut *tx)
                .await?;
        }
        if let Some(event) = update.risk_event {
            write_risk_event(&mut tx, &event).await?;
        }
        if let Some(flow) = update.flow {
            sqlx::query(
                r"
                INSERT INTO flow_daily (day, deposits, redemptions)
                VALUES (CURRENT_DATE, $1, $2)
                ON CONFLICT (day) DO UPDATE SET
                    deposits = flow_daily.deposits + EXCLUDED.deposits,
                    redemptions = flow_daily.redemptions + EXCLUDED.redemptions
                ",
            )
            .bind(big(flow.deposits))
            .bind(big(flow.redemptions))
            .execute(&mut *tx)
            .await?;
        }
        for entry in &update.audits {
            write_audit(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Applied)
    }

    async fn put_fund(&self, fund: &FundProjection) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        write_fund(&mut tx, fund).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn holdings(&self) -> StoreResult<Vec<Holding>> {
        let rows = sqlx::query("SELECT asset, tier, value FROM holdings")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let tier = match row.try_get::<String, _>("tier")?.as_str() {
                    "L1" => Tier::L1,
                    "L2" => Tier::L2,
                    "L3" => Tier::L3,
                    other => return Err(StoreError::Corrupt(format!("bad tier {other}"))),
                };
                Ok(Holding {
                    asset: parse_addr(&row.try_get::<String, _>("asset")?)?,
                    tier,
                    value: amount_col(row, "value")?,
                })
            })
            .collect()
    }

    async fn nav_history(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(DateTime<Utc>, Amount)>> {
        let rows =
            sqlx::query("SELECT ts, share_price FROM nav_snapshots WHERE ts >= $1 ORDER BY ts")
                .bind(since)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("ts")?, amount_col(row, "share_price")?)))
            .collect()
    }

    async fn flow_rates(&self, window_days: u32) -> StoreResult<FlowRates> {
        let total = self.fund().await?.total_assets;
        if total.is_zero() {
            return Ok(FlowRates::default());
        }
        let row = sqlx::query(
            r"
            SELECT COALESCE(SUM(deposits), 0) AS deposits,
                   COALESCE(SUM(redemptions), 0) AS redemptions
            FROM flow_daily
            WHERE day >= CURRENT_DATE - $1::int
            ",
        )
        .bind(window_days as i32)
        .fetch_one(&self.pool)
        .await?;
        let deposits = amount_col(&row, "deposits")?;
        let redemptions = amount_col(&row, "redemptions")?;
        let annualize = 365.0 / window_days.max(1) as f64;
        Ok(FlowRates {
            redemption_rate: redemptions.to_f64_lossy() / total.to_f64_lossy() * annualize,
            deposit_rate: deposits.to_f64_lossy() / total.to_f64_lossy() * annualize,
        })
    }
}

#[async_trait]
impl RedemptionStore for PgStore {
    async fn redemption(&self, request_id: u64) -> StoreResult<Option<RedemptionRequest>> {
        let row = sqlx::query("SELECT body FROM redemption_requests WHERE request_id = $1")
            .bind(request_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| from_body(&row)).transpose()
    }

    async fn upsert_redemption(&self, request: &RedemptionRequest) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        write_redemption(&mut tx, request).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pending_outflow_within(&self, until: DateTime<Utc>) -> StoreResult<Amount> {
        let row = sqlx::query(
            r"
            SELECT COALESCE(SUM(gross_amount), 0) AS total
            FROM redemption_requests
            WHERE settlement_time <= $1
              AND status NOT IN ('SETTLED', 'CANCELLED')
            ",
        )
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        amount_col(&row, "total")
    }

    async fn list_by_status(
        &self,
        status: RedemptionStatus,
        limit: i64,
    ) -> StoreResult<Vec<RedemptionRequest>> {
        let rows = sqlx::query(
            r"
            SELECT body FROM redemption_requests
            WHERE status = $1
            ORDER BY request_id
            LIMIT $2
            ",
        )
        .bind(status.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(from_body).collect()
    }

    async fn redemption_stats(&self) -> StoreResult<RedemptionStats> {
        let row = sqlx::query(
            r"
            SELECT
              COUNT(*) FILTER (WHERE status IN ('PENDING', 'PENDING_APPROVAL', 'APPROVED'))
                AS open_count,
              COUNT(*) FILTER (WHERE status = 'PENDING_APPROVAL') AS pending_approval_count,
              COALESCE(SUM(settled_amount)
                FILTER (WHERE status = 'SETTLED' AND settled_at >= $1), 0) AS settled_24h,
              COALESCE(SUM(settled_amount)
                FILTER (WHERE status = 'SETTLED' AND settled_at >= $2), 0) AS settled_7d
            FROM redemption_requests
            ",
        )
        .bind(Utc::now() - ChronoDuration::hours(24))
        .bind(Utc::now() - ChronoDuration::days(7))
        .fetch_one(&self.pool)
        .await?;
        Ok(RedemptionStats {
            open_count: row.try_get::<i64, _>("open_count")? as u64,
            pending_approval_count: row.try_get::<i64, _>("pending_approval_count")? as u64,
            settled_24h: amount_col(&row, "settled_24h")?,
            settled_7d: amount_col(&row, "settled_7d")?,
        })
    }
}

async fn store_ticket(tx: &mut PgTx<'_>, ticket: &ApprovalTicket) -> StoreResult<()> {
    sqlx::query(
        r"
        UPDATE approval_tickets
        SET status = $2, body = $3, updated_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(&ticket.id)
    .bind(ticket.status.to_string())
    .bind(to_body(ticket)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl TicketStore for PgStore {
    async fn ticket(&self, id: &str) -> StoreResult<Option<ApprovalTicket>> {
        let row = sqlx::query("SELECT body FROM approval_tickets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| from_body(&row)).transpose()
    }

    async fn open_ticket_for_reference(
        &self,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            r"
            SELECT id FROM approval_tickets
            WHERE reference_type = $1 AND reference_id = $2
              AND status IN ('PENDING', 'PARTIALLY_APPROVED')
            LIMIT 1
            ",
        )
        .bind(reference_type.to_string())
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get("id").map_err(StoreError::from))
            .transpose()
    }

    async fn insert_ticket(&self, ticket: &ApprovalTicket) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO approval_tickets
                (id, status, reference_type, reference_id, sla_deadline_at, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ",
        )
        .bind(&ticket.id)
        .bind(ticket.status.to_string())
        .bind(ticket.reference_type.to_string())
        .bind(&ticket.reference_id)
        .bind(ticket.sla_deadline_at)
        .bind(to_body(ticket)?)
        .bind(ticket.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("ticket {} exists", ticket.id))
            }
            other => StoreError::from(other),
        })?;
        Ok(())
    }

    async fn act_on_ticket(
        &self,
        id: &str,
        record: ApprovalRecord,
    ) -> StoreResult<TicketActOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT body FROM approval_tickets WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))?;
        let mut ticket: ApprovalTicket = from_body(&row)?;

        let approver = record.approver;
        let action = record.action;
        let reason = record.reason.clone();
        let outcome = apply_ticket_action(&mut ticket, record);

        if let TicketActOutcome::Applied(_) = &outcome {
            // The unique index on (ticket_id, approver) is the second line of
            // defense for the one-action-per-approver invariant.
            sqlx::query(
                r"
                INSERT INTO approval_records (ticket_id, approver, action, reason)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(id)
            .bind(addr_text(approver))
            .bind(match action {
                keel_core::ApprovalAction::Approve => "APPROVE",
                keel_core::ApprovalAction::Reject => "REJECT",
            })
            .bind(reason)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Conflict(format!("{approver:#x} already acted on {id}"))
                }
                other => StoreError::from(other),
            })?;
            store_ticket(&mut tx, &ticket).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn resolve_ticket(
        &self,
        id: &str,
        status: TicketStatus,
        result: TicketResult,
        resolved_by: &str,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM approval_tickets WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))?;
        let mut ticket: ApprovalTicket = from_body(&row)?;

        if ticket.status.is_terminal() {
            tx.rollback().await?;
            return Ok(false);
        }
        ticket.status = status;
        ticket.result = Some(result);
        ticket.resolved_at = Some(Utc::now());
        ticket.resolved_by = Some(resolved_by.to_string());
        ticket.updated_at = Utc::now();
        store_ticket(&mut tx, &ticket).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_escalated(
        &self,
        id: &str,
        to: ApproverRole,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM approval_tickets WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))?;
        let mut ticket: ApprovalTicket = from_body(&row)?;
        ticket.escalated_at = Some(at);
        ticket.escalated_to = Some(to);
        ticket.updated_at = Utc::now();
        store_ticket(&mut tx, &ticket).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PlanStore for PgStore {
    async fn plan(&self, id: &str) -> StoreResult<Option<RebalancePlan>> {
        let row = sqlx::query("SELECT body FROM rebalance_plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut plan: RebalancePlan = from_body(&row)?;

        let results = sqlx::query(
            r"
            SELECT action_index, success, tx_hash, error, executed_at
            FROM rebalance_actions
            WHERE plan_id = $1 AND executed_at IS NOT NULL
            ORDER BY executed_at
            ",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        plan.results = results
            .iter()
            .map(|row| {
                Ok(ActionResult {
                    index: row.try_get::<i32, _>("action_index")? as u32,
                    success: row.try_get("success")?,
                    tx_hash: row.try_get("tx_hash")?,
                    error: row.try_get("error")?,
                    executed_at: row.try_get("executed_at")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Some(plan))
    }

    async fn insert_plan(&self, plan: &RebalancePlan) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            INSERT INTO rebalance_plans (id, status, trigger_kind, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ",
        )
        .bind(&plan.id)
        .bind(plan.status.to_string())
        .bind(plan.trigger.to_string())
        .bind(to_body(plan)?)
        .bind(plan.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("plan {} exists", plan.id))
            }
            other => StoreError::from(other),
        })?;

        for action in &plan.actions {
            sqlx::query(
                r"
                INSERT INTO rebalance_actions (plan_id, action_index, priority, amount, body)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(&plan.id)
            .bind(action.index as i32)
            .bind(action.priority as i16)
            .bind(big(action.action.amount()))
            .bind(to_body(action)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn transition_plan(
        &self,
        id: &str,
        from: &[PlanStatus],
        to: PlanStatus,
    ) -> StoreResult<bool> {
        let from_texts: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM rebalance_plans WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        let mut plan: RebalancePlan = from_body(&row)?;
        if !from_texts.contains(&plan.status.to_string()) {
            tx.rollback().await?;
            return Ok(false);
        }
        plan.status = to;
        plan.updated_at = Utc::now();
        sqlx::query(
            "UPDATE rebalance_plans SET status = $2, body = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(plan.status.to_string())
        .bind(to_body(&plan)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn set_plan_ticket(&self, id: &str, ticket_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM rebalance_plans WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        let mut plan: RebalancePlan = from_body(&row)?;
        plan.approval_ticket_id = Some(ticket_id.to_string());
        plan.updated_at = Utc::now();
        sqlx::query("UPDATE rebalance_plans SET body = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(to_body(&plan)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_action_result(&self, id: &str, result: &ActionResult) -> StoreResult<()> {
        let updated = sqlx::query(
            r"
            UPDATE rebalance_actions
            SET success = $3, tx_hash = $4, error = $5, executed_at = $6
            WHERE plan_id = $1 AND action_index = $2
            ",
        )
        .bind(id)
        .bind(result.index as i32)
        .bind(result.success)
        .bind(&result.tx_hash)
        .bind(&result.error)
        .bind(result.executed_at)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            warn!(plan = id, index = result.index, "Result for unknown action");
        }
        Ok(())
    }
}

#[async_trait]
impl RiskStore for PgStore {
    async fn append_snapshot(&self, snapshot: &RiskSnapshot) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO risk_snapshots (ts, level, score, readings)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(snapshot.timestamp)
        .bind(snapshot.level.to_string())
        .bind(snapshot.score)
        .bind(serde_json::to_value(&snapshot.readings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_snapshots(&self, limit: i64) -> StoreResult<Vec<RiskSnapshot>> {
        let rows = sqlx::query(
            "SELECT ts, level, score, readings FROM risk_snapshots ORDER BY ts DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let level = match row.try_get::<String, _>("level")?.as_str() {
                    "NORMAL" => keel_core::RiskLevel::Normal,
                    "ELEVATED" => keel_core::RiskLevel::Elevated,
                    "HIGH" => keel_core::RiskLevel::High,
                    "CRITICAL" => keel_core::RiskLevel::Critical,
                    other => return Err(StoreError::Corrupt(format!("bad level {other}"))),
                };
                Ok(RiskSnapshot {
                    timestamp: row.try_get("ts")?,
                    level,
                    score: row.try_get("score")?,
                    readings: serde_json::from_value(row.try_get("readings")?)?,
                })
            })
            .collect()
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        write_risk_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        write_audit(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn checkpoint(&self, contract: Address) -> StoreResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT last_block, block_hash, updated_at FROM checkpoints WHERE contract = $1",
        )
        .bind(addr_text(contract))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Checkpoint {
                contract,
                last_confirmed_block: row.try_get::<i64, _>("last_block")? as u64,
                block_hash: parse_hash(&row.try_get::<String, _>("block_hash")?)?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let updated = sqlx::query(
            r"
            INSERT INTO checkpoints (contract, last_block, block_hash, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (contract) DO UPDATE SET
                last_block = EXCLUDED.last_block,
                block_hash = EXCLUDED.block_hash,
                updated_at = EXCLUDED.updated_at
            WHERE checkpoints.last_block <= EXCLUDED.last_block
            ",
        )
        .bind(addr_text(checkpoint.contract))
        .bind(checkpoint.last_confirmed_block as i64)
        .bind(hash_text(checkpoint.block_hash))
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "checkpoint for {} would move backwards",
                checkpoint.contract
            )));
        }
        Ok(())
    }
}
