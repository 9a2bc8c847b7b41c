//! PostgreSQL store implementation
//!
//! One sqlx transaction per commit unit. The fences:
//!
//! - event insert uses `ON CONFLICT DO NOTHING`; zero rows affected means
//!   `(position_key, event_ver)` exists -> `VersionConflict`, rollback.
//! - snapshot update is `UPDATE ... WHERE last_ver = $expected`; zero rows
//!   -> `CasFailed`, rollback. Inserts conflict on the primary key.
//! - idempotency insert conflicts on trade_id; an existing PROCESSED row
//!   -> `DuplicateTrade`, rollback.
//!
//! Dense versions follow from the engines always writing `last_ver + 1`
//! under the snapshot CAS; the primary key rejects any violation.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

use crate::core_types::{EventVer, PositionKey};
use crate::events::{EventType, MetaLots, PositionEvent};
use crate::models::{
    IdempotencyRecord, IdempotencyStatus, PositionStatus, ReconciliationStatus, Snapshot,
};
use crate::position_state::CompressedLots;
use crate::upi::{UpiChangeType, UpiHistoryEntry};

use super::schema::partition_of;
use super::{CommitUnit, Page, PositionStore, SnapshotFilter, StoreError, UpiHistoryStore};

/// Connect a pool with bounded acquire timeout.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    tracing::info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Liveness probe for the health endpoint.
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ============================================================
// POSITION STORE
// ============================================================

pub struct PgPositionStore {
    pool: PgPool,
    partitions: u16,
}

impl PgPositionStore {
    pub fn new(pool: PgPool, partitions: u16) -> Self {
        Self { pool, partitions }
    }
}

fn parse_position_status(s: &str) -> Result<PositionStatus, StoreError> {
    match s {
        "ACTIVE" => Ok(PositionStatus::Active),
        "TERMINATED" => Ok(PositionStatus::Terminated),
        other => Err(StoreError::Database(format!("corrupt status: {other}"))),
    }
}

fn parse_reconciliation(s: &str) -> Result<ReconciliationStatus, StoreError> {
    match s {
        "RECONCILED" => Ok(ReconciliationStatus::Reconciled),
        "PROVISIONAL" => Ok(ReconciliationStatus::Provisional),
        "PENDING" => Ok(ReconciliationStatus::Pending),
        other => Err(StoreError::Database(format!(
            "corrupt reconciliation status: {other}"
        ))),
    }
}

fn reconciliation_str(s: ReconciliationStatus) -> &'static str {
    match s {
        ReconciliationStatus::Reconciled => "RECONCILED",
        ReconciliationStatus::Provisional => "PROVISIONAL",
        ReconciliationStatus::Pending => "PENDING",
    }
}

fn parse_event_type(s: &str) -> Result<EventType, StoreError> {
    match s {
        "NEW_TRADE" => Ok(EventType::NewTrade),
        "INCREASE" => Ok(EventType::Increase),
        "DECREASE" => Ok(EventType::Decrease),
        "CORRECTION_NEW_TRADE" => Ok(EventType::CorrectionNewTrade),
        "CORRECTION_INCREASE" => Ok(EventType::CorrectionIncrease),
        "CORRECTION_DECREASE" => Ok(EventType::CorrectionDecrease),
        other => Err(StoreError::Database(format!("corrupt event type: {other}"))),
    }
}

fn parse_direction(s: &str) -> Result<crate::core_types::Direction, StoreError> {
    match s {
        "LONG" => Ok(crate::core_types::Direction::Long),
        "SHORT" => Ok(crate::core_types::Direction::Short),
        other => Err(StoreError::Database(format!("corrupt direction: {other}"))),
    }
}

fn parse_change_type(s: &str) -> Result<UpiChangeType, StoreError> {
    match s {
        "CREATED" => Ok(UpiChangeType::Created),
        "TERMINATED" => Ok(UpiChangeType::Terminated),
        "REOPENED" => Ok(UpiChangeType::Reopened),
        "INVALIDATED" => Ok(UpiChangeType::Invalidated),
        "MERGED" => Ok(UpiChangeType::Merged),
        "RESTORED" => Ok(UpiChangeType::Restored),
        other => Err(StoreError::Database(format!("corrupt change type: {other}"))),
    }
}

fn key_from_row(row: &PgRow, col: &str) -> Result<PositionKey, StoreError> {
    let raw: String = row.get(col);
    PositionKey::new(raw).map_err(StoreError::Database)
}

fn row_to_snapshot(row: &PgRow) -> Result<Snapshot, StoreError> {
    let status: String = row.get("status");
    let reconciliation: String = row.get("reconciliation_status");
    let direction: String = row.get("direction");
    let lots_json: String = row.get("compressed_lots");
    let compressed_lots: CompressedLots = serde_json::from_str(&lots_json)
        .map_err(|e| StoreError::Database(format!("corrupt compressed lots: {e}")))?;

    Ok(Snapshot {
        position_key: key_from_row(row, "position_key")?,
        last_ver: row.get("last_ver"),
        compressed_lots,
        status: parse_position_status(&status)?,
        reconciliation_status: parse_reconciliation(&reconciliation)?,
        upi: row.get("upi"),
        account: row.get("account"),
        instrument: row.get("instrument"),
        currency: row.get("currency"),
        contract_id: row.get("contract_id"),
        direction: parse_direction(&direction)?,
        latest_effective_date: row.get("latest_effective_date"),
        last_updated_at: row.get("last_updated_at"),
        archival_flag: row.get("archival_flag"),
    })
}

fn row_to_event(row: &PgRow) -> Result<PositionEvent, StoreError> {
    let event_type: String = row.get("event_type");
    let payload_json: String = row.get("payload");
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| StoreError::Database(format!("corrupt event payload: {e}")))?;
    let meta_lots = match row.get::<Option<String>, _>("meta_lots") {
        Some(json) => Some(
            serde_json::from_str::<MetaLots>(&json)
                .map_err(|e| StoreError::Database(format!("corrupt meta lots: {e}")))?,
        ),
        None => None,
    };

    Ok(PositionEvent {
        position_key: key_from_row(row, "position_key")?,
        event_ver: row.get("event_ver"),
        event_type: parse_event_type(&event_type)?,
        effective_date: row.get("effective_date"),
        occurred_at: row.get("occurred_at"),
        payload,
        meta_lots,
        correlation_id: row.get("correlation_id"),
        causation_id: row.get("causation_id"),
        archival_flag: row.get("archival_flag"),
    })
}

fn row_to_idempotency(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "PROCESSED" => IdempotencyStatus::Processed,
        "FAILED" => IdempotencyStatus::Failed,
        other => {
            return Err(StoreError::Database(format!(
                "corrupt idempotency status: {other}"
            )));
        }
    };
    Ok(IdempotencyRecord {
        trade_id: row.get("trade_id"),
        position_key: key_from_row(row, "position_key")?,
        status,
        event_version: row.get("event_version"),
        processed_at: row.get("processed_at"),
    })
}

const SNAPSHOT_COLUMNS: &str = "position_key, last_ver, compressed_lots, status, \
     reconciliation_status, upi, account, instrument, currency, contract_id, direction, \
     latest_effective_date, last_updated_at, archival_flag";

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn snapshot(&self, key: &PositionKey) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM position_snapshots_tb WHERE position_key = $1"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_snapshot).transpose()
    }

    async fn snapshot_by_upi(&self, upi: &str) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM position_snapshots_tb WHERE upi = $1 LIMIT 1"
        ))
        .bind(upi)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_snapshot).transpose()
    }

    async fn events(&self, key: &PositionKey) -> Result<Vec<PositionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position_key, event_ver, event_type, effective_date, occurred_at,
                   payload, meta_lots, correlation_id, causation_id, archival_flag
            FROM position_events_tb
            WHERE position_key = $1
            ORDER BY effective_date ASC, occurred_at ASC, event_ver ASC
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn max_event_ver(&self, key: &PositionKey) -> Result<EventVer, StoreError> {
        let ver: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(event_ver) FROM position_events_tb WHERE position_key = $1",
        )
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(ver.unwrap_or(0))
    }

    async fn find_snapshots(
        &self,
        filter: &SnapshotFilter,
        page: Page,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS} FROM position_snapshots_tb
            WHERE ($1::text IS NULL OR UPPER(account) = UPPER($1))
              AND ($2::text IS NULL OR UPPER(instrument) = UPPER($2))
              AND ($3::text IS NULL OR contract_id = $3)
            ORDER BY position_key
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(&filter.account)
        .bind(&filter.instrument)
        .bind(&filter.contract_id)
        .bind(page.page_size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_snapshot).collect()
    }

    async fn idempotency(&self, trade_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT trade_id, position_key, status, event_version, processed_at \
             FROM idempotency_tb WHERE trade_id = $1",
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_idempotency).transpose()
    }

    async fn mark_failed(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_tb (trade_id, position_key, status, event_version, processed_at)
            VALUES ($1, $2, 'FAILED', NULL, $3)
            ON CONFLICT (trade_id) DO UPDATE
                SET status = 'FAILED', processed_at = EXCLUDED.processed_at
                WHERE idempotency_tb.status <> 'PROCESSED'
            "#,
        )
        .bind(&record.trade_id)
        .bind(record.position_key.as_str())
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_reconciliation(
        &self,
        key: &PositionKey,
        status: ReconciliationStatus,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE position_snapshots_tb SET reconciliation_status = $1 WHERE position_key = $2")
                .bind(reconciliation_str(status))
                .bind(key.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("snapshot {key}")));
        }
        Ok(())
    }

    async fn commit(&self, unit: CommitUnit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // idempotency fence first: cheapest rejection
        if let Some(record) = &unit.idempotency {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT status FROM idempotency_tb WHERE trade_id = $1 FOR UPDATE")
                    .bind(&record.trade_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if existing.as_deref() == Some("PROCESSED") {
                return Err(StoreError::DuplicateTrade(record.trade_id.clone()));
            }
        }

        for event in &unit.events {
            let payload = serde_json::to_string(&event.payload)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let meta_lots = event
                .meta_lots
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Database(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO position_events_tb
                    (position_key, event_ver, event_type, effective_date, occurred_at,
                     payload, meta_lots, trade_id, correlation_id, causation_id,
                     archival_flag, partition)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (position_key, event_ver) DO NOTHING
                "#,
            )
            .bind(event.position_key.as_str())
            .bind(event.event_ver)
            .bind(event.event_type.as_str())
            .bind(event.effective_date)
            .bind(event.occurred_at)
            .bind(&payload)
            .bind(&meta_lots)
            .bind(&event.payload.trade_id)
            .bind(&event.correlation_id)
            .bind(&event.causation_id)
            .bind(event.archival_flag)
            .bind(partition_of(&event.position_key, self.partitions))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::VersionConflict {
                    key: event.position_key.clone(),
                    ver: event.event_ver,
                });
            }
        }

        for write in &unit.snapshots {
            let snap = &write.snapshot;
            let lots_json = snap.compressed_lots.to_json();

            let rows_affected = match write.expected_ver {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO position_snapshots_tb
                            (position_key, last_ver, compressed_lots, status,
                             reconciliation_status, upi, account, instrument, currency,
                             contract_id, direction, latest_effective_date, last_updated_at,
                             archival_flag, partition)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                        ON CONFLICT (position_key) DO NOTHING
                        "#,
                    )
                    .bind(snap.position_key.as_str())
                    .bind(snap.last_ver)
                    .bind(&lots_json)
                    .bind(snap.status.as_str())
                    .bind(reconciliation_str(snap.reconciliation_status))
                    .bind(&snap.upi)
                    .bind(&snap.account)
                    .bind(&snap.instrument)
                    .bind(&snap.currency)
                    .bind(&snap.contract_id)
                    .bind(snap.direction.as_str())
                    .bind(snap.latest_effective_date)
                    .bind(snap.last_updated_at)
                    .bind(snap.archival_flag)
                    .bind(partition_of(&snap.position_key, self.partitions))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                }
                Some(expected) => {
                    sqlx::query(
                        r#"
                        UPDATE position_snapshots_tb
                        SET last_ver = $1, compressed_lots = $2, status = $3,
                            reconciliation_status = $4, upi = $5,
                            latest_effective_date = $6, last_updated_at = $7
                        WHERE position_key = $8 AND last_ver = $9
                        "#,
                    )
                    .bind(snap.last_ver)
                    .bind(&lots_json)
                    .bind(snap.status.as_str())
                    .bind(reconciliation_str(snap.reconciliation_status))
                    .bind(&snap.upi)
                    .bind(snap.latest_effective_date)
                    .bind(snap.last_updated_at)
                    .bind(snap.position_key.as_str())
                    .bind(expected)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                }
            };

            if rows_affected == 0 {
                return Err(StoreError::CasFailed {
                    key: snap.position_key.clone(),
                    expected: write.expected_ver.unwrap_or(0),
                });
            }
        }

        if let Some(record) = &unit.idempotency {
            sqlx::query(
                r#"
                INSERT INTO idempotency_tb (trade_id, position_key, status, event_version, processed_at)
                VALUES ($1, $2, 'PROCESSED', $3, $4)
                ON CONFLICT (trade_id) DO UPDATE
                    SET status = 'PROCESSED',
                        position_key = EXCLUDED.position_key,
                        event_version = EXCLUDED.event_version,
                        processed_at = EXCLUDED.processed_at
                "#,
            )
            .bind(&record.trade_id)
            .bind(record.position_key.as_str())
            .bind(record.event_version)
            .bind(record.processed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ============================================================
// UPI HISTORY STORE
// ============================================================

pub struct PgUpiHistoryStore {
    pool: PgPool,
}

impl PgUpiHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UpiHistoryStore for PgUpiHistoryStore {
    async fn record(&self, entry: &UpiHistoryEntry) -> Result<(), StoreError> {
        // idempotent on the primary key: retries are safe
        sqlx::query(
            r#"
            INSERT INTO upi_history_tb
                (position_key, upi, previous_upi, status, previous_status, change_type,
                 triggering_trade_id, backdated_trade_id, occurred_at, effective_date,
                 reason, merged_from_position_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (position_key, upi, occurred_at, change_type) DO NOTHING
            "#,
        )
        .bind(entry.position_key.as_str())
        .bind(&entry.upi)
        .bind(&entry.previous_upi)
        .bind(entry.status.as_str())
        .bind(entry.previous_status.map(|s| s.as_str()))
        .bind(entry.change_type.as_str())
        .bind(&entry.triggering_trade_id)
        .bind(&entry.backdated_trade_id)
        .bind(entry.occurred_at)
        .bind(entry.effective_date)
        .bind(&entry.reason)
        .bind(
            entry
                .merged_from_position_key
                .as_ref()
                .map(|k| k.as_str().to_string()),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn history(&self, key: &PositionKey) -> Result<Vec<UpiHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position_key, upi, previous_upi, status, previous_status, change_type,
                   triggering_trade_id, backdated_trade_id, occurred_at, effective_date,
                   reason, merged_from_position_key
            FROM upi_history_tb
            WHERE position_key = $1
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let previous_status: Option<String> = row.get("previous_status");
                let change_type: String = row.get("change_type");
                let merged_from: Option<String> = row.get("merged_from_position_key");
                Ok(UpiHistoryEntry {
                    position_key: key_from_row(row, "position_key")?,
                    upi: row.get("upi"),
                    previous_upi: row.get("previous_upi"),
                    status: parse_position_status(&status)?,
                    previous_status: previous_status
                        .as_deref()
                        .map(parse_position_status)
                        .transpose()?,
                    change_type: parse_change_type(&change_type)?,
                    triggering_trade_id: row.get("triggering_trade_id"),
                    backdated_trade_id: row.get("backdated_trade_id"),
                    occurred_at: row.get("occurred_at"),
                    effective_date: row.get("effective_date"),
                    reason: row.get("reason"),
                    merged_from_position_key: merged_from
                        .map(PositionKey::new)
                        .transpose()
                        .map_err(StoreError::Database)?,
                })
            })
            .collect()
    }
}
