//! Storage abstraction - events, snapshots, idempotency, UPI history
//!
//! Four logical containers behind two traits:
//!
//! - [`PositionStore`]: events (append-only, `(position_key, event_ver)`
//!   unique), snapshots (CAS on `last_ver`), idempotency (keyed by
//!   trade id). A hotpath/coldpath commit writes all three in ONE atomic
//!   unit via [`PositionStore::commit`].
//! - [`UpiHistoryStore`]: audit rows on an independent transactional
//!   boundary; inserts are idempotent on
//!   `(position_key, upi, occurred_at, change_type)`.
//!
//! Implementations: [`memory::MemoryPositionStore`] (reference semantics,
//! powers the test suite) and [`postgres::PgPositionStore`] (sqlx).

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

use crate::core_types::{EventVer, PositionKey};
use crate::events::PositionEvent;
use crate::models::{IdempotencyRecord, ReconciliationStatus, Snapshot};
use crate::upi::UpiHistoryEntry;

// ============================================================
// ERRORS
// ============================================================

#[derive(Error, Debug)]
pub enum StoreError {
    /// `(position_key, event_ver)` already exists - the optimistic fence.
    #[error("event version {ver} already exists for position {key}")]
    VersionConflict { key: PositionKey, ver: EventVer },

    /// Snapshot compare-and-swap on `last_ver` found a different version.
    #[error("snapshot CAS failed for position {key}: expected version {expected}")]
    CasFailed { key: PositionKey, expected: EventVer },

    /// The trade id is already recorded as PROCESSED.
    #[error("trade {0} already processed")]
    DuplicateTrade(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Conflicts the optimistic retry loop recovers from.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::CasFailed { .. }
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

// ============================================================
// COMMIT UNIT
// ============================================================

/// One snapshot write inside a commit unit.
#[derive(Debug, Clone)]
pub struct SnapshotWrite {
    pub snapshot: Snapshot,
    /// `Some(v)`: CAS update, fails unless the stored `last_ver == v`.
    /// `None`: insert of a brand-new snapshot, fails if the key exists.
    pub expected_ver: Option<EventVer>,
}

/// Atomic unit for one hotpath or coldpath commit.
///
/// A sign-change split carries two events and two snapshot writes (one per
/// position key); every other commit carries one of each. The idempotency
/// record lands in the same transaction so at-most-once holds under
/// concurrency.
#[derive(Debug, Clone)]
pub struct CommitUnit {
    pub events: Vec<PositionEvent>,
    pub snapshots: Vec<SnapshotWrite>,
    pub idempotency: Option<IdempotencyRecord>,
}

// ============================================================
// QUERIES
// ============================================================

/// Filter for the diagnostic position search.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub account: Option<String>,
    pub instrument: Option<String>,
    pub contract_id: Option<String>,
}

/// Pagination window, 1-based page numbers.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

impl Page {
    #[inline]
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }
}

// ============================================================
// TRAITS
// ============================================================

/// Events + snapshots + idempotency with an atomic commit primitive.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Current snapshot, if the position exists.
    async fn snapshot(&self, key: &PositionKey) -> Result<Option<Snapshot>, StoreError>;

    /// Snapshot lookup by UPI (coldpath merge detection, diagnostics).
    async fn snapshot_by_upi(&self, upi: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Full event stream for a key in canonical order
    /// `(effective_date, occurred_at, event_ver)`.
    async fn events(&self, key: &PositionKey) -> Result<Vec<PositionEvent>, StoreError>;

    /// Highest committed event version for a key; 0 when none.
    async fn max_event_ver(&self, key: &PositionKey) -> Result<EventVer, StoreError>;

    /// Diagnostic position search with pagination.
    async fn find_snapshots(
        &self,
        filter: &SnapshotFilter,
        page: Page,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Idempotency record for a trade id.
    async fn idempotency(&self, trade_id: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Upsert a FAILED idempotency record. Never downgrades PROCESSED.
    async fn mark_failed(&self, record: IdempotencyRecord) -> Result<(), StoreError>;

    /// Flip the reconciliation status without touching anything else
    /// (coldpath entry marks PROVISIONAL).
    async fn set_reconciliation(
        &self,
        key: &PositionKey,
        status: ReconciliationStatus,
    ) -> Result<(), StoreError>;

    /// Atomically apply a commit unit. All-or-nothing: a version conflict,
    /// failed CAS, or duplicate trade rolls the whole unit back.
    async fn commit(&self, unit: CommitUnit) -> Result<(), StoreError>;
}

/// UPI audit history on its own transactional boundary.
#[async_trait]
pub trait UpiHistoryStore: Send + Sync {
    /// Insert an entry; duplicate `(position_key, upi, occurred_at,
    /// change_type)` is a silent no-op.
    async fn record(&self, entry: &UpiHistoryEntry) -> Result<(), StoreError>;

    /// Entries for a key, oldest first.
    async fn history(&self, key: &PositionKey) -> Result<Vec<UpiHistoryEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::PositionKey;

    #[test]
    fn test_conflict_classification() {
        let key = PositionKey::new("a".repeat(64)).unwrap();
        assert!(StoreError::VersionConflict { key: key.clone(), ver: 3 }.is_conflict());
        assert!(StoreError::CasFailed { key, expected: 2 }.is_conflict());
        assert!(!StoreError::DuplicateTrade("T1".into()).is_conflict());
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(Page::default().offset(), 0);
        assert_eq!(Page { page: 3, page_size: 20 }.offset(), 40);
        assert_eq!(Page { page: 0, page_size: 20 }.offset(), 0);
    }
}
