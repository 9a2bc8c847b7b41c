//! In-memory store - reference implementation
//!
//! Single-mutex state machine with the exact semantics the Postgres
//! implementation provides: dense version enforcement, snapshot CAS,
//! at-most-once idempotency inside one atomic commit. The test suite and
//! the `--memory` run mode use this implementation.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::core_types::{EventVer, PositionKey};
use crate::events::{sort_canonical, PositionEvent};
use crate::models::{IdempotencyRecord, IdempotencyStatus, ReconciliationStatus, Snapshot};
use crate::upi::UpiHistoryEntry;

use super::{CommitUnit, Page, PositionStore, SnapshotFilter, StoreError, UpiHistoryStore};

// ============================================================
// POSITION STORE
// ============================================================

#[derive(Default)]
struct Inner {
    events: FxHashMap<PositionKey, Vec<PositionEvent>>,
    snapshots: FxHashMap<PositionKey, Snapshot>,
    idempotency: FxHashMap<String, IdempotencyRecord>,
}

/// In-memory `PositionStore`.
#[derive(Default)]
pub struct MemoryPositionStore {
    inner: Mutex<Inner>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn max_ver(inner: &Inner, key: &PositionKey) -> EventVer {
        inner
            .events
            .get(key)
            .and_then(|evs| evs.iter().map(|e| e.event_ver).max())
            .unwrap_or(0)
    }

    /// Validate a commit unit against current state. Returns the first
    /// violated fence so the whole unit can be rejected before any write.
    fn check_unit(inner: &Inner, unit: &CommitUnit) -> Result<(), StoreError> {
        if let Some(record) = &unit.idempotency {
            if let Some(existing) = inner.idempotency.get(&record.trade_id) {
                if existing.status == IdempotencyStatus::Processed {
                    return Err(StoreError::DuplicateTrade(record.trade_id.clone()));
                }
            }
        }

        // versions must extend the dense sequence per key
        let mut next_ver: FxHashMap<&PositionKey, EventVer> = FxHashMap::default();
        for event in &unit.events {
            let expected = next_ver
                .get(&event.position_key)
                .copied()
                .unwrap_or_else(|| Self::max_ver(inner, &event.position_key) + 1);
            if event.event_ver != expected {
                return Err(StoreError::VersionConflict {
                    key: event.position_key.clone(),
                    ver: event.event_ver,
                });
            }
            next_ver.insert(&event.position_key, expected + 1);
        }

        for write in &unit.snapshots {
            let key = &write.snapshot.position_key;
            match (write.expected_ver, inner.snapshots.get(key)) {
                (None, None) => {}
                (None, Some(_)) => {
                    return Err(StoreError::CasFailed {
                        key: key.clone(),
                        expected: 0,
                    });
                }
                (Some(expected), Some(existing)) if existing.last_ver == expected => {}
                (Some(expected), _) => {
                    return Err(StoreError::CasFailed {
                        key: key.clone(),
                        expected,
                    });
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn snapshot(&self, key: &PositionKey) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.snapshots.get(key).cloned())
    }

    async fn snapshot_by_upi(&self, upi: &str) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.snapshots.values().find(|s| s.upi == upi).cloned())
    }

    async fn events(&self, key: &PositionKey) -> Result<Vec<PositionEvent>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut events = inner.events.get(key).cloned().unwrap_or_default();
        sort_canonical(&mut events);
        Ok(events)
    }

    async fn max_event_ver(&self, key: &PositionKey) -> Result<EventVer, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::max_ver(&inner, key))
    }

    async fn find_snapshots(
        &self,
        filter: &SnapshotFilter,
        page: Page,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<Snapshot> = inner
            .snapshots
            .values()
            .filter(|s| {
                filter
                    .account
                    .as_ref()
                    .is_none_or(|a| s.account.eq_ignore_ascii_case(a))
                    && filter
                        .instrument
                        .as_ref()
                        .is_none_or(|i| s.instrument.eq_ignore_ascii_case(i))
                    && filter
                        .contract_id
                        .as_ref()
                        .is_none_or(|c| &s.contract_id == c)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.position_key.as_str().cmp(b.position_key.as_str()));
        Ok(matches
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .collect())
    }

    async fn idempotency(&self, trade_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.idempotency.get(trade_id).cloned())
    }

    async fn mark_failed(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.idempotency.get(&record.trade_id) {
            Some(existing) if existing.status == IdempotencyStatus::Processed => Ok(()),
            _ => {
                inner.idempotency.insert(record.trade_id.clone(), record);
                Ok(())
            }
        }
    }

    async fn set_reconciliation(
        &self,
        key: &PositionKey,
        status: ReconciliationStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let snap = inner
            .snapshots
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {key}")))?;
        snap.reconciliation_status = status;
        Ok(())
    }

    async fn commit(&self, unit: CommitUnit) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_unit(&inner, &unit)?;

        for event in unit.events {
            inner
                .events
                .entry(event.position_key.clone())
                .or_default()
                .push(event);
        }
        for write in unit.snapshots {
            inner
                .snapshots
                .insert(write.snapshot.position_key.clone(), write.snapshot);
        }
        if let Some(record) = unit.idempotency {
            inner.idempotency.insert(record.trade_id.clone(), record);
        }
        Ok(())
    }
}

// ============================================================
// UPI HISTORY STORE
// ============================================================

/// In-memory `UpiHistoryStore` with the dedup-on-insert contract.
#[derive(Default)]
pub struct MemoryUpiHistoryStore {
    inner: Mutex<HistoryInner>,
}

#[derive(Default)]
struct HistoryInner {
    entries: Vec<UpiHistoryEntry>,
    seen: HashSet<String>,
}

impl MemoryUpiHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpiHistoryStore for MemoryUpiHistoryStore {
    async fn record(&self, entry: &UpiHistoryEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let (key, upi, at, change) = entry.dedup_key();
        let dedup = format!("{key}|{upi}|{}|{change}", at.timestamp_micros());
        if inner.seen.insert(dedup) {
            inner.entries.push(entry.clone());
        }
        Ok(())
    }

    async fn history(&self, key: &PositionKey) -> Result<Vec<UpiHistoryEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .iter()
            .filter(|e| &e.position_key == key)
            .cloned()
            .collect())
    }
}

// ============================================================
// TESTS
// ============================================================
