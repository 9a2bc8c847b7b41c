//! Coldpath engine - chronological replay for backdated trades
//!
//! Consumes BACKDATED trades from the coldpath queue. Tolerates
//! multi-second latency; must converge to a RECONCILED snapshot.
//!
//! ```text
//! mark PROVISIONAL -> load full event stream (canonical order)
//!   -> synthesize the backdated event at startOfDay(effectiveDate)
//!   -> replay from a clean state tracking (UPI, status) per event
//!   -> diff against the pre-replay snapshot (INVALIDATED / RESTORED / MERGED)
//!   -> append ONE correction event + snapshot CAS + idempotency
//!   -> emit position-corrected, TRADE_REPORT, UPI_INVALIDATION + fan-out
//! ```
//!
//! Correction strategy: append, never rewrite. The injected event gets
//! `event_ver = max + 1` and `occurred_at = startOfDay(effectiveDate)`, so
//! the canonical read order slots it into chronological position and any
//! later replay of the stream reproduces the corrected state.
//!
//! Replay is deterministic: same event set -> byte-identical compressed
//! lots and identical UPI transition sequence, independent of wall-clock
//! arrival order. Lot ids are UUIDv5 over (position_key, trade_id).

use chrono::Utc;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::EngineSettings;
use crate::contract_rules::ContractRulesCache;
use crate::core_types::{Direction, EventVer, PositionKey, Upi};
use crate::emitter::{OutboundEmitter, StreamName};
use crate::error::EngineError;
use crate::events::{sort_canonical, start_of_day, EventType, PositionEvent};
use crate::hotpath::HotpathEngine;
use crate::lot_engine::LotEngine;
use crate::messages::{
    DlqRecord, PositionCorrected, ProvisionalTrade, TradeCorrection, TradeReport, UpiInvalidation,
    AFFECTED_SYSTEMS, CORRECTION_ACTION, CORRECTION_REASON, INVALIDATION_ACTION,
};
use crate::models::{
    IdempotencyRecord, IdempotencyStatus, PositionStatus, ReconciliationStatus, SequenceStatus,
    Snapshot, TaxLotMethod, TradeEvent, TradeType,
};
use crate::position_key;
use crate::position_state::{compress, PositionState};
use crate::store::{CommitUnit, PositionStore, SnapshotWrite, StoreError, UpiHistoryStore};
use crate::upi::{UpiChangeType, UpiHistoryEntry, UpiTracker};

// ============================================================
// REPLAY (pure)
// ============================================================

/// Replay failure - an event is invalid at its chronological position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayError {
    pub trade_id: String,
    pub reason: String,
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trade {}: {}", self.trade_id, self.reason)
    }
}

/// Result of replaying an ordered event stream from a clean state.
#[derive(Debug)]
pub struct ReplayOutput {
    pub state: PositionState,
    pub tracker: UpiTracker,
}

/// Replay `events` (already in canonical order) through the lot engine,
/// tracking UPI transitions as each event is applied.
///
/// `direction` is the key's base direction: lots open with its sign and
/// flip on a same-key sign change. `methods` maps contract ids to their
/// allocation method; unknown contracts use `default_method`.
pub fn replay_events(
    key: &PositionKey,
    events: &[PositionEvent],
    direction: Direction,
    methods: &FxHashMap<String, TaxLotMethod>,
    default_method: TaxLotMethod,
) -> Result<ReplayOutput, ReplayError> {
    let mut state = PositionState::new();
    let mut tracker = UpiTracker::new();
    let mut current_direction = direction;

    for event in events {
        let trade = &event.payload;
        let method = methods
            .get(&trade.contract_id)
            .copied()
            .unwrap_or(default_method);

        match event.event_type.base() {
            TradeType::NewTrade | TradeType::Increase => {
                if event.event_type.base() == TradeType::Increase
                    && tracker.status() != Some(PositionStatus::Active)
                {
                    return Err(ReplayError {
                        trade_id: trade.trade_id.clone(),
                        reason: "INCREASE on a position that is not active at its chronological position"
                            .to_string(),
                    });
                }
                let signed = if current_direction.is_short() {
                    -trade.quantity
                } else {
                    trade.quantity
                };
                LotEngine::add_lot(
                    &mut state,
                    position_key::lot_id(key, &trade.trade_id),
                    signed,
                    trade.price,
                    trade.effective_date,
                );
                tracker.apply(
                    event.event_type.base(),
                    &trade.trade_id,
                    trade.effective_date,
                    state.total_qty(),
                );
            }
            TradeType::Decrease => {
                if state.is_flat() {
                    return Err(ReplayError {
                        trade_id: trade.trade_id.clone(),
                        reason: "DECREASE with no open lots at its chronological position"
                            .to_string(),
                    });
                }
                let result = LotEngine::reduce_lots(
                    &mut state,
                    trade.quantity,
                    method,
                    trade.price,
                    trade.effective_date,
                );
                state.retain_open();
                tracker.apply(
                    TradeType::Decrease,
                    &trade.trade_id,
                    trade.effective_date,
                    state.total_qty(),
                );

                if result.has_excess() {
                    // same-key sign flip: replay cannot split keys, the
                    // past already happened under this one
                    current_direction = current_direction.opposite();
                    let signed = if current_direction.is_short() {
                        -result.excess_qty
                    } else {
                        result.excess_qty
                    };
                    tracker.sign_flip(&trade.trade_id, trade.effective_date);
                    LotEngine::add_lot(
                        &mut state,
                        position_key::lot_id(key, &trade.trade_id),
                        signed,
                        trade.price,
                        trade.effective_date,
                    );
                }
            }
        }
        state.retain_open();

        if !state.sign_pure() {
            return Err(ReplayError {
                trade_id: trade.trade_id.clone(),
                reason: "mixed-sign lots after replaying event".to_string(),
            });
        }
    }

    Ok(ReplayOutput { state, tracker })
}

// ============================================================
// ENGINE
// ============================================================

/// Outcome of one coldpath correction.
#[derive(Debug, Clone)]
pub struct ColdpathOutcome {
    pub position_key: PositionKey,
    pub event_version: EventVer,
    pub upi: Upi,
    pub status: PositionStatus,
    pub invalidated_upis: Vec<Upi>,
    pub restored_upi: Option<Upi>,
}

#[derive(Debug, Default)]
pub struct ColdpathStats {
    pub processed: AtomicU64,
    pub corrected: AtomicU64,
    pub aborted: AtomicU64,
    pub conflicts: AtomicU64,
    pub invalidations: AtomicU64,
}

pub struct ColdpathEngine {
    store: Arc<dyn PositionStore>,
    upi_history: Arc<dyn UpiHistoryStore>,
    rules: Arc<ContractRulesCache>,
    emitter: Arc<OutboundEmitter>,
    settings: EngineSettings,
    stats: ColdpathStats,
}

impl ColdpathEngine {
    pub fn new(
        store: Arc<dyn PositionStore>,
        upi_history: Arc<dyn UpiHistoryStore>,
        rules: Arc<ContractRulesCache>,
        emitter: Arc<OutboundEmitter>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            upi_history,
            rules,
            emitter,
            settings,
            stats: ColdpathStats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &ColdpathStats {
        &self.stats
    }

    /// Process one backdated trade. Never surfaces to a synchronous
    /// caller: it converges, or leaves the snapshot PROVISIONAL and
    /// returns the error for logging/alerting.
    pub async fn process(&self, mut trade: TradeEvent) -> Result<ColdpathOutcome, EngineError> {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        trade.sequence_status = Some(SequenceStatus::Backdated);
        let key = HotpathEngine::resolve_key(&trade);
        let now = Utc::now();

        // idempotency: an already-processed backdated trade is a no-op
        if let Some(record) = self
            .store
            .idempotency(&trade.trade_id)
            .await
            .map_err(EngineError::from)?
        {
            if record.status == IdempotencyStatus::Processed {
                let snapshot = self
                    .store
                    .snapshot(&record.position_key)
                    .await
                    .map_err(EngineError::from)?;
                return Ok(ColdpathOutcome {
                    position_key: record.position_key,
                    event_version: record.event_version.unwrap_or(0),
                    upi: snapshot.as_ref().map(|s| s.upi.clone()).unwrap_or_default(),
                    status: snapshot
                        .map(|s| s.status)
                        .unwrap_or(PositionStatus::Active),
                    invalidated_upis: Vec::new(),
                    restored_upi: None,
                });
            }
        }

        let Some(pre_snapshot) = self.store.snapshot(&key).await.map_err(EngineError::from)?
        else {
            let reason = "backdated trade for a position with no snapshot".to_string();
            self.abort_to_dlq(&trade, &key, &reason, now).await;
            return Err(EngineError::ReplayInconsistency(reason));
        };

        // provisional overlay: the snapshot is untrusted until replay lands
        self.store
            .set_reconciliation(&key, ReconciliationStatus::Provisional)
            .await
            .map_err(EngineError::from)?;
        self.emitter.emit(
            StreamName::ProvisionalTrade,
            key.as_str(),
            &ProvisionalTrade {
                trade_id: trade.trade_id.clone(),
                position_key: key.clone(),
                reconciliation_status: "PROVISIONAL".to_string(),
                occurred_at: now,
                correlation_id: trade.correlation_id.clone(),
            },
        );

        let mut pre_snapshot = pre_snapshot;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.replay_and_commit(&trade, &key, &pre_snapshot).await {
                Ok(outcome) => {
                    self.stats.corrected.fetch_add(1, Ordering::Relaxed);
                    return Ok(outcome);
                }
                Err(CorrectionError::Conflict) if attempt < self.settings.coldpath_retries => {
                    // a hotpath commit raced us; reload and replay again
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    pre_snapshot = self
                        .store
                        .snapshot(&key)
                        .await
                        .map_err(EngineError::from)?
                        .ok_or_else(|| {
                            EngineError::ReplayInconsistency("snapshot vanished mid-replay".into())
                        })?;
                }
                Err(CorrectionError::Conflict) => {
                    return Err(EngineError::RetryExhausted { attempts: attempt });
                }
                Err(CorrectionError::InvalidAtPosition(e)) => {
                    self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                    let reason = e.to_string();
                    self.abort_to_dlq(&trade, &key, &reason, Utc::now()).await;
                    return Err(EngineError::ReplayInconsistency(reason));
                }
                Err(CorrectionError::Engine(e)) => {
                    self.fail_idempotency(&trade, &key).await;
                    return Err(e);
                }
            }
        }
    }

    async fn replay_and_commit(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        pre_snapshot: &Snapshot,
    ) -> Result<ColdpathOutcome, CorrectionError> {
        let now = Utc::now();
        let events = self
            .store
            .events(key)
            .await
            .map_err(|e| CorrectionError::Engine(e.into()))?;
        let max_ver = events.iter().map(|e| e.event_ver).max().unwrap_or(0);

        let injected = PositionEvent {
            position_key: key.clone(),
            event_ver: max_ver + 1,
            event_type: EventType::correction_of(trade.trade_type),
            effective_date: trade.effective_date,
            occurred_at: start_of_day(trade.effective_date),
            payload: trade.clone(),
            meta_lots: None,
            correlation_id: trade.correlation_id.clone(),
            causation_id: trade.causation_id.clone(),
            archival_flag: false,
        };

        let mut timeline = events.clone();
        timeline.push(injected.clone());
        sort_canonical(&mut timeline);

        let methods = self.prefetch_methods(&timeline).await;
        let default = self.rules.default_method();

        // pre-correction timeline: its segments identify the trades that
        // were regulatory-submitted under each UPI
        let old_replay = replay_events(key, &events, pre_snapshot.direction, &methods, default)
            .map_err(|e| {
                CorrectionError::Engine(EngineError::ReplayInconsistency(format!(
                    "existing event stream does not replay: {e}"
                )))
            })?;

        let new_replay = replay_events(key, &timeline, pre_snapshot.direction, &methods, default)
            .map_err(CorrectionError::InvalidAtPosition)?;

        let new_upi = new_replay
            .tracker
            .current_upi()
            .cloned()
            .ok_or_else(|| {
                CorrectionError::Engine(EngineError::ReplayInconsistency(
                    "replay produced no UPI".to_string(),
                ))
            })?;
        let new_status = new_replay
            .tracker
            .status()
            .unwrap_or(PositionStatus::Active);

        // ----- UPI diff -----
        let new_upis: HashSet<&Upi> = new_replay.tracker.segments().iter().map(|s| &s.upi).collect();
        let invalidated: Vec<_> = old_replay
            .tracker
            .segments()
            .iter()
            .filter(|seg| !new_upis.contains(&seg.upi))
            .cloned()
            .collect();

        let restored = if new_upi != pre_snapshot.upi
            && old_replay
                .tracker
                .segment_for(&new_upi)
                .is_some_and(|seg| seg.terminated)
            && new_status == PositionStatus::Active
        {
            Some(new_upi.clone())
        } else {
            None
        };

        let merged_from = match self
            .store
            .snapshot_by_upi(&new_upi)
            .await
            .map_err(|e| CorrectionError::Engine(e.into()))?
        {
            Some(other)
                if other.position_key != *key && other.status == PositionStatus::Active =>
            {
                Some(other.position_key)
            }
            _ => None,
        };

        // ----- corrected snapshot -----
        let corrected_state = new_replay.state;
        let direction = corrected_state.direction().unwrap_or(pre_snapshot.direction);
        let latest_effective_date = timeline.iter().map(|e| e.effective_date).max();
        let corrected = Snapshot {
            position_key: key.clone(),
            last_ver: max_ver + 1,
            compressed_lots: compress(&corrected_state),
            status: new_status,
            reconciliation_status: ReconciliationStatus::Reconciled,
            upi: new_upi.clone(),
            account: pre_snapshot.account.clone(),
            instrument: pre_snapshot.instrument.clone(),
            currency: pre_snapshot.currency.clone(),
            contract_id: pre_snapshot.contract_id.clone(),
            direction,
            latest_effective_date,
            last_updated_at: now,
            archival_flag: pre_snapshot.archival_flag,
        };
        let corrected_total = corrected.total_qty();

        let unit = CommitUnit {
            events: vec![injected],
            snapshots: vec![SnapshotWrite {
                snapshot: corrected,
                expected_ver: Some(pre_snapshot.last_ver),
            }],
            idempotency: Some(IdempotencyRecord::processed(
                trade.trade_id.clone(),
                key.clone(),
                max_ver + 1,
                now,
            )),
        };

        match self.store.commit(unit).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(CorrectionError::Conflict),
            Err(StoreError::DuplicateTrade(_)) => return Err(CorrectionError::Conflict),
            Err(e) => return Err(CorrectionError::Engine(e.into())),
        }

        // ----- history + emits (after commit) -----
        self.record_upi_changes(
            trade,
            key,
            pre_snapshot,
            &new_upi,
            new_status,
            &invalidated,
            restored.as_deref(),
            merged_from.as_ref(),
            now,
        )
        .await;

        self.emit_correction(
            trade,
            key,
            max_ver + 1,
            corrected_total,
            new_status,
            &new_upi,
            &new_replay.tracker,
            &events,
            &invalidated,
            now,
        );

        tracing::info!(
            trade_id = %trade.trade_id,
            position_key = %key,
            event_ver = max_ver + 1,
            upi = %new_upi,
            invalidated = invalidated.len(),
            "Backdated trade reconciled"
        );

        Ok(ColdpathOutcome {
            position_key: key.clone(),
            event_version: max_ver + 1,
            upi: new_upi,
            status: new_status,
            invalidated_upis: invalidated.iter().map(|s| s.upi.clone()).collect(),
            restored_upi: restored,
        })
    }

    /// Resolve allocation methods for every contract in the timeline once,
    /// so the replay itself stays pure and synchronous.
    async fn prefetch_methods(&self, timeline: &[PositionEvent]) -> FxHashMap<String, TaxLotMethod> {
        let mut methods = FxHashMap::default();
        for event in timeline {
            let contract_id = &event.payload.contract_id;
            if !methods.contains_key(contract_id) {
                let method = self.rules.tax_lot_method(contract_id).await;
                methods.insert(contract_id.clone(), method);
            }
        }
        methods
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_upi_changes(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        pre_snapshot: &Snapshot,
        new_upi: &str,
        new_status: PositionStatus,
        invalidated: &[crate::upi::UpiSegment],
        restored: Option<&str>,
        merged_from: Option<&PositionKey>,
        now: chrono::DateTime<Utc>,
    ) {
        let mut entries = Vec::new();

        for segment in invalidated {
            entries.push(UpiHistoryEntry {
                position_key: key.clone(),
                upi: segment.upi.clone(),
                previous_upi: None,
                status: new_status,
                previous_status: Some(pre_snapshot.status),
                change_type: UpiChangeType::Invalidated,
                triggering_trade_id: trade.trade_id.clone(),
                backdated_trade_id: Some(trade.trade_id.clone()),
                occurred_at: now,
                effective_date: trade.effective_date,
                reason: format!(
                    "UPI no longer exists after replaying backdated trade {}",
                    trade.trade_id
                ),
                merged_from_position_key: None,
            });
        }

        if let Some(upi) = restored {
            entries.push(UpiHistoryEntry {
                position_key: key.clone(),
                upi: upi.to_string(),
                previous_upi: Some(pre_snapshot.upi.clone()),
                status: new_status,
                previous_status: Some(pre_snapshot.status),
                change_type: UpiChangeType::Restored,
                triggering_trade_id: trade.trade_id.clone(),
                backdated_trade_id: Some(trade.trade_id.clone()),
                occurred_at: now,
                effective_date: trade.effective_date,
                reason: format!(
                    "UPI restored by replay of backdated trade {}",
                    trade.trade_id
                ),
                merged_from_position_key: None,
            });
        }

        if let Some(from) = merged_from {
            entries.push(UpiHistoryEntry {
                position_key: key.clone(),
                upi: new_upi.to_string(),
                previous_upi: Some(pre_snapshot.upi.clone()),
                status: new_status,
                previous_status: Some(pre_snapshot.status),
                change_type: UpiChangeType::Merged,
                triggering_trade_id: trade.trade_id.clone(),
                backdated_trade_id: Some(trade.trade_id.clone()),
                occurred_at: now,
                effective_date: trade.effective_date,
                reason: "replayed UPI is concurrently active on another position".to_string(),
                merged_from_position_key: Some(from.clone()),
            });
        }

        for entry in &entries {
            let mut committed = false;
            for _ in 0..3 {
                if self.upi_history.record(entry).await.is_ok() {
                    committed = true;
                    break;
                }
            }
            if !committed {
                tracing::error!(
                    position_key = %entry.position_key,
                    upi = %entry.upi,
                    change_type = %entry.change_type,
                    "UPI history write failed after retries"
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_correction(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        event_ver: EventVer,
        total: rust_decimal::Decimal,
        status: PositionStatus,
        new_upi: &str,
        new_tracker: &UpiTracker,
        old_events: &[PositionEvent],
        invalidated: &[crate::upi::UpiSegment],
        now: chrono::DateTime<Utc>,
    ) {
        self.emitter.emit(
            StreamName::PositionCorrected,
            key.as_str(),
            &PositionCorrected {
                trade_id: trade.trade_id.clone(),
                position_key: key.clone(),
                event_ver,
                new_total_qty: total,
                status,
                upi: new_upi.to_string(),
                occurred_at: now,
                correlation_id: trade.correlation_id.clone(),
                reason: CORRECTION_REASON.to_string(),
                backdated_trade_id: trade.trade_id.clone(),
                affected_systems: AFFECTED_SYSTEMS.iter().map(|s| s.to_string()).collect(),
            },
        );

        // the backdated trade is reported under the UPI live at its
        // chronological position
        let report_upi = new_tracker
            .segments()
            .iter()
            .find(|seg| seg.trade_ids.iter().any(|t| t == &trade.trade_id))
            .map(|seg| seg.upi.clone())
            .unwrap_or_else(|| new_upi.to_string());
        self.emitter.emit(
            StreamName::Regulatory,
            key.as_str(),
            &TradeReport::for_trade(trade, key.clone(), report_upi, now),
        );

        let payload_by_trade: FxHashMap<&str, &TradeEvent> = old_events
            .iter()
            .map(|e| (e.payload.trade_id.as_str(), &e.payload))
            .collect();

        for segment in invalidated {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            // summary first, then the fan-out: consumers rely on the order
            self.emitter.emit(
                StreamName::Regulatory,
                key.as_str(),
                &UpiInvalidation {
                    record_type: "UPI_INVALIDATION".to_string(),
                    position_key: key.clone(),
                    invalidated_upi: segment.upi.clone(),
                    new_upi: new_upi.to_string(),
                    invalidated_trade_ids: segment.trade_ids.clone(),
                    reason: "backdated trade changed the position timeline".to_string(),
                    backdated_trade_id: trade.trade_id.clone(),
                    effective_date: trade.effective_date,
                    occurred_at: now,
                    action_required: INVALIDATION_ACTION.to_string(),
                },
            );

            for trade_id in &segment.trade_ids {
                let corrected_upi = new_tracker
                    .segments()
                    .iter()
                    .find(|seg| seg.trade_ids.iter().any(|t| t == trade_id))
                    .map(|seg| seg.upi.clone())
                    .unwrap_or_else(|| new_upi.to_string());
                let original = payload_by_trade.get(trade_id.as_str());
                self.emitter.emit(
                    StreamName::Regulatory,
                    key.as_str(),
                    &TradeCorrection {
                        record_type: "TRADE_CORRECTION".to_string(),
                        trade_id: trade_id.clone(),
                        position_key: key.clone(),
                        original_upi: segment.upi.clone(),
                        corrected_upi,
                        trade_type: original.map(|t| t.trade_type).unwrap_or(trade.trade_type),
                        quantity: original.map(|t| t.quantity).unwrap_or(trade.quantity),
                        price: original.map(|t| t.price).unwrap_or(trade.price),
                        effective_date: original
                            .map(|t| t.effective_date)
                            .unwrap_or(trade.effective_date),
                        reason: "UPI_INVALIDATION".to_string(),
                        backdated_trade_id: trade.trade_id.clone(),
                        action_required: CORRECTION_ACTION.to_string(),
                    },
                );
            }
        }
    }

    async fn abort_to_dlq(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) {
        tracing::error!(
            trade_id = %trade.trade_id,
            position_key = %key,
            reason,
            "Backdated trade rejected during replay, snapshot stays PROVISIONAL"
        );
        self.emitter.emit(
            StreamName::Dlq,
            key.as_str(),
            &DlqRecord {
                trade: trade.clone(),
                errors: vec![reason.to_string()],
                occurred_at: now,
            },
        );
        self.fail_idempotency(trade, key).await;
    }

    async fn fail_idempotency(&self, trade: &TradeEvent, key: &PositionKey) {
        let record = IdempotencyRecord::failed(trade.trade_id.clone(), key.clone(), Utc::now());
        if let Err(e) = self.store.mark_failed(record).await {
            tracing::error!(trade_id = %trade.trade_id, error = %e, "Failed to mark idempotency FAILED");
        }
    }
}

/// Internal error split: conflicts retry, invalid-at-position aborts to
/// DLQ, everything else surfaces.
enum CorrectionError {
    Conflict,
    InvalidAtPosition(ReplayError),
    Engine(EngineError),
}

// ============================================================
// TESTS
// ============================================================
