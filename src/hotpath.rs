//! Hotpath engine - synchronous apply with optimistic retry
//!
//! Processes CURRENT_DATED and FORWARD_DATED trades inside a bounded
//! latency budget. One pass:
//!
//! ```text
//! load snapshot -> validate transition -> inflate lots -> fetch method
//!   -> apply through the lot engine -> build commit unit
//!   -> atomic commit (event append + snapshot CAS + idempotency)
//!   -> UPI history (own transaction) -> post-commit emits
//! ```
//!
//! On an optimistic conflict (snapshot CAS failure or event-version
//! collision) the pass restarts from the snapshot read, up to the
//! configured retry budget with a small random jitter between attempts.
//!
//! # Sign change
//!
//! Signs are never mixed within one position key. A DECREASE whose excess
//! survives all open lots closes the old position (TERMINATED) and opens
//! the excess on the opposite-direction key - two events on two keys in
//! one atomic unit, chained by correlation id.

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::EngineSettings;
use crate::contract_rules::ContractRulesCache;
use crate::core_types::{Direction, EventVer, PositionKey, TradeId, Upi};
use crate::emitter::{OutboundEmitter, StreamName};
use crate::error::EngineError;
use crate::events::{EventType, MetaLots, PositionEvent};
use crate::lot_engine::LotEngine;
use crate::messages::{TradeApplied, TradeReport};
use crate::models::{
    IdempotencyRecord, IdempotencyStatus, PositionStatus, ReconciliationStatus, Snapshot,
    TradeEvent, TradeType,
};
use crate::position_key;
use crate::position_state::{compress, inflate, PositionState};
use crate::store::{CommitUnit, PositionStore, SnapshotWrite, StoreError, UpiHistoryStore};
use crate::upi::{UpiChangeType, UpiHistoryEntry};
use crate::validator::Validator;

// ============================================================
// OUTCOME
// ============================================================

/// Second half of a sign-change split.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub position_key: PositionKey,
    pub event_version: EventVer,
    pub upi: Upi,
    pub quantity: Decimal,
}

/// Result of a hotpath apply, also returned for idempotent resubmits.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    pub event_version: EventVer,
    pub new_total_qty: Decimal,
    pub status: PositionStatus,
    pub upi: Upi,
    /// True when this call returned a previously-committed result.
    pub duplicate: bool,
    pub split: Option<SplitOutcome>,
}

/// Hotpath counters.
#[derive(Debug, Default)]
pub struct HotpathStats {
    pub processed: AtomicU64,
    pub applied: AtomicU64,
    pub duplicates: AtomicU64,
    pub conflicts: AtomicU64,
    pub exhausted: AtomicU64,
    pub sign_changes: AtomicU64,
}

// ============================================================
// ENGINE
// ============================================================

pub struct HotpathEngine {
    store: Arc<dyn PositionStore>,
    upi_history: Arc<dyn UpiHistoryStore>,
    rules: Arc<ContractRulesCache>,
    emitter: Arc<OutboundEmitter>,
    validator: Validator,
    settings: EngineSettings,
    stats: HotpathStats,
}

/// Everything one pass prepared for commit and post-commit work.
struct Plan {
    unit: CommitUnit,
    outcome: ApplyOutcome,
    history: Vec<UpiHistoryEntry>,
    applied: Vec<TradeApplied>,
    reports: Vec<TradeReport>,
}

impl HotpathEngine {
    pub fn new(
        store: Arc<dyn PositionStore>,
        upi_history: Arc<dyn UpiHistoryStore>,
        rules: Arc<ContractRulesCache>,
        emitter: Arc<OutboundEmitter>,
        settings: EngineSettings,
    ) -> Self {
        let validator = Validator::new(settings.max_forward_days);
        Self {
            store,
            upi_history,
            rules,
            emitter,
            validator,
            settings,
            stats: HotpathStats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &HotpathStats {
        &self.stats
    }

    /// Resolve the position key: the supplied one, or the LONG key derived
    /// from the tuple. SHORT keys only arise through the sign-change path.
    pub fn resolve_key(trade: &TradeEvent) -> PositionKey {
        trade.position_key.clone().unwrap_or_else(|| {
            position_key::generate(
                &trade.account,
                &trade.instrument,
                &trade.currency,
                Direction::Long,
            )
        })
    }

    /// Process one trade to completion or a surfaced error.
    pub async fn process(&self, trade: TradeEvent) -> Result<ApplyOutcome, EngineError> {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let key = Self::resolve_key(&trade);

        if let Some(outcome) = self.prior_result(&trade).await? {
            return Ok(outcome);
        }

        let today = Utc::now().date_naive();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms > self.settings.hotpath_deadline_ms {
                self.fail_idempotency(&trade, &key).await;
                return Err(EngineError::DeadlineExceeded { elapsed_ms });
            }

            let snapshot = self.store.snapshot(&key).await.map_err(EngineError::from)?;
            self.validator
                .validate(&trade, snapshot.as_ref(), today)
                .map_err(EngineError::Validation)?;

            let plan = self.build_plan(&trade, &key, snapshot).await?;

            match self.store.commit(plan.unit.clone()).await {
                Ok(()) => {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    self.record_history(&plan.history).await;
                    self.emit_applied(&plan);
                    tracing::info!(
                        trade_id = %trade.trade_id,
                        position_key = %plan.outcome.position_key,
                        event_ver = plan.outcome.event_version,
                        status = %plan.outcome.status,
                        "Trade applied"
                    );
                    return Ok(plan.outcome);
                }
                Err(e) if e.is_conflict() => {
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    // the conflicting writer may have been this very trade
                    // submitted concurrently
                    if let Some(outcome) = self.prior_result(&trade).await? {
                        return Ok(outcome);
                    }
                    if attempt >= self.settings.max_retries {
                        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                        self.fail_idempotency(&trade, &key).await;
                        return Err(EngineError::RetryExhausted { attempts: attempt });
                    }
                    tracing::debug!(
                        trade_id = %trade.trade_id,
                        attempt,
                        error = %e,
                        "Optimistic conflict, retrying"
                    );
                    self.jitter().await;
                }
                Err(StoreError::DuplicateTrade(_)) => {
                    // a concurrent submit of the same trade won the race
                    if let Some(outcome) = self.prior_result(&trade).await? {
                        return Ok(outcome);
                    }
                    return Err(EngineError::Transient(
                        "duplicate trade without idempotency record".to_string(),
                    ));
                }
                Err(other) => {
                    self.fail_idempotency(&trade, &key).await;
                    return Err(EngineError::from(other));
                }
            }
        }
    }

    /// Idempotency fast path: a PROCESSED record returns the prior result.
    async fn prior_result(&self, trade: &TradeEvent) -> Result<Option<ApplyOutcome>, EngineError> {
        let record = self
            .store
            .idempotency(&trade.trade_id)
            .await
            .map_err(EngineError::from)?;
        let Some(record) = record else {
            return Ok(None);
        };
        if record.status != IdempotencyStatus::Processed {
            return Ok(None);
        }

        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        let snapshot = self
            .store
            .snapshot(&record.position_key)
            .await
            .map_err(EngineError::from)?;

        let (total, status, upi) = match &snapshot {
            Some(s) => (s.total_qty(), s.status, s.upi.clone()),
            None => (Decimal::ZERO, PositionStatus::Active, String::new()),
        };

        tracing::debug!(trade_id = %trade.trade_id, "Duplicate submit, returning prior result");
        Ok(Some(ApplyOutcome {
            trade_id: trade.trade_id.clone(),
            position_key: record.position_key.clone(),
            event_version: record.event_version.unwrap_or(0),
            new_total_qty: total,
            status,
            upi,
            duplicate: true,
            split: None,
        }))
    }

    async fn jitter(&self) {
        let upper = self.settings.retry_jitter_ms.max(1);
        let ms = rand::thread_rng().gen_range(0..=upper);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn fail_idempotency(&self, trade: &TradeEvent, key: &PositionKey) {
        let record = IdempotencyRecord::failed(trade.trade_id.clone(), key.clone(), Utc::now());
        if let Err(e) = self.store.mark_failed(record).await {
            tracing::error!(trade_id = %trade.trade_id, error = %e, "Failed to mark idempotency FAILED");
        }
    }

    /// History writes are an independent transactional boundary; failures
    /// log and never unwind the main commit. Inserts are idempotent, so a
    /// blind retry is safe.
    async fn record_history(&self, entries: &[UpiHistoryEntry]) {
        for entry in entries {
            let mut last_err = None;
            for _ in 0..3 {
                match self.upi_history.record(entry).await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(e) = last_err {
                tracing::error!(
                    position_key = %entry.position_key,
                    upi = %entry.upi,
                    change_type = %entry.change_type,
                    error = %e,
                    "UPI history write failed after retries"
                );
            }
        }
    }

    fn emit_applied(&self, plan: &Plan) {
        for applied in &plan.applied {
            self.emitter.emit(
                StreamName::TradeApplied,
                applied.position_key.as_str(),
                applied,
            );
        }
        for report in &plan.reports {
            self.emitter
                .emit(StreamName::Regulatory, report.position_key.as_str(), report);
        }
    }

    // ============================================================
    // PLAN CONSTRUCTION
    // ============================================================

    async fn build_plan(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        snapshot: Option<Snapshot>,
    ) -> Result<Plan, EngineError> {
        match trade.trade_type {
            TradeType::NewTrade | TradeType::Increase => {
                Ok(self.plan_addition(trade, key, snapshot))
            }
            TradeType::Decrease => {
                let snapshot = snapshot.ok_or_else(|| {
                    // the validator already rejected this; defensive only
                    EngineError::Fatal("decrease without snapshot".to_string())
                })?;
                self.plan_decrease(trade, key, snapshot).await
            }
        }
    }

    /// NEW_TRADE on a fresh or terminated key, or INCREASE on an active one.
    fn plan_addition(&self, trade: &TradeEvent, key: &PositionKey, snapshot: Option<Snapshot>) -> Plan {
        let now = Utc::now();
        let direction = snapshot
            .as_ref()
            .map(|s| s.direction)
            .unwrap_or(Direction::Long);
        let signed_qty = if direction.is_short() {
            -trade.quantity
        } else {
            trade.quantity
        };

        let mut state = snapshot
            .as_ref()
            .map(|s| inflate(&s.compressed_lots))
            .unwrap_or_default();
        let opened = LotEngine::add_lot(
            &mut state,
            position_key::lot_id(key, &trade.trade_id),
            signed_qty,
            trade.price,
            trade.effective_date,
        );

        let last_ver = snapshot.as_ref().map(|s| s.last_ver).unwrap_or(0);
        let event_ver = last_ver + 1;
        let reopening = snapshot
            .as_ref()
            .is_some_and(|s| s.status == PositionStatus::Terminated);

        let (upi, history) = match (&snapshot, trade.trade_type) {
            (None, _) => {
                let entry = self.history_entry(
                    key,
                    trade,
                    trade.trade_id.clone(),
                    None,
                    PositionStatus::Active,
                    None,
                    UpiChangeType::Created,
                    "position opened",
                    now,
                );
                (trade.trade_id.clone(), vec![entry])
            }
            (Some(prev), TradeType::NewTrade) if reopening => {
                let entry = self.history_entry(
                    key,
                    trade,
                    trade.trade_id.clone(),
                    Some(prev.upi.clone()),
                    PositionStatus::Active,
                    Some(PositionStatus::Terminated),
                    UpiChangeType::Reopened,
                    "position reopened after termination",
                    now,
                );
                (trade.trade_id.clone(), vec![entry])
            }
            (Some(prev), _) => (prev.upi.clone(), Vec::new()),
        };

        let event = self.event_for(
            key.clone(),
            event_ver,
            EventType::from_trade_type(trade.trade_type),
            trade.clone(),
            Some(MetaLots::Opened(opened)),
            now,
            trade.causation_id.clone(),
        );

        let new_snapshot = self.snapshot_after(
            trade,
            key.clone(),
            snapshot.as_ref(),
            &state,
            event_ver,
            PositionStatus::Active,
            upi.clone(),
            direction,
            now,
        );
        let total = new_snapshot.total_qty();

        let outcome = ApplyOutcome {
            trade_id: trade.trade_id.clone(),
            position_key: key.clone(),
            event_version: event_ver,
            new_total_qty: total,
            status: PositionStatus::Active,
            upi: upi.clone(),
            duplicate: false,
            split: None,
        };

        Plan {
            applied: vec![self.applied_message(trade, key, event_ver, total, PositionStatus::Active, &upi, now)],
            reports: vec![TradeReport::for_trade(trade, key.clone(), upi, now)],
            unit: CommitUnit {
                events: vec![event],
                snapshots: vec![SnapshotWrite {
                    snapshot: new_snapshot,
                    expected_ver: snapshot.as_ref().map(|s| s.last_ver),
                }],
                idempotency: Some(IdempotencyRecord::processed(
                    trade.trade_id.clone(),
                    key.clone(),
                    event_ver,
                    now,
                )),
            },
            outcome,
            history,
        }
    }

    /// DECREASE, including the sign-change split when the reduction
    /// overshoots the open lots.
    async fn plan_decrease(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        snapshot: Snapshot,
    ) -> Result<Plan, EngineError> {
        let now = Utc::now();
        let method = self.rules.tax_lot_method(&trade.contract_id).await;
        let mut state = inflate(&snapshot.compressed_lots);

        let result = LotEngine::reduce_lots(
            &mut state,
            trade.quantity,
            method,
            trade.price,
            trade.effective_date,
        );
        state.retain_open();

        if !result.has_excess() {
            let total = state.total_qty();
            let status = if total.is_zero() {
                PositionStatus::Terminated
            } else {
                PositionStatus::Active
            };
            let event_ver = snapshot.last_ver + 1;

            let history = if status == PositionStatus::Terminated {
                vec![self.history_entry(
                    key,
                    trade,
                    snapshot.upi.clone(),
                    None,
                    PositionStatus::Terminated,
                    Some(PositionStatus::Active),
                    UpiChangeType::Terminated,
                    "position fully closed",
                    now,
                )]
            } else {
                Vec::new()
            };

            let event = self.event_for(
                key.clone(),
                event_ver,
                EventType::Decrease,
                trade.clone(),
                Some(MetaLots::Reduced(result)),
                now,
                trade.causation_id.clone(),
            );
            let new_snapshot = self.snapshot_after(
                trade,
                key.clone(),
                Some(&snapshot),
                &state,
                event_ver,
                status,
                snapshot.upi.clone(),
                snapshot.direction,
                now,
            );

            let outcome = ApplyOutcome {
                trade_id: trade.trade_id.clone(),
                position_key: key.clone(),
                event_version: event_ver,
                new_total_qty: total,
                status,
                upi: snapshot.upi.clone(),
                duplicate: false,
                split: None,
            };

            return Ok(Plan {
                applied: vec![self.applied_message(trade, key, event_ver, total, status, &snapshot.upi, now)],
                reports: vec![TradeReport::for_trade(trade, key.clone(), snapshot.upi.clone(), now)],
                unit: CommitUnit {
                    events: vec![event],
                    snapshots: vec![SnapshotWrite {
                        snapshot: new_snapshot,
                        expected_ver: Some(snapshot.last_ver),
                    }],
                    idempotency: Some(IdempotencyRecord::processed(
                        trade.trade_id.clone(),
                        key.clone(),
                        event_ver,
                        now,
                    )),
                },
                outcome,
                history,
            });
        }

        // ----- sign change: close this key, open the excess opposite -----
        self.stats.sign_changes.fetch_add(1, Ordering::Relaxed);
        let excess = result.excess_qty;
        let old_ver = snapshot.last_ver + 1;

        let close_event = self.event_for(
            key.clone(),
            old_ver,
            EventType::Decrease,
            trade.clone(),
            Some(MetaLots::Reduced(result)),
            now,
            trade.causation_id.clone(),
        );
        let closed_snapshot = self.snapshot_after(
            trade,
            key.clone(),
            Some(&snapshot),
            &state, // flat
            old_ver,
            PositionStatus::Terminated,
            snapshot.upi.clone(),
            snapshot.direction,
            now,
        );

        let new_direction = snapshot.direction.opposite();
        let opposite_key = position_key::generate(
            &trade.account,
            &trade.instrument,
            &trade.currency,
            new_direction,
        );
        let opposite = self
            .store
            .snapshot(&opposite_key)
            .await
            .map_err(EngineError::from)?;

        let signed_excess = if new_direction.is_short() {
            -excess
        } else {
            excess
        };
        let mut opposite_state = opposite
            .as_ref()
            .map(|s| inflate(&s.compressed_lots))
            .unwrap_or_default();
        let opened = LotEngine::add_lot(
            &mut opposite_state,
            position_key::lot_id(&opposite_key, &trade.trade_id),
            signed_excess,
            trade.price,
            trade.effective_date,
        );

        let opposite_ver = opposite.as_ref().map(|s| s.last_ver).unwrap_or(0) + 1;
        let opposite_active = opposite
            .as_ref()
            .is_some_and(|s| s.status == PositionStatus::Active);
        let (opposite_upi, opposite_event_type) = if opposite_active {
            // the existing opposite life absorbs the excess as an increase
            (
                opposite.as_ref().map(|s| s.upi.clone()).unwrap_or_default(),
                EventType::Increase,
            )
        } else {
            (trade.trade_id.clone(), EventType::NewTrade)
        };

        // correlation chaining: the opposite-key event is caused by the
        // closing trade, under the same correlation id
        let open_event = self.event_for(
            opposite_key.clone(),
            opposite_ver,
            opposite_event_type,
            trade.clone(),
            Some(MetaLots::Opened(opened)),
            now,
            trade.trade_id.clone(),
        );
        let opposite_snapshot = self.snapshot_after(
            trade,
            opposite_key.clone(),
            opposite.as_ref(),
            &opposite_state,
            opposite_ver,
            PositionStatus::Active,
            opposite_upi.clone(),
            new_direction,
            now,
        );
        let opposite_total = opposite_snapshot.total_qty();

        let mut history = vec![self.history_entry(
            key,
            trade,
            snapshot.upi.clone(),
            None,
            PositionStatus::Terminated,
            Some(PositionStatus::Active),
            UpiChangeType::Terminated,
            "position closed by sign change",
            now,
        )];
        if !opposite_active {
            let (change, previous_upi, previous_status) = match opposite.as_ref() {
                None => (UpiChangeType::Created, None, None),
                Some(prev) => (
                    UpiChangeType::Reopened,
                    Some(prev.upi.clone()),
                    Some(prev.status),
                ),
            };
            history.push(self.history_entry(
                &opposite_key,
                trade,
                trade.trade_id.clone(),
                previous_upi,
                PositionStatus::Active,
                previous_status,
                change,
                "position opened by sign change",
                now,
            ));
        }

        let outcome = ApplyOutcome {
            trade_id: trade.trade_id.clone(),
            position_key: key.clone(),
            event_version: old_ver,
            new_total_qty: Decimal::ZERO,
            status: PositionStatus::Terminated,
            upi: snapshot.upi.clone(),
            duplicate: false,
            split: Some(SplitOutcome {
                position_key: opposite_key.clone(),
                event_version: opposite_ver,
                upi: opposite_upi.clone(),
                quantity: signed_excess,
            }),
        };

        Ok(Plan {
            applied: vec![
                self.applied_message(
                    trade,
                    key,
                    old_ver,
                    Decimal::ZERO,
                    PositionStatus::Terminated,
                    &snapshot.upi,
                    now,
                ),
                self.applied_message(
                    trade,
                    &opposite_key,
                    opposite_ver,
                    opposite_total,
                    PositionStatus::Active,
                    &opposite_upi,
                    now,
                ),
            ],
            reports: vec![
                TradeReport::for_trade(trade, key.clone(), snapshot.upi.clone(), now),
                TradeReport::for_trade(trade, opposite_key.clone(), opposite_upi, now),
            ],
            unit: CommitUnit {
                events: vec![close_event, open_event],
                snapshots: vec![
                    SnapshotWrite {
                        snapshot: closed_snapshot,
                        expected_ver: Some(snapshot.last_ver),
                    },
                    SnapshotWrite {
                        snapshot: opposite_snapshot,
                        expected_ver: opposite.as_ref().map(|s| s.last_ver),
                    },
                ],
                idempotency: Some(IdempotencyRecord::processed(
                    trade.trade_id.clone(),
                    key.clone(),
                    old_ver,
                    now,
                )),
            },
            outcome,
            history,
        })
    }

    // ============================================================
    // SMALL BUILDERS
    // ============================================================

    #[allow(clippy::too_many_arguments)]
    fn event_for(
        &self,
        position_key: PositionKey,
        event_ver: EventVer,
        event_type: EventType,
        payload: TradeEvent,
        meta_lots: Option<MetaLots>,
        now: chrono::DateTime<Utc>,
        causation_id: String,
    ) -> PositionEvent {
        PositionEvent {
            position_key,
            event_ver,
            event_type,
            effective_date: payload.effective_date,
            occurred_at: now,
            correlation_id: payload.correlation_id.clone(),
            causation_id,
            payload,
            meta_lots,
            archival_flag: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn snapshot_after(
        &self,
        trade: &TradeEvent,
        position_key: PositionKey,
        previous: Option<&Snapshot>,
        state: &PositionState,
        last_ver: EventVer,
        status: PositionStatus,
        upi: Upi,
        direction: Direction,
        now: chrono::DateTime<Utc>,
    ) -> Snapshot {
        let latest_effective_date = previous
            .and_then(|s| s.latest_effective_date)
            .map(|d| d.max(trade.effective_date))
            .or(Some(trade.effective_date));

        Snapshot {
            position_key,
            last_ver,
            compressed_lots: compress(state),
            status,
            reconciliation_status: ReconciliationStatus::Reconciled,
            upi,
            account: trade.account.clone(),
            instrument: trade.instrument.clone(),
            currency: trade.currency.clone(),
            contract_id: trade.contract_id.clone(),
            direction,
            latest_effective_date,
            last_updated_at: now,
            archival_flag: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn history_entry(
        &self,
        key: &PositionKey,
        trade: &TradeEvent,
        upi: Upi,
        previous_upi: Option<Upi>,
        status: PositionStatus,
        previous_status: Option<PositionStatus>,
        change_type: UpiChangeType,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) -> UpiHistoryEntry {
        UpiHistoryEntry {
            position_key: key.clone(),
            upi,
            previous_upi,
            status,
            previous_status,
            change_type,
            triggering_trade_id: trade.trade_id.clone(),
            backdated_trade_id: None,
            occurred_at: now,
            effective_date: trade.effective_date,
            reason: reason.to_string(),
            merged_from_position_key: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn applied_message(
        &self,
        trade: &TradeEvent,
        key: &PositionKey,
        event_ver: EventVer,
        total: Decimal,
        status: PositionStatus,
        upi: &str,
        now: chrono::DateTime<Utc>,
    ) -> TradeApplied {
        TradeApplied {
            trade_id: trade.trade_id.clone(),
            position_key: key.clone(),
            event_ver,
            new_total_qty: total,
            status,
            upi: upi.to_string(),
            occurred_at: now,
            correlation_id: trade.correlation_id.clone(),
        }
    }
}

// ============================================================
// TESTS
// ============================================================
