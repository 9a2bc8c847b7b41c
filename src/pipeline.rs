//! Trade pipeline - partitioned workers over the dual processing paths
//!
//! ```text
//!                      ┌─> hot worker 0 ─┐   (validate -> idempotency ->
//! submit/ingest ──hash─┼─> hot worker 1 ─┼──  classify -> hotpath apply)
//!   by positionKey     └─> hot worker N ─┘
//!                              │ BACKDATED
//!                              ▼
//!                      ┌─> cold worker 0 ─┐  (chronological replay)
//!                      └─> cold worker M ─┘
//! ```
//!
//! Per-key happens-before ordering: the input is partitioned by position
//! key, so one key is consumed by a single hot worker at a time. The event
//! store's `(position_key, event_ver)` uniqueness is the secondary fence
//! that catches any violation and feeds the hotpath retry loop.
//!
//! The hot and cold pools are fully separate (own queues, own workers) so
//! coldpath back-pressure cannot starve the hotpath.

use chrono::Utc;
use rust_decimal::Decimal;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::classifier::Classifier;
use crate::coldpath::ColdpathEngine;
use crate::core_types::{EventVer, PositionKey, Upi};
use crate::emitter::{OutboundEmitter, StreamName};
use crate::error::EngineError;
use crate::hotpath::{ApplyOutcome, HotpathEngine};
use crate::messages::{DlqRecord, ErrorRetryRecord};
use crate::models::{
    IdempotencyStatus, PositionStatus, SequenceStatus, TradeEvent,
};
use crate::store::PositionStore;
use crate::validator::Validator;

// ============================================================
// OUTCOME
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Committed on the hotpath.
    Applied,
    /// Previously committed; prior result returned.
    Duplicate,
    /// Routed to the coldpath queue for asynchronous reconciliation.
    QueuedBackdated,
}

impl SubmitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitStatus::Applied => "APPLIED",
            SubmitStatus::Duplicate => "DUPLICATE",
            SubmitStatus::QueuedBackdated => "QUEUED_BACKDATED",
        }
    }
}

/// What the synchronous submit endpoint returns.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    pub position_key: PositionKey,
    pub event_version: Option<EventVer>,
    pub upi: Option<Upi>,
    pub total_qty: Option<Decimal>,
    pub position_status: Option<PositionStatus>,
}

impl SubmitOutcome {
    fn applied(outcome: ApplyOutcome) -> Self {
        Self {
            status: if outcome.duplicate {
                SubmitStatus::Duplicate
            } else {
                SubmitStatus::Applied
            },
            position_key: outcome.position_key,
            event_version: Some(outcome.event_version),
            upi: Some(outcome.upi),
            total_qty: Some(outcome.new_total_qty),
            position_status: Some(outcome.status),
        }
    }

    fn queued(position_key: PositionKey) -> Self {
        Self {
            status: SubmitStatus::QueuedBackdated,
            position_key,
            event_version: None,
            upi: None,
            total_qty: None,
            position_status: None,
        }
    }
}

// ============================================================
// PIPELINE
// ============================================================

struct HotJob {
    trade: TradeEvent,
    reply: Option<oneshot::Sender<Result<SubmitOutcome, EngineError>>>,
}

pub struct TradePipeline {
    hot_txs: Vec<mpsc::Sender<HotJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl TradePipeline {
    /// Spawn the hot and cold worker pools.
    pub fn spawn(
        hotpath: Arc<HotpathEngine>,
        coldpath: Arc<ColdpathEngine>,
        store: Arc<dyn PositionStore>,
        emitter: Arc<OutboundEmitter>,
        settings: crate::config::EngineSettings,
    ) -> Self {
        let mut workers = Vec::new();

        // cold pool first so hot workers can hold its senders
        let mut cold_txs = Vec::with_capacity(settings.coldpath_workers.max(1));
        for worker_id in 0..settings.coldpath_workers.max(1) {
            let (tx, mut rx) = mpsc::channel::<TradeEvent>(settings.queue_capacity);
            cold_txs.push(tx);
            let coldpath = Arc::clone(&coldpath);
            let emitter = Arc::clone(&emitter);
            workers.push(tokio::spawn(async move {
                while let Some(trade) = rx.recv().await {
                    let trade_id = trade.trade_id.clone();
                    let trade_copy = trade.clone();
                    match coldpath.process(trade).await {
                        Ok(outcome) => {
                            tracing::debug!(
                                worker_id,
                                trade_id = %trade_id,
                                position_key = %outcome.position_key,
                                "Coldpath job reconciled"
                            );
                        }
                        Err(e) if e.retryable() => {
                            let stream_key = HotpathEngine::resolve_key(&trade_copy);
                            emitter.emit(
                                StreamName::ErrorRetry,
                                stream_key.as_str(),
                                &ErrorRetryRecord {
                                    trade: trade_copy,
                                    error_code: e.code().to_string(),
                                    error: e.to_string(),
                                    occurred_at: Utc::now(),
                                },
                            );
                        }
                        Err(e) => {
                            // DLQ/alerting already handled inside the engine
                            tracing::error!(worker_id, trade_id = %trade_id, error = %e, "Coldpath job failed");
                        }
                    }
                }
            }));
        }

        let mut hot_txs = Vec::with_capacity(settings.hotpath_workers.max(1));
        for worker_id in 0..settings.hotpath_workers.max(1) {
            let (tx, mut rx) = mpsc::channel::<HotJob>(settings.queue_capacity);
            hot_txs.push(tx);
            let router = Router {
                hotpath: Arc::clone(&hotpath),
                store: Arc::clone(&store),
                emitter: Arc::clone(&emitter),
                validator: Validator::new(settings.max_forward_days),
                cold_txs: cold_txs.clone(),
            };
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let result = router.route(job.trade).await;
                    if let Some(reply) = job.reply {
                        // submitter may have timed out and gone away
                        let _ = reply.send(result);
                    } else if let Err(ref e) = result {
                        tracing::warn!(worker_id, error = %e, "Ingested trade failed");
                    }
                }
            }));
        }

        Self { hot_txs, workers }
    }

    fn partition(&self, key: &PositionKey) -> usize {
        let mut hasher = rustc_hash::FxHasher::default();
        key.as_str().hash(&mut hasher);
        (hasher.finish() as usize) % self.hot_txs.len()
    }

    /// Synchronous submit: routes through the owning worker and waits for
    /// the outcome.
    pub async fn submit(&self, trade: TradeEvent) -> Result<SubmitOutcome, EngineError> {
        let key = HotpathEngine::resolve_key(&trade);
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = HotJob {
            trade,
            reply: Some(reply_tx),
        };
        self.hot_txs[self.partition(&key)]
            .send(job)
            .await
            .map_err(|_| EngineError::Fatal("pipeline is shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Fatal("pipeline worker dropped the reply".to_string()))?
    }

    /// Fire-and-forget ingest for the streaming transport.
    pub async fn ingest(&self, trade: TradeEvent) -> Result<(), EngineError> {
        let key = HotpathEngine::resolve_key(&trade);
        let job = HotJob {
            trade,
            reply: None,
        };
        self.hot_txs[self.partition(&key)]
            .send(job)
            .await
            .map_err(|_| EngineError::Fatal("pipeline is shut down".to_string()))
    }

    /// Drain queues and stop all workers.
    pub async fn shutdown(mut self) {
        self.hot_txs.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

// ============================================================
// ROUTER (runs inside each hot worker)
// ============================================================

struct Router {
    hotpath: Arc<HotpathEngine>,
    store: Arc<dyn PositionStore>,
    emitter: Arc<OutboundEmitter>,
    validator: Validator,
    cold_txs: Vec<mpsc::Sender<TradeEvent>>,
}

impl Router {
    /// Validate -> idempotency -> classify -> dispatch.
    async fn route(&self, mut trade: TradeEvent) -> Result<SubmitOutcome, EngineError> {
        let key = HotpathEngine::resolve_key(&trade);
        let today = Utc::now().date_naive();

        // idempotency first: a resubmitted trade must return its prior
        // result even though the state machine would reject it today
        if let Some(record) = self
            .store
            .idempotency(&trade.trade_id)
            .await
            .map_err(EngineError::from)?
        {
            if record.status == IdempotencyStatus::Processed {
                let snap = self
                    .store
                    .snapshot(&record.position_key)
                    .await
                    .map_err(EngineError::from)?;
                return Ok(SubmitOutcome {
                    status: SubmitStatus::Duplicate,
                    position_key: record.position_key,
                    event_version: record.event_version,
                    upi: snap.as_ref().map(|s| s.upi.clone()),
                    total_qty: snap.as_ref().map(|s| s.total_qty()),
                    position_status: snap.map(|s| s.status),
                });
            }
        }

        let snapshot = self.store.snapshot(&key).await.map_err(EngineError::from)?;

        if let Err(failure) = self.validator.validate(&trade, snapshot.as_ref(), today) {
            self.emitter.emit(
                StreamName::Dlq,
                key.as_str(),
                &DlqRecord {
                    trade: trade.clone(),
                    errors: failure.errors.clone(),
                    occurred_at: Utc::now(),
                },
            );
            return Err(EngineError::Validation(failure));
        }

        let class = Classifier::classify(&trade, snapshot.as_ref(), today);
        trade.sequence_status = Some(class);

        match class {
            SequenceStatus::Backdated => {
                let partition = {
                    let mut hasher = rustc_hash::FxHasher::default();
                    key.as_str().hash(&mut hasher);
                    (hasher.finish() as usize) % self.cold_txs.len()
                };
                self.cold_txs[partition]
                    .send(trade)
                    .await
                    .map_err(|_| EngineError::Fatal("coldpath pool is shut down".to_string()))?;
                Ok(SubmitOutcome::queued(key))
            }
            SequenceStatus::CurrentDated | SequenceStatus::ForwardDated => {
                match self.hotpath.process(trade.clone()).await {
                    Ok(outcome) => Ok(SubmitOutcome::applied(outcome)),
                    Err(e) => {
                        match &e {
                            EngineError::Validation(failure) => {
                                // snapshot moved between our check and the
                                // engine's; same routing as above
                                self.emitter.emit(
                                    StreamName::Dlq,
                                    key.as_str(),
                                    &DlqRecord {
                                        trade: trade.clone(),
                                        errors: failure.errors.clone(),
                                        occurred_at: Utc::now(),
                                    },
                                );
                            }
                            e if e.retryable() => {
                                self.emitter.emit(
                                    StreamName::ErrorRetry,
                                    key.as_str(),
                                    &ErrorRetryRecord {
                                        trade: trade.clone(),
                                        error_code: e.code().to_string(),
                                        error: e.to_string(),
                                        occurred_at: Utc::now(),
                                    },
                                );
                            }
                            e => {
                                tracing::error!(
                                    trade_id = %trade.trade_id,
                                    error = %e,
                                    "Hotpath failure surfaced to operator"
                                );
                            }
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================
