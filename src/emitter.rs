//! Outbound emitter - after-commit stream production
//!
//! Six named logical streams, each a sequence of JSON records keyed by
//! position key so per-key ordering is preserved end to end:
//!
//! ```text
//! trade-applied       one per hotpath commit
//! provisional-trade   one per coldpath entry (PROVISIONAL marker)
//! position-corrected  one per coldpath commit
//! regulatory          TRADE_REPORT / UPI_INVALIDATION / TRADE_CORRECTION
//! dlq                 validation failures
//! error-retry         transient failures suitable for retry
//! ```
//!
//! Outbox discipline: emits happen strictly after the primary commit, and
//! an emit failure is logged but never rolls the commit back. Within the
//! regulatory stream the UPI_INVALIDATION summary for a coldpath commit is
//! produced before its TRADE_CORRECTION fan-out; consumers may rely on
//! that ordering.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

// ============================================================
// STREAMS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    TradeApplied,
    ProvisionalTrade,
    PositionCorrected,
    Regulatory,
    Dlq,
    ErrorRetry,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::TradeApplied => "trade-applied",
            StreamName::ProvisionalTrade => "provisional-trade",
            StreamName::PositionCorrected => "position-corrected",
            StreamName::Regulatory => "regulatory",
            StreamName::Dlq => "dlq",
            StreamName::ErrorRetry => "error-retry",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One produced record: stream, partition key, serialized payload.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub stream: StreamName,
    /// Partition key - the position key's hex form.
    pub key: String,
    pub payload: serde_json::Value,
}

// ============================================================
// EMITTER
// ============================================================

/// Emission counters per stream.
#[derive(Debug, Default)]
pub struct EmitterStats {
    pub emitted: AtomicU64,
    pub dropped: AtomicU64,
}

/// Producer half. Cheap to clone via `Arc`.
pub struct OutboundEmitter {
    trade_applied: mpsc::UnboundedSender<OutboundRecord>,
    provisional_trade: mpsc::UnboundedSender<OutboundRecord>,
    position_corrected: mpsc::UnboundedSender<OutboundRecord>,
    regulatory: mpsc::UnboundedSender<OutboundRecord>,
    dlq: mpsc::UnboundedSender<OutboundRecord>,
    error_retry: mpsc::UnboundedSender<OutboundRecord>,
    stats: EmitterStats,
}

/// Consumer half, one receiver per stream.
pub struct OutboundReceivers {
    pub trade_applied: mpsc::UnboundedReceiver<OutboundRecord>,
    pub provisional_trade: mpsc::UnboundedReceiver<OutboundRecord>,
    pub position_corrected: mpsc::UnboundedReceiver<OutboundRecord>,
    pub regulatory: mpsc::UnboundedReceiver<OutboundRecord>,
    pub dlq: mpsc::UnboundedReceiver<OutboundRecord>,
    pub error_retry: mpsc::UnboundedReceiver<OutboundRecord>,
}

impl OutboundEmitter {
    pub fn new() -> (Self, OutboundReceivers) {
        let (trade_applied_tx, trade_applied_rx) = mpsc::unbounded_channel();
        let (provisional_tx, provisional_rx) = mpsc::unbounded_channel();
        let (corrected_tx, corrected_rx) = mpsc::unbounded_channel();
        let (regulatory_tx, regulatory_rx) = mpsc::unbounded_channel();
        let (dlq_tx, dlq_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        (
            Self {
                trade_applied: trade_applied_tx,
                provisional_trade: provisional_tx,
                position_corrected: corrected_tx,
                regulatory: regulatory_tx,
                dlq: dlq_tx,
                error_retry: retry_tx,
                stats: EmitterStats::default(),
            },
            OutboundReceivers {
                trade_applied: trade_applied_rx,
                provisional_trade: provisional_rx,
                position_corrected: corrected_rx,
                regulatory: regulatory_rx,
                dlq: dlq_rx,
                error_retry: retry_rx,
            },
        )
    }

    #[inline]
    pub fn stats(&self) -> &EmitterStats {
        &self.stats
    }

    /// Emit one record. Serialization or send failure is logged and
    /// swallowed: the primary commit already happened.
    pub fn emit<T: Serialize>(&self, stream: StreamName, key: &str, message: &T) {
        let payload = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(stream = %stream, key, error = %e, "Failed to serialize outbound record");
                return;
            }
        };

        let record = OutboundRecord {
            stream,
            key: key.to_string(),
            payload,
        };

        let sender = match stream {
            StreamName::TradeApplied => &self.trade_applied,
            StreamName::ProvisionalTrade => &self.provisional_trade,
            StreamName::PositionCorrected => &self.position_corrected,
            StreamName::Regulatory => &self.regulatory,
            StreamName::Dlq => &self.dlq,
            StreamName::ErrorRetry => &self.error_retry,
        };

        match sender.send(record) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(stream = %stream, key, "Outbound stream has no consumer, record dropped");
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_names() {
        assert_eq!(StreamName::TradeApplied.as_str(), "trade-applied");
        assert_eq!(StreamName::ErrorRetry.as_str(), "error-retry");
    }

    #[tokio::test]
    async fn test_emit_routes_to_stream() {
        let (emitter, mut rx) = OutboundEmitter::new();

        emitter.emit(StreamName::TradeApplied, "key1", &json!({"a": 1}));
        emitter.emit(StreamName::Dlq, "key2", &json!({"b": 2}));

        let applied = rx.trade_applied.recv().await.unwrap();
        assert_eq!(applied.key, "key1");
        assert_eq!(applied.payload["a"], 1);

        let dlq = rx.dlq.recv().await.unwrap();
        assert_eq!(dlq.stream, StreamName::Dlq);
        assert_eq!(emitter.stats().emitted.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_per_key_ordering_preserved() {
        let (emitter, mut rx) = OutboundEmitter::new();

        for i in 0..10 {
            emitter.emit(StreamName::Regulatory, "key1", &json!({"seq": i}));
        }
        for i in 0..10 {
            let record = rx.regulatory.recv().await.unwrap();
            assert_eq!(record.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_dropped_when_receiver_gone() {
        let (emitter, rx) = OutboundEmitter::new();
        drop(rx);

        emitter.emit(StreamName::TradeApplied, "key1", &json!({}));
        assert_eq!(emitter.stats().dropped.load(Ordering::Relaxed), 1);
    }
}
