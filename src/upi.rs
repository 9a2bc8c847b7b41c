//! UPI lifecycle - Unique Position Identifier tracking
//!
//! A UPI identifies one "life" of a position: it is the tradeId of the
//! NEW_TRADE that opened (or reopened) the position. Assignment rules:
//!
//! - First NEW_TRADE on a key: UPI = tradeId, CREATED.
//! - Total quantity reaches zero: TERMINATED (value retained for audit).
//! - NEW_TRADE while TERMINATED: UPI = new tradeId, REOPENED.
//! - Sign-change split: old key TERMINATED, new-direction key CREATED.
//!
//! The coldpath's replay additionally detects INVALIDATED / RESTORED /
//! MERGED by diffing the recomputed timeline against the pre-replay state.
//!
//! History writes use their own transactional boundary and are idempotent
//! on `(position_key, upi, occurred_at, change_type)`, so a failed write
//! never fails the main commit and retries are safe.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::core_types::{PositionKey, TradeId, Upi};
use crate::models::{PositionStatus, TradeType};

// ============================================================
// CHANGE TYPES AND HISTORY
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpiChangeType {
    Created,
    Terminated,
    Reopened,
    Invalidated,
    Merged,
    Restored,
}

impl UpiChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpiChangeType::Created => "CREATED",
            UpiChangeType::Terminated => "TERMINATED",
            UpiChangeType::Reopened => "REOPENED",
            UpiChangeType::Invalidated => "INVALIDATED",
            UpiChangeType::Merged => "MERGED",
            UpiChangeType::Restored => "RESTORED",
        }
    }
}

impl fmt::Display for UpiChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audit row in the UPI history container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpiHistoryEntry {
    pub position_key: PositionKey,
    pub upi: Upi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_upi: Option<Upi>,
    pub status: PositionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<PositionStatus>,
    pub change_type: UpiChangeType,
    pub triggering_trade_id: TradeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backdated_trade_id: Option<TradeId>,
    pub occurred_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_from_position_key: Option<PositionKey>,
}

impl UpiHistoryEntry {
    /// Idempotency key for history inserts.
    pub fn dedup_key(&self) -> (PositionKey, Upi, DateTime<Utc>, UpiChangeType) {
        (
            self.position_key.clone(),
            self.upi.clone(),
            self.occurred_at,
            self.change_type,
        )
    }
}

// ============================================================
// REPLAY TRACKER
// ============================================================

/// One UPI transition observed while processing or replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpiTransition {
    pub change_type: UpiChangeType,
    pub upi: Upi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_upi: Option<Upi>,
    pub trade_id: TradeId,
    pub effective_date: NaiveDate,
}

/// Contiguous run of trades processed under one UPI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpiSegment {
    pub upi: Upi,
    pub trade_ids: Vec<TradeId>,
    pub terminated: bool,
}

/// Tracks (currentUPI, status) while events are applied in chronological
/// order. The coldpath uses it during replay; the property tests use it to
/// check UPI reconstructibility against incremental processing.
#[derive(Debug, Default)]
pub struct UpiTracker {
    current_upi: Option<Upi>,
    status: Option<PositionStatus>,
    transitions: Vec<UpiTransition>,
    segments: Vec<UpiSegment>,
}

impl UpiTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current_upi(&self) -> Option<&Upi> {
        self.current_upi.as_ref()
    }

    #[inline]
    pub fn status(&self) -> Option<PositionStatus> {
        self.status
    }

    #[inline]
    pub fn transitions(&self) -> &[UpiTransition] {
        &self.transitions
    }

    #[inline]
    pub fn segments(&self) -> &[UpiSegment] {
        &self.segments
    }

    /// Observe one applied event. `total_after` is the position's total
    /// quantity after the lot engine applied the event.
    ///
    /// A NEW_TRADE while ACTIVE keeps the current UPI: replay reorders
    /// history, and a reopen that is no longer preceded by a termination
    /// degrades to an increase on the still-live UPI.
    pub fn apply(
        &mut self,
        trade_type: TradeType,
        trade_id: &str,
        effective_date: NaiveDate,
        total_after: Decimal,
    ) {
        match trade_type {
            TradeType::NewTrade => match self.status {
                None => self.open(trade_id, effective_date, UpiChangeType::Created),
                Some(PositionStatus::Terminated) => {
                    self.open(trade_id, effective_date, UpiChangeType::Reopened)
                }
                Some(PositionStatus::Active) => self.record_trade(trade_id),
            },
            TradeType::Increase | TradeType::Decrease => self.record_trade(trade_id),
        }

        if total_after.is_zero() && self.status == Some(PositionStatus::Active) {
            self.terminate(trade_id, effective_date);
        }
    }

    /// Same-key sign flip (coldpath only): the old life terminates and the
    /// excess opens a new life under the flipping trade's id.
    pub fn sign_flip(&mut self, trade_id: &str, effective_date: NaiveDate) {
        if self.status == Some(PositionStatus::Active) {
            self.terminate(trade_id, effective_date);
        }
        self.open(trade_id, effective_date, UpiChangeType::Reopened);
    }

    fn open(&mut self, trade_id: &str, effective_date: NaiveDate, change: UpiChangeType) {
        let previous = self.current_upi.clone();
        self.transitions.push(UpiTransition {
            change_type: change,
            upi: trade_id.to_string(),
            previous_upi: previous,
            trade_id: trade_id.to_string(),
            effective_date,
        });
        self.current_upi = Some(trade_id.to_string());
        self.status = Some(PositionStatus::Active);
        self.segments.push(UpiSegment {
            upi: trade_id.to_string(),
            trade_ids: vec![trade_id.to_string()],
            terminated: false,
        });
    }

    fn terminate(&mut self, trade_id: &str, effective_date: NaiveDate) {
        let upi = self
            .current_upi
            .clone()
            .expect("terminate requires an open UPI");
        self.transitions.push(UpiTransition {
            change_type: UpiChangeType::Terminated,
            upi,
            previous_upi: None,
            trade_id: trade_id.to_string(),
            effective_date,
        });
        self.status = Some(PositionStatus::Terminated);
        if let Some(seg) = self.segments.last_mut() {
            seg.terminated = true;
        }
    }

    fn record_trade(&mut self, trade_id: &str) {
        if let Some(seg) = self.segments.last_mut() {
            seg.trade_ids.push(trade_id.to_string());
        }
    }

    /// Segment owned by `upi`, if any.
    pub fn segment_for(&self, upi: &str) -> Option<&UpiSegment> {
        self.segments.iter().find(|s| s.upi == upi)
    }
}

// ============================================================
// TESTS
// ============================================================
