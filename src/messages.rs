//! Outbound message types
//!
//! JSON records produced to the named logical streams (see `emitter`).
//! Field names and ordering are the canonical on-wire schema; every record
//! carries the correlation id explicitly - no ambient context.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core_types::{PositionKey, TradeId, Upi};
use crate::models::{PositionStatus, TradeEvent, TradeType};

// ============================================================
// TRADE APPLIED / POSITION CORRECTED
// ============================================================

/// `trade-applied` - one per hotpath commit (one per key on a sign-change
/// split, correlation-chained).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeApplied {
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    pub event_ver: i64,
    pub new_total_qty: Decimal,
    pub status: PositionStatus,
    pub upi: Upi,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
}

/// Downstream systems notified by a correction.
pub const AFFECTED_SYSTEMS: [&str; 4] = ["RISK", "P_AND_L", "REPORTING", "SETTLEMENT"];

/// `position-corrected` - one per coldpath commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionCorrected {
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    pub event_ver: i64,
    pub new_total_qty: Decimal,
    pub status: PositionStatus,
    pub upi: Upi,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    pub reason: String,
    pub backdated_trade_id: TradeId,
    pub affected_systems: Vec<String>,
}

pub const CORRECTION_REASON: &str = "BACKDATED_TRADE_RECALCULATION";

/// `provisional-trade` - marker emitted on coldpath entry, before replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionalTrade {
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    pub reconciliation_status: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
}

// ============================================================
// REGULATORY STREAM
// ============================================================

/// `regulatory` / TRADE_REPORT - one per committed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeReport {
    #[serde(rename = "type")]
    pub record_type: String,
    pub submission_id: Uuid,
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    pub upi: Upi,
    pub trade_type: TradeType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub effective_date: NaiveDate,
    pub contract_id: String,
    pub correlation_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl TradeReport {
    pub fn for_trade(
        trade: &TradeEvent,
        position_key: PositionKey,
        upi: Upi,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record_type: "TRADE_REPORT".to_string(),
            submission_id: Uuid::new_v4(),
            trade_id: trade.trade_id.clone(),
            position_key,
            upi,
            trade_type: trade.trade_type,
            quantity: trade.quantity,
            price: trade.price,
            effective_date: trade.effective_date,
            contract_id: trade.contract_id.clone(),
            correlation_id: trade.correlation_id.clone(),
            submitted_at,
        }
    }
}

/// `regulatory` / UPI_INVALIDATION - summary per invalidated UPI, produced
/// BEFORE its TRADE_CORRECTION fan-out (consumers rely on this order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpiInvalidation {
    #[serde(rename = "type")]
    pub record_type: String,
    pub position_key: PositionKey,
    #[serde(rename = "invalidatedUPI")]
    pub invalidated_upi: Upi,
    #[serde(rename = "newUPI")]
    pub new_upi: Upi,
    pub invalidated_trade_ids: Vec<TradeId>,
    pub reason: String,
    pub backdated_trade_id: TradeId,
    pub effective_date: NaiveDate,
    pub occurred_at: DateTime<Utc>,
    pub action_required: String,
}

pub const INVALIDATION_ACTION: &str = "RESUBMIT_TRADES_WITH_NEW_UPI";

/// `regulatory` / TRADE_CORRECTION - one per invalidated trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCorrection {
    #[serde(rename = "type")]
    pub record_type: String,
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    #[serde(rename = "originalUPI")]
    pub original_upi: Upi,
    #[serde(rename = "correctedUPI")]
    pub corrected_upi: Upi,
    pub trade_type: TradeType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub effective_date: NaiveDate,
    pub reason: String,
    pub backdated_trade_id: TradeId,
    pub action_required: String,
}

pub const CORRECTION_ACTION: &str = "CORRECT_TRADE_WITH_NEW_UPI";

// ============================================================
// FAILURE STREAMS
// ============================================================

/// `dlq` - validation rejects, original payload attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecord {
    pub trade: TradeEvent,
    pub errors: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// `error-retry` - transient failures suitable for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRetryRecord {
    pub trade: TradeEvent,
    pub error_code: String,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Direction;
    use crate::position_key;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_report_wire_shape() {
        let trade = TradeEvent {
            trade_id: "T1".into(),
            position_key: None,
            account: "ACC-1".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            trade_type: TradeType::NewTrade,
            quantity: dec!(1000),
            price: dec!(50),
            effective_date: "2025-01-10".parse().unwrap(),
            contract_id: "C-1".into(),
            correlation_id: "corr-1".into(),
            causation_id: "cause-1".into(),
            user_id: "u1".into(),
            sequence_status: None,
        };
        let key = position_key::generate("ACC-1", "AAPL", "USD", Direction::Long);
        let report = TradeReport::for_trade(&trade, key, "T1".into(), Utc::now());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "TRADE_REPORT");
        assert_eq!(json["tradeId"], "T1");
        assert_eq!(json["upi"], "T1");
        assert!(json["submissionId"].is_string());
    }

    #[test]
    fn test_invalidation_action_constants() {
        assert_eq!(INVALIDATION_ACTION, "RESUBMIT_TRADES_WITH_NEW_UPI");
        assert_eq!(CORRECTION_ACTION, "CORRECT_TRADE_WITH_NEW_UPI");
        assert_eq!(CORRECTION_REASON, "BACKDATED_TRADE_RECALCULATION");
    }
}
