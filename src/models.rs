//! Domain model - trades, tax lots, snapshots
//!
//! The data model follows three rules:
//! - All money/quantity arithmetic is `rust_decimal::Decimal`. No floats.
//! - Wire names are camelCase; enum wire values are SCREAMING_SNAKE_CASE.
//! - Lots are plain value records with no back-references; the snapshot
//!   exclusively owns its lot sequence.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::core_types::{Direction, PositionKey, TradeId, Upi};

// ============================================================
// TRADE INPUT
// ============================================================

/// Trade type of an incoming trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType {
    NewTrade,
    Increase,
    Decrease,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::NewTrade => "NEW_TRADE",
            TradeType::Increase => "INCREASE",
            TradeType::Decrease => "DECREASE",
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Temporal class assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequenceStatus {
    CurrentDated,
    ForwardDated,
    Backdated,
}

/// Incoming trade event - the input to the whole engine.
///
/// `position_key` is optional; when absent it is derived from the
/// (account, instrument, currency) tuple with LONG direction. SHORT keys
/// only arise internally through the sign-change path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub trade_id: TradeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_key: Option<PositionKey>,
    pub account: String,
    pub instrument: String,
    pub currency: String,
    pub trade_type: TradeType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub effective_date: NaiveDate,
    pub contract_id: String,
    pub correlation_id: String,
    pub causation_id: String,
    pub user_id: String,
    /// Assigned by the classifier; absent on ingest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_status: Option<SequenceStatus>,
}

// ============================================================
// TAX LOTS
// ============================================================

/// Tax-lot allocation method, looked up per contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxLotMethod {
    Fifo,
    Lifo,
    Hifo,
}

impl TaxLotMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxLotMethod::Fifo => "FIFO",
            TaxLotMethod::Lifo => "LIFO",
            TaxLotMethod::Hifo => "HIFO",
        }
    }
}

impl fmt::Display for TaxLotMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaxLotMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(TaxLotMethod::Fifo),
            "LIFO" => Ok(TaxLotMethod::Lifo),
            "HIFO" => Ok(TaxLotMethod::Hifo),
            other => Err(format!("unknown tax lot method: {other}")),
        }
    }
}

/// An open parcel of a position.
///
/// Invariants: `|remaining_qty| <= |original_qty|` and
/// `sign(remaining_qty) == sign(original_qty)`. Short-position lots carry
/// negative quantities. A lot is open iff `remaining_qty != 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaxLot {
    pub lot_id: Uuid,
    pub trade_date: NaiveDate,
    pub price: Decimal,
    pub original_qty: Decimal,
    pub remaining_qty: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_qty: Option<Decimal>,
}

impl TaxLot {
    /// A fresh lot: remaining == original, unsettled.
    pub fn open(lot_id: Uuid, trade_date: NaiveDate, price: Decimal, qty: Decimal) -> Self {
        Self {
            lot_id,
            trade_date,
            price,
            original_qty: qty,
            remaining_qty: qty,
            settlement_date: None,
            settled_qty: None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.remaining_qty.is_zero()
    }
}

// ============================================================
// SNAPSHOT
// ============================================================

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Active,
    Terminated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the snapshot reflects a full chronological replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Reconciled,
    Provisional,
    Pending,
}

/// Current compressed state of a position plus concurrency metadata.
///
/// Created on the first NEW_TRADE for a key, mutated only by the hotpath
/// or coldpath, never deleted. `last_ver` equals the highest committed
/// event version for the key; the snapshot update is a compare-and-swap
/// on this field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub position_key: PositionKey,
    pub last_ver: i64,
    pub compressed_lots: crate::position_state::CompressedLots,
    pub status: PositionStatus,
    pub reconciliation_status: ReconciliationStatus,
    pub upi: Upi,
    pub account: String,
    pub instrument: String,
    pub currency: String,
    pub contract_id: String,
    pub direction: Direction,
    /// Latest effective date of any applied event; the classifier's
    /// backdating test reads this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_effective_date: Option<NaiveDate>,
    pub last_updated_at: DateTime<Utc>,
    pub archival_flag: bool,
}

impl Snapshot {
    #[inline]
    pub fn total_qty(&self) -> Decimal {
        self.compressed_lots.total_qty()
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.status == PositionStatus::Terminated
    }
}

// ============================================================
// IDEMPOTENCY
// ============================================================

/// Processing outcome of a trade id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Processed,
    Failed,
}

/// At-most-once record per trade id.
///
/// Inserted with the committed event version inside the same logical
/// transaction as the event/snapshot write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub trade_id: TradeId,
    pub position_key: PositionKey,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_version: Option<i64>,
    pub processed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processed(
        trade_id: TradeId,
        position_key: PositionKey,
        event_version: i64,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id,
            position_key,
            status: IdempotencyStatus::Processed,
            event_version: Some(event_version),
            processed_at,
        }
    }

    pub fn failed(
        trade_id: TradeId,
        position_key: PositionKey,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id,
            position_key,
            status: IdempotencyStatus::Failed,
            event_version: None,
            processed_at,
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_trade_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&TradeType::NewTrade).unwrap(),
            "\"NEW_TRADE\""
        );
        assert_eq!(
            serde_json::from_str::<TradeType>("\"DECREASE\"").unwrap(),
            TradeType::Decrease
        );
    }

    #[test]
    fn test_tax_lot_method_parse() {
        assert_eq!("fifo".parse::<TaxLotMethod>().unwrap(), TaxLotMethod::Fifo);
        assert_eq!("HIFO".parse::<TaxLotMethod>().unwrap(), TaxLotMethod::Hifo);
        assert!("AVCO".parse::<TaxLotMethod>().is_err());
    }

    #[test]
    fn test_tax_lot_open() {
        let lot = TaxLot::open(Uuid::nil(), date("2025-01-10"), dec!(50), dec!(1000));
        assert_eq!(lot.original_qty, lot.remaining_qty);
        assert!(lot.is_open());

        let mut closed = lot.clone();
        closed.remaining_qty = Decimal::ZERO;
        assert!(!closed.is_open());
    }

    #[test]
    fn test_trade_event_wire_shape() {
        let json = r#"{
            "tradeId": "T1",
            "account": "ACC-1",
            "instrument": "AAPL",
            "currency": "USD",
            "tradeType": "NEW_TRADE",
            "quantity": "1000",
            "price": "50",
            "effectiveDate": "2025-01-10",
            "contractId": "C-1",
            "correlationId": "corr-1",
            "causationId": "cause-1",
            "userId": "u1"
        }"#;
        let trade: TradeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(trade.trade_id, "T1");
        assert_eq!(trade.quantity, dec!(1000));
        assert!(trade.position_key.is_none());
        assert!(trade.sequence_status.is_none());
    }
}
