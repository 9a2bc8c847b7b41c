//! Position state and lot compression
//!
//! `PositionState` is the in-memory aggregate the lot engine operates on: a
//! flat ordered sequence of tax lots, insertion order = trade-date order
//! with ties broken by arrival order. `CompressedLots` is the serialized
//! struct-of-arrays form stored on the snapshot.
//!
//! Round-trip contract: `compress(inflate(x)) == x` byte-equal on the
//! normalized JSON form, and `inflate(compress(p)) == p` for any committed
//! (at-rest) state. At rest a state holds only open lots and each lot's
//! `original_qty` equals its `remaining_qty` residual.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::core_types::Direction;
use crate::models::TaxLot;

// ============================================================
// POSITION STATE
// ============================================================

/// Ordered tax-lot sequence for one position key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionState {
    lots: Vec<TaxLot>,
}

impl PositionState {
    pub fn new() -> Self {
        Self { lots: Vec::new() }
    }

    pub fn from_lots(lots: Vec<TaxLot>) -> Self {
        Self { lots }
    }

    #[inline]
    pub fn lots(&self) -> &[TaxLot] {
        &self.lots
    }

    #[inline]
    pub fn lots_mut(&mut self) -> &mut Vec<TaxLot> {
        &mut self.lots
    }

    /// Append preserving insertion order.
    pub fn push_lot(&mut self, lot: TaxLot) {
        self.lots.push(lot);
    }

    /// Net quantity: sum of remaining over all lots.
    pub fn total_qty(&self) -> Decimal {
        self.lots.iter().map(|l| l.remaining_qty).sum()
    }

    #[inline]
    pub fn is_flat(&self) -> bool {
        self.lots.iter().all(|l| !l.is_open())
    }

    /// Direction of the open lots, None when flat.
    pub fn direction(&self) -> Option<Direction> {
        self.lots.iter().find(|l| l.is_open()).map(|l| {
            if l.remaining_qty.is_sign_negative() {
                Direction::Short
            } else {
                Direction::Long
            }
        })
    }

    /// Drop fully-closed lots. Called at commit time; mid-application a
    /// zeroed lot stays in place so allocation results can reference it.
    pub fn retain_open(&mut self) {
        self.lots.retain(|l| l.is_open());
    }

    /// Sign purity: every open lot carries the same sign.
    pub fn sign_pure(&self) -> bool {
        let mut sign: Option<bool> = None;
        for lot in self.lots.iter().filter(|l| l.is_open()) {
            let neg = lot.remaining_qty.is_sign_negative();
            match sign {
                None => sign = Some(neg),
                Some(s) if s != neg => return false,
                _ => {}
            }
        }
        true
    }
}

// ============================================================
// COMPRESSED FORM
// ============================================================

/// Struct-of-arrays snapshot encoding of the open lots.
///
/// Parallel arrays; index i across all four fields describes one lot.
/// Serialized as canonical JSON on the snapshot row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompressedLots {
    pub ids: Vec<Uuid>,
    pub trade_dates: Vec<NaiveDate>,
    pub prices: Vec<Decimal>,
    pub qtys: Vec<Decimal>,
}

impl CompressedLots {
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn total_qty(&self) -> Decimal {
        self.qtys.iter().copied().sum()
    }

    /// Normalized JSON form (stable field order from the struct layout).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("compressed lots serialize")
    }
}

/// Serialize the open lots of a state into parallel arrays.
pub fn compress(state: &PositionState) -> CompressedLots {
    let open: Vec<&TaxLot> = state.lots().iter().filter(|l| l.is_open()).collect();
    CompressedLots {
        ids: open.iter().map(|l| l.lot_id).collect(),
        trade_dates: open.iter().map(|l| l.trade_date).collect(),
        prices: open.iter().map(|l| l.price).collect(),
        qtys: open.iter().map(|l| l.remaining_qty).collect(),
    }
}

/// Reconstruct the lot sequence, preserving order.
///
/// The open residual becomes the lot: `original_qty = remaining_qty`.
pub fn inflate(compressed: &CompressedLots) -> PositionState {
    let lots = compressed
        .ids
        .iter()
        .zip(&compressed.trade_dates)
        .zip(&compressed.prices)
        .zip(&compressed.qtys)
        .map(|(((id, date), price), qty)| TaxLot::open(*id, *date, *price, *qty))
        .collect();
    PositionState::from_lots(lots)
}

// ============================================================
// TESTS
// ============================================================
