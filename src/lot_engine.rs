//! Lot engine - tax-lot allocation and realized P&L
//!
//! Pure functions over an in-memory `PositionState`; no I/O, no async.
//! The hotpath and coldpath both apply trades exclusively through this
//! module so replay and live processing cannot diverge.
//!
//! # Allocation order
//!
//! - FIFO: ascending trade date, insertion order on ties
//! - LIFO: descending trade date, reverse insertion order on ties
//! - HIFO: descending price, FIFO order on price ties
//!
//! All arithmetic is `Decimal`; rounding happens only at emission, never
//! here.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{TaxLot, TaxLotMethod};
use crate::position_state::PositionState;

// ============================================================
// ALLOCATION RESULT
// ============================================================

/// One lot's share of a reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LotAllocation {
    pub lot_id: Uuid,
    pub lot_price: Decimal,
    pub lot_trade_date: NaiveDate,
    /// Magnitude closed from this lot (always positive).
    pub closed_qty: Decimal,
    pub realized_pnl: Decimal,
}

/// Outcome of `reduce_lots`, recorded on the event as `metaLots`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LotAllocationResult {
    pub allocations: Vec<LotAllocation>,
    /// Total magnitude closed across all allocations.
    pub closed_qty: Decimal,
    /// Quantity that could not be allocated because the open lots ran
    /// out. Never silently discarded: the hotpath's sign-change policy
    /// decides what happens to it.
    pub excess_qty: Decimal,
    pub realized_pnl: Decimal,
    pub close_price: Decimal,
    pub close_date: NaiveDate,
    pub method: TaxLotMethod,
}

impl LotAllocationResult {
    #[inline]
    pub fn has_excess(&self) -> bool {
        !self.excess_qty.is_zero()
    }
}

/// Lot opened by an add, recorded on the event as `metaLots` for
/// NEW_TRADE / INCREASE events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LotOpenResult {
    pub lot_id: Uuid,
    pub qty: Decimal,
    pub price: Decimal,
    pub trade_date: NaiveDate,
}

// ============================================================
// LOT ENGINE
// ============================================================

/// Stateless engine over `PositionState`.
pub struct LotEngine;

impl LotEngine {
    /// Append a new lot. `qty` is signed: negative opens a short lot.
    pub fn add_lot(
        state: &mut PositionState,
        lot_id: Uuid,
        qty: Decimal,
        price: Decimal,
        trade_date: NaiveDate,
    ) -> LotOpenResult {
        state.push_lot(TaxLot::open(lot_id, trade_date, price, qty));
        LotOpenResult {
            lot_id,
            qty,
            price,
            trade_date,
        }
    }

    /// Allocate `reduce_qty` (positive magnitude) against the open lots.
    ///
    /// Consumes lots in method order, taking `min(remaining_to_reduce,
    /// |lot.remaining_qty|)` from each, moving remaining quantities toward
    /// zero. Realized P&L per closed slice is
    /// `(close_price - lot_price) * closed` for long lots and
    /// `(lot_price - close_price) * closed` for short lots.
    ///
    /// Zeroed lots stay in the sequence; the caller drops them at commit
    /// time via `PositionState::retain_open`.
    pub fn reduce_lots(
        state: &mut PositionState,
        reduce_qty: Decimal,
        method: TaxLotMethod,
        close_price: Decimal,
        close_date: NaiveDate,
    ) -> LotAllocationResult {
        debug_assert!(reduce_qty.is_sign_positive() && !reduce_qty.is_zero());

        let order = Self::allocation_order(state.lots(), method);

        let mut remaining = reduce_qty;
        let mut allocations = Vec::new();
        let mut total_pnl = Decimal::ZERO;
        let mut total_closed = Decimal::ZERO;

        for idx in order {
            if remaining.is_zero() {
                break;
            }
            let lot = &mut state.lots_mut()[idx];
            let open_magnitude = lot.remaining_qty.abs();
            if open_magnitude.is_zero() {
                continue;
            }

            let closed = remaining.min(open_magnitude);
            let short = lot.remaining_qty.is_sign_negative();
            let pnl = if short {
                (lot.price - close_price) * closed
            } else {
                (close_price - lot.price) * closed
            };

            // move toward zero
            if short {
                lot.remaining_qty += closed;
            } else {
                lot.remaining_qty -= closed;
            }

            allocations.push(LotAllocation {
                lot_id: lot.lot_id,
                lot_price: lot.price,
                lot_trade_date: lot.trade_date,
                closed_qty: closed,
                realized_pnl: pnl,
            });
            total_pnl += pnl;
            total_closed += closed;
            remaining -= closed;
        }

        LotAllocationResult {
            allocations,
            closed_qty: total_closed,
            excess_qty: remaining,
            realized_pnl: total_pnl,
            close_price,
            close_date,
            method,
        }
    }

    /// Indices of the lots in consumption order for `method`.
    fn allocation_order(lots: &[TaxLot], method: TaxLotMethod) -> Vec<usize> {
        let mut order: Vec<usize> = (0..lots.len()).filter(|&i| lots[i].is_open()).collect();
        match method {
            TaxLotMethod::Fifo => {
                order.sort_by(|&a, &b| {
                    lots[a]
                        .trade_date
                        .cmp(&lots[b].trade_date)
                        .then(a.cmp(&b))
                });
            }
            TaxLotMethod::Lifo => {
                order.sort_by(|&a, &b| {
                    lots[b]
                        .trade_date
                        .cmp(&lots[a].trade_date)
                        .then(b.cmp(&a))
                });
            }
            TaxLotMethod::Hifo => {
                // price ties fall back to FIFO
                order.sort_by(|&a, &b| {
                    lots[b]
                        .price
                        .cmp(&lots[a].price)
                        .then(lots[a].trade_date.cmp(&lots[b].trade_date))
                        .then(a.cmp(&b))
                });
            }
        }
        order
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

    fn state_with(lots: &[(u128, &str, Decimal, Decimal)]) -> PositionState {
        let mut state = PositionState::new();
        for (id, d, price, qty) in lots {
            LotEngine::add_lot(&mut state, Uuid::from_u128(*id), *qty, *price, date(d));
        }
        state
    }

    #[test]
    fn test_add_lot_preserves_order() {
        let state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(1000)),
            (2, "2025-01-11", dec!(55), dec!(500)),
        ]);
        assert_eq!(state.lots()[0].lot_id, Uuid::from_u128(1));
        assert_eq!(state.lots()[1].lot_id, Uuid::from_u128(2));
        assert_eq!(state.total_qty(), dec!(1500));
    }

    #[test]
    fn test_fifo_partial_reduce() {
        let mut state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(1000)),
            (2, "2025-01-11", dec!(55), dec!(500)),
        ]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(200),
            TaxLotMethod::Fifo,
            dec!(60),
            date("2025-01-12"),
        );

        assert_eq!(result.allocations.len(), 1);
        assert_eq!(result.allocations[0].lot_id, Uuid::from_u128(1));
        assert_eq!(result.allocations[0].closed_qty, dec!(200));
        assert_eq!(result.realized_pnl, dec!(2000)); // (60-50)*200
        assert_eq!(result.excess_qty, Decimal::ZERO);
        assert_eq!(state.total_qty(), dec!(1300));
        assert_eq!(state.lots()[0].remaining_qty, dec!(800));
    }

    #[test]
    fn test_lifo_consumes_newest_first() {
        let mut state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(100)),
            (2, "2025-01-12", dec!(60), dec!(100)),
            (3, "2025-01-11", dec!(55), dec!(100)),
        ]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(150),
            TaxLotMethod::Lifo,
            dec!(65),
            date("2025-01-13"),
        );

        assert_eq!(result.allocations[0].lot_id, Uuid::from_u128(2));
        assert_eq!(result.allocations[0].closed_qty, dec!(100));
        assert_eq!(result.allocations[1].lot_id, Uuid::from_u128(3));
        assert_eq!(result.allocations[1].closed_qty, dec!(50));
        // (65-60)*100 + (65-55)*50
        assert_eq!(result.realized_pnl, dec!(1000));
    }

    #[test]
    fn test_lifo_tie_reverse_insertion() {
        let mut state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(100)),
            (2, "2025-01-10", dec!(55), dec!(100)),
        ]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(100),
            TaxLotMethod::Lifo,
            dec!(60),
            date("2025-01-11"),
        );

        assert_eq!(result.allocations[0].lot_id, Uuid::from_u128(2));
    }

    #[test]
    fn test_hifo_highest_price_first_fifo_ties() {
        let mut state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(100)),
            (2, "2025-01-11", dec!(60), dec!(100)),
            (3, "2025-01-12", dec!(55), dec!(100)),
        ]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(120),
            TaxLotMethod::Hifo,
            dec!(65),
            date("2025-01-13"),
        );

        assert_eq!(result.allocations.len(), 2);
        assert_eq!(result.allocations[0].lot_id, Uuid::from_u128(2));
        assert_eq!(result.allocations[0].closed_qty, dec!(100));
        assert_eq!(result.allocations[1].lot_id, Uuid::from_u128(3));
        assert_eq!(result.allocations[1].closed_qty, dec!(20));
        // (65-60)*100 + (65-55)*20 = 700
        assert_eq!(result.realized_pnl, dec!(700));

        state.retain_open();
        assert_eq!(state.total_qty(), dec!(180));
        assert_eq!(state.lots()[0].remaining_qty, dec!(100)); // @50
        assert_eq!(state.lots()[1].remaining_qty, dec!(80)); // @55
    }

    #[test]
    fn test_hifo_equal_prices_fall_back_to_fifo() {
        let mut state = state_with(&[
            (1, "2025-01-11", dec!(50), dec!(100)),
            (2, "2025-01-10", dec!(50), dec!(100)),
        ]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(100),
            TaxLotMethod::Hifo,
            dec!(55),
            date("2025-01-12"),
        );

        // earlier trade date wins the tie
        assert_eq!(result.allocations[0].lot_id, Uuid::from_u128(2));
    }

    #[test]
    fn test_excess_is_returned_not_discarded() {
        let mut state = state_with(&[(1, "2025-01-10", dec!(50), dec!(100))]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(150),
            TaxLotMethod::Fifo,
            dec!(55),
            date("2025-01-11"),
        );

        assert_eq!(result.closed_qty, dec!(100));
        assert_eq!(result.excess_qty, dec!(50));
        assert_eq!(result.realized_pnl, dec!(500)); // (55-50)*100
        assert!(result.has_excess());
        assert!(state.is_flat());
    }

    #[test]
    fn test_short_lot_reduction_pnl() {
        let mut state = state_with(&[(1, "2025-01-10", dec!(50), dec!(-100))]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(60),
            TaxLotMethod::Fifo,
            dec!(45),
            date("2025-01-11"),
        );

        // short: (lot - close) * closed = (50-45)*60
        assert_eq!(result.realized_pnl, dec!(300));
        assert_eq!(state.lots()[0].remaining_qty, dec!(-40));
        assert!(state.sign_pure());
    }

    #[test]
    fn test_conservation_across_reductions() {
        let mut state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(300)),
            (2, "2025-01-11", dec!(52), dec!(200)),
        ]);
        let original_total: Decimal = state.lots().iter().map(|l| l.original_qty).sum();

        let r1 = LotEngine::reduce_lots(
            &mut state,
            dec!(120),
            TaxLotMethod::Fifo,
            dec!(55),
            date("2025-01-12"),
        );
        let r2 = LotEngine::reduce_lots(
            &mut state,
            dec!(250),
            TaxLotMethod::Hifo,
            dec!(53),
            date("2025-01-13"),
        );

        let closed = r1.closed_qty + r2.closed_qty;
        assert_eq!(original_total, state.total_qty() + closed);
    }

    #[test]
    fn test_reduce_skips_closed_lots() {
        let mut state = state_with(&[
            (1, "2025-01-10", dec!(50), dec!(100)),
            (2, "2025-01-11", dec!(55), dec!(100)),
        ]);

        LotEngine::reduce_lots(
            &mut state,
            dec!(100),
            TaxLotMethod::Fifo,
            dec!(60),
            date("2025-01-12"),
        );
        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(50),
            TaxLotMethod::Fifo,
            dec!(60),
            date("2025-01-12"),
        );

        assert_eq!(result.allocations[0].lot_id, Uuid::from_u128(2));
    }

    #[test]
    fn test_decimal_precision_no_rounding() {
        let mut state = state_with(&[(1, "2025-01-10", dec!(50.1234567891), dec!(3))]);

        let result = LotEngine::reduce_lots(
            &mut state,
            dec!(1),
            TaxLotMethod::Fifo,
            dec!(60.9876543219),
            date("2025-01-11"),
        );

        assert_eq!(result.realized_pnl, dec!(10.8641975328));
    }
}
