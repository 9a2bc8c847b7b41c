//! Position events - the append-only per-key log
//!
//! Events are never mutated or deleted. `(position_key, event_ver)` is the
//! primary key; versions are dense integers starting at 1 and double as the
//! optimistic-concurrency fence.
//!
//! # Canonical read order
//!
//! `(effective_date asc, occurred_at asc, event_ver asc)`. `occurred_at`
//! breaks ties between same-day events; the version is the final
//! deterministic tiebreaker. Coldpath correction events are written with
//! `occurred_at = start of the effective day (UTC)` so they sort before
//! same-day hotpath events, which lets an appended backdated event take its
//! chronological place without rewriting history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core_types::{EventVer, PositionKey};
use crate::lot_engine::{LotAllocationResult, LotOpenResult};
use crate::models::{TradeEvent, TradeType};

// ============================================================
// EVENT TYPE
// ============================================================

/// Event type. `Correction*` variants are appended by the coldpath for
/// backdated trades; they replay identically to their base types and exist
/// so corrections are distinguishable in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    NewTrade,
    Increase,
    Decrease,
    CorrectionNewTrade,
    CorrectionIncrease,
    CorrectionDecrease,
}

impl EventType {
    /// The trade semantics this event replays with.
    pub fn base(&self) -> TradeType {
        match self {
            EventType::NewTrade | EventType::CorrectionNewTrade => TradeType::NewTrade,
            EventType::Increase | EventType::CorrectionIncrease => TradeType::Increase,
            EventType::Decrease | EventType::CorrectionDecrease => TradeType::Decrease,
        }
    }

    #[inline]
    pub fn is_correction(&self) -> bool {
        matches!(
            self,
            EventType::CorrectionNewTrade
                | EventType::CorrectionIncrease
                | EventType::CorrectionDecrease
        )
    }

    pub fn from_trade_type(trade_type: TradeType) -> Self {
        match trade_type {
            TradeType::NewTrade => EventType::NewTrade,
            TradeType::Increase => EventType::Increase,
            TradeType::Decrease => EventType::Decrease,
        }
    }

    pub fn correction_of(trade_type: TradeType) -> Self {
        match trade_type {
            TradeType::NewTrade => EventType::CorrectionNewTrade,
            TradeType::Increase => EventType::CorrectionIncrease,
            TradeType::Decrease => EventType::CorrectionDecrease,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewTrade => "NEW_TRADE",
            EventType::Increase => "INCREASE",
            EventType::Decrease => "DECREASE",
            EventType::CorrectionNewTrade => "CORRECTION_NEW_TRADE",
            EventType::CorrectionIncrease => "CORRECTION_INCREASE",
            EventType::CorrectionDecrease => "CORRECTION_DECREASE",
        }
    }
}

// ============================================================
// ALLOCATION METADATA
// ============================================================

/// Allocation result carried on the event (`metaLots`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum MetaLots {
    /// NEW_TRADE / INCREASE: the lot that was opened.
    Opened(LotOpenResult),
    /// DECREASE: the per-lot allocation with realized P&L breakdown.
    Reduced(LotAllocationResult),
}

// ============================================================
// POSITION EVENT
// ============================================================

/// One immutable record of what happened to a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PositionEvent {
    pub position_key: PositionKey,
    pub event_ver: EventVer,
    pub event_type: EventType,
    pub effective_date: NaiveDate,
    pub occurred_at: DateTime<Utc>,
    /// The original submitted trade, verbatim.
    pub payload: TradeEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_lots: Option<MetaLots>,
    pub correlation_id: String,
    pub causation_id: String,
    pub archival_flag: bool,
}

impl PositionEvent {
    /// Canonical ordering key (see module docs).
    #[inline]
    pub fn canonical_key(&self) -> (NaiveDate, DateTime<Utc>, EventVer) {
        (self.effective_date, self.occurred_at, self.event_ver)
    }
}

/// Sort a slice of events into canonical order.
pub fn sort_canonical(events: &mut [PositionEvent]) {
    events.sort_by_key(|e| e.canonical_key());
}

/// UTC midnight of an effective date - the `occurred_at` for coldpath
/// correction events so they sort before same-day hotpath events.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Direction;
    use crate::position_key;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn trade(id: &str, eff: &str) -> TradeEvent {
        TradeEvent {
            trade_id: id.to_string(),
            position_key: None,
            account: "ACC-1".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            trade_type: TradeType::NewTrade,
            quantity: dec!(100),
            price: dec!(50),
            effective_date: date(eff),
            contract_id: "C-1".into(),
            correlation_id: "corr".into(),
            causation_id: "cause".into(),
            user_id: "u1".into(),
            sequence_status: None,
        }
    }

    fn event(ver: EventVer, eff: &str, occurred_at: DateTime<Utc>) -> PositionEvent {
        PositionEvent {
            position_key: position_key::generate("ACC-1", "AAPL", "USD", Direction::Long),
            event_ver: ver,
            event_type: EventType::NewTrade,
            effective_date: date(eff),
            occurred_at,
            payload: trade(&format!("T{ver}"), eff),
            meta_lots: None,
            correlation_id: "corr".into(),
            causation_id: "cause".into(),
            archival_flag: false,
        }
    }

    #[test]
    fn test_event_type_base_and_correction() {
        assert_eq!(EventType::CorrectionDecrease.base(), TradeType::Decrease);
        assert!(EventType::CorrectionDecrease.is_correction());
        assert!(!EventType::Decrease.is_correction());
        assert_eq!(
            EventType::correction_of(TradeType::Increase),
            EventType::CorrectionIncrease
        );
    }

    #[test]
    fn test_canonical_order_effective_date_first() {
        let late = event(1, "2025-01-20", start_of_day(date("2025-01-20")));
        let backdated = event(5, "2025-01-15", start_of_day(date("2025-01-15")));

        let mut events = vec![late.clone(), backdated.clone()];
        sort_canonical(&mut events);

        // the higher-version backdated event sorts first by effective date
        assert_eq!(events[0].event_ver, 5);
        assert_eq!(events[1].event_ver, 1);
    }

    #[test]
    fn test_same_day_correction_sorts_before_hotpath_event() {
        let eff = date("2025-01-15");
        let hotpath = event(2, "2025-01-15", start_of_day(eff) + chrono::Duration::hours(14));
        let correction = event(7, "2025-01-15", start_of_day(eff));

        let mut events = vec![hotpath, correction];
        sort_canonical(&mut events);

        assert_eq!(events[0].event_ver, 7);
        assert_eq!(events[1].event_ver, 2);
    }

    #[test]
    fn test_version_is_final_tiebreaker() {
        let eff = date("2025-01-15");
        let a = event(3, "2025-01-15", start_of_day(eff));
        let b = event(2, "2025-01-15", start_of_day(eff));

        let mut events = vec![a, b];
        sort_canonical(&mut events);
        assert_eq!(events[0].event_ver, 2);
        assert_eq!(events[1].event_ver, 3);
    }
}
