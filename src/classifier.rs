//! Temporal classifier - CURRENT / FORWARD_DATED / BACKDATED
//!
//! Decides which processing path a validated trade takes:
//!
//! - BACKDATED when the effective date precedes what the snapshot has
//!   already seen (either its latest applied effective date or the date of
//!   its last update) -> coldpath replay.
//! - FORWARD_DATED when the effective date is after today -> hotpath.
//! - CURRENT_DATED otherwise, equality included -> hotpath.
//!
//! Tie-break: a trade whose effective date equals the snapshot's latest is
//! NOT backdated - it arrived strictly later in wall-clock and appends in
//! arrival order.

use chrono::NaiveDate;

use crate::models::{SequenceStatus, Snapshot, TradeEvent};

pub struct Classifier;

impl Classifier {
    pub fn classify(
        trade: &TradeEvent,
        snapshot: Option<&Snapshot>,
        today: NaiveDate,
    ) -> SequenceStatus {
        if let Some(snap) = snapshot {
            let before_latest = snap
                .latest_effective_date
                .is_some_and(|latest| trade.effective_date < latest);
            let before_last_update = trade.effective_date < snap.last_updated_at.date_naive();
            if before_latest || before_last_update {
                return SequenceStatus::Backdated;
            }
        }

        if trade.effective_date > today {
            SequenceStatus::ForwardDated
        } else {
            SequenceStatus::CurrentDated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Direction;
    use crate::models::{PositionStatus, ReconciliationStatus, TradeType};
    use crate::position_key;
    use crate::position_state::CompressedLots;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn trade(eff: &str) -> TradeEvent {
        TradeEvent {
            trade_id: "T9".into(),
            position_key: None,
            account: "ACC-1".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            trade_type: TradeType::Increase,
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

    fn snapshot(latest_eff: &str, updated: &str) -> Snapshot {
        Snapshot {
            position_key: position_key::generate("ACC-1", "AAPL", "USD", Direction::Long),
            last_ver: 3,
            compressed_lots: CompressedLots::empty(),
            status: PositionStatus::Active,
            reconciliation_status: ReconciliationStatus::Reconciled,
            upi: "T1".into(),
            account: "ACC-1".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            contract_id: "C-1".into(),
            direction: Direction::Long,
            latest_effective_date: Some(date(latest_eff)),
            last_updated_at: Utc
                .from_utc_datetime(&date(updated).and_hms_opt(10, 30, 0).unwrap()),
            archival_flag: false,
        }
    }

    const TODAY: &str = "2025-01-20";

    #[test]
    fn test_no_snapshot_is_current() {
        assert_eq!(
            Classifier::classify(&trade("2025-01-20"), None, date(TODAY)),
            SequenceStatus::CurrentDated
        );
    }

    #[test]
    fn test_backdated_before_latest_effective() {
        let snap = snapshot("2025-01-18", "2025-01-18");
        assert_eq!(
            Classifier::classify(&trade("2025-01-15"), Some(&snap), date(TODAY)),
            SequenceStatus::Backdated
        );
    }

    #[test]
    fn test_backdated_before_last_update_date() {
        // latest effective is old but the snapshot was touched later
        let snap = snapshot("2025-01-10", "2025-01-19");
        assert_eq!(
            Classifier::classify(&trade("2025-01-15"), Some(&snap), date(TODAY)),
            SequenceStatus::Backdated
        );
    }

    #[test]
    fn test_equal_effective_date_is_current() {
        let snap = snapshot("2025-01-20", "2025-01-20");
        assert_eq!(
            Classifier::classify(&trade("2025-01-20"), Some(&snap), date(TODAY)),
            SequenceStatus::CurrentDated
        );
    }

    #[test]
    fn test_forward_dated() {
        let snap = snapshot("2025-01-18", "2025-01-18");
        assert_eq!(
            Classifier::classify(&trade("2025-01-25"), Some(&snap), date(TODAY)),
            SequenceStatus::ForwardDated
        );
    }

    #[test]
    fn test_backdated_wins_over_forward() {
        // forward of today but behind the snapshot's timeline
        let snap = snapshot("2025-02-01", "2025-01-20");
        assert_eq!(
            Classifier::classify(&trade("2025-01-25"), Some(&snap), date(TODAY)),
            SequenceStatus::Backdated
        );
    }
}
