//! Trade validator - schema, format, and state-machine gate
//!
//! Runs before any processing. Failures are categorized and collected (a
//! trade can fail several checks at once); the pipeline routes rejected
//! trades to the DLQ stream with the full error list.
//!
//! State machine per position key:
//!
//! ```text
//! NON_EXISTENT --NEW_TRADE--> ACTIVE
//! ACTIVE       --INCREASE|DECREASE--> ACTIVE | TERMINATED
//! TERMINATED   --NEW_TRADE--> ACTIVE   (reopen)
//! ```
//!
//! Any other pairing is rejected before processing.

use chrono::{Days, NaiveDate};
use std::fmt;

use crate::models::{PositionStatus, Snapshot, TradeEvent, TradeType};

// ============================================================
// FAILURE TYPE
// ============================================================

/// Collected validation errors, each prefixed with its category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub errors: Vec<String>,
}

impl ValidationFailure {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}

// ============================================================
// VALIDATOR
// ============================================================

/// Stateless validation gate.
pub struct Validator {
    /// Furthest allowed forward effective date, in days from today.
    max_forward_days: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(365)
    }
}

impl Validator {
    pub fn new(max_forward_days: u64) -> Self {
        Self { max_forward_days }
    }

    /// Validate a trade against the current snapshot (or its absence).
    pub fn validate(
        &self,
        trade: &TradeEvent,
        snapshot: Option<&Snapshot>,
        today: NaiveDate,
    ) -> Result<(), ValidationFailure> {
        let mut errors = Vec::new();

        self.check_schema(trade, today, &mut errors);
        self.check_format(trade, &mut errors);
        self.check_state_machine(trade, snapshot, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::new(errors))
        }
    }

    fn check_schema(&self, trade: &TradeEvent, today: NaiveDate, errors: &mut Vec<String>) {
        if trade.trade_id.trim().is_empty() {
            errors.push("schema: tradeId is required".to_string());
        }
        // the key derivables are required even when a key is supplied:
        // the sign-change path re-derives the opposite key from them
        if trade.account.trim().is_empty() {
            errors.push("schema: account is required".to_string());
        }
        if trade.instrument.trim().is_empty() {
            errors.push("schema: instrument is required".to_string());
        }
        if trade.currency.trim().is_empty() {
            errors.push("schema: currency is required".to_string());
        }
        if trade.quantity <= rust_decimal::Decimal::ZERO {
            errors.push(format!(
                "schema: quantity must be positive, got {}",
                trade.quantity
            ));
        }
        if trade.price <= rust_decimal::Decimal::ZERO {
            errors.push(format!("schema: price must be positive, got {}", trade.price));
        }
        let horizon = today
            .checked_add_days(Days::new(self.max_forward_days))
            .unwrap_or(NaiveDate::MAX);
        if trade.effective_date > horizon {
            errors.push(format!(
                "schema: effectiveDate {} is beyond the {}-day forward horizon",
                trade.effective_date, self.max_forward_days
            ));
        }
    }

    fn check_format(&self, trade: &TradeEvent, errors: &mut Vec<String>) {
        // a supplied key arrives through transparent deserialization, so
        // the [0-9a-f]{64} shape is enforced here. trade_type needs no
        // check: serde rejects unknown values at the boundary.
        if let Some(key) = &trade.position_key {
            if crate::core_types::PositionKey::new(key.as_str()).is_err() {
                errors.push("format: positionKey must be 64 lowercase hex chars".to_string());
            }
        }
    }

    fn check_state_machine(
        &self,
        trade: &TradeEvent,
        snapshot: Option<&Snapshot>,
        errors: &mut Vec<String>,
    ) {
        let allowed = match (snapshot.map(|s| s.status), trade.trade_type) {
            (None, TradeType::NewTrade) => true,
            (Some(PositionStatus::Active), TradeType::Increase)
            | (Some(PositionStatus::Active), TradeType::Decrease) => true,
            (Some(PositionStatus::Terminated), TradeType::NewTrade) => true,
            _ => false,
        };

        if !allowed {
            let from = match snapshot.map(|s| s.status) {
                None => "NON_EXISTENT",
                Some(PositionStatus::Active) => "ACTIVE",
                Some(PositionStatus::Terminated) => "TERMINATED",
            };
            errors.push(format!(
                "state: {} is not allowed on a {} position",
                trade.trade_type, from
            ));
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Direction;
    use crate::models::ReconciliationStatus;
    use crate::position_key;
    use crate::position_state::CompressedLots;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn trade(trade_type: TradeType) -> TradeEvent {
        TradeEvent {
            trade_id: "T1".into(),
            position_key: None,
            account: "ACC-1".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            trade_type,
            quantity: dec!(100),
            price: dec!(50),
            effective_date: date("2025-01-10"),
            contract_id: "C-1".into(),
            correlation_id: "corr".into(),
            causation_id: "cause".into(),
            user_id: "u1".into(),
            sequence_status: None,
        }
    }

    fn snapshot(status: PositionStatus) -> Snapshot {
        Snapshot {
            position_key: position_key::generate("ACC-1", "AAPL", "USD", Direction::Long),
            last_ver: 1,
            compressed_lots: CompressedLots::empty(),
            status,
            reconciliation_status: ReconciliationStatus::Reconciled,
            upi: "T0".into(),
            account: "ACC-1".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            contract_id: "C-1".into(),
            direction: Direction::Long,
            latest_effective_date: Some(date("2025-01-09")),
            last_updated_at: Utc::now(),
            archival_flag: false,
        }
    }

    const TODAY: &str = "2025-01-10";

    #[test]
    fn test_valid_new_trade_on_missing_position() {
        let v = Validator::default();
        assert!(v
            .validate(&trade(TradeType::NewTrade), None, date(TODAY))
            .is_ok());
    }

    #[test]
    fn test_schema_rejects_non_positive_amounts() {
        let v = Validator::default();
        let mut t = trade(TradeType::NewTrade);
        t.quantity = dec!(0);
        t.price = dec!(-1);

        let err = v.validate(&t, None, date(TODAY)).unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(err.errors[0].starts_with("schema: quantity"));
        assert!(err.errors[1].starts_with("schema: price"));
    }

    #[test]
    fn test_schema_rejects_missing_derivables() {
        let v = Validator::default();
        let mut t = trade(TradeType::NewTrade);
        t.trade_id = "  ".into();
        t.account = String::new();

        let err = v.validate(&t, None, date(TODAY)).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("tradeId")));
        assert!(err.errors.iter().any(|e| e.contains("account")));
    }

    #[test]
    fn test_schema_rejects_far_forward_date() {
        let v = Validator::default();
        let mut t = trade(TradeType::NewTrade);
        t.effective_date = date("2026-06-01"); // > 2025-01-10 + 365d

        let err = v.validate(&t, None, date(TODAY)).unwrap_err();
        assert!(err.errors[0].contains("forward horizon"));
    }

    #[test]
    fn test_state_machine_rejects_decrease_on_missing_position() {
        let v = Validator::default();
        let err = v
            .validate(&trade(TradeType::Decrease), None, date(TODAY))
            .unwrap_err();
        assert!(err.errors[0].contains("NON_EXISTENT"));
    }

    #[test]
    fn test_state_machine_rejects_new_trade_on_active() {
        let v = Validator::default();
        let snap = snapshot(PositionStatus::Active);
        let err = v
            .validate(&trade(TradeType::NewTrade), Some(&snap), date(TODAY))
            .unwrap_err();
        assert!(err.errors[0].contains("ACTIVE"));
    }

    #[test]
    fn test_state_machine_allows_reopen_and_mutation() {
        let v = Validator::default();
        let active = snapshot(PositionStatus::Active);
        let terminated = snapshot(PositionStatus::Terminated);

        assert!(v
            .validate(&trade(TradeType::Increase), Some(&active), date(TODAY))
            .is_ok());
        assert!(v
            .validate(&trade(TradeType::Decrease), Some(&active), date(TODAY))
            .is_ok());
        assert!(v
            .validate(&trade(TradeType::NewTrade), Some(&terminated), date(TODAY))
            .is_ok());
        assert!(v
            .validate(&trade(TradeType::Increase), Some(&terminated), date(TODAY))
            .is_err());
    }
}
