//! Core types used throughout the system
//!
//! These are fundamental identifier types used by all modules.
//! They provide semantic meaning and enable future type evolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Trade ID - caller-assigned, globally unique per submitted trade.
///
/// The idempotency container is keyed on this value.
pub type TradeId = String;

/// Unique Position Identifier - one "life" of a position.
///
/// Equal to the tradeId of the NEW_TRADE that opened (or reopened) the
/// position. A new UPI begins on every reopen after termination.
pub type Upi = String;

/// Event version - dense per-positionKey sequence starting at 1.
///
/// `(PositionKey, EventVer)` is the event store primary key and the
/// optimistic-concurrency fence: inserting an existing version fails.
pub type EventVer = i64;

/// Position direction - the LONG/SHORT half of the position tuple.
///
/// Long and short holdings of the same (account, instrument, currency)
/// hash to distinct position keys; sign changes move quantity between
/// the two keys rather than mixing signs under one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[inline]
    pub fn is_short(&self) -> bool {
        matches!(self, Direction::Short)
    }

    /// The other side of the book (used on sign change)
    #[inline]
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position key - lowercase hex SHA-256 of the normalized position tuple.
///
/// 64 hex characters, validated on construction. See `position_key` for
/// the derivation contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct PositionKey(String);

impl PositionKey {
    /// Wrap a 64-char lowercase hex string.
    ///
    /// Returns an error describing the first violated constraint.
    pub fn new(s: impl Into<String>) -> Result<Self, String> {
        let s = s.into();
        if s.len() != 64 {
            return Err(format!("position key must be 64 hex chars, got {}", s.len()));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err("position key must be lowercase hex".to_string());
        }
        Ok(Self(s))
    }

    /// Construct without validation. Only for values produced by the
    /// key generator itself.
    pub(crate) fn from_digest(hex: String) -> Self {
        debug_assert_eq!(hex.len(), 64);
        Self(hex)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PositionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
        assert!(Direction::Short.is_short());
        assert!(!Direction::Long.is_short());
    }

    #[test]
    fn test_position_key_validation() {
        let valid = "a".repeat(64);
        assert!(PositionKey::new(valid).is_ok());

        assert!(PositionKey::new("a".repeat(63)).is_err());
        assert!(PositionKey::new("A".repeat(64)).is_err());
        assert!(PositionKey::new("g".repeat(64)).is_err());
    }

    #[test]
    fn test_position_key_from_str() {
        let hex = "0123456789abcdef".repeat(4);
        let key: PositionKey = hex.parse().unwrap();
        assert_eq!(key.as_str(), hex);
    }
}
