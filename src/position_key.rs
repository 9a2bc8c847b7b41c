//! Position key generator
//!
//! Deterministic, collision-resistant identity for one
//! (account, instrument, currency, direction) tuple:
//!
//! ```text
//! key = hex(SHA256(upper(trim(account)) | upper(trim(instrument)) | upper(trim(currency)) | {LONG|SHORT}))
//! ```
//!
//! Long and short positions for the same underlying tuple hash to distinct
//! keys and therefore distinct snapshots; the sign-change path derives the
//! opposite key by flipping the direction component.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core_types::{Direction, PositionKey};

/// Namespace for deterministic lot ids (UUIDv5 over position_key|trade_id).
/// Replay must reproduce byte-identical lot ids, so lots never use random ids.
const LOT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x7a3f_9c44_51b2_4e8d_9f60_2b1c_8d5a_e7f3);

/// Derive the position key for a tuple.
pub fn generate(account: &str, instrument: &str, currency: &str, direction: Direction) -> PositionKey {
    let mut hasher = Sha256::new();
    hasher.update(account.trim().to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(instrument.trim().to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(currency.trim().to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(direction.as_str().as_bytes());
    PositionKey::from_digest(hex::encode(hasher.finalize()))
}

/// Deterministic lot id for the lot a trade opens on a key.
pub fn lot_id(position_key: &PositionKey, trade_id: &str) -> Uuid {
    let name = format!("{}|{}", position_key.as_str(), trade_id);
    Uuid::new_v5(&LOT_ID_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = generate("ACC-1", "AAPL", "USD", Direction::Long);
        let b = generate("ACC-1", "AAPL", "USD", Direction::Long);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_normalization() {
        let canonical = generate("ACC-1", "AAPL", "USD", Direction::Long);
        assert_eq!(generate(" acc-1 ", "aapl", " usd", Direction::Long), canonical);
    }

    #[test]
    fn test_direction_distinct_keys() {
        let long = generate("ACC-1", "AAPL", "USD", Direction::Long);
        let short = generate("ACC-1", "AAPL", "USD", Direction::Short);
        assert_ne!(long, short);
    }

    #[test]
    fn test_tuple_components_distinct_keys() {
        let base = generate("ACC-1", "AAPL", "USD", Direction::Long);
        assert_ne!(generate("ACC-2", "AAPL", "USD", Direction::Long), base);
        assert_ne!(generate("ACC-1", "MSFT", "USD", Direction::Long), base);
        assert_ne!(generate("ACC-1", "AAPL", "EUR", Direction::Long), base);
    }

    #[test]
    fn test_lot_id_deterministic_per_key_and_trade() {
        let key = generate("ACC-1", "AAPL", "USD", Direction::Long);
        let other = generate("ACC-1", "AAPL", "USD", Direction::Short);

        assert_eq!(lot_id(&key, "T1"), lot_id(&key, "T1"));
        assert_ne!(lot_id(&key, "T1"), lot_id(&key, "T2"));
        // same trade id on the opposite key (sign-change split) gets its own lot id
        assert_ne!(lot_id(&key, "T1"), lot_id(&other, "T1"));
    }
}
