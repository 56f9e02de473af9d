//! Transaction identifiers.
//!
//! A `TransactionId` is a 128-bit ULID: a millisecond timestamp prefix plus a
//! random suffix. Ids are minted without coordination at submission time and
//! sort lexicographically in creation order, both as strings and in their
//! 16-byte form.

use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unique, lexicographically sortable transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(Ulid);

impl TransactionId {
    /// Mint a fresh id from the wall clock and thread-local randomness.
    ///
    /// Only callers on the submission path may mint ids; deterministic
    /// execution never creates one.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Rebuild an id from its two 64-bit halves.
    pub fn from_parts(msb: u64, lsb: u64) -> Self {
        Self(Ulid((u128::from(msb) << 64) | u128::from(lsb)))
    }

    /// Most significant 64 bits (timestamp-bearing half).
    pub fn msb(&self) -> u64 {
        (self.0 .0 >> 64) as u64
    }

    /// Least significant 64 bits.
    pub fn lsb(&self) -> u64 {
        self.0 .0 as u64
    }

    /// Big-endian 16-byte form. Byte order equals creation-time order.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0 .0.to_be_bytes()
    }

    /// Inverse of [`TransactionId::to_bytes`].
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid(u128::from_be_bytes(bytes)))
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self(Ulid(0))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

// Ids travel inside log-entry payloads; keep the encoded form a plain
// (msb, lsb) tuple so the codec never depends on ULID string formatting.
impl Serialize for TransactionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.msb(), self.lsb()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (msb, lsb) = <(u64, u64)>::deserialize(deserializer)?;
        if msb == 0 && lsb == 0 {
            return Err(D::Error::custom("zero transaction id"));
        }
        Ok(Self::from_parts(msb, lsb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let id = TransactionId::new();
        assert_eq!(id, TransactionId::from_bytes(id.to_bytes()));
    }

    #[test]
    fn round_trips_through_parts() {
        let id = TransactionId::new();
        assert_eq!(id, TransactionId::from_parts(id.msb(), id.lsb()));
    }

    #[test]
    fn byte_order_follows_creation_order() {
        let a = TransactionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = TransactionId::new();
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
    }

    #[test]
    fn serde_round_trip() {
        let id = TransactionId::new();
        let encoded = serde_json::to_vec(&id).unwrap();
        let decoded: TransactionId = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn zero_id_rejected_on_decode() {
        let err = serde_json::from_str::<TransactionId>("[0,0]");
        assert!(err.is_err());
    }
}
