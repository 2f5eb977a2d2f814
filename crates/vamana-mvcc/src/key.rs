//! Flat byte-string keys and the fixed-seed xxhash64 used to bucket them
//! into [`crate::record::MVCCRecord`]s.
//!
//! No tenant or branch scoping here: the hash folds in nothing but the raw
//! key bytes, so `Key` is a thin newtype over an owned byte buffer rather
//! than a namespace-qualified compound type.

use std::hash::{Hash, Hasher};

/// Fixed seed for the key-hashing xxhash64 instance. Any constant works as
/// long as it never changes across a store's lifetime — a changed seed
/// would silently re-bucket every existing key.
const KEY_HASH_SEED: u64 = 0x5653_4D43_4356_4331; // "VSMCCVC1" in ASCII hex

/// An opaque key into the operation log, stored and compared as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(Box<[u8]>);

impl Key {
    /// Wrap `bytes` as a key.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Key(bytes.into())
    }

    /// Borrow the key's raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hash this key into the bucket used to locate its [`crate::record::MVCCRecord`].
    pub fn hash_code(&self) -> u64 {
        xxhash_rust::xxh64::xxh64(&self.0, KEY_HASH_SEED)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::new(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::new(bytes)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s.as_bytes().to_vec())
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_hash_identically() {
        let a: Key = "hello".into();
        let b: Key = "hello".into();
        assert_eq!(a.hash_code(), b.hash_code());
    }

    #[test]
    fn different_bytes_almost_certainly_hash_differently() {
        let a: Key = "hello".into();
        let b: Key = "world".into();
        assert_ne!(a.hash_code(), b.hash_code());
    }
}
