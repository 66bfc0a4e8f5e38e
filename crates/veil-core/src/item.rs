//! Item, hashed item, label key and match record types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Item size in bytes
pub const ITEM_BYTE_COUNT: usize = 16;

/// Label key size in bytes
pub const LABEL_KEY_BYTE_COUNT: usize = 32;

/// Opaque per-item payload
pub type Label = Vec<u8>;

const ITEM_DOMAIN: &[u8] = b"veil-item";

/// Fixed-width identifier derived from an input byte string
///
/// Equality is exact on the derived value, so two different strings only
/// collide if their 128-bit digests do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Item([u8; ITEM_BYTE_COUNT]);

impl Item {
    pub fn new(bytes: [u8; ITEM_BYTE_COUNT]) -> Self {
        Self(bytes)
    }

    /// Derive an item from arbitrary input bytes
    pub fn from_bytes(input: &[u8]) -> Self {
        let digest = Sha256::new()
            .chain_update(ITEM_DOMAIN)
            .chain_update(input)
            .finalize();
        let mut value = [0u8; ITEM_BYTE_COUNT];
        value.copy_from_slice(&digest[..ITEM_BYTE_COUNT]);
        Self(value)
    }

    pub fn as_bytes(&self) -> &[u8; ITEM_BYTE_COUNT] {
        &self.0
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<&String> for Item {
    fn from(s: &String) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<&[u8]> for Item {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item({})", hex::encode(self.0))
    }
}

/// OPRF output for an item, used as the database lookup key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashedItem([u8; ITEM_BYTE_COUNT]);

impl HashedItem {
    pub fn new(bytes: [u8; ITEM_BYTE_COUNT]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ITEM_BYTE_COUNT] {
        &self.0
    }
}

impl fmt::Debug for HashedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedItem({})", hex::encode(self.0))
    }
}

impl fmt::Display for HashedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Symmetric key decrypting the label returned for one item
#[derive(Clone, PartialEq, Eq)]
pub struct LabelKey([u8; LABEL_KEY_BYTE_COUNT]);

impl LabelKey {
    pub fn new(bytes: [u8; LABEL_KEY_BYTE_COUNT]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LABEL_KEY_BYTE_COUNT] {
        &self.0
    }
}

impl fmt::Debug for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LabelKey(..)")
    }
}

/// Per-item query result
///
/// `label` is only ever present when `found` is true and the database is
/// labeled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRecord {
    pub found: bool,
    pub label: Option<Label>,
}

impl MatchRecord {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn found(label: Option<Label>) -> Self {
        Self { found: true, label }
    }

    /// Label interpreted as UTF-8, lossily
    pub fn label_string(&self) -> Option<String> {
        self.label
            .as_ref()
            .map(|l| String::from_utf8_lossy(l).into_owned())
    }
}

/// Pair query inputs with their results and keep the matches
pub fn found_items<'a, T>(items: &'a [T], records: &[MatchRecord]) -> Vec<&'a T> {
    items
        .iter()
        .zip(records)
        .filter(|(_, r)| r.found)
        .map(|(item, _)| item)
        .collect()
}

/// Pair query inputs with their labels, keeping labeled matches only
pub fn found_labels<'a, T>(items: &'a [T], records: &[MatchRecord]) -> Vec<(&'a T, Label)> {
    items
        .iter()
        .zip(records)
        .filter_map(|(item, r)| match (&r.found, &r.label) {
            (true, Some(label)) => Some((item, label.clone())),
            _ => None,
        })
        .collect()
}
