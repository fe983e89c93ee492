//! Key encodings for the object store trees.
//!
//! All numeric key components are big-endian so lexicographic ordering
//! matches numeric ordering and prefix scans stay contiguous.

use crate::schema::{ClassId, PropertyId};
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::fmt;

/// Size of an object id in bytes.
pub const OBJECT_ID_SIZE: usize = 8;

/// Size of an overflow attribute key: object id + property id + occurrence.
pub const OVERFLOW_KEY_SIZE: usize = OBJECT_ID_SIZE + 8 + 4;

/// Size of a class index key: class id + object id.
pub const CLASS_INDEX_KEY_SIZE: usize = 8 + OBJECT_ID_SIZE;

/// Size of a reference index key: target + source + property.
pub const REF_INDEX_KEY_SIZE: usize = OBJECT_ID_SIZE + OBJECT_ID_SIZE + 8;

/// Stable object identifier, unique across the database.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Encode as a big-endian key.
    pub fn encode(&self) -> [u8; OBJECT_ID_SIZE] {
        self.0.to_be_bytes()
    }

    /// Decode from key bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; OBJECT_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(arr)))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode an overflow attribute key.
///
/// Format: `[object (8)][property (8)][occurrence (4)]`. Scanning the
/// object prefix yields attributes grouped by property, occurrences in
/// order.
pub fn overflow_key(object: ObjectId, property: PropertyId, occurrence: u32) -> [u8; OVERFLOW_KEY_SIZE] {
    let mut buf = [0u8; OVERFLOW_KEY_SIZE];
    buf[..8].copy_from_slice(&object.0.to_be_bytes());
    buf[8..16].copy_from_slice(&property.0.to_be_bytes());
    buf[16..].copy_from_slice(&occurrence.to_be_bytes());
    buf
}

/// Prefix covering all overflow attributes of one object.
pub fn overflow_prefix(object: ObjectId) -> [u8; OBJECT_ID_SIZE] {
    object.encode()
}

/// Decode an overflow attribute key.
pub fn decode_overflow_key(bytes: &[u8]) -> Option<(ObjectId, PropertyId, u32)> {
    if bytes.len() != OVERFLOW_KEY_SIZE {
        return None;
    }
    let object = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let property = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
    let occurrence = u32::from_be_bytes(bytes[16..].try_into().ok()?);
    Some((ObjectId(object), PropertyId(property), occurrence))
}

/// Encode a class index key: `[class (8)][object (8)]`.
pub fn class_index_key(class: ClassId, object: ObjectId) -> [u8; CLASS_INDEX_KEY_SIZE] {
    let mut buf = [0u8; CLASS_INDEX_KEY_SIZE];
    buf[..8].copy_from_slice(&class.0.to_be_bytes());
    buf[8..].copy_from_slice(&object.0.to_be_bytes());
    buf
}

/// Prefix covering all objects of one class.
pub fn class_index_prefix(class: ClassId) -> [u8; 8] {
    class.0.to_be_bytes()
}

/// Decode a class index key.
pub fn decode_class_index_key(bytes: &[u8]) -> Option<(ClassId, ObjectId)> {
    if bytes.len() != CLASS_INDEX_KEY_SIZE {
        return None;
    }
    let class = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let object = u64::from_be_bytes(bytes[8..].try_into().ok()?);
    Some((ClassId(class), ObjectId(object)))
}

/// Encode a reference index key: `[target (8)][source (8)][property (8)]`.
///
/// Keyed by target first so "who points at this object" is one prefix
/// scan.
pub fn ref_index_key(target: ObjectId, source: ObjectId, property: PropertyId) -> [u8; REF_INDEX_KEY_SIZE] {
    let mut buf = [0u8; REF_INDEX_KEY_SIZE];
    buf[..8].copy_from_slice(&target.0.to_be_bytes());
    buf[8..16].copy_from_slice(&source.0.to_be_bytes());
    buf[16..].copy_from_slice(&property.0.to_be_bytes());
    buf
}

/// Prefix covering all references pointing at one object.
pub fn ref_index_prefix(target: ObjectId) -> [u8; OBJECT_ID_SIZE] {
    target.encode()
}

/// Decode a reference index key.
pub fn decode_ref_index_key(bytes: &[u8]) -> Option<(ObjectId, ObjectId, PropertyId)> {
    if bytes.len() != REF_INDEX_KEY_SIZE {
        return None;
    }
    let target = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let source = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
    let property = u64::from_be_bytes(bytes[16..].try_into().ok()?);
    Some((ObjectId(target), ObjectId(source), PropertyId(property)))
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
