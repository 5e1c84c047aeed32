//! Shard keys and key ranges
//!
//! Every key is stored in a normalized byte form whose lexicographic order
//! matches the natural order of the original value, so that point and range
//! comparisons never need to know the key type.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory};

/// Key type a shard map is partitioned on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShardKeyType {
    Int32,
    Int64,
    Guid,
    Binary,
    DateTime,
}

impl ShardKeyType {
    /// Size of the normalized form, `None` for variable-length types.
    fn fixed_width(self) -> Option<usize> {
        match self {
            ShardKeyType::Int32 => Some(4),
            ShardKeyType::Int64 | ShardKeyType::DateTime => Some(8),
            ShardKeyType::Guid => Some(16),
            ShardKeyType::Binary => None,
        }
    }
}

/// A normalized shard key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShardKey {
    key_type: ShardKeyType,
    /// Normalized bytes; `None` is positive infinity.
    value: Option<Vec<u8>>,
}

fn flip_sign(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes[0] ^= 0x80;
    bytes
}

impl ShardKey {
    pub fn from_i32(value: i32) -> Self {
        Self {
            key_type: ShardKeyType::Int32,
            value: Some(flip_sign(value.to_be_bytes().to_vec())),
        }
    }

    pub fn from_i64(value: i64) -> Self {
        Self {
            key_type: ShardKeyType::Int64,
            value: Some(flip_sign(value.to_be_bytes().to_vec())),
        }
    }

    pub fn from_uuid(value: Uuid) -> Self {
        Self {
            key_type: ShardKeyType::Guid,
            value: Some(value.as_bytes().to_vec()),
        }
    }

    /// Binary keys ignore trailing zero bytes.
    pub fn from_bytes(value: &[u8]) -> Self {
        let end = value.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        Self {
            key_type: ShardKeyType::Binary,
            value: Some(value[..end].to_vec()),
        }
    }

    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self {
            key_type: ShardKeyType::DateTime,
            value: Some(flip_sign(value.timestamp_micros().to_be_bytes().to_vec())),
        }
    }

    /// Smallest key of the given type.
    pub fn min(key_type: ShardKeyType) -> Self {
        let value = match key_type.fixed_width() {
            Some(width) => vec![0u8; width],
            None => Vec::new(),
        };
        Self {
            key_type,
            value: Some(value),
        }
    }

    /// Positive infinity for the given type.
    pub fn max(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            value: None,
        }
    }

    /// Rebuild a key from its normalized form, validating the width.
    pub fn from_normalized(key_type: ShardKeyType, value: Option<Vec<u8>>) -> Result<Self> {
        if let (Some(width), Some(bytes)) = (key_type.fixed_width(), value.as_ref()) {
            if bytes.len() != width {
                return Err(ShardManagementError::invalid_argument(
                    ShardManagementErrorCategory::Validation,
                    format!(
                        "normalized {:?} key must be {} bytes, got {}",
                        key_type,
                        width,
                        bytes.len()
                    ),
                ));
            }
        }
        Ok(Self { key_type, value })
    }

    pub fn key_type(&self) -> ShardKeyType {
        self.key_type
    }

    pub fn is_max(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min(self.key_type)
    }

    pub fn normalized(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    fn denormalized_i64(&self) -> Option<i64> {
        let bytes = flip_sign(self.value.clone()?);
        Some(i64::from_be_bytes(bytes.as_slice().try_into().ok()?))
    }

    pub fn as_i32(&self) -> Option<i32> {
        if self.key_type != ShardKeyType::Int32 {
            return None;
        }
        let bytes = flip_sign(self.value.clone()?);
        Some(i32::from_be_bytes(bytes.as_slice().try_into().ok()?))
    }

    pub fn as_i64(&self) -> Option<i64> {
        if self.key_type != ShardKeyType::Int64 {
            return None;
        }
        self.denormalized_i64()
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        if self.key_type != ShardKeyType::Guid {
            return None;
        }
        Uuid::from_slice(self.value.as_deref()?).ok()
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        if self.key_type != ShardKeyType::DateTime {
            return None;
        }
        Utc.timestamp_micros(self.denormalized_i64()?).single()
    }
}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.value, &other.value) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            return write!(f, "+inf");
        }
        match self.key_type {
            ShardKeyType::Int32 => write!(f, "{}", self.as_i32().unwrap_or_default()),
            ShardKeyType::Int64 => write!(f, "{}", self.as_i64().unwrap_or_default()),
            ShardKeyType::Guid => write!(f, "{}", self.as_uuid().unwrap_or_default()),
            ShardKeyType::DateTime => match self.as_datetime() {
                Some(dt) => write!(f, "{}", dt.to_rfc3339()),
                None => write!(f, "<invalid datetime>"),
            },
            ShardKeyType::Binary => {
                write!(f, "0x{}", hex::encode(self.value.as_deref().unwrap_or_default()))
            }
        }
    }
}

/// Half-open key interval `[low, high)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl ShardRange {
    pub fn new(low: ShardKey, high: ShardKey) -> Result<Self> {
        if low.key_type() != high.key_type() {
            return Err(ShardManagementError::invalid_argument(
                ShardManagementErrorCategory::Validation,
                format!(
                    "range bounds have different key types: {:?} and {:?}",
                    low.key_type(),
                    high.key_type()
                ),
            ));
        }
        if low >= high {
            return Err(ShardManagementError::invalid_argument(
                ShardManagementErrorCategory::Validation,
                format!("range low {} must be less than high {}", low, high),
            ));
        }
        Ok(Self { low, high })
    }

    /// Convenience for `Int32` ranges.
    pub fn i32(low: i32, high: i32) -> Result<Self> {
        Self::new(ShardKey::from_i32(low), ShardKey::from_i32(high))
    }

    /// Convenience for `Int64` ranges.
    pub fn i64(low: i64, high: i64) -> Result<Self> {
        Self::new(ShardKey::from_i64(low), ShardKey::from_i64(high))
    }

    /// The whole key space of a type.
    pub fn full(key_type: ShardKeyType) -> Self {
        Self {
            low: ShardKey::min(key_type),
            high: ShardKey::max(key_type),
        }
    }

    pub fn low(&self) -> &ShardKey {
        &self.low
    }

    pub fn high(&self) -> &ShardKey {
        &self.high
    }

    pub fn key_type(&self) -> ShardKeyType {
        self.low.key_type()
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        self.low <= *key && *key < self.high
    }

    pub fn intersects(&self, other: &ShardRange) -> bool {
        self.low < other.high && other.low < self.high
    }

    /// True when `other` starts exactly where `self` ends.
    pub fn is_adjacent_to(&self, other: &ShardRange) -> bool {
        self.high == other.low
    }

    /// Split into `[low, key)` and `[key, high)`.
    pub fn split_at(&self, key: &ShardKey) -> Result<(ShardRange, ShardRange)> {
        if !self.contains(key) || *key == self.low {
            return Err(ShardManagementError::invalid_argument(
                ShardManagementErrorCategory::RangeShardMap,
                format!("split point {} is not strictly inside range {}", key, self),
            ));
        }
        Ok((
            ShardRange::new(self.low.clone(), key.clone())?,
            ShardRange::new(key.clone(), self.high.clone())?,
        ))
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_order_is_preserved() {
        let keys = [i32::MIN, -5, -1, 0, 1, 42, i32::MAX];
        for pair in keys.windows(2) {
            assert!(ShardKey::from_i32(pair[0]) < ShardKey::from_i32(pair[1]));
        }
        assert!(ShardKey::from_i64(-1) < ShardKey::from_i64(0));
        assert_eq!(ShardKey::from_i32(-17).as_i32(), Some(-17));
        assert_eq!(ShardKey::from_i64(i64::MIN).as_i64(), Some(i64::MIN));
    }

    #[test]
    fn test_min_and_max() {
        assert!(ShardKey::min(ShardKeyType::Int32).is_min());
        assert_eq!(ShardKey::min(ShardKeyType::Int32), ShardKey::from_i32(i32::MIN));
        assert!(ShardKey::from_i32(i32::MAX) < ShardKey::max(ShardKeyType::Int32));
        assert_eq!(ShardKey::max(ShardKeyType::Int64).to_string(), "+inf");
    }

    #[test]
    fn test_binary_ignores_trailing_zeros() {
        assert_eq!(ShardKey::from_bytes(&[1, 2, 0, 0]), ShardKey::from_bytes(&[1, 2]));
        assert!(ShardKey::from_bytes(&[1]) < ShardKey::from_bytes(&[1, 1]));
        assert_eq!(ShardKey::from_bytes(&[0xab]).to_string(), "0xab");
    }

    #[test]
    fn test_datetime_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let key = ShardKey::from_datetime(dt);
        assert_eq!(key.as_datetime(), Some(dt));
        assert!(ShardKey::from_datetime(dt - chrono::Duration::seconds(1)) < key);
    }

    #[test]
    fn test_range_contains_and_intersects() {
        let r = ShardRange::i32(0, 100).unwrap();
        assert!(r.contains(&ShardKey::from_i32(0)));
        assert!(r.contains(&ShardKey::from_i32(99)));
        assert!(!r.contains(&ShardKey::from_i32(100)));

        assert!(r.intersects(&ShardRange::i32(99, 200).unwrap()));
        assert!(!r.intersects(&ShardRange::i32(100, 200).unwrap()));
        assert!(r.is_adjacent_to(&ShardRange::i32(100, 200).unwrap()));

        let unbounded = ShardRange::new(ShardKey::from_i32(50), ShardKey::max(ShardKeyType::Int32)).unwrap();
        assert!(unbounded.contains(&ShardKey::from_i32(i32::MAX)));
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(ShardRange::i32(5, 5).is_err());
        assert!(ShardRange::i32(6, 5).is_err());
        assert!(ShardRange::new(ShardKey::from_i32(1), ShardKey::from_i64(2)).is_err());
        assert!(ShardKey::from_normalized(ShardKeyType::Int32, Some(vec![1, 2])).is_err());
    }

    #[test]
    fn test_split_at() {
        let r = ShardRange::i32(0, 100).unwrap();
        let (left, right) = r.split_at(&ShardKey::from_i32(40)).unwrap();
        assert_eq!(left, ShardRange::i32(0, 40).unwrap());
        assert_eq!(right, ShardRange::i32(40, 100).unwrap());
        assert!(r.split_at(&ShardKey::from_i32(0)).is_err());
        assert!(r.split_at(&ShardKey::from_i32(100)).is_err());
    }
}
