//! Key encoding for the ordered key-value collections.
//!
//! Every time-indexed key is a prefix of identifier components followed by a
//! fixed-width timestamp, so that byte-wise key order equals chronological
//! order within one series.
//!
//! # Layout
//!
//! ```text
//! devices  device_id
//! values   device_id 0x1f sensor_id 0x1f ts[8]
//! events   event_id 0x1f ts[8]
//! meta     device_id 0x1f sensor_id 0x1f period 0x1f ts[8]
//! ```
//!
//! `ts` is Unix seconds as a big-endian `u64` with the sign bit flipped. The
//! flip maps `i64::MIN..=i64::MAX` monotonically onto `0..=u64::MAX`, so
//! negative times and times of any decimal width compare correctly.
//!
//! The prefix always ends in the separator. A scan over sensor `temp`
//! therefore never strays into `temp2`, and a key that no longer starts with
//! the prefix marks the end of the series.

use crate::error::KeyError;
use crate::model::PeriodKind;

/// Byte separating key components (ASCII unit separator).
pub const SEP: u8 = 0x1F;

/// Width of an encoded timestamp.
pub const TIMESTAMP_LEN: usize = 8;

const SIGN_BIT: u64 = 1 << 63;

/// Encodes Unix seconds so that byte order equals numeric order.
#[allow(clippy::cast_sign_loss)] // two's-complement reinterpretation is the point
pub fn encode_timestamp(secs: i64) -> [u8; TIMESTAMP_LEN] {
    ((secs as u64) ^ SIGN_BIT).to_be_bytes()
}

/// Inverts [`encode_timestamp`].
#[allow(clippy::cast_possible_wrap)]
pub fn decode_timestamp(bytes: [u8; TIMESTAMP_LEN]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64
}

/// Rejects components that would corrupt the key layout.
fn check_component(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptyComponent { field });
    }
    if value.as_bytes().contains(&SEP) {
        return Err(KeyError::ReservedByte {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Key of a device record.
///
/// # Errors
///
/// Returns [`KeyError`] if `device_id` is empty or contains [`SEP`].
pub fn device_key(device_id: &str) -> Result<Vec<u8>, KeyError> {
    check_component("device id", device_id)?;
    Ok(device_id.as_bytes().to_vec())
}

/// The identifier part shared by every key of one time series.
///
/// A `SeriesPrefix` builds full keys with [`at`](Self::at) and recognises its
/// own keys with [`timestamp_of`](Self::timestamp_of).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPrefix {
    bytes: Vec<u8>,
}

impl SeriesPrefix {
    fn from_components(components: &[(&'static str, &str)]) -> Result<Self, KeyError> {
        let mut bytes = Vec::with_capacity(
            components.iter().map(|(_, c)| c.len() + 1).sum::<usize>() + TIMESTAMP_LEN,
        );
        for (field, component) in components {
            check_component(field, component)?;
            bytes.extend_from_slice(component.as_bytes());
            bytes.push(SEP);
        }
        Ok(Self { bytes })
    }

    /// Prefix of the raw samples of one sensor.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if either id is empty or contains [`SEP`].
    pub fn values(device_id: &str, sensor_id: &str) -> Result<Self, KeyError> {
        Self::from_components(&[("device id", device_id), ("sensor id", sensor_id)])
    }

    /// Prefix of the events of one source.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if `event_id` is empty or contains [`SEP`].
    pub fn events(event_id: &str) -> Result<Self, KeyError> {
        Self::from_components(&[("event id", event_id)])
    }

    /// Prefix of the rollups of one sensor at one granularity.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if either id is empty or contains [`SEP`].
    pub fn meta(device_id: &str, sensor_id: &str, kind: PeriodKind) -> Result<Self, KeyError> {
        Self::from_components(&[
            ("device id", device_id),
            ("sensor id", sensor_id),
            ("period", kind.as_str()),
        ])
    }

    /// Raw prefix bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Full key for the given Unix second.
    pub fn at(&self, secs: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.bytes.len() + TIMESTAMP_LEN);
        key.extend_from_slice(&self.bytes);
        key.extend_from_slice(&encode_timestamp(secs));
        key
    }

    /// Timestamp of `key` if it belongs to this series.
    ///
    /// Returns `None` when the key carries a different prefix or has the
    /// wrong length, which range scans treat as the end of the series.
    pub fn timestamp_of(&self, key: &[u8]) -> Option<i64> {
        let suffix = key.strip_prefix(self.bytes.as_slice())?;
        let bytes: [u8; TIMESTAMP_LEN] = suffix.try_into().ok()?;
        Some(decode_timestamp(bytes))
    }
}

/// Renders a key for logs and dumps: separators become `/`, timestamps
/// become their decimal value.
pub fn display_key(key: &[u8]) -> String {
    let Some(split) = key.len().checked_sub(TIMESTAMP_LEN) else {
        return String::from_utf8_lossy(key).into_owned();
    };
    if split == 0 || key[split - 1] != SEP {
        return String::from_utf8_lossy(key).into_owned();
    }
    let (head, tail) = key.split_at(split);
    let mut out = String::from_utf8_lossy(head).replace(char::from(SEP), "/");
    if let Ok(bytes) = <[u8; TIMESTAMP_LEN]>::try_from(tail) {
        out.push_str(&decode_timestamp(bytes).to_string());
    }
    out
}
