//! Comparable timestamps for last-write-wins ordering.
//!
//! Records arrive from the remote store with ISO-8601 strings and from older
//! cache entries with epoch numbers. Both are normalized to milliseconds since
//! the Unix epoch so that every source compares on one axis.

use crate::{error::Result, Error};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A point in time with millisecond precision.
///
/// Ordering is plain chronological order, which gives the total order the
/// conflict resolver relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(i64);

impl Stamp {
    /// Create a stamp from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Epoch milliseconds.
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Parse an ISO-8601 / RFC 3339 string.
    ///
    /// Accepted shapes, in order:
    /// 1. RFC 3339 with an offset (`2024-03-01T10:00:00+02:00`, `...Z`)
    /// 2. Naive date-time, taken as UTC (`2024-03-01T10:00:00.123`, also with a space)
    /// 3. Date only, taken as midnight UTC (`2024-03-01`)
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self(dt.timestamp_millis()));
        }

        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(Self(naive.and_utc().timestamp_millis()));
            }
        }

        // Postgres renders timestamptz with a short "+00" offset
        if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
            return Ok(Self(dt.timestamp_millis()));
        }

        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self(midnight.and_utc().timestamp_millis()));
            }
        }

        Err(Error::InvalidTimestamp(input.to_string()))
    }

    /// Parse a JSON value: strings as ISO-8601, integers as epoch milliseconds.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Self)
                .ok_or_else(|| Error::InvalidTimestamp(n.to_string())),
            other => Err(Error::InvalidTimestamp(other.to_string())),
        }
    }

    /// RFC 3339 in UTC with millisecond precision, e.g. `2024-01-01T00:00:00.000Z`.
    pub fn to_rfc3339(&self) -> String {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.0.to_string(),
        }
    }

    /// JSON form used when writing a stamp back into a record row.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::String(self.to_rfc3339())
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Stamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Stamp::from_json(&value).map_err(serde::de::Error::custom)
    }
}
