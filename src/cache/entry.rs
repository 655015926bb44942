//! Cache Entry Representations
//!
//! Two physical shapes share the `{prefix}{id}` key space:
//!
//! - **bare**: the JSON record, stored with a hard TTL. An empty (or blank)
//!   string is the negative-cache marker.
//! - **wrapped**: `{"data": <record>, "expireTime": <RFC 3339>}`, stored
//!   without a TTL. Staleness is judged only from `expireTime`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Value written for ids with no backing record
pub const NULL_MARKER: &str = "";

/// Physical cache key for a record
pub fn cache_key(key_prefix: &str, id: impl std::fmt::Display) -> String {
    format!("{}{}", key_prefix, id)
}

/// Result of reading a bare entry
#[derive(Debug, Clone, PartialEq)]
pub enum BareLookup<R> {
    /// A cached record
    Hit(R),
    /// The negative-cache marker
    NullHit,
    /// Nothing cached
    Miss,
}

impl<R> BareLookup<R> {
    /// `Some(answer)` when the entry alone answers the lookup.
    pub fn into_answer(self) -> Option<Option<R>> {
        match self {
            BareLookup::Hit(value) => Some(Some(value)),
            BareLookup::NullHit => Some(None),
            BareLookup::Miss => None,
        }
    }
}

/// Interpret the raw value of a bare entry.
pub fn decode_bare<R: DeserializeOwned>(key: &str, raw: Option<String>) -> Result<BareLookup<R>> {
    match raw {
        None => Ok(BareLookup::Miss),
        Some(raw) if raw.trim().is_empty() => Ok(BareLookup::NullHit),
        Some(raw) => serde_json::from_str(&raw)
            .map(BareLookup::Hit)
            .map_err(|e| Error::CorruptEntry {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Wrapped entry carrying its own logical expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEntry<R> {
    pub data: R,
    pub expire_time: DateTime<Utc>,
}

impl<R> LogicalEntry<R> {
    pub fn new(data: R, expire_time: DateTime<Utc>) -> Self {
        Self { data, expire_time }
    }

    /// Stale once `expire_time` is not after `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }
}

/// Interpret the raw value of a wrapped entry. Blank counts as absent.
pub fn decode_logical<R: DeserializeOwned>(
    key: &str,
    raw: Option<String>,
) -> Result<Option<LogicalEntry<R>>> {
    match raw {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::CorruptEntry {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}
