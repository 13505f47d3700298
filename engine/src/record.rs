//! Record and cache entry types.

use crate::{error::Result, Entity, EntitySchema, Error, RecordId, Stamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved member carrying cache metadata inside a persisted row.
pub const CACHE_MEMBER: &str = "_cache";

/// A stable business identifier, normalized for comparison.
///
/// Natural keys are trimmed and lower-cased so that `Ada@Example.com ` and
/// `ada@example.com` identify the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Normalize a raw key.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated entity record.
///
/// The full row is kept as an opaque JSON object; identity and timestamp are
/// extracted once by the entity schema and kept in step with the row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity: Entity,
    id: RecordId,
    natural_key: NaturalKey,
    updated_at: Option<Stamp>,
    timestamp_field: String,
    row: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub(crate) fn from_parts(
        entity: Entity,
        id: RecordId,
        natural_key: NaturalKey,
        updated_at: Option<Stamp>,
        timestamp_field: String,
        row: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            entity,
            id,
            natural_key,
            updated_at,
            timestamp_field,
            row,
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn natural_key(&self) -> &NaturalKey {
        &self.natural_key
    }

    pub fn updated_at(&self) -> Option<Stamp> {
        self.updated_at
    }

    /// The full row.
    pub fn row(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.row
    }

    /// The full row as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.row.clone())
    }

    /// Set `updated_at`, writing it into the row's primary timestamp field.
    pub fn touch(&mut self, at: Stamp) {
        self.updated_at = Some(at);
        self.row.insert(self.timestamp_field.clone(), at.to_json());
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.row.serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMeta {
    #[serde(default)]
    cached_at: Option<Stamp>,
    #[serde(default)]
    dirty: bool,
    #[serde(default)]
    deleted: bool,
}

/// A record as held by the local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The cached record
    pub record: Record,
    /// When this entry was written locally
    pub cached_at: Stamp,
    /// Written locally and not yet confirmed by the remote store
    pub dirty: bool,
    /// Tombstone awaiting remote confirmation
    pub deleted: bool,
}

impl CacheEntry {
    /// An entry confirmed by the remote store.
    pub fn clean(record: Record, cached_at: Stamp) -> Self {
        Self {
            record,
            cached_at,
            dirty: false,
            deleted: false,
        }
    }

    /// An entry written while the remote store was unreachable.
    pub fn dirty(record: Record, cached_at: Stamp) -> Self {
        Self {
            record,
            cached_at,
            dirty: true,
            deleted: false,
        }
    }

    /// Turn this entry into a dirty tombstone stamped at `at`.
    pub fn into_tombstone(mut self, at: Stamp) -> Self {
        self.record.touch(at);
        self.cached_at = at;
        self.dirty = true;
        self.deleted = true;
        self
    }

    /// `entity:id` identity of the entry.
    pub fn key(&self) -> String {
        format!("{}:{}", self.record.entity(), self.record.id())
    }

    pub fn natural_key(&self) -> &NaturalKey {
        self.record.natural_key()
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Persisted form: the row plus the reserved `_cache` member.
    pub fn to_json(&self) -> serde_json::Value {
        let mut row = self.record.row().clone();
        let meta = CacheMeta {
            cached_at: Some(self.cached_at),
            dirty: self.dirty,
            deleted: self.deleted,
        };
        row.insert(
            CACHE_MEMBER.to_string(),
            serde_json::to_value(meta).unwrap_or(serde_json::Value::Null),
        );
        serde_json::Value::Object(row)
    }

    /// Parse a persisted entry.
    ///
    /// Rows written by other code paths may lack the `_cache` member; they are
    /// treated as clean entries cached at their own `updated_at`.
    pub fn from_json(schema: &EntitySchema, value: serde_json::Value) -> Result<Self> {
        let meta = match value.get(CACHE_MEMBER) {
            None | Some(serde_json::Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<CacheMeta>(raw.clone())
                    .map_err(|e| Error::InvalidCacheEntry(e.to_string()))?,
            ),
        };

        let record = schema.parse(value)?;
        let fallback_cached_at = record.updated_at().unwrap_or(Stamp::from_millis(0));

        Ok(match meta {
            Some(meta) => Self {
                cached_at: meta.cached_at.unwrap_or(fallback_cached_at),
                dirty: meta.dirty,
                deleted: meta.deleted,
                record,
            },
            None => Self::clean(record, fallback_cached_at),
        })
    }
}
