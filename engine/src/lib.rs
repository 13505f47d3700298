//! # Tandem Engine
//!
//! The pure core of a remote-first data layer with a local fallback cache.
//!
//! This crate owns the data model and the decision rules: how rows are
//! validated, how cache entries are keyed and persisted, and which of several
//! copies of a record wins. It never touches the network, the filesystem or
//! the clock; callers pass the current time in.
//!
//! ## Design Principles
//!
//! - **No IO**: storage and transport live in the server crate
//! - **Deterministic**: the same candidates always pick the same winner
//! - **Testable**: pure functions, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is an opaque JSON row for one [`Entity`], with an `id`, a
//! normalized [`NaturalKey`] and an optional `updated_at` [`Stamp`] lifted out
//! by the entity's [`EntitySchema`].
//!
//! ### Cache entries
//!
//! A [`CacheEntry`] wraps a record with local bookkeeping: when it was cached,
//! whether it is still unconfirmed by the remote store (`dirty`), and whether
//! it is a pending delete (`deleted`). The [`keys`] module defines the
//! storage key namespace shared by every process on the same storage area.
//!
//! ### Resolution
//!
//! [`ConflictResolver`] picks one entry per natural key using last-write-wins
//! on `updated_at`, preferring an individually-keyed override on ties.
//! [`reconcile_remote`] folds a successful remote read into local state.
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{CacheEntry, Candidate, ConflictResolver, Entity, Schema, Stamp};
//! use serde_json::json;
//!
//! let schema = Schema::default();
//! let older = json!({"id": "1", "email": "ada@example.com", "updated_at": "2024-01-01"});
//! let newer = json!({"id": "1", "email": "Ada@Example.com", "updated_at": "2024-02-01"});
//! let older = schema.parse(Entity::Users, older).unwrap();
//! let newer = schema.parse(Entity::Users, newer).unwrap();
//!
//! let now = Stamp::from_millis(0);
//! let merged = ConflictResolver::merge(vec![
//!     Candidate::from_override(CacheEntry::clean(older, now)),
//!     Candidate::from_collection(CacheEntry::clean(newer.clone(), now)),
//! ]);
//!
//! assert_eq!(merged.entries.len(), 1);
//! assert_eq!(merged.entries[0].record, newer);
//! ```

pub mod entity;
pub mod error;
pub mod event;
pub mod keys;
pub mod record;
pub mod resolve;
pub mod schema;
pub mod stamp;

// Re-export main types at crate root
pub use entity::Entity;
pub use error::{Error, Result};
pub use event::{ChangeEvent, EventSource, EventType, UpdateMarker};
pub use keys::CacheKey;
pub use record::{CacheEntry, NaturalKey, Record, CACHE_MEMBER};
pub use resolve::{
    reconcile_remote, reconcile_remote_one, Candidate, Conflict, ConflictReason,
    ConflictResolver, MergeOutcome, Origin, Resolution,
};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema};
pub use stamp::Stamp;

/// Remote primary key, rendered as a string
pub type RecordId = String;
