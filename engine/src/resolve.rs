//! Conflict resolution for records that share a natural key.
//!
//! The same logical record can be visible several times at once: in the
//! canonical collection, as an individually-keyed override, and in a fresh
//! remote listing. This module picks one winner per natural key.
//!
//! # Algorithm
//!
//! 1. Group candidates by natural key
//! 2. Within a group, order by (`updated_at`, origin); absent timestamps sort
//!    lowest and an override outranks a collection entry
//! 3. Break any remaining tie with a total fallback (id, then row content) so
//!    the result never depends on input order
//! 4. Report remaining ties between different records as [`Conflict`] values
//!
//! Everything here is pure: no clock reads, no I/O.

use crate::{CacheEntry, NaturalKey, Record, RecordId, Stamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Where a candidate was read from.
///
/// Declaration order is rank order: an override outranks a collection entry
/// when timestamps tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// Entry of the shared `<entity>_collection` bucket
    Collection,
    /// Individually-keyed `record_<entity>_<naturalKey>` bucket
    Override,
}

/// One candidate for a natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entry: CacheEntry,
    pub origin: Origin,
}

impl Candidate {
    pub fn from_collection(entry: CacheEntry) -> Self {
        Self {
            entry,
            origin: Origin::Collection,
        }
    }

    pub fn from_override(entry: CacheEntry) -> Self {
        Self {
            entry,
            origin: Origin::Override,
        }
    }

    fn rank(&self) -> (Option<Stamp>, Origin) {
        (self.entry.record.updated_at(), self.origin)
    }

    fn row_text(&self) -> String {
        serde_json::to_string(self.entry.record.row()).unwrap_or_default()
    }

    fn same_content(&self, other: &Candidate) -> bool {
        self.entry.deleted == other.entry.deleted
            && self.entry.record.row() == other.entry.record.row()
    }

    /// Total order used to pick a winner.
    fn compare(&self, other: &Candidate) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.entry.record.id().cmp(other.entry.record.id()))
            .then_with(|| self.row_text().cmp(&other.row_text()))
            .then_with(|| self.entry.deleted.cmp(&other.entry.deleted))
            .then_with(|| self.entry.dirty.cmp(&other.entry.dirty))
            .then_with(|| self.entry.cached_at.cmp(&other.entry.cached_at))
    }
}

/// Why two candidates could not be ordered by timestamp and origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    /// Equal or absent timestamps from the same origin
    UnorderableTimestamps,
}

/// A tie settled by the fallback order.
///
/// Conflicts are informational: the winner has already been chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub natural_key: NaturalKey,
    pub reason: ConflictReason,
    pub winner_id: RecordId,
    pub tied_ids: Vec<RecordId>,
}

/// The winner for one natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Candidate,
    pub conflict: Option<Conflict>,
}

/// One entry per natural key, in natural-key order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    pub entries: Vec<CacheEntry>,
    pub conflicts: Vec<Conflict>,
}

/// Last-write-wins resolver.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Pick the winner among candidates sharing a natural key.
    ///
    /// Returns `None` only for an empty input.
    pub fn resolve(candidates: Vec<Candidate>) -> Option<Resolution> {
        let winner = candidates
            .iter()
            .max_by(|a, b| a.compare(b))
            .cloned()?;

        let tied_ids: Vec<RecordId> = candidates
            .iter()
            .filter(|c| c.rank() == winner.rank() && !c.same_content(&winner))
            .map(|c| c.entry.record.id().to_string())
            .collect();

        let conflict = (!tied_ids.is_empty()).then(|| Conflict {
            natural_key: winner.entry.natural_key().clone(),
            reason: ConflictReason::UnorderableTimestamps,
            winner_id: winner.entry.record.id().to_string(),
            tied_ids,
        });

        Some(Resolution { winner, conflict })
    }

    /// Group candidates by natural key and resolve each group.
    pub fn merge(candidates: impl IntoIterator<Item = Candidate>) -> MergeOutcome {
        let mut groups: BTreeMap<NaturalKey, Vec<Candidate>> = BTreeMap::new();
        for candidate in candidates {
            groups
                .entry(candidate.entry.natural_key().clone())
                .or_default()
                .push(candidate);
        }

        let mut outcome = MergeOutcome::default();
        for (_, group) in groups {
            if let Some(resolution) = Self::resolve(group) {
                outcome.entries.push(resolution.winner.entry);
                outcome.conflicts.extend(resolution.conflict);
            }
        }
        outcome
    }
}

/// Whether a dirty local entry should survive a successful remote read.
///
/// A dirty entry yields once the remote store returns the record with
/// `updated_at >= cached_at`; a remote row without a timestamp never
/// displaces it. A tombstone whose row is gone remotely is confirmed and
/// yields too.
fn local_survives(remote: Option<&Record>, local: &CacheEntry) -> bool {
    if !local.dirty {
        return false;
    }
    let Some(remote) = remote else {
        return local.is_live();
    };
    match remote.updated_at() {
        Some(remote_at) => remote_at < local.cached_at,
        None => true,
    }
}

/// Fold a successful remote listing into the local entries.
///
/// The remote rows become the canonical set (deduplicated by natural key).
/// Dirty local entries survive where [`local_survives`] says so; clean local
/// entries missing remotely are dropped, since an empty remote answer is
/// authoritative.
pub fn reconcile_remote(remote: Vec<Record>, local: Vec<CacheEntry>, now: Stamp) -> MergeOutcome {
    let remote = ConflictResolver::merge(
        remote
            .into_iter()
            .map(|record| Candidate::from_collection(CacheEntry::clean(record, now))),
    );

    let mut by_key: BTreeMap<NaturalKey, CacheEntry> = remote
        .entries
        .into_iter()
        .map(|entry| (entry.natural_key().clone(), entry))
        .collect();

    for entry in local {
        let remote_record = by_key.get(entry.natural_key()).map(|e| &e.record);
        if local_survives(remote_record, &entry) {
            by_key.insert(entry.natural_key().clone(), entry);
        }
    }

    MergeOutcome {
        entries: by_key.into_values().collect(),
        conflicts: remote.conflicts,
    }
}

/// Single-record form of [`reconcile_remote`].
pub fn reconcile_remote_one(
    remote: Option<Record>,
    local: Option<CacheEntry>,
    now: Stamp,
) -> Option<CacheEntry> {
    match local {
        Some(local) if local_survives(remote.as_ref(), &local) => Some(local),
        _ => remote.map(|record| CacheEntry::clean(record, now)),
    }
}
