//! # Change Detector
//! Pure, deterministic comparison of two snapshots. No I/O.
//!
//! Policy: a key of `curr` is stale when it is new, when there is no previous
//! snapshot at all (cold start), or when its value differs structurally from
//! the previous one. Keys that only exist in `prev` are ignored; deletions do
//! not trigger work. A value that became empty counts as a change.

use std::collections::BTreeSet;

use crate::snapshot::Snapshot;
use crate::sources::{route_key, PipelineKind};

/// Set of stale keys, sorted for deterministic dispatch order.
pub type ChangeSet = BTreeSet<String>;

/// Stale keys of `curr` relative to `prev`.
pub fn diff(prev: Option<&Snapshot>, curr: &Snapshot) -> ChangeSet {
    diff_where(prev, curr, |_| true)
}

/// Same as [`diff`], restricted to the keys one sub-pipeline owns.
pub fn diff_scoped(prev: Option<&Snapshot>, curr: &Snapshot, kind: PipelineKind) -> ChangeSet {
    diff_where(prev, curr, |key| route_key(key) == Some(kind))
}

/// Same as [`diff`] with an arbitrary key filter.
pub fn diff_where<F>(prev: Option<&Snapshot>, curr: &Snapshot, mut keep: F) -> ChangeSet
where
    F: FnMut(&str) -> bool,
{
    curr.data
        .iter()
        .filter(|(key, _)| keep(key))
        .filter(|(key, value)| match prev.and_then(|p| p.data.get(*key)) {
            // serde_json::Value equality is recursive over maps/arrays/scalars
            Some(before) => before != *value,
            None => true,
        })
        .map(|(key, _)| key.clone())
        .collect()
}
