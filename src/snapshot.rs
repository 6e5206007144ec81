//! # Snapshot store
//! Bounded, oldest-first JSON array of timestamped scrape snapshots
//! (`results.json`). Snapshots are never mutated once appended; the store
//! only evicts from the front when it grows past its limit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::storage;

pub const DEFAULT_SNAPSHOT_LIMIT: usize = 5;

/// One capture of all upstream raw source data, keyed by logical source id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub data: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>, data: BTreeMap<String, Value>) -> Self {
        Self { timestamp, data }
    }

    /// Stamp raw collector output with the current time.
    pub fn now(data: BTreeMap<String, Value>) -> Self {
        Self::new(Utc::now(), data)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Stable sha256 over the data section (BTreeMap keeps key order fixed).
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.data).unwrap_or_default();
        let hash = Sha256::digest(&bytes);
        hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    limit: usize,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Full retained history, oldest first. Missing file -> empty.
    pub fn load(&self) -> Result<Vec<Snapshot>> {
        storage::read_array(&self.path)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                serde_json::from_value(v).map_err(|e| {
                    PipelineError::malformed(&self.path, format!("entry {i}: {e}"))
                })
            })
            .collect()
    }

    /// Append and evict from the front past `limit`. Returns the retained length.
    pub fn append(&self, snapshot: Snapshot) -> Result<usize> {
        let mut all = self.load()?;
        if let Some(last) = all.last() {
            if snapshot.timestamp <= last.timestamp {
                tracing::warn!(
                    new = %snapshot.timestamp,
                    last = %last.timestamp,
                    "snapshot timestamp not after the latest one"
                );
            }
        }
        all.push(snapshot);
        if all.len() > self.limit {
            let excess = all.len() - self.limit;
            all.drain(0..excess);
        }
        storage::write_json_atomic(&self.path, &all)?;
        tracing::debug!(path = %self.path.display(), retained = all.len(), "snapshot appended");
        Ok(all.len())
    }

    pub fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.load()?.pop())
    }

    /// Second-to-last snapshot; `None` on cold start (fewer than two).
    pub fn previous(&self) -> Result<Option<Snapshot>> {
        let mut all = self.load()?;
        if all.len() < 2 {
            return Ok(None);
        }
        all.pop();
        Ok(all.pop())
    }
}
