//! Explicit per-sub-pipeline state, persisted next to the data so a restart
//! knows what the last run got through.
//!
//! Only the orchestrator writes this file. Every update happens under one
//! async mutex and is flushed atomically before the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::sources::PipelineKind;
use crate::storage;

/// Where a sub-pipeline is within one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Detecting,
    NoChange,
    Dispatching,
    Persisting,
}

impl Phase {
    /// Legal moves: idle -> detecting -> (no_change | dispatching -> persisting) -> idle.
    /// Any phase may fall back to idle when the run aborts.
    pub fn can_advance(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Idle, Detecting)
                | (Detecting, NoChange)
                | (Detecting, Dispatching)
                | (Dispatching, Persisting)
                | (_, Idle)
        )
    }

    /// A run stopped here did not finish.
    pub fn is_interrupted(self) -> bool {
        matches!(self, Phase::Detecting | Phase::Dispatching | Phase::Persisting)
    }
}

/// Per-pipeline bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubPipelineState {
    pub phase: Phase,
    /// Timestamp of the latest snapshot fully processed.
    pub processed_snapshot: Option<DateTime<Utc>>,
    pub snapshot_digest: Option<String>,
    /// Keys whose units failed; retried on the next tick.
    #[serde(default)]
    pub pending_retry: BTreeSet<String>,
    /// Failed unit keys behind `pending_retry` when one key fans out to
    /// several units. Empty means every unit of a pending key is redone.
    #[serde(default)]
    pub pending_units: BTreeSet<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

impl SubPipelineState {
    /// `snapshot` was already handled by a completed run.
    pub fn has_processed(&self, snapshot: &Snapshot) -> bool {
        self.processed_snapshot == Some(snapshot.timestamp)
            && self.snapshot_digest.as_deref() == Some(snapshot.digest().as_str())
    }

    /// The retained snapshot this pipeline last completed. `None` when it never
    /// ran or that snapshot has been evicted since.
    pub fn baseline(&self, history: &[Arc<Snapshot>]) -> Option<Arc<Snapshot>> {
        self.processed_snapshot?;
        history.iter().rev().find(|s| self.has_processed(s)).cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStateFile {
    #[serde(default)]
    pub pipelines: BTreeMap<PipelineKind, SubPipelineState>,
}

pub struct StateStore {
    path: PathBuf,
    inner: Mutex<PipelineStateFile>,
}

impl StateStore {
    /// Load the state file; missing means every pipeline is idle. A malformed
    /// file is fatal. Interrupted runs are reported and reset to idle.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file: PipelineStateFile = storage::read_json(&path)?.unwrap_or_default();
        for (kind, st) in file.pipelines.iter_mut() {
            if st.phase.is_interrupted() {
                tracing::warn!(
                    pipeline = %kind,
                    phase = ?st.phase,
                    processed = ?st.processed_snapshot,
                    "previous run was interrupted, work will be redone"
                );
                st.phase = Phase::Idle;
            }
        }
        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, kind: PipelineKind) -> SubPipelineState {
        self.inner
            .lock()
            .await
            .pipelines
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> PipelineStateFile {
        self.inner.lock().await.clone()
    }

    /// Move `kind` to `phase` and flush.
    pub async fn enter(&self, kind: PipelineKind, phase: Phase) -> Result<()> {
        self.update(kind, |st| {
            if !st.phase.can_advance(phase) {
                tracing::warn!(pipeline = %kind, from = ?st.phase, to = ?phase, "unexpected phase transition");
            }
            st.phase = phase;
        })
        .await
    }

    /// Mutate one pipeline's entry and flush the whole file atomically.
    pub async fn update<F>(&self, kind: PipelineKind, f: F) -> Result<()>
    where
        F: FnOnce(&mut SubPipelineState),
    {
        let mut guard = self.inner.lock().await;
        f(guard.pipelines.entry(kind).or_default());
        storage::write_json_atomic(&self.path, &*guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert!(Phase::Idle.can_advance(Phase::Detecting));
        assert!(Phase::Detecting.can_advance(Phase::NoChange));
        assert!(Phase::Dispatching.can_advance(Phase::Persisting));
        assert!(Phase::Persisting.can_advance(Phase::Idle));
        assert!(!Phase::Persisting.can_advance(Phase::Dispatching));
        assert!(!Phase::Idle.can_advance(Phase::Persisting));
    }

    #[tokio::test]
    async fn updates_are_flushed_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state").join("pipeline_state.json");
        let store = StateStore::open(&p).unwrap();
        store.enter(PipelineKind::Calendar, Phase::Detecting).await.unwrap();
        store
            .update(PipelineKind::Calendar, |st| {
                st.pending_retry.insert("EUR/USD_calendar".into());
            })
            .await
            .unwrap();

        let text = std::fs::read_to_string(&p).unwrap();
        assert!(text.contains("\"calendar\""));
        assert!(text.contains("\"detecting\""));

        // reopen: interrupted phase is reset, pending keys are kept
        let again = StateStore::open(&p).unwrap();
        let st = again.get(PipelineKind::Calendar).await;
        assert_eq!(st.phase, Phase::Idle);
        assert!(st.pending_retry.contains("EUR/USD_calendar"));
    }

    #[test]
    fn malformed_state_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("pipeline_state.json");
        std::fs::write(&p, "{ nope").unwrap();
        let err = StateStore::open(&p).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn processed_requires_matching_digest() {
        let snap = Snapshot::now(BTreeMap::new());
        let mut st = SubPipelineState {
            processed_snapshot: Some(snap.timestamp),
            snapshot_digest: Some("other".into()),
            ..Default::default()
        };
        assert!(!st.has_processed(&snap));
        st.snapshot_digest = Some(snap.digest());
        assert!(st.has_processed(&snap));
    }

    #[test]
    fn baseline_is_the_processed_snapshot_while_retained() {
        use chrono::TimeZone;
        let at = |m: u32, v: i64| {
            let mut data = BTreeMap::new();
            data.insert("risk.fx".to_string(), serde_json::json!(v));
            Arc::new(Snapshot::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, m, 0).unwrap(), data))
        };
        let history = vec![at(0, 1), at(30, 2), at(59, 3)];

        assert!(SubPipelineState::default().baseline(&history).is_none());

        let st = SubPipelineState {
            processed_snapshot: Some(history[0].timestamp),
            snapshot_digest: Some(history[0].digest()),
            ..Default::default()
        };
        assert_eq!(st.baseline(&history), Some(history[0].clone()));
        // evicted
        assert!(st.baseline(&history[1..]).is_none());
    }
}
