//! The four sub-pipelines. Each one turns a stale key set into work units,
//! dispatches them, and persists the outcome to its own rolling files.
//!
//! Detection and state bookkeeping live in the orchestrator; a sub-pipeline
//! only sees the two phases it owns: dispatch, then persist.

pub mod calendar;
pub mod fundamentals;
pub mod news;
pub mod risk;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::analysis::SharedAnalyst;
use crate::change_detector::ChangeSet;
use crate::dispatch::{Dispatcher, FailurePolicy};
use crate::history::ResultPersister;
use crate::snapshot::Snapshot;
use crate::sources::{PipelineKind, SourceEntry};

pub use calendar::CalendarPipeline;
pub use fundamentals::FundamentalsPipeline;
pub use news::NewsPipeline;
pub use risk::RiskPipeline;

/// Stale keys that are only there because an earlier run failed on them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryScope {
    /// Pending keys that did not change since the baseline.
    pub keys: ChangeSet,
    /// Unit keys that failed; empty means every unit of `keys` is redone.
    pub units: BTreeSet<String>,
}

impl RetryScope {
    /// Whether `key` should drive the unit named `unit` this tick.
    pub fn allows(&self, key: &str, unit: &str) -> bool {
        !self.keys.contains(key) || self.units.is_empty() || self.units.contains(unit)
    }
}

/// Read-only inputs for one sub-pipeline during one tick.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub curr: Arc<Snapshot>,
    /// Snapshot this pipeline last completed; `None` on cold start.
    pub prev: Option<Arc<Snapshot>>,
    pub retry: RetryScope,
}

impl TickContext {
    pub fn new(curr: Snapshot, prev: Option<Snapshot>) -> Self {
        Self::shared(Arc::new(curr), prev.map(Arc::new))
    }

    pub fn shared(curr: Arc<Snapshot>, prev: Option<Arc<Snapshot>>) -> Self {
        Self {
            curr,
            prev,
            retry: RetryScope::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryScope) -> Self {
        self.retry = retry;
        self
    }

    /// Typed entries for `stale` keys present in the current snapshot.
    /// A payload that does not fit its key fails the whole sub-pipeline.
    pub fn stale_entries(&self, stale: &ChangeSet) -> anyhow::Result<Vec<(String, SourceEntry)>> {
        let mut out = Vec::with_capacity(stale.len());
        for key in stale {
            let Some(value) = self.curr.get(key) else {
                continue;
            };
            if let Some(entry) = SourceEntry::parse(key, value)? {
                out.push((key.clone(), entry));
            }
        }
        Ok(out)
    }

    /// Typed entry for `key` in the previous snapshot, if it parses.
    pub fn previous_entry(&self, key: &str) -> Option<SourceEntry> {
        let prev = self.prev.as_ref()?;
        SourceEntry::parse(key, prev.get(key)?).ok().flatten()
    }
}

/// What one sub-pipeline did in a tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    /// Snapshot keys whose work failed; retried on the next tick.
    pub failed_keys: BTreeSet<String>,
    /// Failed unit keys, set by pipelines that fan one key out to several units.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub failed_units: BTreeSet<String>,
    /// History files rewritten this tick.
    pub written: Vec<PathBuf>,
}

/// Shared construction inputs.
#[derive(Clone)]
pub struct PipelineDeps {
    pub analyst: SharedAnalyst,
    pub persister: ResultPersister,
    pub dispatcher: Dispatcher,
    pub policy: FailurePolicy,
}

#[async_trait]
pub trait SubPipeline: Send + Sync + 'static {
    /// Dispatch results handed whole to `persist`.
    type Output: Send + 'static;

    fn kind(&self) -> PipelineKind;

    /// Build and run work units for `stale` (never empty).
    async fn dispatch(&self, ctx: &TickContext, stale: &ChangeSet) -> anyhow::Result<Self::Output>;

    /// Merge dispatch results into the rolling history files.
    fn persist(&self, output: Self::Output) -> anyhow::Result<RunSummary>;
}
