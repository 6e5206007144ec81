//! One tick: load the retained snapshots, then drive the four sub-pipelines
//! independently through detect -> dispatch -> persist.
//!
//! Each sub-pipeline diffs the latest snapshot against the one it last
//! completed, so snapshots appended between ticks are never skipped.
//!
//! Each sub-pipeline runs on its own task. An error or panic in one is logged,
//! recorded in the state file and reported, but never stops the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};

use crate::analysis::SharedAnalyst;
use crate::change_detector::{self, ChangeSet};
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::history::ResultPersister;
use crate::pipelines::{
    CalendarPipeline, FundamentalsPipeline, NewsPipeline, PipelineDeps, RetryScope, RiskPipeline,
    RunSummary, SubPipeline, TickContext,
};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::sources::PipelineKind;
use crate::state::{Phase, StateStore, SubPipelineState};

/// Result of one sub-pipeline in one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Nothing in the snapshot store yet.
    NoSnapshot,
    /// Empty stale set; nothing dispatched, nothing written.
    NoUpdate,
    Updated(RunSummary),
    Failed { error: String },
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::NoSnapshot => "no_snapshot",
            PipelineOutcome::NoUpdate => "no_change",
            PipelineOutcome::Updated(s) if s.failed_keys.is_empty() => "updated",
            PipelineOutcome::Updated(_) => "partial",
            PipelineOutcome::Failed { .. } => "failed",
        }
    }

    /// Units dispatched for this outcome.
    pub fn dispatched(&self) -> usize {
        match self {
            PipelineOutcome::Updated(s) => s.dispatched,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Timestamp of the snapshot this tick processed.
    pub snapshot: Option<DateTime<Utc>>,
    pub pipelines: BTreeMap<PipelineKind, PipelineOutcome>,
}

impl TickReport {
    pub fn dispatched(&self) -> usize {
        self.pipelines.values().map(PipelineOutcome::dispatched).sum()
    }
}

pub struct PipelineOrchestrator {
    snapshots: SnapshotStore,
    state: Arc<StateStore>,
    news: Arc<NewsPipeline>,
    risk: Arc<RiskPipeline>,
    calendar: Arc<CalendarPipeline>,
    fundamentals: Arc<FundamentalsPipeline>,
}

impl PipelineOrchestrator {
    pub fn new(cfg: &AppConfig, analyst: SharedAnalyst) -> anyhow::Result<Self> {
        let state = StateStore::open(cfg.state_path()).context("opening pipeline state")?;
        let persister = ResultPersister::new(cfg.history_dir(), cfg.history_limit);
        let dispatcher = Dispatcher::new(cfg.retry, cfg.concurrency);
        let deps = |kind: PipelineKind| PipelineDeps {
            analyst: analyst.clone(),
            persister: persister.clone(),
            dispatcher: dispatcher.labeled(kind.as_str()),
            policy: cfg.failure_policy.for_kind(kind),
        };

        tracing::info!(
            data_dir = %cfg.data_dir.display(),
            analyst = analyst.name(),
            pairs = cfg.pairs.len(),
            "pipeline orchestrator ready"
        );

        Ok(Self {
            snapshots: SnapshotStore::new(cfg.snapshot_path(), cfg.snapshot_limit),
            state: Arc::new(state),
            news: Arc::new(NewsPipeline::new(deps(PipelineKind::News), cfg.flash_limit)),
            risk: Arc::new(RiskPipeline::new(deps(PipelineKind::RiskSentiment))),
            calendar: Arc::new(CalendarPipeline::new(deps(PipelineKind::Calendar))),
            fundamentals: Arc::new(FundamentalsPipeline::new(
                deps(PipelineKind::Fundamentals),
                cfg.pairs.clone(),
            )),
        })
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Run one tick. Only a broken snapshot store fails the whole tick.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        counter!("pipeline_ticks_total").increment(1);
        gauge!("pipeline_last_tick_ts").set(Utc::now().timestamp() as f64);

        let history: Arc<Vec<Arc<Snapshot>>> = Arc::new(
            self.snapshots
                .load()
                .context("loading snapshots")?
                .into_iter()
                .map(Arc::new)
                .collect(),
        );
        let Some(curr) = history.last() else {
            tracing::info!(path = %self.snapshots.path().display(), "no snapshot yet, nothing to do");
            return Ok(TickReport {
                snapshot: None,
                pipelines: PipelineKind::ALL
                    .iter()
                    .map(|k| (*k, PipelineOutcome::NoSnapshot))
                    .collect(),
            });
        };
        let snapshot = Some(curr.timestamp);

        let handles = vec![
            (
                PipelineKind::News,
                tokio::spawn(drive(self.news.clone(), history.clone(), self.state.clone())),
            ),
            (
                PipelineKind::RiskSentiment,
                tokio::spawn(drive(self.risk.clone(), history.clone(), self.state.clone())),
            ),
            (
                PipelineKind::Calendar,
                tokio::spawn(drive(self.calendar.clone(), history.clone(), self.state.clone())),
            ),
            (
                PipelineKind::Fundamentals,
                tokio::spawn(drive(self.fundamentals.clone(), history.clone(), self.state.clone())),
            ),
        ];

        let mut pipelines = BTreeMap::new();
        for (kind, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join) => {
                    let error = format!("sub-pipeline aborted: {join}");
                    tracing::error!(pipeline = %kind, %error, "sub-pipeline panicked");
                    counter!("pipeline_failures_total", "pipeline" => kind.as_str()).increment(1);
                    if let Err(e) = self
                        .state
                        .update(kind, |st| finish(st, "failed"))
                        .await
                    {
                        tracing::error!(pipeline = %kind, error = %e, "could not record failure");
                    }
                    PipelineOutcome::Failed { error }
                }
            };
            pipelines.insert(kind, outcome);
        }

        let report = TickReport { snapshot, pipelines };
        tracing::info!(
            snapshot = ?report.snapshot,
            dispatched = report.dispatched(),
            outcomes = ?report.pipelines.iter().map(|(k, o)| (k.as_str(), o.label())).collect::<Vec<_>>(),
            "tick finished"
        );
        Ok(report)
    }
}

fn finish(st: &mut SubPipelineState, outcome: &str) {
    st.phase = Phase::Idle;
    st.last_run = Some(Utc::now());
    st.last_outcome = Some(outcome.to_string());
}

/// This tick as `kind` sees it: its context against its own baseline, and the
/// keys to work on. `None` only when the store is empty.
fn detect(
    history: &[Arc<Snapshot>],
    st: &SubPipelineState,
    kind: PipelineKind,
) -> Option<(TickContext, ChangeSet)> {
    let curr = history.last()?;
    let prev = st.baseline(history);
    if prev.is_none() && st.processed_snapshot.is_some() {
        tracing::warn!(
            pipeline = %kind,
            processed = ?st.processed_snapshot,
            "last processed snapshot no longer retained, diffing from scratch"
        );
    }
    let changed = if st.has_processed(curr) {
        ChangeSet::new()
    } else {
        change_detector::diff_scoped(prev.as_deref(), curr, kind)
    };
    let queued: ChangeSet = st
        .pending_retry
        .iter()
        .filter(|k| curr.get(k).is_some() && !changed.contains(*k))
        .cloned()
        .collect();

    let mut stale = changed;
    stale.extend(queued.iter().cloned());
    let ctx = TickContext::shared(curr.clone(), prev).with_retry(RetryScope {
        keys: queued,
        units: st.pending_units.clone(),
    });
    Some((ctx, stale))
}

/// Drive one sub-pipeline through its phases, recording each in the state file.
async fn drive<P: SubPipeline>(
    pipeline: Arc<P>,
    history: Arc<Vec<Arc<Snapshot>>>,
    state: Arc<StateStore>,
) -> PipelineOutcome {
    let kind = pipeline.kind();
    match run_phases(pipeline.as_ref(), &history, &state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let error = format!("{e:#}");
            tracing::error!(pipeline = %kind, %error, "sub-pipeline failed");
            counter!("pipeline_failures_total", "pipeline" => kind.as_str()).increment(1);
            let detected = detect(&history, &state.get(kind).await, kind);
            let recorded = state
                .update(kind, |st| {
                    // the whole stale set is retried next tick, against this snapshot
                    if let Some((ctx, stale)) = detected {
                        st.processed_snapshot = Some(ctx.curr.timestamp);
                        st.snapshot_digest = Some(ctx.curr.digest());
                        st.pending_retry = stale;
                        st.pending_units.clear();
                    }
                    finish(st, "failed");
                })
                .await;
            if let Err(e) = recorded {
                tracing::error!(pipeline = %kind, error = %e, "could not record failure");
            }
            PipelineOutcome::Failed { error }
        }
    }
}

async fn run_phases<P: SubPipeline>(
    pipeline: &P,
    history: &[Arc<Snapshot>],
    state: &StateStore,
) -> anyhow::Result<PipelineOutcome> {
    let kind = pipeline.kind();
    state.enter(kind, Phase::Detecting).await?;
    let st = state.get(kind).await;
    let (ctx, stale) = detect(history, &st, kind).context("snapshot store is empty")?;
    let digest = ctx.curr.digest();

    if stale.is_empty() {
        state.enter(kind, Phase::NoChange).await?;
        state
            .update(kind, |st| {
                st.processed_snapshot = Some(ctx.curr.timestamp);
                st.snapshot_digest = Some(digest);
                st.pending_retry.clear();
                st.pending_units.clear();
                finish(st, "no_change");
            })
            .await?;
        counter!("pipeline_noop_total", "pipeline" => kind.as_str()).increment(1);
        tracing::debug!(pipeline = %kind, "no stale keys");
        return Ok(PipelineOutcome::NoUpdate);
    }

    tracing::info!(
        pipeline = %kind,
        stale = stale.len(),
        retries = ctx.retry.keys.len(),
        baseline = ?ctx.prev.as_ref().map(|p| p.timestamp),
        "dispatching"
    );
    state.enter(kind, Phase::Dispatching).await?;
    let output = pipeline.dispatch(&ctx, &stale).await?;

    state.enter(kind, Phase::Persisting).await?;
    let summary = pipeline.persist(output)?;

    let outcome = PipelineOutcome::Updated(summary.clone());
    let label = outcome.label();
    state
        .update(kind, |st| {
            st.processed_snapshot = Some(ctx.curr.timestamp);
            st.snapshot_digest = Some(digest);
            st.pending_retry = summary.failed_keys.clone();
            st.pending_units = summary.failed_units.clone();
            finish(st, label);
        })
        .await?;
    tracing::info!(
        pipeline = %kind,
        dispatched = summary.dispatched,
        ok = summary.succeeded,
        failed = summary.failed_keys.len(),
        written = summary.written.len(),
        "sub-pipeline updated"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn snap(minute: u32, pairs: &[(&str, serde_json::Value)]) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        ))
    }

    fn processed(s: &Snapshot) -> SubPipelineState {
        SubPipelineState {
            processed_snapshot: Some(s.timestamp),
            snapshot_digest: Some(s.digest()),
            ..Default::default()
        }
    }

    #[test]
    fn processed_snapshot_only_retries_pending_keys_still_present() {
        let history = vec![
            snap(0, &[("risk.fx", json!(1))]),
            snap(30, &[("risk.fx", json!(2)), ("risk.bonds", json!(3))]),
        ];
        let st = SubPipelineState {
            pending_retry: ["risk.bonds".to_string(), "risk.gone".to_string()].into(),
            ..processed(&history[1])
        };
        let (ctx, stale) = detect(&history, &st, PipelineKind::RiskSentiment).unwrap();
        assert_eq!(stale.into_iter().collect::<Vec<_>>(), vec!["risk.bonds"]);
        assert_eq!(ctx.retry.keys.iter().collect::<Vec<_>>(), vec!["risk.bonds"]);
    }

    #[test]
    fn diff_runs_against_the_last_processed_snapshot() {
        let history = vec![
            snap(0, &[("risk.fx", json!(1)), ("risk.bonds", json!(3))]),
            snap(30, &[("risk.fx", json!(2)), ("risk.bonds", json!(3))]),
            snap(59, &[("risk.fx", json!(2)), ("risk.bonds", json!(3))]),
        ];
        // latest two are equal, but the fx move since the baseline still counts
        let (ctx, stale) = detect(&history, &processed(&history[0]), PipelineKind::RiskSentiment).unwrap();
        assert_eq!(stale.into_iter().collect::<Vec<_>>(), vec!["risk.fx"]);
        assert_eq!(ctx.prev.as_ref().map(|p| p.timestamp), Some(history[0].timestamp));
        assert!(ctx.retry.keys.is_empty());
    }

    #[test]
    fn never_run_or_evicted_baseline_is_a_cold_start() {
        let gone = snap(0, &[("risk.fx", json!(0))]);
        let history = vec![
            snap(30, &[("risk.fx", json!(2)), ("risk.bonds", json!(3))]),
            snap(59, &[("risk.fx", json!(2)), ("risk.bonds", json!(3))]),
        ];
        for st in [SubPipelineState::default(), processed(&gone)] {
            let (ctx, stale) = detect(&history, &st, PipelineKind::RiskSentiment).unwrap();
            assert!(ctx.prev.is_none());
            assert_eq!(stale.len(), 2);
        }
        assert!(detect(&[], &SubPipelineState::default(), PipelineKind::Calendar).is_none());
    }

    #[test]
    fn changed_pending_key_is_not_treated_as_a_retry() {
        let history = vec![
            snap(0, &[("fundamental.usd.NFP", json!(150))]),
            snap(30, &[("fundamental.usd.NFP", json!(175))]),
        ];
        let st = SubPipelineState {
            pending_retry: ["fundamental.usd.NFP".to_string()].into(),
            pending_units: ["USD/JPY".to_string()].into(),
            ..processed(&history[0])
        };
        let (ctx, stale) = detect(&history, &st, PipelineKind::Fundamentals).unwrap();
        assert_eq!(stale.len(), 1);
        assert!(ctx.retry.keys.is_empty());
        assert!(ctx.retry.allows("fundamental.usd.NFP", "EUR/USD"));
    }
}
