//! Economic calendar: extract events from the scraped page, then analyse them.
//! Both stages run as one chained unit per pair.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PipelineDeps, RunSummary, SubPipeline, TickContext};
use crate::analysis::CalendarEvent;
use crate::change_detector::ChangeSet;
use crate::dispatch::{FailurePolicy, UnitOutcome, WorkUnit};
use crate::history::HistoryRecord;
use crate::sources::{CurrencyPair, PipelineKind, SourceEntry};

const ERROR_PREFIX: &str = "Error analyzing calendar";

/// History file per pair. The misspelling is what readers look for.
pub fn calendar_file(pair: &CurrencyPair) -> String {
    format!("{}_calender_analysis.json", pair.slug())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarAnalysis {
    pub pair: CurrencyPair,
    pub events: Vec<CalendarEvent>,
    pub analysis: String,
}

/// Result of one chained unit.
#[derive(Debug, Clone, PartialEq)]
pub enum CalendarResult {
    /// Extracted events match the latest record; nothing to analyse.
    Unchanged,
    Analyzed {
        events: Vec<CalendarEvent>,
        analysis: String,
    },
}

struct CalendarJob {
    pair: CurrencyPair,
    page: Value,
    last_events: Option<Vec<CalendarEvent>>,
}

pub struct CalendarOutput {
    records: Vec<CalendarAnalysis>,
    dispatched: usize,
    succeeded: usize,
    unchanged: usize,
    failed_keys: BTreeSet<String>,
}

pub struct CalendarPipeline {
    deps: PipelineDeps,
}

impl CalendarPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    fn unit(&self, key: String, job: Arc<CalendarJob>) -> WorkUnit<CalendarResult> {
        let extractor = self.deps.analyst.clone();
        let analyst = self.deps.analyst.clone();
        WorkUnit::chain(
            key,
            job,
            move |job: Arc<CalendarJob>| {
                let extractor = extractor.clone();
                async move { extractor.extract_calendar(&job.pair, &job.page).await }
            },
            move |job: Arc<CalendarJob>, events: Vec<CalendarEvent>| {
                let analyst = analyst.clone();
                async move {
                    if job.last_events.as_ref() == Some(&events) {
                        return Ok(CalendarResult::Unchanged);
                    }
                    let analysis = analyst.analyze_calendar(&job.pair, &events).await?;
                    Ok(CalendarResult::Analyzed { events, analysis })
                }
            },
        )
    }
}

#[async_trait]
impl SubPipeline for CalendarPipeline {
    type Output = CalendarOutput;

    fn kind(&self) -> PipelineKind {
        PipelineKind::Calendar
    }

    async fn dispatch(&self, ctx: &TickContext, stale: &ChangeSet) -> anyhow::Result<CalendarOutput> {
        let mut pairs = BTreeMap::new();
        let mut had_history = BTreeSet::new();
        let mut units = Vec::new();
        for (key, entry) in ctx.stale_entries(stale)? {
            let SourceEntry::Calendar { pair, page } = entry else {
                continue;
            };
            let last: Option<HistoryRecord<CalendarAnalysis>> = self
                .deps
                .persister
                .latest(&calendar_file(&pair))
                .with_context(|| format!("loading calendar history for {pair}"))?;
            if last.is_some() {
                had_history.insert(key.clone());
            }
            let job = Arc::new(CalendarJob {
                pair: pair.clone(),
                page,
                last_events: last.map(|r| r.body.events),
            });
            units.push(self.unit(key.clone(), job));
            pairs.insert(key, pair);
        }

        let dispatched = units.len();
        let results = self.deps.dispatcher.dispatch(units).await;
        let succeeded = results.success_count();
        let failed_keys = results.failed_keys();

        let mut records = Vec::new();
        let mut unchanged = 0;
        for (key, outcome) in results.iter() {
            let Some(pair) = pairs.get(key) else {
                continue;
            };
            match outcome {
                UnitOutcome::Success(CalendarResult::Unchanged) => unchanged += 1,
                UnitOutcome::Success(CalendarResult::Analyzed { events, analysis }) => {
                    records.push(CalendarAnalysis {
                        pair: pair.clone(),
                        events: events.clone(),
                        analysis: analysis.clone(),
                    })
                }
                // an error record only fills a gap, it never follows good history
                UnitOutcome::Failed(e)
                    if self.deps.policy == FailurePolicy::Placeholder && !had_history.contains(key) =>
                {
                    records.push(CalendarAnalysis {
                        pair: pair.clone(),
                        events: Vec::new(),
                        analysis: format!("{ERROR_PREFIX}: {e}"),
                    })
                }
                UnitOutcome::Failed(_) => {}
            }
        }

        Ok(CalendarOutput {
            records,
            dispatched,
            succeeded,
            unchanged,
            failed_keys,
        })
    }

    fn persist(&self, output: CalendarOutput) -> anyhow::Result<RunSummary> {
        if output.unchanged > 0 {
            tracing::info!(pipeline = "calendar", pairs = output.unchanged, "events unchanged, analysis skipped");
        }
        let mut written = Vec::new();
        for body in output.records {
            let file = calendar_file(&body.pair);
            let path = self
                .deps
                .persister
                .append(&file, HistoryRecord::now(body))
                .with_context(|| format!("writing {file}"))?;
            written.push(path);
        }
        Ok(RunSummary {
            dispatched: output.dispatched,
            succeeded: output.succeeded,
            failed_keys: output.failed_keys,
            written,
            ..Default::default()
        })
    }
}
