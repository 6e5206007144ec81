//! Risk sentiment: one assessment per changed asset category, folded into a
//! single rolling record that carries untouched categories forward.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PipelineDeps, RunSummary, SubPipeline, TickContext};
use crate::change_detector::ChangeSet;
use crate::dispatch::WorkUnit;
use crate::history::HistoryRecord;
use crate::sources::{PipelineKind, SourceEntry};

pub const RISK_FILE: &str = "risk_sentiment.json";
const ERROR_PREFIX: &str = "Error assessing risk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSentiment {
    /// category -> assessment text
    pub assessments: BTreeMap<String, String>,
    /// Categories refreshed in this record.
    pub updated: Vec<String>,
}

pub struct RiskOutput {
    record: Option<RiskSentiment>,
    dispatched: usize,
    succeeded: usize,
    failed_keys: BTreeSet<String>,
}

pub struct RiskPipeline {
    deps: PipelineDeps,
}

impl RiskPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl SubPipeline for RiskPipeline {
    type Output = RiskOutput;

    fn kind(&self) -> PipelineKind {
        PipelineKind::RiskSentiment
    }

    async fn dispatch(&self, ctx: &TickContext, stale: &ChangeSet) -> anyhow::Result<RiskOutput> {
        let previous: BTreeMap<String, String> = self
            .deps
            .persister
            .latest::<HistoryRecord<RiskSentiment>>(RISK_FILE)
            .context("loading risk history")?
            .map(|r| r.body.assessments)
            .unwrap_or_default();

        let mut categories = BTreeMap::new();
        let units: Vec<WorkUnit<String>> = ctx
            .stale_entries(stale)?
            .into_iter()
            .filter_map(|(key, entry)| match entry {
                SourceEntry::Risk { category, data } => Some((key, category, data)),
                _ => None,
            })
            .map(|(key, category, data)| {
                categories.insert(key.clone(), category.clone());
                let analyst = self.deps.analyst.clone();
                WorkUnit::new(key, (category, data), move |(category, data): (String, Value)| {
                    let analyst = analyst.clone();
                    async move { analyst.assess_risk(&category, &data).await }
                })
            })
            .collect();

        let dispatched = units.len();
        let results = self.deps.dispatcher.dispatch(units).await;
        let succeeded = results.success_count();
        let failed_keys = results.failed_keys();

        if succeeded == 0 {
            tracing::warn!(pipeline = "risk_sentiment", dispatched, "no category assessed");
            return Ok(RiskOutput {
                record: None,
                dispatched,
                succeeded,
                failed_keys,
            });
        }

        // a placeholder never replaces an earlier real assessment
        let resolved = results.resolve(self.deps.policy, |_, e| format!("{ERROR_PREFIX}: {e}"));
        let mut assessments = previous;
        let mut updated = Vec::new();
        for (key, text) in resolved {
            let Some(category) = categories.get(&key) else {
                continue;
            };
            let is_placeholder = failed_keys.contains(&key);
            if is_placeholder && assessments.contains_key(category) {
                continue;
            }
            assessments.insert(category.clone(), text);
            if !is_placeholder {
                updated.push(category.clone());
            }
        }

        Ok(RiskOutput {
            record: Some(RiskSentiment { assessments, updated }),
            dispatched,
            succeeded,
            failed_keys,
        })
    }

    fn persist(&self, output: RiskOutput) -> anyhow::Result<RunSummary> {
        let mut written = Vec::new();
        if let Some(body) = output.record {
            let path = self
                .deps
                .persister
                .append(RISK_FILE, HistoryRecord::now(body))
                .context("writing risk sentiment")?;
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
