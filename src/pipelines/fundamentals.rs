//! Fundamentals: a configured pair is re-analysed when any indicator of its
//! base or quote currency changed. FedWatch probabilities get their own unit.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{PipelineDeps, RunSummary, SubPipeline, TickContext};
use crate::change_detector::ChangeSet;
use crate::dispatch::{FailurePolicy, UnitOutcome, WorkUnit};
use crate::history::HistoryRecord;
use crate::sources::{CurrencyPair, PipelineKind, SourceEntry, FED_WATCH_KEY};

pub const FEDWATCH_FILE: &str = "fedwatch/analysis.json";
const ERROR_PREFIX: &str = "Error analyzing fundamentals";

pub fn analysis_file(pair: &CurrencyPair) -> String {
    format!("{}_analysis.json", pair.slug())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalAnalysis {
    pub pair: CurrencyPair,
    /// Indicator keys that triggered this run.
    pub changed: Vec<String>,
    pub analysis: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedWatchAnalysis {
    pub probabilities: Value,
    pub analysis: String,
}

pub struct FundamentalsOutput {
    pairs: Vec<FundamentalAnalysis>,
    fed_watch: Option<FedWatchAnalysis>,
    dispatched: usize,
    succeeded: usize,
    failed_keys: BTreeSet<String>,
    failed_units: BTreeSet<String>,
}

pub struct FundamentalsPipeline {
    deps: PipelineDeps,
    pairs: Vec<CurrencyPair>,
}

/// Every current indicator of `pair`'s two currencies, keyed as in the snapshot.
fn indicators_for(ctx: &TickContext, pair: &CurrencyPair) -> Value {
    let mut out = Map::new();
    for (key, value) in &ctx.curr.data {
        if let Ok(Some(SourceEntry::Fundamental { currency, .. })) = SourceEntry::parse(key, value) {
            if pair.involves(&currency) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

impl FundamentalsPipeline {
    pub fn new(deps: PipelineDeps, pairs: Vec<CurrencyPair>) -> Self {
        Self { deps, pairs }
    }

    fn has_history(&self, file: &str) -> anyhow::Result<bool> {
        Ok(self
            .deps
            .persister
            .latest::<Value>(file)
            .with_context(|| format!("loading {file}"))?
            .is_some())
    }

    fn unit(&self, key: String, subject: String, payload: Value) -> WorkUnit<String> {
        let analyst = self.deps.analyst.clone();
        WorkUnit::new(key, (subject, payload), move |(subject, payload): (String, Value)| {
            let analyst = analyst.clone();
            async move { analyst.analyze_fundamentals(&subject, &payload).await }
        })
    }
}

#[async_trait]
impl SubPipeline for FundamentalsPipeline {
    type Output = FundamentalsOutput;

    fn kind(&self) -> PipelineKind {
        PipelineKind::Fundamentals
    }

    async fn dispatch(&self, ctx: &TickContext, stale: &ChangeSet) -> anyhow::Result<FundamentalsOutput> {
        // currency -> changed indicator keys
        let mut changed: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut fed_watch = None;
        for (key, entry) in ctx.stale_entries(stale)? {
            match entry {
                SourceEntry::Fundamental { currency, .. } => {
                    changed.entry(currency).or_default().push(key)
                }
                SourceEntry::FedWatch(v) => fed_watch = Some(v),
                _ => {}
            }
        }

        let mut units = Vec::new();
        let mut triggers: BTreeMap<String, (CurrencyPair, Vec<String>)> = BTreeMap::new();
        for pair in &self.pairs {
            let unit_key = pair.to_string();
            // a key queued for retry only re-runs the pairs that failed on it
            let keys: Vec<String> = changed
                .iter()
                .filter(|(ccy, _)| pair.involves(ccy))
                .flat_map(|(_, keys)| keys.iter())
                .filter(|key| ctx.retry.allows(key, &unit_key))
                .cloned()
                .collect();
            if keys.is_empty() {
                continue;
            }
            units.push(self.unit(unit_key.clone(), unit_key.clone(), indicators_for(ctx, pair)));
            triggers.insert(unit_key, (pair.clone(), keys));
        }
        for ccy in changed.keys() {
            if !self.pairs.iter().any(|p| p.involves(ccy)) {
                tracing::debug!(pipeline = "fundamentals", currency = %ccy, "no configured pair for currency");
            }
        }
        if !ctx.retry.allows(FED_WATCH_KEY, FED_WATCH_KEY) {
            fed_watch = None;
        }
        if let Some(v) = &fed_watch {
            units.push(self.unit(FED_WATCH_KEY.to_string(), FED_WATCH_KEY.to_string(), v.clone()));
        }

        let dispatched = units.len();
        let results = self.deps.dispatcher.dispatch(units).await;
        let succeeded = results.success_count();

        let mut failed_keys = BTreeSet::new();
        let failed_units = results.failed_keys();
        let mut pairs = Vec::new();
        let mut fed = None;
        for (key, outcome) in results.iter() {
            let analysis = match outcome {
                UnitOutcome::Success(text) => text.clone(),
                UnitOutcome::Failed(e) => {
                    match triggers.get(key) {
                        Some((_, keys)) => failed_keys.extend(keys.iter().cloned()),
                        None => {
                            failed_keys.insert(key.clone());
                        }
                    }
                    let file = match triggers.get(key) {
                        Some((pair, _)) => analysis_file(pair),
                        None => FEDWATCH_FILE.to_string(),
                    };
                    if self.deps.policy == FailurePolicy::Drop || self.has_history(&file)? {
                        continue;
                    }
                    format!("{ERROR_PREFIX}: {e}")
                }
            };
            if key == FED_WATCH_KEY {
                fed = fed_watch.clone().map(|probabilities| FedWatchAnalysis {
                    probabilities,
                    analysis,
                });
            } else if let Some((pair, keys)) = triggers.get(key) {
                pairs.push(FundamentalAnalysis {
                    pair: pair.clone(),
                    changed: keys.clone(),
                    analysis,
                });
            }
        }

        Ok(FundamentalsOutput {
            pairs,
            fed_watch: fed,
            dispatched,
            succeeded,
            failed_keys,
            failed_units,
        })
    }

    fn persist(&self, output: FundamentalsOutput) -> anyhow::Result<RunSummary> {
        let mut written = Vec::new();
        for body in output.pairs {
            let file = analysis_file(&body.pair);
            let path = self
                .deps
                .persister
                .append(&file, HistoryRecord::now(body))
                .with_context(|| format!("writing {file}"))?;
            written.push(path);
        }
        if let Some(body) = output.fed_watch {
            let path = self
                .deps
                .persister
                .append(FEDWATCH_FILE, HistoryRecord::now(body))
                .context("writing fedwatch analysis")?;
            written.push(path);
        }
        Ok(RunSummary {
            dispatched: output.dispatched,
            succeeded: output.succeeded,
            failed_keys: output.failed_keys,
            failed_units: output.failed_units,
            written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use serde_json::json;

    #[test]
    fn pair_sees_indicators_of_both_currencies_only() {
        let data = [
            ("fundamental.eur.CPI", json!(2.1)),
            ("fundamental.usd.NFP", json!(150)),
            ("fundamental.jpy.CPI", json!(3.0)),
            ("risk.equities", json!({})),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let ctx = TickContext::new(Snapshot::now(data), None);
        let pair: CurrencyPair = "EUR/USD".parse().unwrap();
        let v = indicators_for(&ctx, &pair);
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["fundamental.eur.CPI", "fundamental.usd.NFP"]);
    }
}
