// tests/common/mod.rs
//
// Shared fixtures: a scripted Analyst that records every call and can be told
// to fail or panic on specific inputs, plus config/snapshot helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use fx_refresh::analysis::{structured_events, ArticleSummary, CalendarEvent};
use fx_refresh::config::AppConfig;
use fx_refresh::retry::RetryPolicy;
use fx_refresh::sources::{ArticleRef, CurrencyPair};
use fx_refresh::{Analyst, PipelineError, Snapshot, SnapshotStore};

#[derive(Default)]
pub struct ScriptedAnalyst {
    /// One entry per call: "summarize:<url>", "risk:<category>", ...
    pub calls: Mutex<Vec<String>>,
    pub fail: Mutex<HashSet<String>>,
    pub panic_on: Mutex<HashSet<String>>,
}

impl ScriptedAnalyst {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the call tagged `tag` fail (non-retryable) until `heal` is called.
    pub fn fail_on(&self, tag: &str) {
        self.fail.lock().unwrap().insert(tag.to_string());
    }

    pub fn heal(&self, tag: &str) {
        self.fail.lock().unwrap().remove(tag);
    }

    pub fn panic_on(&self, tag: &str) {
        self.panic_on.lock().unwrap().insert(tag.to_string());
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, tag: String) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(tag.clone());
        if self.panic_on.lock().unwrap().contains(&tag) {
            panic!("scripted panic for {tag}");
        }
        if self.fail.lock().unwrap().contains(&tag) {
            return Err(PipelineError::Rejected(format!("scripted failure for {tag}")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Analyst for ScriptedAnalyst {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn summarize_article(&self, _pair: &CurrencyPair, article: &ArticleRef) -> anyhow::Result<String> {
        self.record(format!("summarize:{}", article.url()))?;
        Ok(format!("summary of {}", article.url()))
    }

    async fn synthesize_news(&self, pair: &CurrencyPair, summaries: &[ArticleSummary]) -> anyhow::Result<String> {
        self.record(format!("synthesize:{pair}"))?;
        Ok(format!("{pair} outlook from {} articles", summaries.len()))
    }

    async fn assess_risk(&self, category: &str, data: &Value) -> anyhow::Result<String> {
        self.record(format!("risk:{category}"))?;
        Ok(format!("{category} risk given {data}"))
    }

    async fn extract_calendar(&self, pair: &CurrencyPair, page: &Value) -> anyhow::Result<Vec<CalendarEvent>> {
        self.record(format!("extract:{pair}"))?;
        structured_events(page).ok_or_else(|| PipelineError::Rejected("unstructured page".into()).into())
    }

    async fn analyze_calendar(&self, pair: &CurrencyPair, events: &[CalendarEvent]) -> anyhow::Result<String> {
        self.record(format!("calendar:{pair}"))?;
        Ok(format!("{pair}: {} events", events.len()))
    }

    async fn analyze_fundamentals(&self, subject: &str, indicators: &Value) -> anyhow::Result<String> {
        self.record(format!("fundamentals:{subject}"))?;
        let n = indicators.as_object().map(|m| m.len()).unwrap_or(1);
        Ok(format!("{subject}: {n} indicators"))
    }
}

/// Config rooted at `dir`, no retries, EUR/USD and USD/JPY.
pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        data_dir: dir.to_path_buf(),
        retry: RetryPolicy::none(),
        pairs: vec!["EUR/USD".parse().unwrap(), "USD/JPY".parse().unwrap()],
        ..AppConfig::default()
    }
}

pub fn ts(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap() + Duration::minutes(minute)
}

/// Append `data` (a JSON object) as the snapshot taken at `minute`.
pub fn push_snapshot(cfg: &AppConfig, minute: i64, data: Value) {
    let map: BTreeMap<String, Value> = serde_json::from_value(data).unwrap();
    SnapshotStore::new(cfg.snapshot_path(), cfg.snapshot_limit)
        .append(Snapshot::new(ts(minute), map))
        .unwrap();
}

pub fn read_history(cfg: &AppConfig, file: &str) -> Vec<Value> {
    let p = cfg.history_dir().join(file);
    match std::fs::read_to_string(&p) {
        Ok(t) => serde_json::from_str(&t).unwrap(),
        Err(_) => Vec::new(),
    }
}
