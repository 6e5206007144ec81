//! Analysis port: the external summarisation / analysis endpoints every
//! sub-pipeline calls. Prompt wording lives behind the implementation.

pub mod llm;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::sources::{ArticleRef, CurrencyPair};

pub use llm::LlmAnalyst;

/// One summarised article as stored in the news history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub summary: String,
}

impl ArticleSummary {
    pub const ERROR_PREFIX: &'static str = "Error summarizing";

    pub fn placeholder(article: &ArticleRef, error: &str) -> Self {
        Self {
            url: article.url().to_string(),
            title: article.title().map(str::to_string),
            summary: format!("{}: {error}", Self::ERROR_PREFIX),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.summary.starts_with(Self::ERROR_PREFIX)
    }
}

/// One economic-calendar row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    #[serde(alias = "event", alias = "name")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

#[async_trait]
pub trait Analyst: Send + Sync {
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;

    async fn summarize_article(
        &self,
        pair: &CurrencyPair,
        article: &ArticleRef,
    ) -> anyhow::Result<String>;

    /// Synthesis over the concatenation of a pair's article summaries.
    async fn synthesize_news(
        &self,
        pair: &CurrencyPair,
        summaries: &[ArticleSummary],
    ) -> anyhow::Result<String>;

    async fn assess_risk(&self, category: &str, data: &Value) -> anyhow::Result<String>;

    async fn extract_calendar(
        &self,
        pair: &CurrencyPair,
        page: &Value,
    ) -> anyhow::Result<Vec<CalendarEvent>>;

    async fn analyze_calendar(
        &self,
        pair: &CurrencyPair,
        events: &[CalendarEvent],
    ) -> anyhow::Result<String>;

    /// `subject` is a pair (`EUR/USD`) or `fed_watch`.
    async fn analyze_fundamentals(&self, subject: &str, indicators: &Value)
        -> anyhow::Result<String>;
}

pub type SharedAnalyst = Arc<dyn Analyst>;

/// Used when analysis is switched off in config: every call fails fast with a
/// non-retryable config error, so nothing gets persisted.
pub struct DisabledAnalyst;

impl DisabledAnalyst {
    fn off() -> anyhow::Error {
        PipelineError::Config("analysis endpoint disabled".into()).into()
    }
}

#[async_trait]
impl Analyst for DisabledAnalyst {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn summarize_article(&self, _: &CurrencyPair, _: &ArticleRef) -> anyhow::Result<String> {
        Err(Self::off())
    }

    async fn synthesize_news(
        &self,
        _: &CurrencyPair,
        _: &[ArticleSummary],
    ) -> anyhow::Result<String> {
        Err(Self::off())
    }

    async fn assess_risk(&self, _: &str, _: &Value) -> anyhow::Result<String> {
        Err(Self::off())
    }

    async fn extract_calendar(
        &self,
        _: &CurrencyPair,
        page: &Value,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        structured_events(page).ok_or_else(Self::off)
    }

    async fn analyze_calendar(&self, _: &CurrencyPair, _: &[CalendarEvent]) -> anyhow::Result<String> {
        Err(Self::off())
    }

    async fn analyze_fundamentals(&self, _: &str, _: &Value) -> anyhow::Result<String> {
        Err(Self::off())
    }
}

/// Calendar pages that collectors already delivered as rows need no model call.
pub fn structured_events(page: &Value) -> Option<Vec<CalendarEvent>> {
    let rows = match page {
        Value::Array(_) => page,
        Value::Object(m) => m.get("events")?,
        _ => return None,
    };
    serde_json::from_value(rows.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_rows_parse_with_aliases() {
        let page = json!({"events": [
            {"event": "CPI y/y", "currency": "USD", "forecast": "3.1%"},
            {"title": "ECB rate", "impact": "high"}
        ]});
        let ev = structured_events(&page).unwrap();
        assert_eq!(ev.len(), 2);
        assert_eq!(ev[0].title, "CPI y/y");
        assert_eq!(ev[1].impact.as_deref(), Some("high"));
        assert!(structured_events(&json!("<html>")).is_none());
    }

    #[test]
    fn placeholder_is_recognisable() {
        let a = ArticleRef::Url("https://x".into());
        let s = ArticleSummary::placeholder(&a, "timeout");
        assert!(s.is_placeholder());
        assert_eq!(s.summary, "Error summarizing: timeout");
    }
}
