//! OpenAI-compatible chat-completions client implementing [`Analyst`].
//!
//! Every request carries its own connect/request timeout. HTTP status codes
//! are mapped onto the error taxonomy so the dispatcher's retry policy can
//! tell a rate limit from a bad request.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{structured_events, Analyst, ArticleSummary, CalendarEvent};
use crate::config::LlmConfig;
use crate::error::PipelineError;
use crate::sources::{ArticleRef, CurrencyPair};

pub struct LlmAnalyst {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl LlmAnalyst {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, PipelineError> {
        if cfg.api_key.trim().is_empty() {
            return Err(PipelineError::Config("analysis api key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("fx-refresh/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }

    async fn complete(&self, task: &str, input: &str) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: task,
                },
                Msg {
                    role: "user",
                    content: input,
                },
            ],
            temperature: self.temperature,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| PipelineError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body).into());
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| PipelineError::Rejected(format!("unreadable completion: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(PipelineError::Rejected("empty completion".into()).into());
        }
        Ok(content)
    }
}

fn classify_status(status: StatusCode, body: &str) -> PipelineError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            PipelineError::Transient(format!("{status}: {snippet}"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PipelineError::Config(format!("credentials rejected ({status})"))
        }
        s if s.is_server_error() => PipelineError::Transient(format!("{status}: {snippet}")),
        _ => PipelineError::Rejected(format!("{status}: {snippet}")),
    }
}

/// Pull a JSON array out of a completion that may wrap it in prose or fences.
fn json_array_in(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

#[async_trait]
impl Analyst for LlmAnalyst {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn summarize_article(
        &self,
        pair: &CurrencyPair,
        article: &ArticleRef,
    ) -> anyhow::Result<String> {
        let input = serde_json::to_string(article)?;
        self.complete(
            &format!("Summarize this news article for a {pair} trader."),
            &input,
        )
        .await
    }

    async fn synthesize_news(
        &self,
        pair: &CurrencyPair,
        summaries: &[ArticleSummary],
    ) -> anyhow::Result<String> {
        let input = summaries
            .iter()
            .map(|s| format!("- {} ({})", s.summary, s.url))
            .collect::<Vec<_>>()
            .join("\n");
        self.complete(
            &format!("Synthesize these article summaries into one {pair} news outlook."),
            &input,
        )
        .await
    }

    async fn assess_risk(&self, category: &str, data: &Value) -> anyhow::Result<String> {
        self.complete(
            &format!("Assess risk sentiment for the {category} asset category."),
            &data.to_string(),
        )
        .await
    }

    async fn extract_calendar(
        &self,
        pair: &CurrencyPair,
        page: &Value,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        if let Some(rows) = structured_events(page) {
            return Ok(rows);
        }
        let text = self
            .complete(
                &format!("Extract the economic calendar events relevant to {pair} as a JSON array."),
                &page.to_string(),
            )
            .await?;
        let raw = json_array_in(&text)
            .ok_or_else(|| PipelineError::Rejected("no JSON array in extraction".into()))?;
        let events = serde_json::from_str(raw)
            .map_err(|e| PipelineError::Rejected(format!("bad event rows: {e}")))
            .context("calendar extraction")?;
        Ok(events)
    }

    async fn analyze_calendar(
        &self,
        pair: &CurrencyPair,
        events: &[CalendarEvent],
    ) -> anyhow::Result<String> {
        let input = serde_json::to_string(events)?;
        self.complete(
            &format!("Analyze the impact of these calendar events on {pair}."),
            &input,
        )
        .await
    }

    async fn analyze_fundamentals(
        &self,
        subject: &str,
        indicators: &Value,
    ) -> anyhow::Result<String> {
        self.complete(
            &format!("Analyze the fundamental indicators for {subject}."),
            &indicators.to_string(),
        )
        .await
    }
}
