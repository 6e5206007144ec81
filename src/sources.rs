//! Typed view over raw snapshot keys.
//!
//! Collectors write untyped JSON under conventional keys; every key is routed
//! to at most one sub-pipeline and parsed into a [`SourceEntry`] before any
//! work is built from it.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

pub const FLASH_NEWS_KEY: &str = "flash_news";
pub const FED_WATCH_KEY: &str = "fed_watch";

static RE_NEWS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]{3}/[A-Z]{3})_news(?:_websites)?$").unwrap());
static RE_CALENDAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]{3}/[A-Z]{3})_calendar$").unwrap());
static RE_FUNDAMENTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^fundamental\.([a-z]{3})\.(.+)$").unwrap());
static RE_RISK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^risk\.([A-Za-z0-9_\-]+)$").unwrap());

/// The four independent analysis chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    News,
    RiskSentiment,
    Calendar,
    Fundamentals,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::News,
        PipelineKind::RiskSentiment,
        PipelineKind::Calendar,
        PipelineKind::Fundamentals,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::News => "news",
            PipelineKind::RiskSentiment => "risk_sentiment",
            PipelineKind::Calendar => "calendar",
            PipelineKind::Fundamentals => "fundamentals",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `EUR/USD` style pair, always upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    pub fn involves(&self, currency: &str) -> bool {
        self.base.eq_ignore_ascii_case(currency) || self.quote.eq_ignore_ascii_case(currency)
    }

    /// File-name form: `EUR/USD` -> `eur_usd`.
    pub fn slug(&self) -> String {
        format!("{}_{}", self.base, self.quote).to_ascii_lowercase()
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("currency pair must look like EUR/USD, got {s:?}"))?;
        let ok = |c: &str| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic());
        if !ok(base) || !ok(quote) {
            return Err(format!("currency pair must look like EUR/USD, got {s:?}"));
        }
        Ok(Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        })
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(p: CurrencyPair) -> Self {
        p.to_string()
    }
}

/// An article reference as scraped: a bare URL or an object with extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArticleRef {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
}

impl ArticleRef {
    pub fn url(&self) -> &str {
        match self {
            ArticleRef::Url(u) => u,
            ArticleRef::Detailed { url, .. } => url,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            ArticleRef::Url(_) => None,
            ArticleRef::Detailed { title, .. } => title.as_deref(),
        }
    }
}

/// One interleaved "flash" headline. `id` may carry an update suffix
/// (`ecb-rate#2`); records sharing the part before `#` are the same story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashItem {
    pub id: String,
    pub headline: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Typed record per logical source, one variant per sub-pipeline data shape.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEntry {
    News {
        pair: CurrencyPair,
        articles: Vec<ArticleRef>,
    },
    FlashNews(Vec<FlashItem>),
    Risk {
        category: String,
        data: Value,
    },
    Calendar {
        pair: CurrencyPair,
        page: Value,
    },
    Fundamental {
        currency: String,
        indicator: String,
        values: Value,
    },
    FedWatch(Value),
}

impl SourceEntry {
    /// Parse a raw snapshot entry. `Ok(None)` for keys no pipeline owns.
    pub fn parse(key: &str, value: &Value) -> Result<Option<SourceEntry>, PipelineError> {
        let bad = |reason: String| PipelineError::Payload {
            key: key.to_string(),
            reason,
        };

        if let Some(c) = RE_NEWS.captures(key) {
            let pair = c[1].parse().map_err(bad)?;
            let articles: Vec<ArticleRef> =
                serde_json::from_value(value.clone()).map_err(|e| bad(e.to_string()))?;
            return Ok(Some(SourceEntry::News { pair, articles }));
        }
        if key == FLASH_NEWS_KEY {
            let items: Vec<FlashItem> =
                serde_json::from_value(value.clone()).map_err(|e| bad(e.to_string()))?;
            return Ok(Some(SourceEntry::FlashNews(items)));
        }
        if let Some(c) = RE_CALENDAR.captures(key) {
            let pair = c[1].parse().map_err(bad)?;
            return Ok(Some(SourceEntry::Calendar {
                pair,
                page: value.clone(),
            }));
        }
        if let Some(c) = RE_FUNDAMENTAL.captures(key) {
            return Ok(Some(SourceEntry::Fundamental {
                currency: c[1].to_ascii_uppercase(),
                indicator: c[2].to_string(),
                values: value.clone(),
            }));
        }
        if key == FED_WATCH_KEY {
            return Ok(Some(SourceEntry::FedWatch(value.clone())));
        }
        if let Some(c) = RE_RISK.captures(key) {
            return Ok(Some(SourceEntry::Risk {
                category: c[1].to_string(),
                data: value.clone(),
            }));
        }
        Ok(None)
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            SourceEntry::News { .. } | SourceEntry::FlashNews(_) => PipelineKind::News,
            SourceEntry::Risk { .. } => PipelineKind::RiskSentiment,
            SourceEntry::Calendar { .. } => PipelineKind::Calendar,
            SourceEntry::Fundamental { .. } | SourceEntry::FedWatch(_) => {
                PipelineKind::Fundamentals
            }
        }
    }
}

/// Which sub-pipeline owns `key`, judged by name only.
pub fn route_key(key: &str) -> Option<PipelineKind> {
    if RE_NEWS.is_match(key) || key == FLASH_NEWS_KEY {
        Some(PipelineKind::News)
    } else if RE_CALENDAR.is_match(key) {
        Some(PipelineKind::Calendar)
    } else if RE_FUNDAMENTAL.is_match(key) || key == FED_WATCH_KEY {
        Some(PipelineKind::Fundamentals)
    } else if RE_RISK.is_match(key) {
        Some(PipelineKind::RiskSentiment)
    } else {
        None
    }
}
