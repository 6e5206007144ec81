//! News: per-article summaries, then one synthesis per pair over the
//! concatenated summaries. The flash feed is appended as-is.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{PipelineDeps, RunSummary, SubPipeline, TickContext};
use crate::analysis::ArticleSummary;
use crate::change_detector::ChangeSet;
use crate::dispatch::{FailurePolicy, UnitOutcome, WorkUnit};
use crate::history::HistoryRecord;
use crate::sources::{ArticleRef, CurrencyPair, FlashItem, PipelineKind, SourceEntry, FLASH_NEWS_KEY};

pub const FLASH_FILE: &str = "flash_news.json";

pub fn synthesis_file(pair: &CurrencyPair) -> String {
    format!("{}_news_synthesis.json", pair.slug())
}

/// Persisted per-pair record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsSynthesis {
    pub pair: CurrencyPair,
    pub articles: Vec<ArticleSummary>,
    pub synthesis: String,
}

/// One pair's worth of stale input.
#[derive(Debug, Clone)]
struct PairArticles {
    keys: BTreeSet<String>,
    pair: CurrencyPair,
    articles: Vec<ArticleRef>,
}

pub struct NewsOutput {
    records: Vec<(CurrencyPair, NewsSynthesis)>,
    flash: Vec<FlashItem>,
    dispatched: usize,
    succeeded: usize,
    failed_keys: BTreeSet<String>,
}

pub struct NewsPipeline {
    deps: PipelineDeps,
    flash_limit: usize,
}

impl NewsPipeline {
    pub fn new(deps: PipelineDeps, flash_limit: usize) -> Self {
        Self {
            deps,
            flash_limit: flash_limit.max(1),
        }
    }

    /// Real summaries from the pair's latest record, by URL.
    fn cached_summaries(&self, pair: &CurrencyPair) -> anyhow::Result<HashMap<String, ArticleSummary>> {
        let latest: Option<HistoryRecord<NewsSynthesis>> =
            self.deps.persister.latest(&synthesis_file(pair))?;
        Ok(latest
            .map(|r| r.body.articles)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !s.is_placeholder())
            .map(|s| (s.url.clone(), s))
            .collect())
    }

    /// Flash items whose id was not in the previous snapshot's feed.
    fn fresh_flash(ctx: &TickContext, items: Vec<FlashItem>) -> Vec<FlashItem> {
        let seen: HashSet<String> = match ctx.previous_entry(FLASH_NEWS_KEY) {
            Some(SourceEntry::FlashNews(prev)) => prev.into_iter().map(|i| i.id).collect(),
            _ => HashSet::new(),
        };
        items.into_iter().filter(|i| !seen.contains(&i.id)).collect()
    }
}

fn unit_key(pair: &CurrencyPair, url: &str) -> String {
    format!("{pair}|{url}")
}

/// Drop repeated URLs, keeping first-seen order.
fn dedup_articles(articles: Vec<ArticleRef>) -> Vec<ArticleRef> {
    let mut seen = HashSet::new();
    articles
        .into_iter()
        .filter(|a| seen.insert(a.url().to_string()))
        .collect()
}

#[async_trait]
impl SubPipeline for NewsPipeline {
    type Output = NewsOutput;

    fn kind(&self) -> PipelineKind {
        PipelineKind::News
    }

    async fn dispatch(&self, ctx: &TickContext, stale: &ChangeSet) -> anyhow::Result<NewsOutput> {
        let mut pairs = Vec::new();
        let mut flash = Vec::new();
        for (key, entry) in ctx.stale_entries(stale)? {
            match entry {
                SourceEntry::News { pair, articles } => pairs.push(PairArticles {
                    keys: BTreeSet::from([key]),
                    pair,
                    articles: dedup_articles(articles),
                }),
                SourceEntry::FlashNews(items) => flash = Self::fresh_flash(ctx, items),
                _ => {}
            }
        }
        // `EUR/USD_news` and `EUR/USD_news_websites` feed the same pair
        let mut by_pair: BTreeMap<CurrencyPair, PairArticles> = BTreeMap::new();
        for p in pairs {
            match by_pair.get_mut(&p.pair) {
                Some(existing) => {
                    existing.articles.extend(p.articles);
                    existing.articles = dedup_articles(std::mem::take(&mut existing.articles));
                    existing.keys.extend(p.keys);
                }
                None => {
                    by_pair.insert(p.pair.clone(), p);
                }
            }
        }

        let mut failed_keys = BTreeSet::new();
        let mut caches = HashMap::new();
        let mut units = Vec::new();
        let mut reused = 0usize;
        for p in by_pair.values() {
            let cache = self
                .cached_summaries(&p.pair)
                .with_context(|| format!("loading news history for {}", p.pair))?;
            for article in &p.articles {
                if cache.contains_key(article.url()) {
                    reused += 1;
                    continue;
                }
                let analyst = self.deps.analyst.clone();
                units.push(WorkUnit::new(
                    unit_key(&p.pair, article.url()),
                    (p.pair.clone(), article.clone()),
                    move |(pair, article): (CurrencyPair, ArticleRef)| {
                        let analyst = analyst.clone();
                        async move { analyst.summarize_article(&pair, &article).await }
                    },
                ));
            }
            caches.insert(p.pair.clone(), cache);
        }
        let mut dispatched = units.len();
        let summaries = self.deps.dispatcher.dispatch(units).await;
        let mut succeeded = summaries.success_count();
        tracing::debug!(
            pipeline = "news",
            pairs = by_pair.len(),
            summarized = dispatched,
            reused,
            "article summaries collected"
        );

        let mut synth_units = Vec::new();
        let mut inputs: BTreeMap<CurrencyPair, Vec<ArticleSummary>> = BTreeMap::new();
        for p in by_pair.values() {
            let cache = caches.remove(&p.pair).unwrap_or_default();
            let mut collected = Vec::with_capacity(p.articles.len());
            let mut any_failed = false;
            for article in &p.articles {
                if let Some(hit) = cache.get(article.url()) {
                    collected.push(hit.clone());
                    continue;
                }
                match summaries.get(&unit_key(&p.pair, article.url())) {
                    Some(UnitOutcome::Success(text)) => collected.push(ArticleSummary {
                        url: article.url().to_string(),
                        title: article.title().map(str::to_string),
                        summary: text.clone(),
                    }),
                    Some(UnitOutcome::Failed(e)) => {
                        any_failed = true;
                        if self.deps.policy == FailurePolicy::Placeholder {
                            collected.push(ArticleSummary::placeholder(article, e));
                        }
                    }
                    None => any_failed = true,
                }
            }
            if any_failed {
                failed_keys.extend(p.keys.iter().cloned());
            }
            if collected.iter().all(ArticleSummary::is_placeholder) {
                tracing::info!(pipeline = "news", pair = %p.pair, "no usable summaries, skipping synthesis");
                if !p.articles.is_empty() {
                    failed_keys.extend(p.keys.iter().cloned());
                }
                continue;
            }
            let analyst = self.deps.analyst.clone();
            synth_units.push(WorkUnit::new(
                p.pair.to_string(),
                (p.pair.clone(), collected.clone()),
                move |(pair, summaries): (CurrencyPair, Vec<ArticleSummary>)| {
                    let analyst = analyst.clone();
                    async move { analyst.synthesize_news(&pair, &summaries).await }
                },
            ));
            inputs.insert(p.pair.clone(), collected);
        }

        dispatched += synth_units.len();
        let syntheses = self.deps.dispatcher.dispatch(synth_units).await;
        succeeded += syntheses.success_count();

        let mut records = Vec::new();
        for (pair, articles) in inputs {
            match syntheses.get(&pair.to_string()) {
                Some(UnitOutcome::Success(text)) => records.push((
                    pair.clone(),
                    NewsSynthesis {
                        pair,
                        articles,
                        synthesis: text.clone(),
                    },
                )),
                _ => {
                    if let Some(p) = by_pair.get(&pair) {
                        failed_keys.extend(p.keys.iter().cloned());
                    }
                }
            }
        }

        Ok(NewsOutput {
            records,
            flash,
            dispatched,
            succeeded,
            failed_keys,
        })
    }

    fn persist(&self, output: NewsOutput) -> anyhow::Result<RunSummary> {
        let mut written = Vec::new();
        for (pair, body) in output.records {
            let file = synthesis_file(&pair);
            let path = self
                .deps
                .persister
                .append(&file, HistoryRecord::now(body))
                .with_context(|| format!("writing {file}"))?;
            written.push(path);
        }
        if !output.flash.is_empty() {
            let now = chrono::Utc::now();
            let records: Vec<HistoryRecord<FlashItem>> = output
                .flash
                .into_iter()
                .map(|item| HistoryRecord::new(now, item))
                .collect();
            let path = self
                .deps
                .persister
                .extend_flash(FLASH_FILE, records, self.flash_limit)
                .context("writing flash news")?;
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
