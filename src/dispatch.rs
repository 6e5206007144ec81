//! # Work-unit dispatcher
//! Fan-out of independent, independently-failable async units.
//!
//! Each unit runs on its own Tokio task, so an error *or a panic* inside one
//! unit is recorded as a failure marker for its key and never reaches sibling
//! units or the caller. `dispatch` always joins every unit before returning.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

type Job<T> = Box<dyn FnOnce(RetryPolicy) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// One schedulable task: a key plus the payload and analysis function
/// captured in `job`.
pub struct WorkUnit<T> {
    key: String,
    job: Job<T>,
}

impl<T: Send + 'static> WorkUnit<T> {
    /// Homogeneous unit: `f(payload)`, retried per the dispatcher's policy.
    pub fn new<P, F, Fut>(key: impl Into<String>, payload: P, f: F) -> Self
    where
        P: Clone + Send + Sync + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let job: Job<T> = Box::new(move |policy: RetryPolicy| {
            async move { policy.run(|| f(payload.clone())).await }.boxed()
        });
        Self {
            key: key.into(),
            job,
        }
    }

    /// Two-stage unit for one key: `second` consumes what `first` produced.
    /// Each stage gets its own retry budget; stage one is not re-run when
    /// stage two fails.
    pub fn chain<P, M, F1, Fut1, F2, Fut2>(
        key: impl Into<String>,
        payload: P,
        first: F1,
        second: F2,
    ) -> Self
    where
        P: Clone + Send + Sync + 'static,
        M: Clone + Send + Sync + 'static,
        F1: Fn(P) -> Fut1 + Send + Sync + 'static,
        Fut1: Future<Output = anyhow::Result<M>> + Send + 'static,
        F2: Fn(P, M) -> Fut2 + Send + Sync + 'static,
        Fut2: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let job: Job<T> = Box::new(move |policy: RetryPolicy| {
            async move {
                let mid = policy
                    .run(|| first(payload.clone()))
                    .await
                    .context("first stage")?;
                policy
                    .run(|| second(payload.clone(), mid.clone()))
                    .await
                    .context("second stage")
            }
            .boxed()
        });
        Self {
            key: key.into(),
            job,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Success value or failure marker carrying the error description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome<T> {
    Success(T),
    Failed(String),
}

impl<T> UnitOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success(_))
    }
}

/// What a sub-pipeline does with failed keys when building its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Omit failed keys from the merged result.
    #[default]
    Drop,
    /// Keep failed keys with an explicit error placeholder value.
    Placeholder,
}

/// Outcome of one dispatch, key -> success | failure. Handed over whole once
/// every unit has finished.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResultMap<T> {
    entries: BTreeMap<String, UnitOutcome<T>>,
}

impl<T> Default for PartialResultMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> PartialResultMap<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&UnitOutcome<T>> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UnitOutcome<T>)> {
        self.entries.iter()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&String, &T)> {
        self.entries.iter().filter_map(|(k, o)| match o {
            UnitOutcome::Success(v) => Some((k, v)),
            UnitOutcome::Failed(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &str)> {
        self.entries.iter().filter_map(|(k, o)| match o {
            UnitOutcome::Failed(e) => Some((k, e.as_str())),
            UnitOutcome::Success(_) => None,
        })
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn failed_keys(&self) -> BTreeSet<String> {
        self.failures().map(|(k, _)| k.clone()).collect()
    }

    pub fn into_successes(self) -> BTreeMap<String, T> {
        self.entries
            .into_iter()
            .filter_map(|(k, o)| match o {
                UnitOutcome::Success(v) => Some((k, v)),
                UnitOutcome::Failed(_) => None,
            })
            .collect()
    }

    /// Apply a failure policy: failed keys are dropped, or replaced with
    /// `placeholder(key, error)`.
    pub fn resolve<F>(self, policy: FailurePolicy, placeholder: F) -> BTreeMap<String, T>
    where
        F: Fn(&str, &str) -> T,
    {
        self.entries
            .into_iter()
            .filter_map(|(k, o)| match (o, policy) {
                (UnitOutcome::Success(v), _) => Some((k, v)),
                (UnitOutcome::Failed(_), FailurePolicy::Drop) => None,
                (UnitOutcome::Failed(e), FailurePolicy::Placeholder) => {
                    let v = placeholder(&k, &e);
                    Some((k, v))
                }
            })
            .collect()
    }
}

impl<T> FromIterator<(String, UnitOutcome<T>)> for PartialResultMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, UnitOutcome<T>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    retry: RetryPolicy,
    /// `None` = every unit at once.
    concurrency: Option<usize>,
    label: &'static str,
}

impl Dispatcher {
    pub fn new(retry: RetryPolicy, concurrency: Option<usize>) -> Self {
        Self {
            retry,
            concurrency: concurrency.filter(|n| *n > 0),
            label: "unlabeled",
        }
    }

    /// Same settings, metrics labelled with the owning pipeline.
    pub fn labeled(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Run every unit concurrently and collect one outcome per key.
    pub async fn dispatch<T: Send + 'static>(&self, units: Vec<WorkUnit<T>>) -> PartialResultMap<T> {
        let label = self.label;
        // first unit per key runs, later duplicates never start
        let mut seen = BTreeSet::new();
        let units: Vec<WorkUnit<T>> = units
            .into_iter()
            .filter(|u| {
                let first = seen.insert(u.key.clone());
                if !first {
                    tracing::warn!(pipeline = label, key = %u.key, "duplicate work-unit key, unit skipped");
                }
                first
            })
            .collect();

        let total = units.len();
        if total == 0 {
            return PartialResultMap::default();
        }
        let limit = self.concurrency.unwrap_or(total).max(1);
        let retry = self.retry;

        let results: Vec<(String, UnitOutcome<T>)> = stream::iter(units)
            .map(move |unit| async move {
                let WorkUnit { key, job } = unit;
                let outcome = match tokio::spawn(job(retry)).await {
                    Ok(Ok(v)) => UnitOutcome::Success(v),
                    Ok(Err(e)) => UnitOutcome::Failed(format!("{e:#}")),
                    Err(join) => UnitOutcome::Failed(format!("work unit aborted: {join}")),
                };
                match &outcome {
                    UnitOutcome::Success(_) => {
                        counter!("pipeline_units_total", "pipeline" => label, "outcome" => "success")
                            .increment(1);
                    }
                    UnitOutcome::Failed(e) => {
                        tracing::warn!(pipeline = label, key = %key, error = %e, "work unit failed");
                        counter!("pipeline_units_total", "pipeline" => label, "outcome" => "failed")
                            .increment(1);
                    }
                }
                (key, outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let map: PartialResultMap<T> = results.into_iter().collect();
        tracing::debug!(
            pipeline = label,
            units = total,
            ok = map.success_count(),
            "dispatch finished"
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn quick() -> Dispatcher {
        Dispatcher::new(RetryPolicy::new(2, Duration::from_millis(1)), None)
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let units: Vec<WorkUnit<u32>> = (0..5u32)
            .map(|i| {
                WorkUnit::new(format!("k{i}"), i, |n: u32| async move {
                    if n == 2 {
                        Err(PipelineError::Rejected("boom".into()).into())
                    } else {
                        Ok(n * 10)
                    }
                })
            })
            .collect();
        let out = quick().dispatch(units).await;
        assert_eq!(out.len(), 5);
        assert_eq!(out.success_count(), 4);
        assert_eq!(out.failed_keys().into_iter().collect::<Vec<_>>(), vec!["k2"]);
        assert_eq!(out.get("k4"), Some(&UnitOutcome::Success(40)));
    }

    #[tokio::test]
    async fn duplicate_key_keeps_the_first_unit_and_skips_the_rest() {
        let runs = Arc::new(AtomicUsize::new(0));
        let units: Vec<WorkUnit<u32>> = (1..=3u32)
            .map(|n| {
                let runs = runs.clone();
                WorkUnit::new("EUR/USD", n, move |n: u32| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        // the first unit is the slowest, it must still be the one kept
                        tokio::time::sleep(Duration::from_millis(u64::from(4 - n) * 5)).await;
                        Ok(n)
                    }
                })
            })
            .collect();
        let out = quick().dispatch(units).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("EUR/USD"), Some(&UnitOutcome::Success(1)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_unit_is_a_failure_marker() {
        let units = vec![
            WorkUnit::new("ok", 1u8, |n: u8| async move { Ok(n) }),
            WorkUnit::new("bad", 2u8, |_n: u8| async move {
                if true {
                    panic!("analysis exploded");
                }
                Ok(0u8)
            }),
        ];
        let out = quick().dispatch(units).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out.get("bad"), Some(UnitOutcome::Failed(_))));
        assert_eq!(out.get("ok"), Some(&UnitOutcome::Success(1)));
    }

    #[tokio::test]
    async fn chain_feeds_second_stage_and_keeps_first_stage_result() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let (fc, sc) = (first_calls.clone(), second_calls.clone());
        let unit = WorkUnit::chain(
            "EUR/USD",
            "raw".to_string(),
            move |raw: String| {
                let fc = fc.clone();
                async move {
                    fc.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("{raw}->extracted"))
                }
            },
            move |_raw: String, mid: String| {
                let sc = sc.clone();
                async move {
                    // fail once with a transient error, then succeed
                    if sc.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(PipelineError::Transient("503".into()).into());
                    }
                    Ok(format!("{mid}->analyzed"))
                }
            },
        );
        let out = quick().dispatch(vec![unit]).await;
        assert_eq!(
            out.get("EUR/USD"),
            Some(&UnitOutcome::Success("raw->extracted->analyzed".to_string()))
        );
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bounded_concurrency_never_exceeds_limit() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let units: Vec<WorkUnit<()>> = (0..8)
            .map(|i| {
                let (live, peak) = (live.clone(), peak.clone());
                WorkUnit::new(format!("k{i}"), (), move |_| {
                    let (live, peak) = (live.clone(), peak.clone());
                    async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
            })
            .collect();
        let d = Dispatcher::new(RetryPolicy::none(), Some(2));
        let out = d.dispatch(units).await;
        assert_eq!(out.success_count(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn resolve_applies_policy() {
        let map: PartialResultMap<String> = vec![
            ("a".to_string(), UnitOutcome::Success("A".to_string())),
            ("b".to_string(), UnitOutcome::Failed("timeout".to_string())),
        ]
        .into_iter()
        .collect();
        let dropped = map.clone().resolve(FailurePolicy::Drop, |_, _| String::new());
        assert_eq!(dropped.len(), 1);
        let kept = map.resolve(FailurePolicy::Placeholder, |_, e| format!("Error: {e}"));
        assert_eq!(kept["b"], "Error: timeout");
    }
}
