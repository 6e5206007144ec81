//! history.rs: rolling, size-bounded JSON history files per entity.
//!
//! A history file is a JSON array of records, oldest first. Writers append
//! (or extend), optionally truncate from the front to `limit`, and replace the
//! file atomically. Readers want the last record, sometimes the one before.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::storage;

pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// Timestamped, immutable entry. Domain fields are flattened next to
/// `timestamp` on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord<T> {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> HistoryRecord<T> {
    pub fn new(timestamp: DateTime<Utc>, body: T) -> Self {
        Self { timestamp, body }
    }

    pub fn now(body: T) -> Self {
        Self::new(Utc::now(), body)
    }
}

/// A single record is appended, a list is extended.
#[derive(Debug, Clone)]
pub enum Batch<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Batch<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Batch::One(r) => vec![r],
            Batch::Many(v) => v,
        }
    }
}

/// Merge `data` into the history at `path`. Returns the resulting length.
///
/// An empty `Many` leaves the file untouched, so good history is never
/// replaced by an empty result.
pub fn merge<T: Serialize>(data: Batch<T>, path: &Path, truncate: bool, limit: usize) -> Result<usize> {
    merge_with(data, path, truncate, limit, |_| {})
}

/// [`merge`] for interleaved flash records: after extending, consecutive
/// records whose `id` shares the prefix before `#` collapse into the last one.
pub fn merge_flash<T: Serialize>(data: Batch<T>, path: &Path, truncate: bool, limit: usize) -> Result<usize> {
    merge_with(data, path, truncate, limit, collapse_related)
}

fn merge_with<T, F>(data: Batch<T>, path: &Path, truncate: bool, limit: usize, post: F) -> Result<usize>
where
    T: Serialize,
    F: FnOnce(&mut Vec<Value>),
{
    let incoming = data.into_vec();
    let mut records = storage::read_array(path)?;
    if incoming.is_empty() {
        return Ok(records.len());
    }
    let added = incoming.len();
    for r in incoming {
        let v = serde_json::to_value(r)
            .map_err(|e| PipelineError::malformed(path, format!("serialize record: {e}")))?;
        records.push(v);
    }
    post(&mut records);
    if truncate && records.len() > limit {
        let excess = records.len() - limit;
        records.drain(0..excess);
    }
    storage::write_json_atomic(path, &records)?;
    counter!("history_records_written_total").increment(added as u64);
    tracing::debug!(path = %path.display(), added, len = records.len(), "history merged");
    Ok(records.len())
}

/// Keep-last collapse of consecutive records sharing an id prefix.
pub fn collapse_related(records: &mut Vec<Value>) {
    let mut out: Vec<Value> = Vec::with_capacity(records.len());
    for r in records.drain(..) {
        let same_story = match (out.last().and_then(id_prefix), id_prefix(&r)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if same_story {
            out.pop();
        }
        out.push(r);
    }
    *records = out;
}

fn id_prefix(v: &Value) -> Option<&str> {
    let id = v.get("id")?.as_str()?;
    id.split('#').next()
}

/// All records, oldest first. Missing file -> empty.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    storage::read_array(path)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value(v)
                .map_err(|e| PipelineError::malformed(path, format!("record {i}: {e}")))
        })
        .collect()
}

/// Most recent record, if any.
pub fn latest<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    nth_from_end(path, 0)
}

/// Record before the most recent one, for diffing.
pub fn previous<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    nth_from_end(path, 1)
}

fn nth_from_end<T: DeserializeOwned>(path: &Path, n: usize) -> Result<Option<T>> {
    let records = storage::read_array(path)?;
    let Some(v) = records.into_iter().rev().nth(n) else {
        return Ok(None);
    };
    serde_json::from_value(v)
        .map(Some)
        .map_err(|e| PipelineError::malformed(path, e))
}

/// Owns the history directory of one deployment and its default limit.
#[derive(Debug, Clone)]
pub struct ResultPersister {
    root: PathBuf,
    limit: usize,
}

impl ResultPersister {
    pub fn new(root: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            root: root.into(),
            limit: limit.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn path_for(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// Append one record to `file`, truncating to the default limit.
    pub fn append<T: Serialize>(&self, file: &str, record: HistoryRecord<T>) -> Result<PathBuf> {
        let path = self.path_for(file);
        merge(Batch::One(record), &path, true, self.limit)?;
        Ok(path)
    }

    /// Extend `file` with flash records, collapsing related ones.
    pub fn extend_flash<T: Serialize>(&self, file: &str, records: Vec<T>, limit: usize) -> Result<PathBuf> {
        let path = self.path_for(file);
        merge_flash(Batch::Many(records), &path, true, limit)?;
        Ok(path)
    }

    pub fn latest<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        latest(&self.path_for(file))
    }

    pub fn previous<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        previous(&self.path_for(file))
    }

    pub fn load<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        load(&self.path_for(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seven_appends_with_limit_five_keep_three_to_seven() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("eur_usd_news_synthesis.json");
        for i in 1..=7 {
            let len = merge(Batch::One(json!({ "n": i })), &p, true, 5).unwrap();
            assert_eq!(len, i.min(5));
        }
        let all: Vec<Value> = load(&p).unwrap();
        let ns: Vec<i64> = all.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn without_truncate_history_grows() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("h.json");
        merge(Batch::Many(vec![json!(1), json!(2), json!(3)]), &p, false, 2).unwrap();
        assert_eq!(load::<Value>(&p).unwrap().len(), 3);
    }

    #[test]
    fn empty_batch_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("h.json");
        merge(Batch::One(json!({"n": 1})), &p, true, 5).unwrap();
        let before = std::fs::read(&p).unwrap();
        merge::<Value>(Batch::Many(vec![]), &p, true, 5).unwrap();
        assert_eq!(std::fs::read(&p).unwrap(), before);

        let missing = dir.path().join("never.json");
        merge::<Value>(Batch::Many(vec![]), &missing, true, 5).unwrap();
        assert!(!missing.exists());
    }

    #[test]
    fn latest_and_previous() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("h.json");
        assert_eq!(latest::<Value>(&p).unwrap(), None);
        merge(Batch::Many(vec![json!("a"), json!("b")]), &p, true, 5).unwrap();
        assert_eq!(latest::<Value>(&p).unwrap(), Some(json!("b")));
        assert_eq!(previous::<Value>(&p).unwrap(), Some(json!("a")));
    }

    #[test]
    fn malformed_history_is_fatal_and_not_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("h.json");
        std::fs::write(&p, "[{\"timestamp\": ").unwrap();
        let err = merge(Batch::One(json!({})), &p, true, 5).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "[{\"timestamp\": ");
    }

    #[test]
    fn flash_collapses_consecutive_related_ids_before_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("flash_news.json");
        merge_flash(
            Batch::Many(vec![json!({"id": "ecb#1", "headline": "ECB holds"})]),
            &p,
            true,
            3,
        )
        .unwrap();
        merge_flash(
            Batch::Many(vec![
                json!({"id": "ecb#2", "headline": "ECB holds, Lagarde speaks"}),
                json!({"id": "nfp", "headline": "NFP beats"}),
                json!({"id": "ecb#3", "headline": "ECB again"}),
            ]),
            &p,
            true,
            3,
        )
        .unwrap();
        let all: Vec<Value> = load(&p).unwrap();
        let ids: Vec<&str> = all.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["ecb#2", "nfp", "ecb#3"]);
    }

    #[test]
    fn record_flattens_domain_fields() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Body {
            pair: String,
        }
        let r = HistoryRecord::new(
            "2025-09-06T09:00:00Z".parse().unwrap(),
            Body { pair: "EUR/USD".into() },
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, json!({"timestamp": "2025-09-06T09:00:00Z", "pair": "EUR/USD"}));
        let back: HistoryRecord<Body> = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }
}
