//! Atomic JSON file helpers shared by the snapshot store, the result persister
//! and the pipeline state file.
//!
//! Writes go to a sibling temp file, unique per process and per write, which
//! is fsynced and renamed over the target. A concurrent reader sees either the
//! old or the new document, and two writers never share a temp file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{PipelineError, Result};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Read a JSON array file. A missing file is an empty history, not an error.
pub fn read_array(path: &Path) -> Result<Vec<Value>> {
    let Some(text) = read_optional(path)? else {
        return Ok(Vec::new());
    };
    if text.trim().is_empty() {
        return Err(PipelineError::malformed(path, "empty file"));
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(PipelineError::malformed(
            path,
            format!("expected a JSON array, found {}", json_kind(&other)),
        )),
        Err(e) => Err(PipelineError::malformed(path, e)),
    }
}

/// Read a typed JSON document; `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match read_optional(path)? {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PipelineError::malformed(path, e)),
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::malformed(path, format!("serialize: {e}")))?;
    write_atomic(path, &bytes).map_err(|e| PipelineError::io(path, e))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = tmp_path(path);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}.{seq}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
