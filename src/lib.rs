// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analysis;
pub mod api;
pub mod change_detector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod pipelines;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod sources;
pub mod state;
pub mod storage;

// ---- Re-exports for stable public API ----
pub use crate::analysis::{Analyst, DisabledAnalyst, LlmAnalyst, SharedAnalyst};
pub use crate::api::router;
pub use crate::config::AppConfig;
pub use crate::error::PipelineError;
pub use crate::orchestrator::{PipelineOrchestrator, PipelineOutcome, TickReport};
pub use crate::snapshot::{Snapshot, SnapshotStore};

use std::sync::Arc;

use tracing::{info, warn};

/// Analysis backend for `cfg`: the HTTP client when enabled, otherwise one
/// that fails every call so nothing is persisted.
pub fn build_analyst(cfg: &AppConfig) -> Result<SharedAnalyst, PipelineError> {
    if !cfg.llm.enabled {
        warn!("analysis endpoint disabled in config; only structured calendar pages will be extracted");
        return Ok(Arc::new(DisabledAnalyst));
    }
    let llm = LlmAnalyst::from_config(&cfg.llm)?;
    info!(model = %cfg.llm.model, endpoint = %cfg.llm.endpoint, "analysis endpoint configured");
    Ok(Arc::new(llm))
}
