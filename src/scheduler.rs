// src/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::orchestrator::PipelineOrchestrator;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
}

/// Spawn the fixed-interval driver. The first tick fires immediately; a slow
/// tick delays the next one instead of stacking ticks.
///
/// Flipping `shutdown` to `true` stops the loop between ticks. A tick that is
/// already running is allowed to finish, so no history write is cut short.
pub fn spawn_scheduler(
    orchestrator: Arc<PipelineOrchestrator>,
    cfg: SchedulerCfg,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = cfg.interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match orchestrator.tick().await {
                Ok(report) => tracing::debug!(
                    target: "scheduler",
                    dispatched = report.dispatched(),
                    "tick done"
                ),
                // fatal: surfaced every tick until the operator fixes it
                Err(e) => tracing::error!(target: "scheduler", error = %format!("{e:#}"), "tick failed"),
            }
        }
        tracing::info!("scheduler stopped");
    })
}
