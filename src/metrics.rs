use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::PipelineError;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the pipeline series.
    pub fn init(interval_secs: u64) -> Result<Self, PipelineError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| PipelineError::Config(format!("prometheus: install recorder: {e}")))?;

        describe_counter!("pipeline_ticks_total", "Scheduler ticks started");
        describe_counter!(
            "pipeline_units_total",
            "Work units finished, by pipeline and outcome"
        );
        describe_counter!(
            "pipeline_noop_total",
            "Sub-pipeline runs with an empty stale set"
        );
        describe_counter!(
            "pipeline_failures_total",
            "Whole sub-pipeline failures, by pipeline"
        );
        describe_counter!(
            "history_records_written_total",
            "Records appended to rolling history files"
        );
        describe_gauge!("pipeline_last_tick_ts", "Unix time of the last tick");
        describe_gauge!("pipeline_interval_secs", "Configured tick period");

        // Static gauge with the configured period
        gauge!("pipeline_interval_secs").set(interval_secs as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
