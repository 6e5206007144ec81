// tests/scheduler.rs
//
// The scheduler ticks immediately, keeps going on its interval, and stops
// cleanly when asked.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use common::{push_snapshot, read_history, test_config, ScriptedAnalyst};
use fx_refresh::scheduler::{spawn_scheduler, SchedulerCfg};
use fx_refresh::PipelineOrchestrator;

#[tokio::test]
async fn first_tick_runs_immediately_and_shutdown_stops_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    push_snapshot(&cfg, 0, json!({"risk.fx": {"dxy": 104}}));

    let analyst = ScriptedAnalyst::new();
    let orch = Arc::new(PipelineOrchestrator::new(&cfg, analyst.clone()).unwrap());
    let (tx, rx) = watch::channel(false);
    let handle = spawn_scheduler(
        orch,
        SchedulerCfg {
            interval: Duration::from_secs(3600),
        },
        rx,
    );

    // wait for the immediate first tick to persist
    let mut tries = 0;
    while read_history(&cfg, "risk_sentiment.json").is_empty() {
        tries += 1;
        assert!(tries < 200, "first tick never persisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops promptly")
        .unwrap();
    assert_eq!(analyst.calls_with_prefix("risk:"), vec!["risk:fx"]);
}

#[tokio::test(start_paused = true)]
async fn repeated_ticks_without_new_data_do_no_work() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    push_snapshot(&cfg, 0, json!({"fundamental.eur.CPI": 2.1}));

    let analyst = ScriptedAnalyst::new();
    let orch = Arc::new(PipelineOrchestrator::new(&cfg, analyst.clone()).unwrap());
    let (tx, rx) = watch::channel(false);
    let handle = spawn_scheduler(
        orch,
        SchedulerCfg {
            interval: Duration::from_secs(1800),
        },
        rx,
    );

    // three scheduled periods go by
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(1800)).await;
    }
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(analyst.calls_with_prefix("fundamentals:"), vec!["fundamentals:EUR/USD"]);
    assert_eq!(read_history(&cfg, "eur_usd_analysis.json").len(), 1);
}
