// tests/metrics.rs
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use fx_refresh::dispatch::{Dispatcher, WorkUnit};
use fx_refresh::history::{self, Batch};
use fx_refresh::metrics::Metrics;
use fx_refresh::retry::RetryPolicy;
use fx_refresh::PipelineError;

// One recorder per process, so a single test installs it and checks every series.
#[tokio::test]
async fn metrics_endpoint_contains_expected_series() {
    let metrics = Metrics::init(1800).expect("install recorder");

    let units = vec![
        WorkUnit::new("ok", 1u8, |n: u8| async move { Ok(n) }),
        WorkUnit::new("bad", 2u8, |_n: u8| async move {
            Err::<u8, _>(PipelineError::Rejected("nope".into()).into())
        }),
    ];
    Dispatcher::new(RetryPolicy::none(), None)
        .labeled("risk_sentiment")
        .dispatch(units)
        .await;

    let dir = tempfile::tempdir().unwrap();
    history::merge(Batch::One(json!({"n": 1})), &dir.path().join("h.json"), true, 5).unwrap();

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "pipeline_units_total{pipeline=\"risk_sentiment\",outcome=\"success\"} 1",
        "pipeline_units_total{pipeline=\"risk_sentiment\",outcome=\"failed\"} 1",
        "history_records_written_total 1",
        "pipeline_interval_secs 1800",
    ] {
        assert!(text.contains(needle), "missing `{needle}` in:\n{text}");
    }

    // a second install in the same process is a config error, not a panic
    assert!(Metrics::init(60).is_err());
}
