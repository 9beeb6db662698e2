//! Integration tests for the daemon's health and metrics endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use baseline_engine::api::{create_router, AppState};
use engine_lib::{health::components, EngineMetrics, HealthRegistry, Severity};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::with_engine_components().await;
    let state = Arc::new(AppState::new(health_registry, EngineMetrics::new()));
    (create_router(state.clone()), state)
}

async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_healthz_reports_every_component() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health = body_json(response).await;
    assert_eq!(health["status"], "healthy");
    for name in components::ALL {
        assert!(health["components"][name].is_object(), "missing {name}");
    }
}

#[tokio::test]
async fn test_healthz_stays_ok_when_degraded() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .report_batch(components::DRIFT_MONITOR, 1, 4)
        .await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health = body_json(response).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["drift_monitor"]["message"],
        "1 of 4 machines failed"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_store_unhealthy() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_unhealthy(components::STORE, "snapshot write failed")
        .await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_startup_and_component_health() {
    let (app, state) = setup_test_app().await;

    let response = get(app.clone(), "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["ready"], false);

    state.health_registry.set_ready(true).await;
    let response = get(app.clone(), "/readyz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);

    state
        .health_registry
        .set_unhealthy(components::RETRAIN, "worker stopped")
        .await;
    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["reason"], "unhealthy: retrain");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_engine_metrics() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_scoring_latency(0.0004);
    state.metrics.observe_training_latency(0.2);
    state.metrics.inc_anomalies(Severity::Critical);
    state.metrics.inc_scheduler_skips("drift_check");
    state.metrics.set_active_models(3);

    let response = get(app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("baseline_engine_scoring_latency_seconds_bucket"));
    assert!(text.contains("baseline_engine_training_latency_seconds_count"));
    assert!(text.contains("baseline_engine_readings_scored_total"));
    assert!(text.contains("baseline_engine_scheduler_skips_total{job=\"drift_check\"}"));
    assert!(text.contains("baseline_engine_active_models"));
}
