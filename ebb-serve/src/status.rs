//! Status HTTP surface
//!
//! `/health` for liveness probes, `/status` for a JSON snapshot of every
//! platform's service loop, `/metrics` for Prometheus scrapes.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use libebbtide::{Platform, RunStatus, StatusBoard, Timeline};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::BTreeMap;

/// Fixed facts about the running service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub started_at: DateTime<Utc>,
    pub interval_secs: u64,
    pub dry_run: bool,
    pub timeline: Timeline,
}

#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub info: ServiceInfo,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    service: ServiceInfo,
    platforms: BTreeMap<Platform, RunStatus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: state.info.clone(),
        platforms: state.board.snapshot(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics recorder not installed\n".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use libebbtide::{Counts, RunOutcome, Summary, Termination};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(board: StatusBoard, metrics: Option<PrometheusHandle>) -> AppState {
        AppState {
            board,
            info: ServiceInfo {
                started_at: Utc::now(),
                interval_secs: 3600,
                dry_run: true,
                timeline: Timeline::Posts,
            },
            metrics,
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(router(state(StatusBoard::new(), None)), "/health").await;

        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let board = StatusBoard::new();
        board.register(Platform::Bluesky);
        board.register(Platform::Mastodon);

        let mut summary = Summary::new(Platform::Mastodon, "");
        summary.counts = Counts {
            deleted: 4,
            ..Counts::default()
        };
        summary.outcome = Some(RunOutcome::Completed {
            reason: Termination::EndOfTimeline,
        });
        board.mark_started(Platform::Mastodon, Utc::now());
        board.mark_finished(Platform::Mastodon, &summary, Duration::from_millis(1500), None);

        let (status, body) = get_body(router(state(board, None)), "/status").await;
        assert_eq!(status, StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["service"]["interval_secs"], 3600);
        assert_eq!(value["service"]["timeline"], "posts");
        assert_eq!(value["platforms"]["bluesky"]["total_runs"], 0);

        let mastodon = &value["platforms"]["mastodon"];
        assert_eq!(mastodon["total_runs"], 1);
        assert_eq!(mastodon["running"], false);
        assert_eq!(mastodon["cumulative"]["deleted"], 4);
        assert_eq!(mastodon["last_duration"], 1.5);
        assert_eq!(mastodon["last_outcome"]["status"], "completed");
    }

    #[tokio::test]
    async fn test_metrics_renders_recorded_values() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("ebbtide_runs_total", "platform" => "mock").increment(2);
        });

        let (status, body) = get_body(router(state(StatusBoard::new(), Some(handle))), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ebbtide_runs_total{platform=\"mock\"} 2"));
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (status, _) = get_body(router(state(StatusBoard::new(), None)), "/metrics").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get_body(router(state(StatusBoard::new(), None)), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
