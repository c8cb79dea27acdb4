//! The HTTP scrape endpoint: `GET /metrics` renders the registry in
//! Prometheus text exposition format, `GET /` is a minimal index page.

use crate::executor::ExecutorHandle;
use crate::registry::MetricRegistry;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::Encoder;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    registry: Arc<MetricRegistry>,
    executor: ExecutorHandle,
}

impl AppState {
    pub fn new(registry: Arc<MetricRegistry>, executor: ExecutorHandle) -> Self {
        Self { registry, executor }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/", get(handle_index))
        .with_state(state)
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    state.executor.run_aperiodic_queries().await;
    let metric_families = state.registry.prometheus_registry().gather();
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
        buffer,
    )
        .into_response()
}

async fn handle_index() -> impl IntoResponse {
    Html(
        "<html><body><h1>query-exporter</h1><p><a href=\"/metrics\">Metrics</a></p></body></html>",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let executor = Executor::new(shared::config::Config::default()).unwrap();
        AppState::new(executor.registry(), executor.handle())
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let router = create_router(test_state());

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn index_endpoint_returns_ok() {
        let router = create_router(test_state());

        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
