use crate::index::HostIndex;
use crate::metrics::Metrics;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub index: Arc<HostIndex>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStatus {
    pub hosts: usize,
    pub generation_built_at_unix: i64,
}

pub fn build_router(metrics: Arc<Metrics>, index: Arc<HostIndex>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/index", get(index_handler))
        .with_state(HttpAppState { metrics, index })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn index_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let generation = state.index.generation();
    Json(IndexStatus {
        hosts: generation.len(),
        generation_built_at_unix: generation.built_at_unix(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::MemoryHostStore;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn index(hosts: usize) -> Arc<HostIndex> {
        Arc::new(HostIndex::new(
            Arc::new(MemoryHostStore::with_hosts(hosts)),
            1000,
        ))
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(Metrics::new().expect("metrics"), index(0));
        let (status, body) = get_text(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_counts_scrapes() {
        let metrics = Metrics::new().expect("metrics");
        let app = build_router(metrics.clone(), index(0));

        let (status, body) = get_text(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hostsnap_scrape_count_total 1"));
        assert!(body.contains("hostsnap_index_hosts"));
    }

    #[tokio::test]
    async fn api_index_reports_active_generation() {
        let index = index(3);
        index.refresh().await;
        let app = build_router(Metrics::new().expect("metrics"), index);

        let (status, body) = get_text(app, "/api/index").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["hosts"], 3);
        assert!(json["generation_built_at_unix"].as_i64().unwrap() > 0);
    }
}
