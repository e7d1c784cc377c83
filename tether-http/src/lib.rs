//! Liveness endpoint probed by the watchdog.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tether_types::StopSignal;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HealthState {
    inner: Arc<Inner>,
}

struct Inner {
    started: Instant,
    mode: String,
}

impl HealthState {
    pub fn new(mode: impl Into<String>) -> Self {
        Self::started_at(Instant::now(), mode)
    }

    pub fn started_at(started: Instant, mode: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                started,
                mode: mode.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    mode: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.inner.started.elapsed().as_secs(),
        mode: state.inner.mode.clone(),
    })
}

/// Bind `0.0.0.0:port` and serve until `stop` fires.
pub async fn serve(port: u16, state: HealthState, stop: StopSignal) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.stopped().await })
        .await?;
    tracing::info!("health server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_mode_and_uptime() {
        let started = Instant::now() - Duration::from_secs(42);
        let app = router(HealthState::started_at(started, "daemon"));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["mode"], "daemon");
        assert!(value["uptime_seconds"].as_u64().unwrap() >= 42);
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let app = router(HealthState::new("interactive"));
        for path in ["/", "/healthz", "/health/extra"] {
            let resp = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn serve_stops_on_signal() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let stop = StopSignal::new();
        let server = tokio::spawn(serve(port, HealthState::new("daemon"), stop.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
