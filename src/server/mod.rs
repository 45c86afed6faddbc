pub mod shutdown;

use crate::metrics::exporter::export_metrics;
use crate::waf::{RequestDescriptor, RequestPayload, ScanEngine};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use shutdown::ShutdownCoordinator;

pub fn router(engine: Arc<ScanEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serves until the shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<ScanEngine>,
    mut stop: broadcast::Receiver<()>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("WAF server listening on {}", addr);
    }

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await
        .context("HTTP server failed")?;

    info!("WAF server stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

/// 200 when the request may go through, 403 when it is blocked and 503 when
/// the submission cannot be understood.
async fn submit(State(engine): State<Arc<ScanEngine>>, body: String) -> Response {
    let request = match serde_json::from_str::<RequestPayload>(&body)
        .map_err(|e| e.to_string())
        .and_then(|p| RequestDescriptor::try_from(p).map_err(|e| e.to_string()))
    {
        Ok(request) => request,
        Err(message) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": message })),
            )
                .into_response();
        }
    };

    if engine.scan(&request).is_allowed() {
        StatusCode::OK.into_response()
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

async fn metrics() -> Response {
    match export_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ChangeNotifier;
    use crate::store::MemoryStore;
    use crate::waf::ConfigStore;

    async fn start(deny: &str) -> (String, ShutdownCoordinator, tokio::task::JoinHandle<Result<()>>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(ChangeNotifier::new(store).unwrap());
        let config = ConfigStore::bootstrap(notifier).unwrap();
        if !deny.is_empty() {
            config.set_deny_list(deny).unwrap();
        }
        let engine = Arc::new(ScanEngine::new(config, "", "{{.Scanresult}}").unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let coordinator = ShutdownCoordinator::new();
        let handle = tokio::spawn(serve(listener, engine, coordinator.subscribe()));
        (base, coordinator, handle)
    }

    async fn post(base: &str, body: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/submit", base))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (base, coordinator, handle) = start("").await;

        let response = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), r#"{"status":"OK"}"#);

        coordinator.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_submit_verdicts() {
        let (base, coordinator, handle) = start("10.0.0.0/8").await;

        let allowed = post(
            &base,
            r#"{"remote_addr":"192.168.1.1","url":"http://example.com/","method":"GET"}"#,
        )
        .await;
        assert_eq!(allowed.status(), 200);

        let blocked = post(
            &base,
            r#"{"remote_addr":"10.1.2.3","url":"http://example.com/","method":"GET"}"#,
        )
        .await;
        assert_eq!(blocked.status(), 403);

        coordinator.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_input() {
        let (base, coordinator, handle) = start("").await;

        let response = post(&base, "{not json").await;
        assert_eq!(response.status(), 503);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["message"].is_string());

        let response = post(
            &base,
            r#"{"remote_addr":"1.2.3.4","url":"not a url","method":"GET"}"#,
        )
        .await;
        assert_eq!(response.status(), 503);

        coordinator.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (base, coordinator, handle) = start("").await;
        post(
            &base,
            r#"{"remote_addr":"192.168.1.1","url":"http://example.com/","method":"GET"}"#,
        )
        .await;

        let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("fe_waf_scan_total"));

        coordinator.shutdown();
        handle.await.unwrap().unwrap();
    }
}
