//! HTTP surface: JSON API, per-run SSE streams and the WebSocket feed.

pub mod api;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::service::PipelineService;

pub use api::{AppState, SharedState};

/// Where the server listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Allow cross-origin requests, for a dashboard served elsewhere
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
            permissive_cors: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(service: Arc<PipelineService>) -> Router {
    let ws_tx = service.firehose();
    let state = Arc::new(AppState { service });

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn start_server(service: Arc<PipelineService>, config: ServerConfig) -> Result<()> {
    let mut app = build_router(service);
    if config.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "Server listening");
    println!("pipewright running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GatewayError;
    use crate::gateway::{GenerationGateway, GenerationRequest};
    use crate::phase::PipelineTopology;
    use crate::service::ServiceOptions;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Unreachable;

    #[async_trait]
    impl GenerationGateway for Unreachable {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, GatewayError> {
            Err(GatewayError::Unavailable("offline".into()))
        }
    }

    fn test_router(dir: &std::path::Path) -> Router {
        let service = PipelineService::new(
            Arc::new(Unreachable),
            PipelineTopology::default_pipeline(),
            ServiceOptions::new(dir),
        );
        build_router(Arc::new(service))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 5000);
        assert!(!config.permissive_cors);
    }
}
