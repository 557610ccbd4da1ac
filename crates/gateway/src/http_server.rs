//! HTTP server for the Prometheus metrics endpoint.

use crate::metrics::MetricsRegistry;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    registry: Arc<MetricsRegistry>,
    listen_addr: String,
}

impl MetricsServer {
    pub fn new(registry: Arc<MetricsRegistry>, listen_addr: String) -> Self {
        Self {
            registry,
            listen_addr,
        }
    }

    fn router(registry: Arc<MetricsRegistry>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(registry)
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let app = Self::router(self.registry);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Metrics server stopped");
        Ok(())
    }
}

/// Handler for /metrics
async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> Response {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry.registry) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_metrics_handler_returns_text_format() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.update_counts(2, 3);

        let response = metrics_handler(State(registry)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn test_metrics_server_serves_and_stops() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.record_endpoint_publish();

        // Reserve a free port, then hand it to the server.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let server = MetricsServer::new(registry, addr.to_string());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(addr).await {
                stream
                    .write_all(b"GET /metrics HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
                    .await
                    .unwrap();
                stream.read_to_string(&mut body).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("gateway_endpoint_publishes_total 1"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
