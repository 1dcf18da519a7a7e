//! Diagnostics HTTP Server
//!
//! Serves the health check and Prometheus metrics on `--http-endpoint` (or the
//! deprecated `--metrics-address`).

use super::supervisor::SupervisorStatus;
use crate::config::parse_listen_address;
use crate::error::{Error, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Health check path
pub const HEALTHZ_PATH: &str = "/healthz";

// =============================================================================
// Router
// =============================================================================

/// Diagnostics router builder
pub struct DiagnosticsRouter {
    status: SupervisorStatus,
    metrics_path: String,
}

impl DiagnosticsRouter {
    pub fn new(status: SupervisorStatus, metrics_path: impl Into<String>) -> Self {
        Self {
            status,
            metrics_path: metrics_path.into(),
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            .route(HEALTHZ_PATH, get(healthz))
            .route("/healthz/status", get(status))
            .route(&self.metrics_path, get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.status)
    }
}

#[derive(Serialize)]
struct StatusResponse {
    phase: String,
    running: i64,
}

/// 200 while every controller runs, 503 once the host is shutting down
async fn healthz(State(status): State<SupervisorStatus>) -> impl IntoResponse {
    if status.is_healthy() {
        (StatusCode::OK, "ok".to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, status.phase().to_string())
    }
}

async fn status(State(status): State<SupervisorStatus>) -> impl IntoResponse {
    Json(StatusResponse {
        phase: status.phase().to_string(),
        running: status.metrics().running(),
    })
}

async fn metrics(State(status): State<SupervisorStatus>) -> impl IntoResponse {
    match status.metrics().encode() {
        Ok((content_type, body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Diagnostics server with its listener already bound
pub struct DiagnosticsServer {
    listener: TcpListener,
    app: Router,
}

impl DiagnosticsServer {
    /// Bind `addr` (Go-style `:port` accepted) so a busy port fails before
    /// any controller is started
    pub async fn bind(addr: &str, metrics_path: &str, status: SupervisorStatus) -> Result<Self> {
        let addr = parse_listen_address(addr)?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::Configuration(format!("Failed to bind diagnostics server on {}: {}", addr, e))
        })?;
        info!("Diagnostics server listening on {}", addr);

        Ok(Self {
            listener,
            app: DiagnosticsRouter::new(status, metrics_path).build(),
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Diagnostics server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Diagnostics server error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::controlplane::metrics::HostMetrics;
    use crate::controlplane::registry::RegistryEntry;
    use crate::controlplane::supervisor::{Phase, Supervisor, SupervisorConfig};
    use crate::domain::ports::{controller_fn, ControllerContext};
    use assert_matches::assert_matches;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn idle_entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            controller: controller_fn(|ctx: ControllerContext| async move {
                ctx.cancelled().await;
                Ok::<(), Error>(())
            }),
        }
    }

    async fn get_path(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_follows_phase() {
        let mut sup = Supervisor::new(SupervisorConfig::default(), HostMetrics::new().unwrap());
        let status = sup.status();

        let (code, _) = get_path(DiagnosticsRouter::new(status.clone(), "/metrics").build(), HEALTHZ_PATH).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        sup.start(
            vec![idle_entry("attacher"), idle_entry("resizer")],
            Arc::new(Configuration::default()),
        )
        .unwrap();
        let (code, body) = get_path(DiagnosticsRouter::new(status.clone(), "/metrics").build(), HEALTHZ_PATH).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "ok");

        let (code, body) =
            get_path(DiagnosticsRouter::new(status.clone(), "/metrics").build(), "/healthz/status").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.contains("\"running\":2"));

        sup.cancellation_token().cancel();
        sup.wait().await;
        assert_eq!(status.phase(), Phase::Stopped);

        let (code, body) = get_path(DiagnosticsRouter::new(status, "/metrics").build(), HEALTHZ_PATH).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "stopped");
    }

    #[tokio::test]
    async fn test_metrics_path() {
        let metrics = HostMetrics::new().unwrap();
        metrics.controller_started("provisioner");
        let sup = Supervisor::new(SupervisorConfig::default(), metrics);

        let router = DiagnosticsRouter::new(sup.status(), "/custom/metrics").build();
        let (code, body) = get_path(router, "/custom/metrics").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.contains("csi_sidecars_controllers_running 1"));

        let router = DiagnosticsRouter::new(sup.status(), "/custom/metrics").build();
        let (code, _) = get_path(router, "/metrics").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let sup = Supervisor::new(SupervisorConfig::default(), HostMetrics::new().unwrap());
        let shutdown = CancellationToken::new();

        let server = DiagnosticsServer::bind("127.0.0.1:0", "/metrics", sup.status())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        let handle = tokio::spawn(server.serve(shutdown.clone()));
        shutdown.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_failures_are_configuration_errors() {
        let sup = Supervisor::new(SupervisorConfig::default(), HostMetrics::new().unwrap());
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = DiagnosticsServer::bind(&addr, "/metrics", sup.status())
            .await
            .err()
            .unwrap();
        assert_matches!(&err, Error::Configuration(msg) if msg.contains("Failed to bind"));
        assert!(err.is_startup_error());

        assert_matches!(
            DiagnosticsServer::bind("localhost:8080", "/metrics", sup.status()).await.err(),
            Some(Error::Configuration(_))
        );
    }
}
