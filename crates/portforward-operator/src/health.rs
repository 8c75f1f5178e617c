//! Liveness and readiness HTTP endpoints for the kubelet.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RouterClient;

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the operator has completed startup.
    started: AtomicBool,
    router: Arc<dyn RouterClient>,
}

impl HealthState {
    pub fn new(router: Arc<dyn RouterClient>) -> Self {
        Self {
            started: AtomicBool::new(false),
            router,
        }
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the health check HTTP server until `cancel` fires.
///
/// The operator is marked as started only after the listener is bound.
pub async fn run_health_server(
    state: Arc<HealthState>,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    let listener = TcpListener::bind(listen_address(port)).await?;

    info!(port = port, "Health check server listening");
    state.mark_started();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// The kubelet connects to the pod IP from the node, so listen on every interface
fn listen_address(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Liveness: 200 while the process is alive.
async fn healthz() -> StatusCode {
    debug!("Liveness check: OK");
    StatusCode::OK
}

/// Readiness: 200 once started and the router reports ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness check: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.router.check_readiness().await {
        Ok(true) => {
            debug!("Readiness check: OK");
            StatusCode::OK
        }
        Ok(false) => {
            debug!("Readiness check: NOT READY (router not ready)");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness check: NOT READY (router unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockRouterClient, RouterError};

    fn state(router: MockRouterClient) -> Arc<HealthState> {
        Arc::new(HealthState::new(Arc::new(router)))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_before_startup() {
        let mut router = MockRouterClient::new();
        router.expect_check_readiness().never();

        let result = readyz(State(state(router))).await;
        assert_eq!(result, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_ok_when_router_ready() {
        let mut router = MockRouterClient::new();
        router.expect_check_readiness().returning(|| Ok(true));

        let state = state(router);
        state.mark_started();
        assert_eq!(readyz(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_when_router_not_ready() {
        let mut router = MockRouterClient::new();
        router.expect_check_readiness().returning(|| Ok(false));

        let state = state(router);
        state.mark_started();
        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_when_router_unreachable() {
        let mut router = MockRouterClient::new();
        router
            .expect_check_readiness()
            .returning(|| Err(RouterError::NotFound("portforward".to_string())));

        let state = state(router);
        state.mark_started();
        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_listens_on_all_interfaces() {
        let addr = listen_address(DEFAULT_HEALTH_PORT);
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 8081);
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let state = state(MockRouterClient::new());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_health_server(state.clone(), 0, cancel.clone()));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !state.is_started() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
