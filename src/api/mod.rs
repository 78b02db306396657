//! HTTP endpoints served while a machine runs.
//!
//! Two small routers live here:
//! - the control plane, bound for the lifetime of `start`, answering
//!   `GET /version` so the supervising parent can tell we are up
//! - the command proxy, a separate process forwarding `POST /exec` to the
//!   guest over SSH
//!
//! ```bash
//! curl http://127.0.0.1:38271/version
//! curl -X POST http://127.0.0.1:38271/exec \
//!   -H "Content-Type: application/json" \
//!   -d '{"command": "uname -a"}'
//! ```

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::error::{Error, Result};
use crate::ssh::SshTarget;

/// Upper bound on any request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// State of the command proxy.
#[derive(Debug, Clone)]
pub struct ProxyState {
    /// Machine the commands run in.
    pub machine: String,
    /// SSH endpoint of that machine.
    pub target: SshTarget,
    /// Used when a request carries no timeout.
    pub default_timeout: Duration,
}

/// Router for the control plane.
pub fn control_router() -> Router {
    Router::new()
        .route("/version", get(handlers::version::version))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

/// Router for the command proxy.
pub fn cmd_proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/version", get(handlers::version::version))
        .route("/exec", post(handlers::exec::exec_command))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` for a router.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::network(format!("bind {}", addr), e.to_string()))
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovm_protocol::VersionInfo;

    #[tokio::test]
    async fn test_control_plane_version() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, control_router(), async {
            let _ = rx.await;
        }));

        let info: VersionInfo = reqwest::get(format!("http://{}/version", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info.version, crate::VERSION);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
