//! Health HTTP server (§4.9 ambient, §6 health probe contract). A minimal `axum` surface exposing
//! only `GET /health`; every other route is a typed 404. HTTP/1.0 clients get the connection
//! closed after the response the way `hyper` always does for 1.0 requests with no keep-alive.

use crate::http_handler::{health, not_found};

use axum::routing::get;
use axum::Router;
use common::HealthState;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

#[derive(Clone)]
pub struct HealthAppState {
    pub health: Arc<RwLock<HealthState>>,
}

pub struct HealthServer;

impl HealthServer {
    pub async fn start<F>(addr: SocketAddr, health: Arc<RwLock<HealthState>>, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = HealthAppState { health };
        let app = Router::new()
            .route("/health", get(health))
            .fallback(not_found)
            .with_state(state)
            .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
