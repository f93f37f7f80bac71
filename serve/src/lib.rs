//! HTTP server for weft (axum).
//!
//! Webhook ingress with SSE streaming, authentication endpoints, agent and
//! RAG administration, and metrics reads — all over one shared
//! [`Container`](app::Container) assembled at startup.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`].

pub mod app;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod sanitize;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use app::Container;

const DEFAULT_ADDR: &str = "0.0.0.0:8000";

/// Serves the API on an existing listener. Tests bind `127.0.0.1:0` and
/// pass the listener in.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    container: Arc<Container>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");
    let router = app::router(container);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Binds `addr` (default `0.0.0.0:8000`) and serves until `shutdown`
/// resolves.
pub async fn run_serve(
    addr: Option<&str>,
    container: Arc<Container>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr.unwrap_or(DEFAULT_ADDR)).await?;
    run_serve_on_listener(listener, container, shutdown).await
}
