//! HTTP surface.
//!
//! Axum server exposing the public health and login endpoints plus the
//! token-protected API: RBAC management, sandboxed filesystem access,
//! gadget execution, and MCP peer operations.
//!
//! Middleware order is fixed: correlation id → access log → CORS →
//! (protected routes) token verification → per-route permission/role gate.
//! Everything after the correlation id runs route-internally, so the
//! access log carries the matched route template and covers CORS
//! preflights and recovered panics.

pub mod middleware;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let public = Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/auth/login", post(routes::auth::login));

    let protected = Router::new()
        .route("/api/auth/refresh", post(routes::auth::refresh))
        .merge(crate::rbac::api::router(&ctx))
        .merge(routes::fs::router(&ctx))
        .merge(routes::gadgets::router(&ctx))
        .merge(routes::mcp::router(&ctx))
        .route_layer(from_fn_with_state(ctx.clone(), middleware::require_auth));

    // Correlation id is the only top-level layer: it must stamp every
    // request before routing. The rest run route-internally so the access
    // log sees the matched route template and still records short-circuited
    // CORS preflights and recovered panics.
    Router::new()
        .merge(public)
        .merge(protected)
        .route_layer(CatchPanicLayer::custom(handle_panic))
        .route_layer(from_fn(middleware::cors))
        .route_layer(from_fn(middleware::access_log))
        .layer(from_fn(middleware::request_id))
        .with_state(ctx)
}

/// Top-level recover: full detail goes to the log, the client sees only a
/// generic internal error.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::http::Response<axum::body::Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "handler panicked");

    axum::http::Response::builder()
        .status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(r#"{"error":"internal"}"#))
        .expect("static response")
}

/// Bind and serve until shutdown.
pub async fn serve(ctx: Arc<AppContext>, addr: SocketAddr) -> Result<()> {
    let router = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
