//! MCP peer routes, all gated on the `(ai, access)` permission.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::rest::middleware::{error_response, permission_gate};
use crate::AppContext;

pub fn router(ctx: &Arc<AppContext>) -> Router<Arc<AppContext>> {
    Router::new()
        .route("/api/mcp/servers", get(servers))
        .route("/api/mcp/servers/:name/connect", post(connect))
        .route("/api/mcp/servers/:name", delete(disconnect))
        .route("/api/mcp/resources", get(resources))
        .route("/api/mcp/tools/:server/:tool", post(call_tool))
        .route_layer(from_fn_with_state((ctx.clone(), "ai", "access"), permission_gate))
}

async fn servers(State(ctx): State<Arc<AppContext>>) -> Response {
    let configs = ctx.peers.peer_configs().await;
    let status = ctx.peers.status().await;
    Json(json!({ "configs": configs, "status": status })).into_response()
}

async fn connect(State(ctx): State<Arc<AppContext>>, Path(name): Path<String>) -> Response {
    match ctx.peers.connect(&name).await {
        Ok(()) => Json(json!({ "message": format!("connected to {name}") })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

async fn disconnect(State(ctx): State<Arc<AppContext>>, Path(name): Path<String>) -> Response {
    match ctx.peers.disconnect(&name).await {
        Ok(()) => Json(json!({ "message": format!("disconnected from {name}") })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

async fn resources(State(ctx): State<Arc<AppContext>>) -> Response {
    let resources = ctx.peers.list_resources().await;
    Json(json!({ "resources": resources })).into_response()
}

async fn call_tool(
    State(ctx): State<Arc<AppContext>>,
    Path((server, tool)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Response {
    let arguments = body.map(|Json(v)| v).unwrap_or(Value::Null);

    match ctx.peers.call_tool(&server, &tool, arguments).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}
