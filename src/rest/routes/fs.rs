//! Sandboxed filesystem routes.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::Claims;
use crate::rest::middleware::{error_response, permission_gate};
use crate::AppContext;

pub fn router(ctx: &Arc<AppContext>) -> Router<Arc<AppContext>> {
    let read = Router::new()
        .route("/api/fs/list", get(list))
        .route("/api/fs/read", get(read))
        .route_layer(from_fn_with_state(
            (ctx.clone(), "filesystem", "read"),
            permission_gate,
        ));
    let write = Router::new()
        .route("/api/fs/write", post(write))
        .route_layer(from_fn_with_state(
            (ctx.clone(), "filesystem", "write"),
            permission_gate,
        ));
    read.merge(write)
}

#[derive(Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
}

async fn read(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PathQuery>,
) -> Response {
    let Some(path) = query.path else {
        return error_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": "path parameter required" }),
        );
    };

    match ctx.safefs.read(&path, &claims.username).await {
        Ok(data) => Json(json!({
            "path": path,
            "content": String::from_utf8_lossy(&data),
            "size": data.len(),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

async fn list(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PathQuery>,
) -> Response {
    let path = query.path.unwrap_or_else(|| "/tmp".to_string());

    match ctx.safefs.list(&path, &claims.username).await {
        Ok(files) => Json(json!({
            "path": path,
            "files": files,
            "count": files.len(),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

#[derive(Deserialize)]
pub struct WriteRequest {
    pub path: String,
    pub content: String,
}

async fn write(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<WriteRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return error_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": "path and content are required" }),
        );
    };

    match ctx
        .safefs
        .write(&req.path, &claims.username, req.content.as_bytes(), 0o644)
        .await
    {
        Ok(()) => Json(json!({
            "message": "file written successfully",
            "path": req.path,
            "size": req.content.len(),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}
