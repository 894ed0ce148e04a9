//! Gadget routes: catalog, info, and supervised execution.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::auth::Claims;
use crate::gadgets::{is_system_gadget, is_valid_gadget_name};
use crate::rest::middleware::{error_response, permission_gate, role_gate, RequestId};
use crate::AppContext;

pub fn router(ctx: &Arc<AppContext>) -> Router<Arc<AppContext>> {
    let catalog = Router::new()
        .route("/api/gadgets", get(list))
        .route("/api/gadgets/:name/info", get(info))
        .route_layer(from_fn_with_state(
            (ctx.clone(), &["user", "admin"] as &[&str]),
            role_gate,
        ));
    let execute = Router::new()
        .route("/api/gadgets/:name/execute", post(execute))
        .route_layer(from_fn_with_state(
            (ctx.clone(), "gadgets", "execute"),
            permission_gate,
        ));
    catalog.merge(execute)
}

async fn list(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.gadgets.list().await {
        Ok(gadgets) => Json(json!({
            "gadgets": gadgets,
            "count": gadgets.len(),
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "gadget.list.error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to list gadgets", "details": e.to_string() }),
            )
        }
    }
}

async fn info(State(ctx): State<Arc<AppContext>>, Path(name): Path<String>) -> Response {
    if !is_valid_gadget_name(&name) {
        return error_response(StatusCode::BAD_REQUEST, json!({ "error": "invalid gadget name" }));
    }

    match ctx.gadgets.info(&name).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "gadget not found or failed to get info",
                "gadget": name,
                "details": e.to_string(),
            }),
        ),
    }
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    #[allow(dead_code)]
    pub gadget_name: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

async fn execute(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    if !is_valid_gadget_name(&name) {
        return error_response(StatusCode::BAD_REQUEST, json!({ "error": "invalid gadget name" }));
    }
    let Ok(Json(req)) = body else {
        return error_response(StatusCode::BAD_REQUEST, json!({ "error": "invalid request body" }));
    };

    // System-classified gadgets need (system, manage) on top of the route's
    // (gadgets, execute) gate.
    if is_system_gadget(&name) {
        let allowed = ctx
            .policy
            .check_user_permission(&claims.sub, &claims.roles, "system", "manage")
            .await
            .unwrap_or(false);
        if !allowed {
            return error_response(
                StatusCode::FORBIDDEN,
                json!({
                    "error": "system gadgets require admin permissions",
                    "gadget": name,
                }),
            );
        }
    }

    match ctx
        .gadgets
        .execute(&name, &req.args, &claims.username, &request_id.0)
        .await
    {
        Ok(result) if result.success => Json(result).into_response(),
        Ok(result) => (StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}
