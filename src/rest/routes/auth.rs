//! Login and refresh.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::Claims;
use crate::rest::middleware::error_response;
use crate::AppContext;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Validate credentials against the configured user table and mint a token.
pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return error_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": "username and password are required" }),
        );
    };

    let Some(roles) = ctx.config.users.authenticate(&req.username, &req.password) else {
        warn!(user = %req.username, "auth.login.fail");
        return error_response(
            StatusCode::UNAUTHORIZED,
            json!({ "error": "invalid credentials" }),
        );
    };

    match ctx.tokens.mint(&req.username, &req.username, roles.clone()) {
        Ok(token) => {
            info!(user = %req.username, "auth.login.ok");
            Json(json!({
                "token": token,
                "username": req.username,
                "roles": roles,
            }))
            .into_response()
        }
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "failed to generate token" }),
        ),
    }
}

/// Mint a fresh token for an already-verified identity.
pub async fn refresh(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
) -> Response {
    match ctx.tokens.mint(&claims.sub, &claims.username, claims.roles.clone()) {
        Ok(token) => {
            info!(user = %claims.username, "auth.refresh.ok");
            Json(json!({
                "token": token,
                "username": claims.username,
                "roles": claims.roles,
            }))
            .into_response()
        }
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "failed to refresh token" }),
        ),
    }
}
