//! HTTP middleware pipeline.
//!
//! Fixed order: correlation id (every request, before routing), then on
//! matched routes the access log, CORS, and — for protected routes —
//! token verification and the permission or role gate declared by the
//! route.  The access log runs route-internally so the matched route
//! template is available to it.  Authorization is a pure function of the
//! identity, the route policy, and the policy store snapshot; nothing in
//! this pipeline mutates state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{extract_token, Claims};
use crate::AppContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id carried in request extensions and echoed on the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Build a uniform JSON error response.
pub fn error_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

// ─── Correlation id ───────────────────────────────────────────────────────────

pub async fn request_id(mut req: Request, next: Next) -> Response {
    let rid = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(rid.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// ─── Access log ───────────────────────────────────────────────────────────────

pub async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_default();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    info!(
        request_id,
        method = %method,
        path,
        route,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        client_ip,
        user_agent,
        "http request"
    );
    response
}

// ─── CORS ─────────────────────────────────────────────────────────────────────

pub async fn cors(req: Request, next: Next) -> Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Origin, Content-Type, Authorization"),
    );
    response
}

// ─── Authentication ───────────────────────────────────────────────────────────

/// Verify the bearer token and bind the identity to the request.
///
/// A missing token and an invalid one both answer 401, but with distinct
/// log reasons.
pub async fn require_auth(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let query_token = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("token=")));

    let Some(token) = extract_token(auth_header, query_token) else {
        warn!(path = req.uri().path(), "auth.missing");
        return error_response(
            StatusCode::UNAUTHORIZED,
            json!({ "error": "missing authorization token" }),
        );
    };

    match ctx.tokens.verify(&token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => {
            warn!(path = req.uri().path(), error = %e, "auth.invalid");
            error_response(StatusCode::UNAUTHORIZED, json!({ "error": e.to_string() }))
        }
    }
}

// ─── Permission gate ──────────────────────────────────────────────────────────

/// State for [`permission_gate`]: the app context plus the required
/// `(object, action)` pair.
pub type PermissionGateState = (Arc<AppContext>, &'static str, &'static str);

/// Require `(object, action)`: a direct user rule, or a `role:<r>` rule for
/// any of the identity's roles.
pub async fn permission_gate(
    State((ctx, object, action)): State<PermissionGateState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(claims) = req.extensions().get::<Claims>().cloned() else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            json!({ "error": "authentication required" }),
        );
    };

    match ctx
        .policy
        .check_user_permission(&claims.sub, &claims.roles, object, action)
        .await
    {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            warn!(
                path = req.uri().path(),
                user = %claims.username,
                object,
                action,
                "rbac.denied"
            );
            error_response(
                StatusCode::FORBIDDEN,
                json!({
                    "error": "insufficient permissions",
                    "required": { "object": object, "action": action },
                }),
            )
        }
        Err(e) => {
            error!(user = %claims.username, object, action, error = %e, "rbac.error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "permission check failed" }),
            )
        }
    }
}

// ─── Role gate ────────────────────────────────────────────────────────────────

/// State for [`role_gate`]: the app context plus the accepted role names.
pub type RoleGateState = (Arc<AppContext>, &'static [&'static str]);

/// Require membership (via the policy store's grants) in any of `roles`.
pub async fn role_gate(
    State((ctx, roles)): State<RoleGateState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(claims) = req.extensions().get::<Claims>().cloned() else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            json!({ "error": "authentication required" }),
        );
    };

    for role in roles {
        match ctx.policy.has_role(&claims.sub, role).await {
            Ok(true) => return next.run(req).await,
            Ok(false) => continue,
            Err(e) => {
                error!(user = %claims.username, role, error = %e, "rbac.error");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "role check failed" }),
                );
            }
        }
    }

    warn!(
        path = req.uri().path(),
        user = %claims.username,
        required_roles = ?roles,
        "rbac.denied"
    );
    error_response(
        StatusCode::FORBIDDEN,
        json!({
            "error": "insufficient role",
            "required_roles": roles,
            "user_roles": claims.roles,
        }),
    )
}
