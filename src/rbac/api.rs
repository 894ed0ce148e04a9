//! RBAC management endpoints under `/api/rbac`.
//!
//! User, role, and permission administration is admin-only; `/me` routes are
//! open to any authenticated identity.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::auth::Claims;
use crate::rest::middleware::{error_response, role_gate};
use crate::AppContext;

pub fn router(ctx: &Arc<AppContext>) -> Router<Arc<AppContext>> {
    let admin = Router::new()
        .route("/api/rbac/users", get(all_users).post(create_user_grant))
        .route("/api/rbac/users/:username", get(get_user).delete(delete_user))
        .route("/api/rbac/users/:username/roles", post(assign_role))
        .route("/api/rbac/users/:username/roles/:role", delete(remove_role))
        .route("/api/rbac/users/:username/permissions", get(user_permissions))
        .route("/api/rbac/roles", get(all_roles))
        .route("/api/rbac/roles/:role", get(get_role))
        .route(
            "/api/rbac/roles/:role/permissions",
            post(add_role_permission).delete(remove_role_permission),
        )
        .route(
            "/api/rbac/permissions",
            post(add_permission).delete(remove_permission),
        )
        .route("/api/rbac/stats", get(stats))
        .route_layer(from_fn_with_state(
            (ctx.clone(), &["admin"] as &[&str]),
            role_gate,
        ));

    let me = Router::new()
        .route("/api/rbac/me", get(current_user))
        .route("/api/rbac/me/permissions", get(current_user_permissions));

    admin.merge(me)
}

// ─── Request bodies ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GrantRequest {
    username: String,
    role: String,
}

#[derive(Deserialize)]
struct AssignRoleRequest {
    role: String,
}

#[derive(Deserialize)]
struct PermissionRequest {
    subject: String,
    object: String,
    action: String,
}

#[derive(Deserialize)]
struct RolePermissionRequest {
    object: String,
    action: String,
}

fn bad_body() -> Response {
    error_response(StatusCode::BAD_REQUEST, json!({ "error": "invalid request body" }))
}

// ─── Users ────────────────────────────────────────────────────────────────────

async fn all_users(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.policy.all_users().await {
        Ok(users) => Json(json!({ "users": users, "count": users.len() })).into_response(),
        Err(e) => {
            error!(error = %e, "rbac.users.error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get users" }),
            )
        }
    }
}

async fn create_user_grant(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else { return bad_body() };

    match ctx.policy.grant(&req.username, &req.role).await {
        Ok(()) => {
            info!(actor = %claims.username, target = %req.username, role = %req.role, "rbac.assign.ok");
            Json(json!({
                "message": "role assigned successfully",
                "user": req.username,
                "role": req.role,
            }))
            .into_response()
        }
        Err(e) => {
            error!(actor = %claims.username, target = %req.username, role = %req.role, error = %e, "rbac.assign.error");
            error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
        }
    }
}

async fn get_user(State(ctx): State<Arc<AppContext>>, Path(username): Path<String>) -> Response {
    let roles = match ctx.policy.roles_of(&username).await {
        Ok(roles) => roles,
        Err(e) => {
            error!(error = %e, "rbac.user.error");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get user roles" }),
            );
        }
    };

    let mut permissions = Vec::new();
    for role in &roles {
        if let Ok(rules) = ctx.policy.rules_of_role(role).await {
            permissions.extend(rules.iter().map(|p| format!("{}:{}", p.object, p.action)));
        }
    }

    Json(json!({
        "id": username,
        "username": username,
        "roles": roles,
        "permissions": permissions,
    }))
    .into_response()
}

async fn delete_user(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    Path(username): Path<String>,
) -> Response {
    let roles = match ctx.policy.roles_of(&username).await {
        Ok(roles) if !roles.is_empty() => roles,
        Ok(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("user {username} has no roles") }),
            )
        }
        Err(e) => {
            error!(error = %e, "rbac.user.error");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get user roles" }),
            );
        }
    };

    for role in &roles {
        if let Err(e) = ctx.policy.revoke(&username, role).await {
            return error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }));
        }
    }
    info!(actor = %claims.username, target = %username, "rbac.user.removed");
    Json(json!({ "message": "user roles removed", "user": username })).into_response()
}

async fn assign_role(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    Path(username): Path<String>,
    body: Result<Json<AssignRoleRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else { return bad_body() };

    match ctx.policy.grant(&username, &req.role).await {
        Ok(()) => {
            info!(actor = %claims.username, target = %username, role = %req.role, "rbac.assign.ok");
            Json(json!({
                "message": "role assigned successfully",
                "user": username,
                "role": req.role,
            }))
            .into_response()
        }
        Err(e) => {
            error!(actor = %claims.username, target = %username, role = %req.role, error = %e, "rbac.assign.error");
            error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
        }
    }
}

async fn remove_role(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
    Path((username, role)): Path<(String, String)>,
) -> Response {
    match ctx.policy.revoke(&username, &role).await {
        Ok(()) => {
            info!(actor = %claims.username, target = %username, role = %role, "rbac.remove.ok");
            Json(json!({
                "message": "role removed successfully",
                "user": username,
                "role": role,
            }))
            .into_response()
        }
        Err(e) => {
            error!(actor = %claims.username, target = %username, role = %role, error = %e, "rbac.remove.error");
            error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
        }
    }
}

async fn user_permissions(
    State(ctx): State<Arc<AppContext>>,
    Path(username): Path<String>,
) -> Response {
    let roles = match ctx.policy.roles_of(&username).await {
        Ok(roles) => roles,
        Err(e) => {
            error!(error = %e, "rbac.user.error");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get user roles" }),
            );
        }
    };

    let mut permissions = Vec::new();
    for role in &roles {
        if let Ok(rules) = ctx.policy.rules_of_role(role).await {
            permissions.extend(rules);
        }
    }

    Json(json!({
        "user": username,
        "permissions": permissions,
        "count": permissions.len(),
    }))
    .into_response()
}

// ─── Roles ────────────────────────────────────────────────────────────────────

async fn all_roles(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.policy.all_roles().await {
        Ok(roles) => Json(json!({ "roles": roles, "count": roles.len() })).into_response(),
        Err(e) => {
            error!(error = %e, "rbac.roles.error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get roles" }),
            )
        }
    }
}

async fn get_role(State(ctx): State<Arc<AppContext>>, Path(role): Path<String>) -> Response {
    match ctx.policy.rules_of_role(&role).await {
        Ok(rules) => {
            let permissions: Vec<String> = rules
                .iter()
                .map(|p| format!("{}:{}", p.object, p.action))
                .collect();
            Json(json!({
                "name": role,
                "description": crate::rbac::store::role_description_of(&role),
                "permissions": permissions,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "rbac.role.error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get role permissions" }),
            )
        }
    }
}

async fn add_role_permission(
    State(ctx): State<Arc<AppContext>>,
    Path(role): Path<String>,
    body: Result<Json<RolePermissionRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else { return bad_body() };

    let subject = format!("{}{role}", crate::rbac::ROLE_PREFIX);
    match ctx.policy.add_rule(&subject, &req.object, &req.action).await {
        Ok(()) => Json(json!({
            "message": "permission added to role successfully",
            "role": role,
            "object": req.object,
            "action": req.action,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

async fn remove_role_permission(
    State(ctx): State<Arc<AppContext>>,
    Path(role): Path<String>,
    body: Result<Json<RolePermissionRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else { return bad_body() };

    let subject = format!("{}{role}", crate::rbac::ROLE_PREFIX);
    match ctx.policy.remove_rule(&subject, &req.object, &req.action).await {
        Ok(()) => Json(json!({
            "message": "permission removed from role successfully",
            "role": role,
            "object": req.object,
            "action": req.action,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

// ─── Permissions ──────────────────────────────────────────────────────────────

async fn add_permission(
    State(ctx): State<Arc<AppContext>>,
    body: Result<Json<PermissionRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else { return bad_body() };

    match ctx.policy.add_rule(&req.subject, &req.object, &req.action).await {
        Ok(()) => Json(json!({
            "message": "permission added successfully",
            "subject": req.subject,
            "object": req.object,
            "action": req.action,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

async fn remove_permission(
    State(ctx): State<Arc<AppContext>>,
    body: Result<Json<PermissionRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else { return bad_body() };

    match ctx.policy.remove_rule(&req.subject, &req.object, &req.action).await {
        Ok(()) => Json(json!({
            "message": "permission removed successfully",
            "subject": req.subject,
            "object": req.object,
            "action": req.action,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    }
}

// ─── Current user ─────────────────────────────────────────────────────────────

async fn current_user(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
) -> Response {
    let granted = ctx.policy.roles_of(&claims.sub).await.unwrap_or_default();
    // Durable grants take precedence; fall back to the token's roles.
    let roles = if granted.is_empty() { claims.roles.clone() } else { granted };
    Json(json!({
        "id": claims.sub,
        "username": claims.username,
        "roles": roles,
    }))
    .into_response()
}

async fn current_user_permissions(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<Claims>,
) -> Response {
    let mut roles = ctx.policy.roles_of(&claims.sub).await.unwrap_or_default();
    for role in &claims.roles {
        if !roles.contains(role) {
            roles.push(role.clone());
        }
    }

    let mut permissions = Vec::new();
    for role in &roles {
        if let Ok(rules) = ctx.policy.rules_of_role(role).await {
            permissions.extend(rules);
        }
    }

    Json(json!({
        "user": claims.username,
        "permissions": permissions,
        "count": permissions.len(),
    }))
    .into_response()
}

// ─── Stats ────────────────────────────────────────────────────────────────────

async fn stats(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.policy.stats().await {
        Ok(stats) => Json(json!({ "stats": stats })).into_response(),
        Err(e) => {
            error!(error = %e, "rbac.stats.error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to get stats" }),
            )
        }
    }
}
