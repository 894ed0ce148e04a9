use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppContext;

/// Public liveness report: the gadget launcher, the policy store, and the
/// server itself.
pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let gadget_framework = match ctx.gadgets.health_check().await {
        Ok(()) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {e}"),
    };

    // The admin role losing (system, manage) means the store is damaged.
    let rbac_status = match ctx.policy.enforce("role:admin", "system", "manage").await {
        Ok(true) => "healthy",
        Ok(false) => "unhealthy",
        Err(_) => "unhealthy",
    };
    let stats = ctx.policy.stats().await.ok();

    Json(json!({
        "server": "healthy",
        "gadget_framework": gadget_framework,
        "rbac": { "status": rbac_status, "stats": stats },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
