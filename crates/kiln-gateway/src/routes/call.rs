//! One-shot call endpoints and health.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value as JsonValue, json};

use super::present;
use crate::error::ErrorEnvelope;
use crate::extract::{Identity, SCOPE_ADMIN, SCOPE_CALL};
use crate::state::AppState;

/// `POST /call/{app}/{version}/{method}` — body is the JSON args value.
pub async fn call_app(
    State(state): State<AppState>,
    Path((app, version, method)): Path<(String, String, String)>,
    identity: Identity,
    Json(args): Json<JsonValue>,
) -> Result<Json<JsonValue>, ErrorEnvelope> {
    identity.require_scope(SCOPE_CALL)?;
    let env = identity.env(&app, &version);
    let result = state
        .engine
        .call_app(&app, &version, &method, args, env)
        .await?;
    Ok(Json(present(result)))
}

/// `POST /server/{gamespace}/{method}` — one-shot against the gamespace's
/// server-code build.
pub async fn call_server(
    State(state): State<AppState>,
    Path((gamespace, method)): Path<(String, String)>,
    identity: Identity,
    Json(args): Json<JsonValue>,
) -> Result<Json<JsonValue>, ErrorEnvelope> {
    identity.require_scope(SCOPE_ADMIN)?;
    if identity.gamespace != gamespace {
        return Err(ErrorEnvelope::new(403, "Gamespace mismatch"));
    }
    let env = identity.server_env();
    let result = state
        .engine
        .call_server(&gamespace, &method, args, env)
        .await?;
    Ok(Json(present(result)))
}

/// `GET /healthz` — liveness and engine counters.
pub async fn healthz(State(state): State<AppState>) -> Json<JsonValue> {
    let stats = state.engine.stats().snapshot();
    Json(json!({
        "status": "ok",
        "workers": state.engine.pool_size(),
        "builds": state.engine.build_cache().len(),
        "stats": stats,
    }))
}
