use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::db::DbUser;
use crate::pool::PoolStatus;
use crate::middleware::{JsonBody, RequireAdmin};
use crate::{GateError, router::GateState};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub kid: String,
}

/// POST /admin/users -> creates an account.
pub async fn register_handler(
    State(state): State<GateState>,
    RequireAdmin(session): RequireAdmin,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<DbUser>), GateError> {
    let user = state
        .gateway
        .register_as(&session.claims, &req.username, &req.password, req.role)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /admin/keys/rotate -> switches to a fresh signing key.
pub async fn rotate_key_handler(
    State(state): State<GateState>,
    RequireAdmin(session): RequireAdmin,
) -> Result<Json<RotateResponse>, GateError> {
    let kid = state.gateway.rotate_signing_key_as(&session.claims)?;
    Ok(Json(RotateResponse { kid }))
}

/// GET /admin/pool -> point-in-time pool occupancy.
pub async fn pool_status_handler(
    State(state): State<GateState>,
    _admin: RequireAdmin,
) -> Result<Json<PoolStatus>, GateError> {
    let status = state.gateway.pool().status().await?;
    Ok(Json(status))
}
