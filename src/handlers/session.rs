use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::DbUser;
use crate::middleware::{JsonBody, RequireSession};
use crate::{GateError, router::GateState};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// POST /auth/login -> verifies credentials and returns a bearer token.
pub async fn login_handler(
    State(state): State<GateState>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, GateError> {
    let issued = state.gateway.login(&req.username, &req.password).await?;
    Ok(Json(LoginResponse {
        expires_at: issued.claims.expires_at(),
        token: issued.token,
        token_type: "Bearer",
    }))
}

/// GET /auth/me -> the caller's account, re-read from storage.
pub async fn me_handler(
    State(state): State<GateState>,
    session: RequireSession,
) -> Result<Json<DbUser>, GateError> {
    let user = state.gateway.session_user(&session.claims).await?;
    Ok(Json(user))
}

/// POST /auth/password -> replaces the caller's password.
pub async fn change_password_handler(
    State(state): State<GateState>,
    session: RequireSession,
    JsonBody(req): JsonBody<ChangePasswordRequest>,
) -> Result<StatusCode, GateError> {
    state
        .gateway
        .change_password_as(&session.claims, &req.current_password, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
