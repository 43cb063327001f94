use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::gateway::SessionGateway;
use crate::handlers::admin::{pool_status_handler, register_handler, rotate_key_handler};
use crate::handlers::session::{change_password_handler, login_handler, me_handler};

#[derive(Clone)]
pub struct GateState {
    pub gateway: Arc<SessionGateway>,
}

impl GateState {
    pub fn new(gateway: Arc<SessionGateway>) -> Self {
        Self { gateway }
    }
}

/// Bearer transport over the session gateway.
///
/// - POST /auth/login
/// - GET /auth/me
/// - POST /auth/password
/// - POST /admin/users
/// - POST /admin/keys/rotate
/// - GET /admin/pool
pub fn gate_router(state: GateState) -> Router {
    Router::new()
        .route("/auth/login", post(login_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/password", post(change_password_handler))
        .route("/admin/users", post(register_handler))
        .route("/admin/keys/rotate", post(rotate_key_handler))
        .route("/admin/pool", get(pool_status_handler))
        .with_state(state)
}
