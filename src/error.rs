use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::Error as SqlxError;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::error;

/// Failures of the connection pool.
#[derive(Debug, Clone, ThisError)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    #[error("connection lease exceeded its maximum duration and was reclaimed")]
    LeaseExpired,

    #[error("failed to open database connection: {0}")]
    Connect(String),

    #[error("pool startup probe failed: {0}")]
    Startup(String),

    #[error("connection pool is closed")]
    Closed,
}

/// Reasons a bearer token is rejected (or cannot be minted).
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum TokenError {
    #[error("token signature is invalid")]
    BadSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is malformed")]
    Malformed,

    #[error("signing key must be at least {0} bytes")]
    WeakKey(usize),

    #[error("failed to encode token: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, ThisError)]
pub enum PasswordError {
    /// Stored hash is corrupt or uses an unsupported scheme. Data-integrity fault.
    #[error("stored password hash is malformed: {0}")]
    HashFormat(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, ThisError)]
pub enum GateError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("insufficient role for this operation")]
    Forbidden,

    #[error("username already exists")]
    UsernameTaken,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("password error: {0}")]
    Password(#[from] PasswordError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] SqlxError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, GateError::Pool(PoolError::Timeout(_)))
    }

    pub fn is_lease_expired(&self) -> bool {
        matches!(self, GateError::Pool(PoolError::LeaseExpired))
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match &self {
            GateError::AuthenticationFailed => (
                StatusCode::UNAUTHORIZED,
                "AUTHENTICATION_FAILED",
                "Invalid username or password.",
            ),
            // One message for every sub-reason; the detail only goes to logs.
            GateError::InvalidToken(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "Missing, invalid or expired token.",
            ),
            GateError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Insufficient permissions for this operation.",
            ),
            GateError::UsernameTaken => (
                StatusCode::CONFLICT,
                "USERNAME_TAKEN",
                "Username already exists.",
            ),
            GateError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "The request is invalid.",
            ),
            GateError::Pool(PoolError::Timeout(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "POOL_EXHAUSTED",
                "Server is busy, retry later.",
            ),
            GateError::Pool(PoolError::LeaseExpired) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "LEASE_EXPIRED",
                "The operation took too long and was aborted.",
            ),
            GateError::Pool(_)
            | GateError::Password(_)
            | GateError::DatabaseError(_)
            | GateError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal server error occurred.",
            ),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed with an internal error");
        }

        let message = match self {
            GateError::Validation(detail) => detail,
            _ => message.to_string(),
        };

        let body = ApiErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(ApiErrorResponse { error: body })).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: GateError) -> (StatusCode, String) {
        let resp = err.into_response();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn token_sub_reasons_share_one_response() {
        let expired = render(TokenError::Expired.into()).await;
        let forged = render(TokenError::BadSignature.into()).await;
        let malformed = render(TokenError::Malformed.into()).await;
        assert_eq!(expired, forged);
        assert_eq!(forged, malformed);
        assert_eq!(expired.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn hash_format_fault_is_opaque() {
        let (status, body) =
            render(PasswordError::HashFormat("bad salt".to_string()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains("salt"));
    }

    #[tokio::test]
    async fn pool_timeout_is_backpressure() {
        let (status, body) =
            render(PoolError::Timeout(Duration::from_millis(100)).into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("POOL_EXHAUSTED"));
    }

    #[test]
    fn error_predicates() {
        assert!(GateError::from(PoolError::Timeout(Duration::ZERO)).is_pool_timeout());
        assert!(GateError::from(PoolError::LeaseExpired).is_lease_expired());
        assert!(!GateError::AuthenticationFailed.is_pool_timeout());
    }
}
