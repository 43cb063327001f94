use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::Authorization;
use headers::authorization::Bearer;

use crate::auth::{Role, SessionClaims};
use crate::error::{GateError, TokenError};
use crate::router::GateState;

/// A request carrying a valid `Authorization: Bearer <token>` header.
///
/// The token is checked once here; handlers hand the claims to the
/// gateway's claims-taking operations.
#[derive(Debug, Clone)]
pub struct RequireSession {
    pub claims: SessionClaims,
}

impl FromRequestParts<GateState> for RequireSession {
    type Rejection = GateError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GateState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| GateError::InvalidToken(TokenError::Malformed))?;

        let claims = state.gateway.authenticate(bearer.token())?;
        Ok(Self { claims })
    }
}

/// Like `RequireSession`, additionally requiring the admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub RequireSession);

impl FromRequestParts<GateState> for RequireAdmin {
    type Rejection = GateError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GateState,
    ) -> Result<Self, Self::Rejection> {
        let session = RequireSession::from_request_parts(parts, state).await?;
        state.gateway.require_role(&session.claims, Role::Admin)?;
        Ok(Self(session))
    }
}
