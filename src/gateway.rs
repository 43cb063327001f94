//! Session gateway: login, bearer validation and authenticated units of work.
//!
//! Token checks are pure CPU work and never touch the pool. A connection is
//! leased only after a token validates, and only for the database part of
//! an operation; password hashing always runs on the blocking pool with no
//! connection held.

use crate::auth::{IssuedToken, PasswordHasher, Role, SessionClaims, TokenService, TokenSubject};
use crate::config::PoolConfig;
use crate::db::{DbUser, UserStorage};
use crate::error::{GateError, PasswordError, PoolError};
use crate::pool::{Pool, SqliteManager};
use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_USERNAME_LEN: usize = 64;

pub struct SessionGateway {
    pool: Pool<SqliteManager>,
    hasher: Arc<PasswordHasher>,
    tokens: TokenService,
    max_lease: Duration,
    /// Verified against when the username is unknown, so both login
    /// failures cost one full hash.
    dummy_hash: String,
}

impl SessionGateway {
    pub fn new(
        pool: Pool<SqliteManager>,
        hasher: PasswordHasher,
        tokens: TokenService,
        config: &PoolConfig,
    ) -> Result<Self, GateError> {
        let dummy_hash = hasher.hash("session-gateway-placeholder")?;
        Ok(Self {
            pool,
            hasher: Arc::new(hasher),
            tokens,
            max_lease: config.max_lease(),
            dummy_hash,
        })
    }

    pub fn pool(&self) -> &Pool<SqliteManager> {
        &self.pool
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Apply the bundled DDL on one pooled connection.
    pub async fn prepare_schema(&self) -> Result<(), GateError> {
        let mut lease = self.pool.acquire().await?;
        UserStorage::init_schema(lease.conn_mut()?).await?;
        lease.release();
        Ok(())
    }

    /// Verify credentials and mint a token.
    ///
    /// Unknown username and wrong password both yield
    /// `GateError::AuthenticationFailed`.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedToken, GateError> {
        let user = {
            let mut lease = self.pool.acquire().await?;
            let found = UserStorage::find_by_username(lease.conn_mut()?, username).await;
            lease.release();
            found?
        };

        let stored = user
            .as_ref()
            .map(|u| u.password_hash.clone())
            .unwrap_or_else(|| self.dummy_hash.clone());
        let verdict = self.verify_blocking(password, stored).await?;

        let Some(user) = user else {
            debug!(username = %username, "login for unknown user");
            return Err(GateError::AuthenticationFailed);
        };
        match verdict {
            Ok(true) => {}
            Ok(false) => {
                debug!(user_id = user.id, "login with wrong password");
                return Err(GateError::AuthenticationFailed);
            }
            Err(PasswordError::HashFormat(detail)) => {
                error!(user_id = user.id, detail = %detail, "stored password hash is unreadable");
                return Err(GateError::AuthenticationFailed);
            }
            Err(e) => return Err(e.into()),
        }

        let issued = self.tokens.issue(&TokenSubject::from(&user), Utc::now())?;
        info!(user_id = user.id, role = %user.role, "session token issued");
        Ok(issued)
    }

    /// Validate a bearer token. No storage is consulted.
    pub fn authenticate(&self, bearer: &str) -> Result<SessionClaims, GateError> {
        self.tokens.validate(bearer, Utc::now()).map_err(|e| {
            debug!(reason = %e, "bearer token rejected");
            GateError::InvalidToken(e)
        })
    }

    /// Run `work` on a pooled connection on behalf of the bearer.
    ///
    /// The token is checked before any lease is taken. The lease is
    /// released whether `work` succeeds or fails, and `work` is cut off
    /// with `PoolError::LeaseExpired` once it runs past `max_lease`.
    pub async fn with_connection<T, F>(&self, bearer: &str, work: F) -> Result<T, GateError>
    where
        F: for<'c> FnOnce(
            &'c SessionClaims,
            &'c mut SqliteConnection,
        ) -> BoxFuture<'c, Result<T, GateError>>,
    {
        let claims = self.authenticate(bearer)?;
        self.with_session(&claims, work).await
    }

    /// `with_connection` for claims an extractor has already validated.
    pub async fn with_session<T, F>(&self, claims: &SessionClaims, work: F) -> Result<T, GateError>
    where
        F: for<'c> FnOnce(
            &'c SessionClaims,
            &'c mut SqliteConnection,
        ) -> BoxFuture<'c, Result<T, GateError>>,
    {
        let mut lease = self.pool.acquire().await?;
        let outcome = {
            let conn = lease.conn_mut()?;
            tokio::time::timeout(self.max_lease, work(claims, conn)).await
        };

        match outcome {
            Ok(_) if lease.is_expired() => {
                warn!(lease = %lease.lease_id(), user_id = claims.sub, "work finished after its lease was reclaimed");
                lease.discard();
                Err(PoolError::LeaseExpired.into())
            }
            Ok(result) => {
                lease.release();
                result
            }
            Err(_) => {
                warn!(
                    lease = %lease.lease_id(),
                    user_id = claims.sub,
                    max_lease_ms = self.max_lease.as_millis() as u64,
                    "unit of work exceeded lease bound; connection discarded"
                );
                lease.discard();
                Err(PoolError::LeaseExpired.into())
            }
        }
    }

    pub fn require_role(&self, claims: &SessionClaims, required: Role) -> Result<(), GateError> {
        match (required, claims.role) {
            (Role::User, _) | (Role::Admin, Role::Admin) => Ok(()),
            _ => {
                debug!(user_id = claims.sub, required = %required, "role check failed");
                Err(GateError::Forbidden)
            }
        }
    }

    /// Re-read the bearer's account. A deleted account fails authentication.
    pub async fn current_user(&self, bearer: &str) -> Result<DbUser, GateError> {
        let claims = self.authenticate(bearer)?;
        self.session_user(&claims).await
    }

    pub async fn session_user(&self, claims: &SessionClaims) -> Result<DbUser, GateError> {
        self.with_session(claims, |claims, conn| {
            Box::pin(async move {
                UserStorage::find_by_id(conn, claims.sub)
                    .await?
                    .ok_or(GateError::AuthenticationFailed)
            })
        })
        .await
    }

    /// Create an account. Admin only.
    pub async fn register(
        &self,
        bearer: &str,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<DbUser, GateError> {
        let claims = self.authenticate(bearer)?;
        self.register_as(&claims, username, password, role).await
    }

    pub async fn register_as(
        &self,
        claims: &SessionClaims,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<DbUser, GateError> {
        self.require_role(claims, Role::Admin)?;
        validate_username(username)?;
        validate_password(password)?;

        let hash = self.hash_blocking(password).await?;
        let username = username.to_string();
        let user = self
            .with_session(claims, move |_, conn| {
                Box::pin(async move {
                    let id = UserStorage::insert(conn, &username, &hash, role).await?;
                    UserStorage::find_by_id(conn, id)
                        .await?
                        .ok_or_else(|| GateError::Internal("inserted user not found".to_string()))
                })
            })
            .await?;
        info!(by = claims.sub, user_id = user.id, role = %user.role, "user registered");
        Ok(user)
    }

    /// Replace the bearer's password after checking the current one.
    pub async fn change_password(
        &self,
        bearer: &str,
        current: &str,
        new: &str,
    ) -> Result<(), GateError> {
        let claims = self.authenticate(bearer)?;
        self.change_password_as(&claims, current, new).await
    }

    pub async fn change_password_as(
        &self,
        claims: &SessionClaims,
        current: &str,
        new: &str,
    ) -> Result<(), GateError> {
        validate_password(new)?;

        let stored = self
            .with_session(claims, |claims, conn| {
                Box::pin(async move {
                    UserStorage::find_by_id(conn, claims.sub)
                        .await?
                        .map(|u| u.password_hash)
                        .ok_or(GateError::AuthenticationFailed)
                })
            })
            .await?;

        match self.verify_blocking(current, stored).await? {
            Ok(true) => {}
            Ok(false) => return Err(GateError::AuthenticationFailed),
            Err(PasswordError::HashFormat(detail)) => {
                error!(user_id = claims.sub, detail = %detail, "stored password hash is unreadable");
                return Err(GateError::AuthenticationFailed);
            }
            Err(e) => return Err(e.into()),
        }

        let hash = self.hash_blocking(new).await?;
        let updated = self
            .with_session(claims, move |claims, conn| {
                Box::pin(async move { UserStorage::update_password(conn, claims.sub, &hash).await })
            })
            .await?;
        if !updated {
            return Err(GateError::AuthenticationFailed);
        }
        info!(user_id = claims.sub, "password changed");
        Ok(())
    }

    /// Seed an admin account when the user table is empty.
    /// Returns whether an account was created.
    pub async fn ensure_bootstrap_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, GateError> {
        validate_username(username)?;
        validate_password(password)?;

        let existing = {
            let mut lease = self.pool.acquire().await?;
            let count = UserStorage::count_users(lease.conn_mut()?).await;
            lease.release();
            count?
        };
        if existing > 0 {
            debug!(users = existing, "user table not empty; bootstrap admin skipped");
            return Ok(false);
        }

        let hash = self.hash_blocking(password).await?;
        let mut lease = self.pool.acquire().await?;
        let id = UserStorage::insert(lease.conn_mut()?, username, &hash, Role::Admin).await;
        lease.release();
        let id = id?;
        info!(user_id = id, username = %username, "bootstrap admin created");
        Ok(true)
    }

    /// Switch to a fresh random signing key. Admin only.
    /// Returns the new key id.
    pub fn rotate_signing_key(&self, bearer: &str) -> Result<String, GateError> {
        let claims = self.authenticate(bearer)?;
        self.rotate_signing_key_as(&claims)
    }

    pub fn rotate_signing_key_as(&self, claims: &SessionClaims) -> Result<String, GateError> {
        self.require_role(claims, Role::Admin)?;
        let kid = self.tokens.rotate_random(Utc::now())?;
        info!(by = claims.sub, kid = %kid, "signing key rotation requested");
        Ok(kid)
    }

    async fn verify_blocking(
        &self,
        candidate: &str,
        stored: String,
    ) -> Result<Result<bool, PasswordError>, GateError> {
        let hasher = self.hasher.clone();
        let candidate = candidate.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&candidate, &stored))
            .await
            .map_err(|e| GateError::Internal(format!("verify task failed: {e}")))
    }

    async fn hash_blocking(&self, secret: &str) -> Result<String, GateError> {
        let hasher = self.hasher.clone();
        let secret = secret.to_string();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&secret))
            .await
            .map_err(|e| GateError::Internal(format!("hash task failed: {e}")))??;
        Ok(hash)
    }
}

fn validate_username(username: &str) -> Result<(), GateError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(GateError::Validation(format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(GateError::Validation(
            "username may only contain letters, digits, '_', '-' and '.'".to_string(),
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), GateError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(GateError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.b-c_d9").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(MAX_USERNAME_LEN + 1)).is_err());
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("admin1234").is_ok());
        assert!(matches!(
            validate_password("short"),
            Err(GateError::Validation(_))
        ));
    }
}
