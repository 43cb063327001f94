//! Stateless HMAC-SHA256 session tokens with signing-key rotation.
//!
//! Wire form: `base64url(header).base64url(claims).base64url(mac)`, where
//! the header names the signing key by `kid`. Validation is local CPU work
//! only; no storage is consulted.

use crate::auth::Role;
use crate::error::TokenError;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_SECRET_LEN: usize = 32;
const ALG: &str = "HS256";

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    kid: String,
}

/// Identity carried inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: i64,
    pub name: String,
    pub role: Role,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
}

impl SessionClaims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.expires_at_ms
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.expires_at_ms)
    }
}

/// Who a token is minted for.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub id: i64,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: SessionClaims,
}

/// A checked signing key with its HMAC state keyed once.
#[derive(Clone)]
struct SigningKey {
    kid: String,
    hmac: HmacSha256,
}

impl SigningKey {
    fn new(secret: Vec<u8>) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakKey(MIN_SECRET_LEN));
        }
        Self::derive(&secret)
    }

    fn derive(secret: &[u8]) -> Result<Self, TokenError> {
        let hmac = HmacSha256::new_from_slice(secret)
            .map_err(|e| TokenError::Encoding(format!("unusable signing key: {e}")))?;
        let digest = Sha256::digest(secret);
        Ok(Self {
            kid: URL_SAFE_NO_PAD.encode(&digest[..9]),
            hmac,
        })
    }

    fn mac(&self, signing_input: &[u8]) -> Vec<u8> {
        let mut mac = self.hmac.clone();
        mac.update(signing_input);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish()
    }
}

#[derive(Debug, Clone)]
struct KeyRing {
    current: SigningKey,
    /// Key replaced by the last rotation, with the instant it was retired.
    previous: Option<(SigningKey, DateTime<Utc>)>,
}

impl KeyRing {
    fn key_for(&self, kid: &str, now: DateTime<Utc>, grace: TimeDelta) -> Option<&SigningKey> {
        if self.current.kid == kid {
            return Some(&self.current);
        }
        match &self.previous {
            Some((key, retired_at)) if key.kid == kid => {
                let grace_ends = retired_at
                    .checked_add_signed(grace)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (now < grace_ends).then_some(key)
            }
            _ => None,
        }
    }
}

/// Mints and validates session tokens.
///
/// The key ring lives in a `watch` channel: readers take an `Arc`
/// snapshot, rotation swaps the whole ring under the channel's lock.
pub struct TokenService {
    keys: watch::Sender<Arc<KeyRing>>,
    ttl: TimeDelta,
    grace: TimeDelta,
}

impl TokenService {
    pub fn new(secret: Vec<u8>, ttl: Duration, grace: Duration) -> Result<Self, TokenError> {
        let ring = KeyRing {
            current: SigningKey::new(secret)?,
            previous: None,
        };
        let (keys, _) = watch::channel(Arc::new(ring));
        Ok(Self {
            keys,
            ttl: to_delta(ttl),
            grace: to_delta(grace),
        })
    }

    /// Build from a freshly generated random key.
    pub fn with_random_key(ttl: Duration, grace: Duration) -> Result<Self, TokenError> {
        let ring = KeyRing {
            current: random_key()?,
            previous: None,
        };
        let (keys, _) = watch::channel(Arc::new(ring));
        Ok(Self {
            keys,
            ttl: to_delta(ttl),
            grace: to_delta(grace),
        })
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Key id of the key currently used for signing.
    pub fn current_kid(&self) -> String {
        self.keys.borrow().current.kid.clone()
    }

    pub fn issue(&self, subject: &TokenSubject, now: DateTime<Utc>) -> Result<IssuedToken, TokenError> {
        let ring = self.keys.borrow().clone();
        let issued_at_ms = now.timestamp_millis();
        let claims = SessionClaims {
            sub: subject.id,
            name: subject.name.clone(),
            role: subject.role,
            issued_at_ms,
            expires_at_ms: issued_at_ms.saturating_add(self.ttl.num_milliseconds()),
        };
        let header = TokenHeader {
            alg: ALG.to_string(),
            kid: ring.current.kid.clone(),
        };

        let header_b64 = encode_segment(&header)?;
        let claims_b64 = encode_segment(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = URL_SAFE_NO_PAD.encode(ring.current.mac(signing_input.as_bytes()));

        Ok(IssuedToken {
            token: format!("{signing_input}.{signature}"),
            claims,
        })
    }

    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, TokenError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let header: TokenHeader = decode_segment(header_b64)?;
        if header.alg != ALG {
            return Err(TokenError::Malformed);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        let ring = self.keys.borrow().clone();
        let key = ring
            .key_for(&header.kid, now, self.grace)
            .ok_or(TokenError::BadSignature)?;

        let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
        let expected = key.mac(signing_input.as_bytes());
        if !bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            return Err(TokenError::BadSignature);
        }

        let claims: SessionClaims = decode_segment(claims_b64)?;
        if claims.is_expired(now) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Make `secret` the signing key; the old key stays valid for the grace window.
    pub fn rotate(&self, secret: Vec<u8>, now: DateTime<Utc>) -> Result<String, TokenError> {
        let key = SigningKey::new(secret)?;
        Ok(self.install(key, now))
    }

    pub fn rotate_random(&self, now: DateTime<Utc>) -> Result<String, TokenError> {
        let key = random_key()?;
        Ok(self.install(key, now))
    }

    fn install(&self, key: SigningKey, now: DateTime<Utc>) -> String {
        let kid = key.kid.clone();
        self.keys.send_modify(|ring| {
            let retired = ring.current.clone();
            *ring = Arc::new(KeyRing {
                current: key,
                previous: Some((retired, now)),
            });
        });
        info!(kid = %kid, "signing key rotated");
        kid
    }
}

fn random_key() -> Result<SigningKey, TokenError> {
    use argon2::password_hash::rand_core::{OsRng, RngCore};
    let mut secret = vec![0u8; MIN_SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    SigningKey::derive(&secret)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::Encoding(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}
