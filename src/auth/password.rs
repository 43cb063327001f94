//! Argon2id password hashing and constant-time verification.
//!
//! Hashes are stored as PHC strings (`$argon2id$v=19$m=..,t=..,p=..$salt$digest`)
//! so the salt and cost factors travel with the digest and stay readable
//! across restarts and parameter changes.

use crate::config::PasswordConfig;
use crate::error::PasswordError;
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher as _, SaltString, rand_core::OsRng},
};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordHasher {
    pub fn new(cfg: &PasswordConfig) -> Result<Self, PasswordError> {
        let params = Params::new(cfg.memory_kib, cfg.iterations, cfg.parallelism, None)
            .map_err(|e| PasswordError::Hashing(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self { params })
    }

    /// Hash `secret` with a fresh random salt.
    pub fn hash(&self, secret: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let hash = argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| PasswordError::Hashing(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Check `candidate` against a stored PHC hash.
    ///
    /// A mismatch is `Ok(false)`. Only a stored hash that cannot be
    /// interpreted yields `PasswordError::HashFormat`. The digest is
    /// recomputed with the salt and costs embedded in `stored`, not with
    /// this hasher's current parameters.
    pub fn verify(&self, candidate: &str, stored: &str) -> Result<bool, PasswordError> {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| PasswordError::HashFormat(format!("unparseable PHC string: {e}")))?;

        let algorithm = Algorithm::try_from(parsed.algorithm).map_err(|_| {
            PasswordError::HashFormat(format!("unknown algorithm {}", parsed.algorithm))
        })?;
        if algorithm != Algorithm::Argon2id {
            return Err(PasswordError::HashFormat(format!(
                "unsupported algorithm {algorithm:?}"
            )));
        }
        match parsed.version {
            Some(v) if v == Version::V0x13 as u32 => {}
            other => {
                return Err(PasswordError::HashFormat(format!(
                    "unsupported version {other:?}"
                )));
            }
        }

        let params = Params::try_from(&parsed)
            .map_err(|e| PasswordError::HashFormat(format!("bad parameters: {e}")))?;
        let salt = parsed
            .salt
            .ok_or_else(|| PasswordError::HashFormat("missing salt".to_string()))?;
        let expected = parsed
            .hash
            .ok_or_else(|| PasswordError::HashFormat("missing digest".to_string()))?;

        let recomputed = Argon2::default()
            .hash_password_customized(
                candidate.as_bytes(),
                Some(parsed.algorithm),
                parsed.version,
                params,
                salt,
            )
            .map_err(|e| PasswordError::HashFormat(e.to_string()))?;
        let Some(actual) = recomputed.hash else {
            return Err(PasswordError::HashFormat("empty digest".to_string()));
        };

        Ok(bool::from(actual.as_bytes().ct_eq(expected.as_bytes())))
    }
}
