use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment prefix; nested keys use `__`, e.g. `SESSIONGATE_POOL__MAX_SIZE=8`.
pub const ENV_PREFIX: &str = "SESSIONGATE_";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub basic: BasicConfig,
    pub pool: PoolConfig,
    pub token: TokenConfig,
    pub password: PasswordConfig,
}

impl Config {
    /// Defaults, then `config.toml`, then `SESSIONGATE_*` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub loglevel: String,
    pub bootstrap_admin: Option<AdminSeed>,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            database_url: "sqlite://data/sessiongate.sqlite".to_string(),
            loglevel: "info".to_string(),
            bootstrap_admin: None,
        }
    }
}

/// Account created on startup when the user table is empty.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminSeed {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSeed")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    pub max_lease_ms: u64,
    /// Idle connections older than this are reopened on checkout. `None` keeps them forever.
    pub max_idle_ms: Option<u64>,
    pub test_on_checkout: bool,
    pub startup_retries: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            acquire_timeout_ms: 5_000,
            max_lease_ms: 30_000,
            max_idle_ms: Some(600_000),
            test_on_checkout: true,
            startup_retries: 3,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_lease(&self) -> Duration {
        Duration::from_millis(self.max_lease_ms)
    }

    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Signing secret. Empty means a random key is generated at startup.
    pub secret: String,
    pub ttl_secs: u64,
    /// How long tokens signed by the previous key stay valid after a rotation.
    pub grace_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_secs: 3_600,
            grace_secs: 300,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .field("grace_secs", &self.grace_secs)
            .finish()
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        // OWASP argon2id baseline: m=19 MiB, t=2, p=1
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.pool.max_size, 20);
        assert_eq!(cfg.pool.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.token.ttl(), Duration::from_secs(3_600));
        assert!(cfg.basic.bootstrap_admin.is_none());
    }

    #[test]
    fn env_overrides_nested_keys() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SESSIONGATE_POOL__MAX_SIZE", "4");
            jail.set_env("SESSIONGATE_TOKEN__TTL_SECS", "60");
            let cfg = Config::load()?;
            assert_eq!(cfg.pool.max_size, 4);
            assert_eq!(cfg.token.ttl_secs, 60);
            assert_eq!(cfg.pool.max_lease_ms, 30_000);
            Ok(())
        });
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut cfg = Config::default();
        cfg.token.secret = "super-secret-signing-key-material".to_string();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("super-secret"));
    }
}
