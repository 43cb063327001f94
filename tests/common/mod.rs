#![allow(dead_code)]

use sessiongate::auth::{PasswordHasher, TokenService};
use sessiongate::config::{PasswordConfig, PoolConfig};
use sessiongate::{Pool, SessionGateway, SqliteManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ADMIN: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin1234";

/// A gateway over a throwaway SQLite file with the bootstrap admin seeded.
pub struct TestGate {
    pub gateway: Arc<SessionGateway>,
    path: PathBuf,
}

impl TestGate {
    pub async fn new(tag: &str) -> Self {
        Self::with_pool(tag, |_| {}).await
    }

    pub async fn with_pool(tag: &str, tweak: impl FnOnce(&mut PoolConfig)) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX_EPOCH")
            .as_nanos();
        let mut path = std::env::temp_dir();
        path.push(format!(
            "sessiongate-{}-{}-{}.sqlite",
            tag,
            std::process::id(),
            nanos
        ));

        let mut cfg = PoolConfig {
            max_size: 4,
            startup_retries: 0,
            ..PoolConfig::default()
        };
        tweak(&mut cfg);

        let database_url = format!("sqlite:{}", path.display());
        let manager = SqliteManager::new(&database_url).expect("bad database url");
        let pool = Pool::new(manager, &cfg).await.expect("pool failed to start");
        let hasher = PasswordHasher::new(&PasswordConfig {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .expect("bad argon2 params");
        let tokens = TokenService::new(
            b"integration-test-signing-key-0123456789".to_vec(),
            Duration::from_secs(3_600),
            Duration::from_secs(300),
        )
        .expect("weak test key");

        let gateway = SessionGateway::new(pool, hasher, tokens, &cfg).expect("gateway");
        gateway.prepare_schema().await.expect("schema");
        gateway
            .ensure_bootstrap_admin(ADMIN, ADMIN_PASSWORD)
            .await
            .expect("bootstrap admin");

        Self {
            gateway: Arc::new(gateway),
            path,
        }
    }

    pub async fn admin_token(&self) -> String {
        self.gateway
            .login(ADMIN, ADMIN_PASSWORD)
            .await
            .expect("admin login")
            .token
    }
}

impl Drop for TestGate {
    fn drop(&mut self) {
        self.gateway.pool().close();
        for suffix in ["", "-wal", "-shm"] {
            let mut p = self.path.clone().into_os_string();
            p.push(suffix);
            let _ = std::fs::remove_file(p);
        }
    }
}
