use mimalloc::MiMalloc;
use sessiongate::auth::{PasswordHasher, TokenService};
use sessiongate::config::Config;
use sessiongate::router::{GateState, gate_router};
use sessiongate::{Pool, SessionGateway, SqliteManager};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.basic.database_url,
        listen_addr = %cfg.basic.listen_addr,
        loglevel = %cfg.basic.loglevel,
        pool = ?cfg.pool,
        token = ?cfg.token
    );

    let manager = SqliteManager::new(&cfg.basic.database_url)?;
    let pool = Pool::new(manager, &cfg.pool).await?;

    let tokens = if cfg.token.secret.is_empty() {
        warn!("no token secret configured; using a random key, tokens will not survive a restart");
        TokenService::with_random_key(cfg.token.ttl(), cfg.token.grace())?
    } else {
        TokenService::new(
            cfg.token.secret.clone().into_bytes(),
            cfg.token.ttl(),
            cfg.token.grace(),
        )?
    };
    let hasher = PasswordHasher::new(&cfg.password)?;

    let gateway = Arc::new(SessionGateway::new(pool.clone(), hasher, tokens, &cfg.pool)?);
    gateway.prepare_schema().await?;

    if let Some(seed) = cfg.basic.bootstrap_admin.as_ref() {
        gateway
            .ensure_bootstrap_admin(&seed.username, &seed.password)
            .await?;
    }

    let app = gate_router(GateState::new(gateway));

    let listener = TcpListener::bind(&cfg.basic.listen_addr).await?;
    info!("HTTP server listening on {}", cfg.basic.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
