//! Bounded connection pool.
//!
//! Layout:
//! - `mod.rs`: the `ConnectionManager` seam, the clonable `Pool` handle and
//!   the `PooledConnection` lease guard
//! - `actor.rs`: the ractor actor that owns all pool state
//! - `sqlite.rs`: `ConnectionManager` over sqlx SQLite connections
//!
//! Idle connections are reused LIFO, waiters are served FIFO, and every
//! lease is bounded by a maximum duration after which the actor reclaims
//! the slot.

mod actor;
pub mod sqlite;

pub use sqlite::SqliteManager;

use crate::config::PoolConfig;
use crate::error::PoolError;
use actor::{Lent, PoolActor, PoolArgs, PoolMessage, PoolSettings};
use backon::{ExponentialBuilder, Retryable};
use ractor::{Actor, ActorRef};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Opens and checks physical database sessions for the pool.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, PoolError>> + Send;

    /// Cheap liveness check run before an idle connection is lent out.
    fn is_valid(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send;

    /// Synchronous check on return; `true` discards the connection.
    fn has_broken(&self, _conn: &Self::Connection) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub(crate) u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterId(u64);

impl WaiterId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    /// Connections being opened or validated.
    pub pending: usize,
    pub waiting: usize,
}

pub struct Pool<M: ConnectionManager> {
    actor: ActorRef<PoolMessage<M::Connection>>,
    manager: Arc<M>,
    default_timeout: Duration,
    capacity: usize,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            manager: self.manager.clone(),
            default_timeout: self.default_timeout,
            capacity: self.capacity,
        }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Probe the database once, then start the pool actor.
    ///
    /// The probe is retried with exponential backoff up to
    /// `startup_retries` times; if no connection can be opened the pool
    /// is not started and `PoolError::Startup` is returned.
    pub async fn new(manager: M, config: &PoolConfig) -> Result<Self, PoolError> {
        if config.max_size == 0 {
            return Err(PoolError::Startup("max_size must be at least 1".to_string()));
        }
        let manager = Arc::new(manager);
        let probe = startup_probe(&manager, config.startup_retries).await?;

        let args = PoolArgs {
            manager: manager.clone(),
            settings: PoolSettings {
                max_size: config.max_size,
                max_lease: config.max_lease(),
                max_idle: config.max_idle(),
                test_on_checkout: config.test_on_checkout,
            },
            initial: probe,
        };
        let (actor, _jh) = Actor::spawn(None, PoolActor::<M>::new(), args)
            .await
            .map_err(|e| PoolError::Startup(format!("failed to spawn pool actor: {e}")))?;

        info!(
            capacity = config.max_size,
            max_lease_ms = config.max_lease_ms,
            "connection pool started"
        );
        Ok(Self {
            actor,
            manager,
            default_timeout: config.acquire_timeout(),
            capacity: config.max_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Acquire with the configured default timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        self.acquire_timeout(self.default_timeout).await
    }

    /// Wait at most `timeout` for a connection.
    ///
    /// Only the calling task is suspended. Dropping the returned future
    /// withdraws the request from the wait queue.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<M>, PoolError> {
        let waiter = WaiterId::next();
        let (reply, rx) = oneshot::channel();
        ractor::cast!(self.actor, PoolMessage::Acquire { waiter, reply })
            .map_err(|_| PoolError::Closed)?;

        let mut pending = PendingAcquire {
            waiter,
            rx: Some(rx),
            actor: self.actor.clone(),
        };
        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(Ok(lent)) => Ok(PooledConnection::new(self.clone(), lent)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for a pooled connection"
                );
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Return a connection to the idle set.
    pub fn release(&self, conn: PooledConnection<M>) {
        conn.release();
    }

    /// Close a connection found broken after use; the pool opens a replacement.
    pub fn discard_and_replace(&self, conn: PooledConnection<M>) {
        conn.discard();
    }

    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        ractor::call!(self.actor, PoolMessage::Status).map_err(|_| PoolError::Closed)
    }

    /// Stop the pool. Queued and future acquires fail with `PoolError::Closed`.
    pub fn close(&self) {
        self.actor.stop(Some("pool closed".to_string()));
    }
}

async fn startup_probe<M: ConnectionManager>(
    manager: &Arc<M>,
    retries: usize,
) -> Result<M::Connection, PoolError> {
    let policy = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(retries);

    (|| async { manager.connect().await })
        .retry(policy)
        .notify(|err, dur: Duration| {
            warn!("startup probe failed: {}, retrying in {:?}", err, dur);
        })
        .await
        .map_err(|e| PoolError::Startup(e.to_string()))
}

/// An in-flight acquire. Dropping it before completion cancels the wait.
struct PendingAcquire<C: Send + 'static> {
    waiter: WaiterId,
    rx: Option<oneshot::Receiver<Result<Lent<C>, PoolError>>>,
    actor: ActorRef<PoolMessage<C>>,
}

impl<C: Send + 'static> PendingAcquire<C> {
    async fn wait(&mut self) -> Result<Lent<C>, PoolError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(PoolError::Closed);
        };
        let outcome = rx.await;
        self.rx = None;
        outcome.unwrap_or(Err(PoolError::Closed))
    }
}

impl<C: Send + 'static> Drop for PendingAcquire<C> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let _ = ractor::cast!(self.actor, PoolMessage::Cancel(self.waiter));
        // A connection may already be in flight to us; hand it back.
        rx.close();
        if let Ok(Ok(lent)) = rx.try_recv() {
            let _ = ractor::cast!(
                self.actor,
                PoolMessage::Release {
                    lease: lent.lease,
                    conn: lent.conn,
                    broken: false,
                }
            );
        }
    }
}

/// Exclusive lease on one pooled connection. Dropping it releases the lease.
pub struct PooledConnection<M: ConnectionManager> {
    pool: Pool<M>,
    lease: LeaseId,
    conn: Option<M::Connection>,
    expired: Arc<AtomicBool>,
    broken: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(pool: Pool<M>, lent: Lent<M::Connection>) -> Self {
        Self {
            pool,
            lease: lent.lease,
            conn: Some(lent.conn),
            expired: lent.expired,
            broken: false,
        }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// True once the pool has reclaimed this lease for overrunning `max_lease`.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn conn(&self) -> Result<&M::Connection, PoolError> {
        if self.is_expired() {
            return Err(PoolError::LeaseExpired);
        }
        self.conn.as_ref().ok_or(PoolError::LeaseExpired)
    }

    pub fn conn_mut(&mut self) -> Result<&mut M::Connection, PoolError> {
        if self.is_expired() {
            return Err(PoolError::LeaseExpired);
        }
        self.conn.as_mut().ok_or(PoolError::LeaseExpired)
    }

    pub fn release(self) {
        drop(self);
    }

    pub fn discard(mut self) {
        self.broken = true;
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let broken = self.broken || self.pool.manager.has_broken(&conn);
        let _ = ractor::cast!(
            self.pool.actor,
            PoolMessage::Release {
                lease: self.lease,
                conn,
                broken,
            }
        );
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("lease", &self.lease)
            .field("expired", &self.is_expired())
            .finish()
    }
}
