use super::{ConnectionManager, LeaseId, PoolStatus, WaiterId};
use crate::error::PoolError;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A connection handed to a waiter, with the lease it is held under.
pub(crate) struct Lent<C> {
    pub lease: LeaseId,
    pub conn: C,
    pub expired: Arc<AtomicBool>,
}

pub(crate) type Reply<C> = oneshot::Sender<Result<Lent<C>, PoolError>>;

pub(crate) struct Waiter<C> {
    id: WaiterId,
    reply: Reply<C>,
}

/// Messages handled by the pool actor.
pub(crate) enum PoolMessage<C> {
    /// Queue a caller for the next free connection.
    Acquire { waiter: WaiterId, reply: Reply<C> },
    /// Caller gave up (timeout or dropped future); forget it.
    Cancel(WaiterId),
    /// Lease ended. `broken` connections are closed and replaced.
    Release {
        lease: LeaseId,
        conn: C,
        broken: bool,
    },
    Status(RpcReplyPort<PoolStatus>),

    // Internal messages (sent by tasks the actor spawned)
    /// A connection was opened or validated for this waiter.
    Ready { waiter: Waiter<C>, conn: C },
    /// Opening a connection for this waiter failed.
    OpenFailed { waiter: Waiter<C>, error: PoolError },
    /// Replacement for a discarded connection is ready (or failed).
    Replenished(Result<C, PoolError>),
    /// Lease outlived `max_lease`; reclaim its slot.
    ReapLease(LeaseId),
}

pub(crate) struct PoolSettings {
    pub max_size: usize,
    pub max_lease: Duration,
    pub max_idle: Option<Duration>,
    pub test_on_checkout: bool,
}

pub(crate) struct PoolArgs<M: ConnectionManager> {
    pub manager: Arc<M>,
    pub settings: PoolSettings,
    pub initial: M::Connection,
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

impl<C> IdleConn<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            since: Instant::now(),
        }
    }
}

struct Lease {
    expired: Arc<AtomicBool>,
    reaper: JoinHandle<()>,
}

/// All mutable pool state. Only the actor touches it.
pub(crate) struct PoolState<M: ConnectionManager> {
    manager: Arc<M>,
    settings: PoolSettings,
    /// LIFO: the most recently returned connection is lent first.
    idle: Vec<IdleConn<M::Connection>>,
    leases: HashMap<LeaseId, Lease>,
    /// FIFO queue of callers waiting for a connection.
    waiters: VecDeque<Waiter<M::Connection>>,
    /// Slots held by connections being opened or validated.
    pending: usize,
    next_lease: u64,
}

impl<M: ConnectionManager> PoolState<M> {
    /// Slots in use: leased, idle, or in flight.
    fn occupied(&self) -> usize {
        self.leases.len() + self.idle.len() + self.pending
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.settings.max_size,
            idle: self.idle.len(),
            leased: self.leases.len(),
            pending: self.pending,
            waiting: self.waiters.len(),
        }
    }
}

/// ractor-based pool actor
pub(crate) struct PoolActor<M> {
    _manager: PhantomData<fn() -> M>,
}

impl<M> PoolActor<M> {
    pub fn new() -> Self {
        Self {
            _manager: PhantomData,
        }
    }
}

#[ractor::async_trait]
impl<M: ConnectionManager> Actor for PoolActor<M> {
    type Msg = PoolMessage<M::Connection>;
    type State = PoolState<M>;
    type Arguments = PoolArgs<M>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(PoolState {
            manager: args.manager,
            settings: args.settings,
            idle: vec![IdleConn::new(args.initial)],
            leases: HashMap::new(),
            waiters: VecDeque::new(),
            pending: 0,
            next_lease: 1,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for (_, lease) in state.leases.drain() {
            lease.reaper.abort();
        }
        // Dropping the reply senders wakes every waiter with `Closed`.
        state.waiters.clear();
        state.idle.clear();
        info!("connection pool stopped");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::Acquire { waiter, reply } => {
                state.waiters.push_back(Waiter { id: waiter, reply });
                self.dispatch(state, &myself);
                if !state.waiters.is_empty() {
                    debug!(
                        waiting = state.waiters.len(),
                        leased = state.leases.len(),
                        "pool saturated; caller queued"
                    );
                }
            }
            PoolMessage::Cancel(id) => {
                let before = state.waiters.len();
                state.waiters.retain(|w| w.id != id);
                if state.waiters.len() != before {
                    debug!(waiter = id.0, "acquire cancelled; waiter removed");
                }
            }
            PoolMessage::Release { lease, conn, broken } => {
                self.handle_release(state, &myself, lease, conn, broken);
            }
            PoolMessage::Status(rp) => {
                let _ = rp.send(state.status());
            }
            PoolMessage::Ready { waiter, conn } => {
                state.pending = state.pending.saturating_sub(1);
                self.handle_ready(state, &myself, waiter, conn);
            }
            PoolMessage::OpenFailed { waiter, error } => {
                state.pending = state.pending.saturating_sub(1);
                warn!(waiter = waiter.id.0, "failed to open connection: {}", error);
                let _ = waiter.reply.send(Err(error));
                self.dispatch(state, &myself);
            }
            PoolMessage::Replenished(result) => {
                state.pending = state.pending.saturating_sub(1);
                match result {
                    Ok(conn) => {
                        debug!("replacement connection ready");
                        state.idle.push(IdleConn::new(conn));
                    }
                    Err(e) => warn!("failed to open replacement connection: {}", e),
                }
                self.dispatch(state, &myself);
            }
            PoolMessage::ReapLease(lease) => {
                if let Some(entry) = state.leases.remove(&lease) {
                    entry.expired.store(true, Ordering::Release);
                    warn!(
                        lease = %lease,
                        max_lease_ms = state.settings.max_lease.as_millis() as u64,
                        "lease exceeded maximum duration; reclaimed"
                    );
                    self.dispatch(state, &myself);
                }
            }
        }
        Ok(())
    }
}

impl<M: ConnectionManager> PoolActor<M> {
    /// Serve queued waiters, oldest first, while connections or capacity remain.
    fn dispatch(&self, state: &mut PoolState<M>, myself: &ActorRef<PoolMessage<M::Connection>>) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            if let Some(idle) = state.idle.pop() {
                state.pending += 1;
                self.spawn_checkout(state, myself, idle, waiter);
                continue;
            }
            if state.occupied() < state.settings.max_size {
                state.pending += 1;
                self.spawn_open(state, myself, waiter);
                continue;
            }
            state.waiters.push_front(waiter);
            break;
        }
    }

    /// Validate an idle connection off the actor, reopening it if stale or dead.
    fn spawn_checkout(
        &self,
        state: &PoolState<M>,
        myself: &ActorRef<PoolMessage<M::Connection>>,
        idle: IdleConn<M::Connection>,
        waiter: Waiter<M::Connection>,
    ) {
        let manager = state.manager.clone();
        let max_idle = state.settings.max_idle;
        let test = state.settings.test_on_checkout;
        let me = myself.clone();

        tokio::spawn(async move {
            let IdleConn { mut conn, since } = idle;
            let stale = max_idle.is_some_and(|limit| since.elapsed() > limit);
            let result = if stale {
                debug!("idle connection past max idle time; reopening");
                drop(conn);
                manager.connect().await
            } else if test && !manager.is_valid(&mut conn).await {
                warn!("idle connection failed liveness check; replacing");
                drop(conn);
                manager.connect().await
            } else {
                Ok(conn)
            };
            let msg = match result {
                Ok(conn) => PoolMessage::Ready { waiter, conn },
                Err(error) => PoolMessage::OpenFailed { waiter, error },
            };
            let _ = ractor::cast!(me, msg);
        });
    }

    fn spawn_open(
        &self,
        state: &PoolState<M>,
        myself: &ActorRef<PoolMessage<M::Connection>>,
        waiter: Waiter<M::Connection>,
    ) {
        let manager = state.manager.clone();
        let me = myself.clone();
        tokio::spawn(async move {
            let msg = match manager.connect().await {
                Ok(conn) => PoolMessage::Ready { waiter, conn },
                Err(error) => PoolMessage::OpenFailed { waiter, error },
            };
            let _ = ractor::cast!(me, msg);
        });
    }

    fn handle_ready(
        &self,
        state: &mut PoolState<M>,
        myself: &ActorRef<PoolMessage<M::Connection>>,
        waiter: Waiter<M::Connection>,
        conn: M::Connection,
    ) {
        if waiter.reply.is_closed() {
            state.idle.push(IdleConn::new(conn));
            self.dispatch(state, myself);
            return;
        }

        let lease = LeaseId(state.next_lease);
        state.next_lease += 1;
        let expired = Arc::new(AtomicBool::new(false));

        let me = myself.clone();
        let max_lease = state.settings.max_lease;
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(max_lease).await;
            let _ = ractor::cast!(me, PoolMessage::ReapLease(lease));
        });

        let lent = Lent {
            lease,
            conn,
            expired: expired.clone(),
        };
        match waiter.reply.send(Ok(lent)) {
            Ok(()) => {
                state.leases.insert(lease, Lease { expired, reaper });
                debug!(
                    lease = %lease,
                    leased = state.leases.len(),
                    idle = state.idle.len(),
                    "connection leased"
                );
            }
            Err(returned) => {
                // Waiter vanished between the check and the send.
                reaper.abort();
                if let Ok(lent) = returned {
                    state.idle.push(IdleConn::new(lent.conn));
                }
                self.dispatch(state, myself);
            }
        }
    }

    fn handle_release(
        &self,
        state: &mut PoolState<M>,
        myself: &ActorRef<PoolMessage<M::Connection>>,
        lease: LeaseId,
        conn: M::Connection,
        broken: bool,
    ) {
        let Some(entry) = state.leases.remove(&lease) else {
            // Already reclaimed or released; never return it to the idle set twice.
            debug!(lease = %lease, "release of an inactive lease; closing connection");
            drop(conn);
            return;
        };
        entry.reaper.abort();

        if !broken {
            state.idle.push(IdleConn::new(conn));
            self.dispatch(state, myself);
            return;
        }

        debug!(lease = %lease, "discarding broken connection");
        drop(conn);
        self.dispatch(state, myself);
        if state.waiters.is_empty() && state.occupied() < state.settings.max_size {
            state.pending += 1;
            let manager = state.manager.clone();
            let me = myself.clone();
            tokio::spawn(async move {
                let result = manager.connect().await;
                let _ = ractor::cast!(me, PoolMessage::Replenished(result));
            });
        }
    }
}
