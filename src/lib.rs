pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod pool;
pub mod router;

pub use error::GateError;
pub use gateway::SessionGateway;
pub use pool::{ConnectionManager, Pool, PooledConnection, SqliteManager};
