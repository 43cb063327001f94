//! Database module: user records and schema.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `sqlite.rs`: queries, run on a connection leased from the pool

pub mod models;
pub mod schema;
pub mod sqlite;

pub use models::DbUser;
pub use schema::SQLITE_INIT;
pub use sqlite::UserStorage;
