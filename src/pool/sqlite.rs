use super::ConnectionManager;
use crate::error::PoolError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;

/// Opens raw SQLite connections; pooling is left to `Pool`.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    options: SqliteConnectOptions,
}

impl SqliteManager {
    pub fn new(database_url: &str) -> Result<Self, PoolError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PoolError::Connect(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        if let Some(dir) = options.get_filename().parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .map_err(|e| PoolError::Connect(format!("cannot create {}: {e}", dir.display())))?;
        }
        Ok(Self { options })
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection, PoolError> {
        self.options
            .connect()
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))
    }

    async fn is_valid(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }
}
