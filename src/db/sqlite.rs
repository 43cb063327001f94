use crate::auth::Role;
use crate::db::models::DbUser;
use crate::db::schema::SQLITE_INIT;
use crate::error::GateError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

/// User queries. Every call runs on a connection the caller leased from the pool.
pub struct UserStorage;

impl UserStorage {
    /// Initialize the schema by executing the bundled DDL.
    pub async fn init_schema(conn: &mut SqliteConnection) -> Result<(), GateError> {
        // execute multiple statements safely (SQLite supports multi-commands but sqlx::query doesn't)
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&mut *conn).await?;
        }
        Ok(())
    }

    pub async fn find_by_username(
        conn: &mut SqliteConnection,
        username: &str,
    ) -> Result<Option<DbUser>, GateError> {
        let row = sqlx::query(
            r#"SELECT id, username, password_hash, role, created_at, updated_at
               FROM users WHERE username = ?"#,
        )
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(Self::row_to_model).transpose()
    }

    pub async fn find_by_id(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<DbUser>, GateError> {
        let row = sqlx::query(
            r#"SELECT id, username, password_hash, role, created_at, updated_at
               FROM users WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(Self::row_to_model).transpose()
    }

    /// Insert a new user. Returns the row id.
    /// A duplicate username maps to `GateError::UsernameTaken`.
    pub async fn insert(
        conn: &mut SqliteConnection,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<i64, GateError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"INSERT INTO users (username, password_hash, role, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(username)
        .bind(password_hash)
        .bind(role.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(GateError::UsernameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stored hash. Returns false when no such user exists.
    pub async fn update_password(
        conn: &mut SqliteConnection,
        id: i64,
        password_hash: &str,
    ) -> Result<bool, GateError> {
        let done = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn count_users(conn: &mut SqliteConnection) -> Result<i64, GateError> {
        let rec: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *conn)
            .await?;
        Ok(rec.0)
    }

    fn row_to_model(row: SqliteRow) -> Result<DbUser, GateError> {
        let id: i64 = row.try_get("id")?;
        let username: String = row.try_get("username")?;
        let password_hash: String = row.try_get("password_hash")?;
        let role_str: String = row.try_get("role")?;
        let created_str: String = row.try_get("created_at")?;
        let updated_str: String = row.try_get("updated_at")?;

        let role: Role = role_str
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

        Ok(DbUser {
            id,
            username,
            password_hash,
            role,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    async fn memory_db() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        UserStorage::init_schema(&mut conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let mut conn = memory_db().await;
        let id = UserStorage::insert(&mut conn, "alice", "$argon2id$fake", Role::User)
            .await
            .unwrap();

        let by_name = UserStorage::find_by_username(&mut conn, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, id);
        assert_eq!(by_name.role, Role::User);

        let by_id = UserStorage::find_by_id(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(by_id, by_name);
        assert!(
            UserStorage::find_by_username(&mut conn, "bob")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_username_is_taken() {
        let mut conn = memory_db().await;
        UserStorage::insert(&mut conn, "alice", "h1", Role::User)
            .await
            .unwrap();
        let err = UserStorage::insert(&mut conn, "alice", "h2", Role::Admin)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UsernameTaken));
        assert_eq!(UserStorage::count_users(&mut conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_password_touches_one_row() {
        let mut conn = memory_db().await;
        let id = UserStorage::insert(&mut conn, "alice", "old", Role::User)
            .await
            .unwrap();
        assert!(UserStorage::update_password(&mut conn, id, "new").await.unwrap());
        assert!(!UserStorage::update_password(&mut conn, id + 1, "new").await.unwrap());

        let user = UserStorage::find_by_id(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(user.password_hash, "new");
        assert!(user.updated_at >= user.created_at);
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let mut conn = memory_db().await;
        UserStorage::init_schema(&mut conn).await.unwrap();
        assert_eq!(UserStorage::count_users(&mut conn).await.unwrap(), 0);
    }
}
