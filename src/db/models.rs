use crate::auth::{Role, TokenSubject};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbUser {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&DbUser> for TokenSubject {
    fn from(u: &DbUser) -> Self {
        TokenSubject {
            id: u.id,
            name: u.username.clone(),
            role: u.role,
        }
    }
}
