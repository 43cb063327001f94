pub mod auth;
pub mod json;

pub use auth::{RequireAdmin, RequireSession};
pub use json::JsonBody;
