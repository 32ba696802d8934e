//! Database models for server-side login sessions.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::UserId;

/// A session row. `id` is the digest of the cookie value, never the value itself.
#[derive(Debug, Clone, FromRow)]
pub struct UserSession {
    pub id: String,
    pub user_id: UserId,
    pub is_admin_portal: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionCreateDBRequest {
    pub id: String,
    pub user_id: UserId,
    pub is_admin_portal: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
}
