//! Database repository for login sessions.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::{
    errors::Result,
    models::sessions::{SessionCreateDBRequest, UserSession},
};
use crate::types::{UserId, abbrev_uuid};

const SESSION_COLUMNS: &str = "id, user_id, is_admin_portal, ip_address, user_agent, created_at, last_seen_at, expires_at";

pub struct Sessions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Sessions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id)), err)]
    pub async fn create(&mut self, request: &SessionCreateDBRequest) -> Result<UserSession> {
        let session = sqlx::query_as::<_, UserSession>(&format!(
            r#"
            INSERT INTO user_sessions (id, user_id, is_admin_portal, ip_address, user_agent, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(&request.id)
        .bind(request.user_id)
        .bind(request.is_admin_portal)
        .bind(request.ip_address.as_deref())
        .bind(request.user_agent.as_deref())
        .bind(request.expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(session)
    }

    /// Look up an unexpired session and bump `last_seen_at`.
    #[instrument(skip_all, err)]
    pub async fn touch_active(&mut self, id: &str) -> Result<Option<UserSession>> {
        let session = sqlx::query_as::<_, UserSession>(&format!(
            r#"
            UPDATE user_sessions SET last_seen_at = NOW()
            WHERE id = $1 AND expires_at > NOW()
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(session)
    }

    #[instrument(skip_all, err)]
    pub async fn delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// End every session of a user, e.g. after a password change or when the account is disabled.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn delete_for_user(&mut self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    pub async fn purge_expired(&mut self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= NOW()")
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
