//! Append-only repositories for `payment_verification_log` and `security_audit_log`.
//!
//! There is deliberately no update or delete here; the tables also refuse both with a trigger.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::{
    errors::Result,
    models::audit::{
        PaymentVerificationCreateDBRequest, PaymentVerificationRecord, SecurityEventCreateDBRequest, SecurityEventFilter,
        SecurityEventRecord,
    },
};
use crate::types::{ApplicationId, abbrev_uuid};

const VERIFICATION_COLUMNS: &str =
    "id, application_id, verified_by, source, action, previous_status, new_status, provider_event_id, notes, created_at";
const SECURITY_COLUMNS: &str = "id, user_id, action_type, entity_type, entity_id, ip_address, user_agent, details, created_at";

pub struct PaymentVerifications<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PaymentVerifications<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(application_id = %abbrev_uuid(&request.application_id), action = %request.action), err)]
    pub async fn append(&mut self, request: &PaymentVerificationCreateDBRequest) -> Result<PaymentVerificationRecord> {
        let record = sqlx::query_as::<_, PaymentVerificationRecord>(&format!(
            r#"
            INSERT INTO payment_verification_log
                (application_id, verified_by, source, action, previous_status, new_status, provider_event_id, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {VERIFICATION_COLUMNS}
            "#
        ))
        .bind(request.application_id)
        .bind(request.verified_by)
        .bind(request.source.as_str())
        .bind(&request.action)
        .bind(request.previous_status)
        .bind(request.new_status)
        .bind(request.provider_event_id.as_deref())
        .bind(request.notes.as_deref())
        .fetch_one(&mut *self.db)
        .await?;

        Ok(record)
    }

    /// Oldest first, so the list reads as a timeline.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&application_id)), err)]
    pub async fn list_for_application(&mut self, application_id: ApplicationId) -> Result<Vec<PaymentVerificationRecord>> {
        let records = sqlx::query_as::<_, PaymentVerificationRecord>(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM payment_verification_log WHERE application_id = $1 ORDER BY created_at, id"
        ))
        .bind(application_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(records)
    }
}

pub struct SecurityEvents<'c> {
    db: &'c mut PgConnection,
}

impl<'c> SecurityEvents<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(action = request.action.as_str()), err)]
    pub async fn append(&mut self, request: &SecurityEventCreateDBRequest) -> Result<SecurityEventRecord> {
        let record = sqlx::query_as::<_, SecurityEventRecord>(&format!(
            r#"
            INSERT INTO security_audit_log (user_id, action_type, entity_type, entity_id, ip_address, user_agent, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SECURITY_COLUMNS}
            "#
        ))
        .bind(request.user_id)
        .bind(request.action.as_str())
        .bind(request.entity_type)
        .bind(request.entity_id.as_deref())
        .bind(request.ip_address.as_deref())
        .bind(request.user_agent.as_deref())
        .bind(&request.details)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(record)
    }

    /// Newest first.
    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &SecurityEventFilter) -> Result<Vec<SecurityEventRecord>> {
        let records = sqlx::query_as::<_, SecurityEventRecord>(&format!(
            r#"
            SELECT {SECURITY_COLUMNS} FROM security_audit_log
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR action_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.user_id)
        .bind(filter.action_type.as_deref())
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(records)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &SecurityEventFilter) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM security_audit_log
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR action_type = $2)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.action_type.as_deref())
        .fetch_one(&mut *self.db)
        .await?;

        Ok(count)
    }
}
