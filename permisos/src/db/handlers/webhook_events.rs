//! Database repository for received payment provider events.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::{
    errors::Result,
    models::webhook_events::{WebhookEventRecord, WebhookOutcome},
};
use crate::types::ApplicationId;

pub struct WebhookEvents<'c> {
    db: &'c mut PgConnection,
}

impl<'c> WebhookEvents<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Claim a provider event id. Returns `None` when the id was seen before, i.e. a replay.
    ///
    /// Run inside the same transaction as the status change so a rolled-back attempt frees the id
    /// for the provider's retry.
    #[instrument(skip(self), err)]
    pub async fn claim(&mut self, provider_event_id: &str, event_type: &str) -> Result<Option<i64>> {
        let id: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events (provider_event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(provider_event_id)
        .bind(event_type)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    #[instrument(skip(self), err)]
    pub async fn set_outcome(&mut self, id: i64, application_id: Option<ApplicationId>, outcome: WebhookOutcome) -> Result<()> {
        sqlx::query("UPDATE payment_webhook_events SET application_id = $2, outcome = $3 WHERE id = $1")
            .bind(id)
            .bind(application_id)
            .bind(outcome.as_str())
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_provider_id(&mut self, provider_event_id: &str) -> Result<Option<WebhookEventRecord>> {
        let record = sqlx::query_as::<_, WebhookEventRecord>(
            "SELECT id, provider_event_id, event_type, application_id, outcome, received_at FROM payment_webhook_events WHERE provider_event_id = $1",
        )
        .bind(provider_event_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(record)
    }
}
