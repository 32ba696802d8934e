//! Database models for received payment provider events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::types::ApplicationId;

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Status transition applied
    Applied,
    /// Application already in the target status
    Unchanged,
    /// Event recognised but not applicable to the application's current status
    Ignored,
    /// Event type not handled or no matching application
    Unmatched,
}

impl WebhookOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Unchanged => "unchanged",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Unmatched => "unmatched",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookEventRecord {
    pub id: i64,
    pub provider_event_id: String,
    pub event_type: String,
    pub application_id: Option<ApplicationId>,
    pub outcome: String,
    pub received_at: DateTime<Utc>,
}
