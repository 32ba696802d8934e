//! Append-only audit records.
//!
//! Both tables reject UPDATE and DELETE with a trigger, so these types only have create requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::permits::status::ApplicationStatus;
use crate::types::{ApplicationId, UserId};

/// Where a payment verification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VerificationSource {
    Webhook,
    Admin,
}

impl VerificationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationSource::Webhook => "webhook",
            VerificationSource::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentVerificationCreateDBRequest {
    pub application_id: ApplicationId,
    pub verified_by: Option<UserId>,
    pub source: VerificationSource,
    /// Provider event type or admin action name
    pub action: String,
    pub previous_status: ApplicationStatus,
    pub new_status: ApplicationStatus,
    pub provider_event_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct PaymentVerificationRecord {
    pub id: i64,
    #[schema(value_type = String, format = "uuid")]
    pub application_id: ApplicationId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub verified_by: Option<UserId>,
    pub source: String,
    pub action: String,
    pub previous_status: ApplicationStatus,
    pub new_status: ApplicationStatus,
    pub provider_event_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Security-relevant actions written to `security_audit_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityAction {
    Register,
    LoginSuccess,
    LoginFailure,
    Logout,
    PasswordResetRequested,
    PasswordResetCompleted,
    PasswordChanged,
    UserUpdated,
    ApplicationStatusChanged,
    PaymentVerified,
    PaymentRejected,
    PermitDownloaded,
}

impl SecurityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityAction::Register => "auth.register",
            SecurityAction::LoginSuccess => "auth.login_success",
            SecurityAction::LoginFailure => "auth.login_failure",
            SecurityAction::Logout => "auth.logout",
            SecurityAction::PasswordResetRequested => "auth.password_reset_requested",
            SecurityAction::PasswordResetCompleted => "auth.password_reset_completed",
            SecurityAction::PasswordChanged => "auth.password_changed",
            SecurityAction::UserUpdated => "admin.user_updated",
            SecurityAction::ApplicationStatusChanged => "application.status_changed",
            SecurityAction::PaymentVerified => "payment.verified",
            SecurityAction::PaymentRejected => "payment.rejected",
            SecurityAction::PermitDownloaded => "permit.downloaded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityEventCreateDBRequest {
    pub user_id: Option<UserId>,
    pub action: SecurityAction,
    pub entity_type: Option<&'static str>,
    pub entity_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
}

impl SecurityEventCreateDBRequest {
    pub fn new(user_id: Option<UserId>, action: SecurityAction) -> Self {
        Self {
            user_id,
            action,
            entity_type: None,
            entity_id: None,
            ip_address: None,
            user_agent: None,
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn entity(mut self, entity_type: &'static str, entity_id: impl ToString) -> Self {
        self.entity_type = Some(entity_type);
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn client(mut self, client: &crate::auth::ClientInfo) -> Self {
        self.ip_address = client.ip_address.clone();
        self.user_agent = client.user_agent.clone();
        self
    }
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct SecurityEventRecord {
    pub id: i64,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
    pub action_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityEventFilter {
    pub user_id: Option<UserId>,
    pub action_type: Option<String>,
    pub skip: i64,
    pub limit: i64,
}
