use crate::db::errors::DbError;
use crate::db::pool::RollbackError;
use crate::payment_providers::PaymentError;
use crate::permits::status::ApplicationStatus;
use crate::permits::storage::FileSystemError;
use crate::types::{Operation, Permission};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// User lacks required permissions for the operation
    #[error("Insufficient permissions to {action:?} {resource}")]
    InsufficientPermissions {
        required: Permission,
        action: Operation,
        resource: String,
    },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// One or more request fields failed validation
    #[error("Validation failed for {} field(s)", fields.len())]
    Validation { fields: Vec<FieldError> },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Status change outside the allowed transition table
    #[error("Cannot move application from {from} to {to}")]
    InvalidTransition { from: ApplicationStatus, to: ApplicationStatus },

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single field-level validation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Collects field errors and turns them into [`Error::Validation`] when any were recorded.
#[derive(Debug, Default)]
pub struct Validator {
    fields: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &str, message: &str) -> &mut Self {
        if !ok {
            self.fields.push(FieldError::new(field, message));
        }
        self
    }

    pub fn required(&mut self, value: &str, field: &str) -> &mut Self {
        self.check(!value.trim().is_empty(), field, "is required")
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.fields.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                fields: std::mem::take(&mut self.fields),
            })
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InsufficientPermissions { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::Database(db_err) => match db_err.root() {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::ProtectedEntity { .. } => StatusCode::FORBIDDEN,
                DbError::TransactionRolledBack { .. } | DbError::Query { .. } | DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::FileSystem(fs_err) => match fs_err {
                FileSystemError::NotFound { .. } => StatusCode::NOT_FOUND,
                FileSystemError::Io { .. } | FileSystemError::InvalidPath { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Payment(payment_err) => payment_err.status_code(),
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InsufficientPermissions { action, resource, .. } => {
                format!("Insufficient permissions to {action} {resource}")
            }
            Error::BadRequest { message } => message.clone(),
            Error::Validation { .. } => "Some fields are invalid".to_string(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::InvalidTransition { from, to } => {
                format!("Application cannot change from {from} to {to}")
            }
            Error::Database(db_err) => match db_err.root() {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { constraint, .. } => match constraint.as_deref() {
                    Some("users_email_unique") => "An account with this email address already exists".to_string(),
                    Some("permit_applications_payment_reference_unique") => "Payment reference already in use".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::ProtectedEntity {
                    operation,
                    entity_type,
                    reason,
                    ..
                } => format!("Cannot {operation:?} {entity_type}: {reason}"),
                DbError::TransactionRolledBack { .. } | DbError::Query { .. } | DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::FileSystem(FileSystemError::NotFound { .. }) => "File not found".to_string(),
            Error::FileSystem(_) => "Internal server error".to_string(),
            Error::Payment(payment_err) => payment_err.user_message(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl RollbackError for Error {
    fn rolled_back(self) -> Self {
        match self {
            Error::Database(db_err) => Error::Database(db_err.rolled_back()),
            other => other,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log full details server-side; level depends on who is at fault
        if status.is_server_error() {
            match &self {
                Error::Database(db_err) => {
                    tracing::error!(code = db_err.code(), "Database error: {:#}", self);
                }
                _ => tracing::error!("Internal service error: {:#}", self),
            }
        } else {
            match &self {
                Error::Database(_) => tracing::warn!("Database constraint error: {}", self),
                Error::Unauthenticated { .. } | Error::InsufficientPermissions { .. } => {
                    tracing::info!("Authorization error: {}", self);
                }
                Error::InvalidTransition { .. } | Error::Conflict { .. } => tracing::warn!("Conflict error: {}", self),
                _ => tracing::debug!("Client error: {}", self),
            }
        }

        let body = match &self {
            Error::Validation { fields } => json!({
                "message": self.user_message(),
                "errors": fields,
            }),
            Error::InvalidTransition { from, to } => json!({
                "message": self.user_message(),
                "current_status": from,
                "requested_status": to,
            }),
            _ => json!({ "message": self.user_message() }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_collects_all_fields() {
        let err = Validator::new()
            .required("", "applicant_name")
            .required("  ", "vin")
            .check(2024 >= 1900, "model_year", "out of range")
            .finish()
            .unwrap_err();

        match err {
            Error::Validation { fields } => {
                assert_eq!(
                    fields,
                    vec![FieldError::new("applicant_name", "is required"), FieldError::new("vin", "is required")]
                );
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_is_unprocessable() {
        let err = Error::Validation {
            fields: vec![FieldError::new("email", "is invalid")],
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_rolled_back_database_errors_keep_status_of_cause() {
        let err = Error::Database(DbError::NotFound).rolled_back();
        assert!(matches!(err, Error::Database(DbError::TransactionRolledBack { .. })));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_errors_hide_details() {
        let err = Error::Other(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "Internal server error");
    }

    #[test]
    fn test_invalid_transition_is_conflict() {
        let err = Error::InvalidTransition {
            from: ApplicationStatus::PermitReady,
            to: ApplicationStatus::PaymentReceived,
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.user_message(), "Application cannot change from PERMIT_READY to PAYMENT_RECEIVED");
    }
}
