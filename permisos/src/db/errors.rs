use crate::types::Operation;
use thiserror::Error;

/// Unified error type for database operations that application code can handle.
///
/// Constraint variants keep the Postgres SQLSTATE so it reaches the logs; see [`DbError::code`].
#[derive(Error, Debug)]
pub enum DbError {
    /// Entity not found by the given identifier
    #[error("Entity not found")]
    NotFound,

    #[error("Unique constraint violation")]
    UniqueViolation {
        code: Option<String>,
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    #[error("Foreign key constraint violation")]
    ForeignKeyViolation {
        code: Option<String>,
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    #[error("Check constraint violation")]
    CheckViolation {
        code: Option<String>,
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Entity cannot be modified or deleted due to retention rules
    #[error("{operation:?} cannot be applied to entity of type {entity_type}: {reason}")]
    ProtectedEntity {
        operation: Operation,
        reason: String,
        entity_type: String,
        entity_id: Option<String>,
    },

    /// A transaction callback failed and the transaction was rolled back
    #[error("transaction rolled back: {source}")]
    TransactionRolledBack {
        #[source]
        source: Box<DbError>,
    },

    /// Driver error that callers are not expected to recover from
    #[error("database error{}: {source}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Query {
        code: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// SQLSTATE reported by Postgres, when the error came from the server.
    pub fn code(&self) -> Option<&str> {
        match self {
            DbError::UniqueViolation { code, .. }
            | DbError::ForeignKeyViolation { code, .. }
            | DbError::CheckViolation { code, .. }
            | DbError::Query { code, .. } => code.as_deref(),
            DbError::TransactionRolledBack { source } => source.code(),
            DbError::NotFound | DbError::ProtectedEntity { .. } | DbError::Other(_) => None,
        }
    }

    /// Wrap a callback failure after rollback. Already-wrapped errors are not nested again.
    pub fn rolled_back(self) -> Self {
        match self {
            DbError::TransactionRolledBack { .. } => self,
            other => DbError::TransactionRolledBack { source: Box::new(other) },
        }
    }

    /// The error with any rollback wrapper removed, for matching on the underlying cause.
    pub fn root(&self) -> &DbError {
        match self {
            DbError::TransactionRolledBack { source } => source.root(),
            other => other,
        }
    }
}

/// Convert from sqlx::Error using sqlx's error categorization
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let constraint = db_err.constraint().map(|s| s.to_string());
                let table = db_err.table().map(|s| s.to_string());
                let message = db_err.message().to_string();

                if db_err.is_unique_violation() {
                    DbError::UniqueViolation {
                        code,
                        constraint,
                        table,
                        message,
                    }
                } else if db_err.is_foreign_key_violation() {
                    DbError::ForeignKeyViolation {
                        code,
                        constraint,
                        table,
                        message,
                    }
                } else if db_err.is_check_violation() {
                    DbError::CheckViolation {
                        code,
                        constraint,
                        table,
                        message,
                    }
                } else {
                    DbError::Query { code, source: err }
                }
            }
            _ => DbError::Query { code: None, source: err },
        }
    }
}

/// Type alias for database operation results
pub type Result<T> = std::result::Result<T, DbError>;
