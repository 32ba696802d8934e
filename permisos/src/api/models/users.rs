//! API request/response models for users.

use super::pagination::Pagination;
use crate::db::models::users::{AccountStatus, Role, UserDBResponse};
use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Profile fields a user may change about themselves.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Account changes staff can make from the admin portal.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdminUserUpdate {
    pub role: Option<Role>,
    /// Whether the account may log in to the admin portal
    pub is_admin_portal: Option<bool>,
    pub account_status: Option<AccountStatus>,
}

// User response models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_admin_portal: bool,
    pub account_status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Query parameters for listing users
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListUsersQuery {
    /// Pagination parameters
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    pub role: Option<Role>,

    pub account_status: Option<AccountStatus>,

    /// Search query to filter users by name or email (case-insensitive substring match)
    pub search: Option<String>,
}

/// The authenticated caller, resolved from the session cookie.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentUser {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    /// True only when the account is allowed in the admin portal and this session logged in there
    pub is_admin_portal: bool,
}

impl From<UserDBResponse> for UserResponse {
    fn from(db: UserDBResponse) -> Self {
        Self {
            id: db.id,
            email: db.email,
            first_name: db.first_name,
            last_name: db.last_name,
            role: db.role,
            is_admin_portal: db.is_admin_portal,
            account_status: db.account_status,
            created_at: db.created_at,
            updated_at: db.updated_at,
            last_login: db.last_login_at,
        }
    }
}

impl From<UserDBResponse> for CurrentUser {
    fn from(db: UserDBResponse) -> Self {
        Self {
            id: db.id,
            email: db.email,
            first_name: db.first_name,
            last_name: db.last_name,
            role: db.role,
            is_admin_portal: db.is_admin_portal,
        }
    }
}
