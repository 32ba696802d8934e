//! API models for the admin dashboard and audit log.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::{db::models::applications::StatusCount, types::UserId};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DashboardStats {
    pub total_applications: i64,
    /// Applications per status; statuses with no applications are omitted
    pub status_counts: Vec<StatusCount>,
    /// Paid applications whose permit has not been issued yet
    pub awaiting_issuance: i64,
    /// Applications waiting on a staff renewal decision
    pub pending_renewals: i64,
    pub total_users: i64,
}

/// Query parameters for the security event log
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct SecurityEventsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,

    /// Exact action name, e.g. `auth.login_failure`
    pub action_type: Option<String>,
}
