//! Authentication and authorization.
//!
//! Citizens and staff log in with email and password. A successful login creates a row in
//! `user_sessions` and sets an opaque, HTTP-only cookie; the row id is a keyed digest of the
//! cookie value, so a leaked table cannot be replayed as cookies.
//!
//! Staff log in through the admin portal, which marks the session with `is_admin_portal`.
//! Admin routes require both the `admin` role and an admin-portal session.
//!
//! # Modules
//!
//! - [`current_user`]: `CurrentUser` / `AdminUser` extractors
//! - [`password`]: Argon2 hashing and password rules
//! - [`permissions`]: ownership checks for client routes
//! - [`session`]: session creation, lookup and cookies
//!
//! # Usage in Handlers
//!
//! ```ignore
//! async fn list_my_applications(
//!     State(state): State<AppState>,
//!     current_user: CurrentUser,
//! ) -> Result<Json<Vec<ApplicationResponse>>, Error> { ... }
//!
//! async fn admin_stats(State(state): State<AppState>, AdminUser(admin): AdminUser) -> ... { ... }
//! ```

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};

pub mod current_user;
pub mod password;
pub mod permissions;
pub mod session;

/// Caller network details recorded on sessions and audit events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    /// Read the first `X-Forwarded-For` hop (falling back to `X-Real-IP`) and `User-Agent`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty());

        let ip_address = header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .or_else(|| header("x-real-ip"))
            .map(str::to_string);

        Self {
            ip_address,
            user_agent: header("user-agent").map(|ua| ua.chars().take(512).collect()),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
