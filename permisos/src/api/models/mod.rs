//! API request and response data models.
//!
//! These structures define the public HTTP contract and are kept apart from the database rows in
//! [`crate::db::models`], so storage can change without breaking clients. Every model derives
//! `utoipa::ToSchema` for the OpenAPI document served at `/admin/docs`.
//!
//! - [`auth`]: registration, login and password management payloads
//! - [`users`]: profiles, the authenticated [`users::CurrentUser`], and admin account changes
//! - [`applications`]: permit applications, payments, renewals and staff decisions
//! - [`admin`]: dashboard statistics and audit log queries
//! - [`pagination`]: `skip`/`limit` query parameters and the paginated list wrapper

pub mod admin;
pub mod applications;
pub mod auth;
pub mod pagination;
pub mod users;
