//! HTTP request handlers for all API endpoints.
//!
//! Handlers validate input, check who is calling, and run repository or permit-service work.
//! Each returns [`crate::errors::Result`], so failures become JSON error responses with the
//! right status code.
//!
//! # Handler Modules
//!
//! - [`auth`]: registration, login, logout and password management
//! - [`users`]: the caller's profile, plus account administration
//! - [`applications`]: citizen application lifecycle and permit download
//! - [`payments`]: starting payments and the provider webhook
//! - [`admin`]: staff review of applications, payments, renewals and the audit log
//!
//! # Authentication
//!
//! Handlers take [`crate::api::models::users::CurrentUser`] for any logged-in caller, or
//! [`crate::auth::current_user::AdminUser`] for admin-portal sessions. The webhook
//! authenticates with the provider signature instead.

pub mod admin;
pub mod applications;
pub mod auth;
pub mod payments;
pub mod users;
