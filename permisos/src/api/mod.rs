//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Authentication** (`/authentication/*`): registration, login, password resets
//! - **Client API** (`/api/v1/*`): the caller's profile, applications, payments and permits
//! - **Admin API** (`/admin/api/v1/*`): application review, payment verification, users, audit log
//! - **Webhooks** (`/webhooks/payments`): signed payment provider events
//!
//! # OpenAPI Documentation
//!
//! Endpoints are annotated with `utoipa`; the document is served at `/admin/docs`.

pub mod handlers;
pub mod models;
