//! Database record types, one module per table.
//!
//! `*CreateDBRequest` / `*UpdateDBRequest` are the repository inputs; the row structs derive
//! [`sqlx::FromRow`] and are returned as-is.

pub mod applications;
pub mod audit;
pub mod password_reset_tokens;
pub mod sessions;
pub mod users;
pub mod webhook_events;
