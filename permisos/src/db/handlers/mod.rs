//! Repositories over the application's tables.
//!
//! Each repository borrows a `&mut PgConnection`, so it can run on a pooled connection or inside
//! a transaction without changes.
//!
//! - [`Users`]: accounts, never hard-deleted
//! - [`Sessions`]: server-side login sessions
//! - [`PasswordResetTokens`]: single-use reset tokens
//! - [`Applications`]: permit applications
//! - [`PaymentVerifications`] / [`SecurityEvents`]: append-only audit logs
//! - [`WebhookEvents`]: provider event ids used to drop replays

pub mod applications;
pub mod audit_logs;
pub mod password_reset_tokens;
pub mod repository;
pub mod sessions;
pub mod users;
pub mod webhook_events;

pub use applications::Applications;
pub use audit_logs::{PaymentVerifications, SecurityEvents};
pub use password_reset_tokens::PasswordResetTokens;
pub use repository::Repository;
pub use sessions::Sessions;
pub use users::Users;
pub use webhook_events::WebhookEvents;
