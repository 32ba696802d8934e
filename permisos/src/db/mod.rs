//! Database layer.
//!
//! ```text
//! ┌─────────────┐
//! │  Services   │  (api handlers, permits::transitions, payment webhooks)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │  Database   │  (db::pool - query / with_transaction, SQL logging)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - one per table)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`pool`]: the shared [`pool::Database`] handle, injected into services through `AppState`
//! - [`handlers`]: repositories for each table
//! - [`models`]: row and request structures
//! - [`errors`]: [`errors::DbError`], which keeps the Postgres SQLSTATE of failed statements
//!
//! # Transactions
//!
//! Multi-statement writes go through [`pool::Database::with_transaction`]. The closure gets a
//! `&mut PgConnection`, so any repository can be built inside it:
//!
//! ```ignore
//! db.with_transaction(TransactionMode::ReadWrite, |conn| {
//!     Box::pin(async move {
//!         let application = Applications::new(conn).create(&request).await?;
//!         SecurityEvents::new(conn).append(&event).await?;
//!         Ok(application)
//!     })
//! })
//! .await?;
//! ```
//!
//! A failing closure rolls the transaction back and nothing it wrote survives.
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are applied at startup through [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod models;
pub mod pool;
