//! Shared shape of the table repositories.

use crate::db::errors::Result;

/// Read and write access to one table whose rows are kept for good.
///
/// There is no delete: users are disabled, applications end in CANCELLED or EXPIRED, and reset
/// tokens are marked used. Repositories borrow a `&mut PgConnection`, so the caller picks a plain
/// pooled connection or a transaction from
/// [`Database::with_transaction`](crate::db::pool::Database::with_transaction).
#[async_trait::async_trait]
pub trait Repository {
    type New: Sync;
    type Patch: Sync;
    type Record;
    type Id: Send + Sync;
    type Filter: Send + Sync;

    async fn create(&mut self, new: &Self::New) -> Result<Self::Record>;

    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Record>>;

    /// One page of matching rows, newest first.
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Record>>;

    /// Matching rows across all pages; the filter's `skip`/`limit` are ignored.
    async fn count(&mut self, filter: &Self::Filter) -> Result<i64>;

    /// `NotFound` when `id` does not exist.
    async fn update(&mut self, id: Self::Id, patch: &Self::Patch) -> Result<Self::Record>;
}
