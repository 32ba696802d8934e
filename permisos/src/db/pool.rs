//! Connection pool wrapper with timing, slow-query logging and a transaction helper.
//!
//! [`Database`] is built once at startup and handed to everything that needs it through
//! [`crate::AppState`]. It never lives in a global.
//!
//! ```text
//! ┌──────────────┐   query_as / execute / with_connection
//! │   Database   │ ─────────────────────────────────────────▶ acquire → run → time → release
//! │  (PgPool +   │
//! │  threshold)  │   with_transaction(mode, f)
//! └──────────────┘ ─────────────────────────────────────────▶ BEGIN [READ ONLY] → f(conn)
//!                                                               ├─ Ok  → COMMIT
//!                                                               └─ Err → ROLLBACK → wrap error
//! ```
//!
//! Connections are returned to the pool when their guard drops, so every exit path
//! (success, error, panic, cancelled future) releases them. Nothing here retries: a
//! failed statement is logged and handed straight back to the caller.

use std::fmt;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use metrics::counter;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Arguments, FromRow, PgConnection, PgPool};
use tracing::{debug, error, warn};

use crate::config::PoolSettings;
use crate::db::errors::{DbError, Result};

/// Statements slower than this are logged at `warn` unless configured otherwise.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(500);

/// Access mode for [`Database::with_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Errors that can come out of a transaction callback.
///
/// `rolled_back` is applied to the callback's error after the rollback has been issued, so
/// callers can tell a rolled-back failure from one that happened before `BEGIN`.
pub trait RollbackError: From<DbError> + fmt::Display {
    fn rolled_back(self) -> Self;
}

impl RollbackError for DbError {
    fn rolled_back(self) -> Self {
        DbError::rolled_back(self)
    }
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
    slow_query_threshold: Duration,
}

impl Database {
    /// Open a pool against `url` using the configured limits.
    pub async fn connect(url: &str, settings: &PoolSettings, slow_query_threshold: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .idle_timeout(settings.idle_timeout())
            .max_lifetime(settings.max_lifetime())
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool, slow_query_threshold))
    }

    pub fn from_pool(pool: PgPool, slow_query_threshold: Duration) -> Self {
        Self {
            pool,
            slow_query_threshold,
        }
    }

    /// The underlying pool, for migrations and tests.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn slow_query_threshold(&self) -> Duration {
        self.slow_query_threshold
    }

    /// Run `sql` with positional `args` and map every row into `T`.
    pub async fn query_as<T>(&self, sql: &str, args: PgArguments) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let param_count = args.len();
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();

        let result = sqlx::query_as_with::<_, T, _>(sql, args).fetch_all(&mut *conn).await;
        self.observe(sql, param_count, started.elapsed(), result.as_ref().err());

        Ok(result?)
    }

    /// Run a statement that returns no rows, yielding the number of rows affected.
    pub async fn execute(&self, sql: &str, args: PgArguments) -> Result<u64> {
        let param_count = args.len();
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();

        let result = sqlx::query_with(sql, args).execute(&mut *conn).await;
        self.observe(sql, param_count, started.elapsed(), result.as_ref().err());

        Ok(result?.rows_affected())
    }

    /// Borrow a pooled connection for several statements outside a transaction.
    ///
    /// `label` names the unit of work in the slow-query log.
    pub async fn with_connection<T, F>(&self, label: &str, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();

        let result = f(&mut *conn).await;
        let elapsed = started.elapsed();
        if let Err(e) = &result {
            error!(label, code = e.code(), error = %e, "Database work failed");
        }
        self.warn_if_slow(label, elapsed);

        result
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`. When `f` fails the transaction is rolled back before the
    /// error is returned, wrapped through [`RollbackError::rolled_back`]. A failing rollback is
    /// logged and the callback's error still wins.
    pub async fn with_transaction<T, E, F>(&self, mode: TransactionMode, f: F) -> std::result::Result<T, E>
    where
        T: Send,
        E: RollbackError + Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, std::result::Result<T, E>>,
    {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        if mode == TransactionMode::ReadOnly {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
        }

        let outcome = f(&mut *tx).await;

        let result = match outcome {
            Ok(value) => {
                if let Err(e) = tx.commit().await {
                    let e = DbError::from(e);
                    error!(?mode, code = e.code(), error = %e, "Transaction commit failed");
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(?mode, error = %rollback_err, "Transaction rollback failed");
                }
                warn!(?mode, error = %e, "Transaction rolled back");
                Err(e.rolled_back())
            }
        };

        self.warn_if_slow("transaction", started.elapsed());
        result
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn observe(&self, sql: &str, param_count: usize, elapsed: Duration, failure: Option<&sqlx::Error>) {
        if let Some(err) = failure {
            let code = match err {
                sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
                _ => None,
            };
            error!(sql, param_count, code = code.as_deref(), error = %err, "Query failed");
        } else {
            debug!(sql, param_count, elapsed_ms = elapsed.as_millis() as u64, "Query executed");
        }
        self.warn_if_slow(sql, elapsed);
    }

    fn warn_if_slow(&self, what: &str, elapsed: Duration) {
        if elapsed > self.slow_query_threshold {
            counter!("permisos_slow_queries_total").increment(1);
            warn!(
                query = what,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_query_threshold.as_millis() as u64,
                "Slow query"
            );
        }
    }
}
