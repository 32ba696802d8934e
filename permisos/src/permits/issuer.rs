//! Permit issuance.
//!
//! ```text
//! PAYMENT_RECEIVED ─┐
//!                   ├─▶ GENERATING_PERMIT ─▶ render + store PDF ─┬─▶ PERMIT_READY
//! ERROR_GENERATING ─┘                                             └─▶ ERROR_GENERATING_PERMIT
//! ```
//!
//! Entering GENERATING_PERMIT is a claim: the row lock serializes claimants, the folio is
//! reserved in the same transaction, and `permit_generation_started_at` identifies the owner.
//! A second `issue` while the claim is live fails with a conflict. Once the claim is older than
//! `permits.generation_timeout` it is treated as abandoned and the next `issue` takes it over;
//! the previous owner then loses its final write and discards its file.
//!
//! Rendering and storage happen outside any transaction.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Utc};
use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Config,
    db::{
        handlers::{Applications, Repository, Users},
        models::applications::{ApplicationDBResponse, PermitDocumentUpdate},
        pool::{Database, TransactionMode},
    },
    email::EmailService,
    errors::{Error, Result},
    permits::{
        document::{PermitDocument, PermitRenderer},
        status::ApplicationStatus,
        storage::PermitStorage,
        transitions::{Actor, TransitionOutcome, transition},
    },
    types::{ApplicationId, abbrev_uuid},
};

#[derive(Clone)]
pub struct PermitIssuer {
    db: Database,
    storage: Arc<dyn PermitStorage>,
    renderer: PermitRenderer,
    config: Config,
    /// Issuance started by [`spawn_issue`](Self::spawn_issue), awaited on shutdown
    in_flight: Arc<Mutex<JoinSet<()>>>,
}

/// What a successful claim hands to generation.
struct Claim {
    application: ApplicationDBResponse,
    folio: String,
    claimed_at: DateTime<Utc>,
}

impl PermitIssuer {
    pub fn new(db: Database, storage: Arc<dyn PermitStorage>, renderer: PermitRenderer, config: Config) -> Self {
        Self {
            db,
            storage,
            renderer,
            config,
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Age after which a GENERATING_PERMIT claim counts as abandoned.
    pub fn generation_timeout(&self) -> std::time::Duration {
        self.config.permits.generation_timeout
    }

    /// Generate, store and record the permit for application `id`.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id), %actor), err)]
    pub async fn issue(&self, id: ApplicationId, actor: Actor) -> Result<ApplicationDBResponse> {
        let claim = self.claim(id, actor).await?;
        let claimed_at = claim.claimed_at;

        match self.generate(&claim).await {
            Ok(update) => {
                let stored_key = update.permit_file_path.clone();
                let recorded = self
                    .db
                    .with_transaction(TransactionMode::ReadWrite, |conn| {
                        Box::pin(async move {
                            if Applications::new(&mut *conn)
                                .set_permit_document(id, claimed_at, &update)
                                .await?
                                .is_none()
                            {
                                return Ok::<_, Error>(None);
                            }
                            let outcome = transition(conn, id, ApplicationStatus::PermitReady, actor, None).await?;
                            Ok::<_, Error>(Some(outcome.into_application()))
                        })
                    })
                    .await?;

                let Some(issued) = recorded else {
                    warn!(folio = %claim.folio, "Permit generation was taken over; discarding document");
                    if let Err(e) = self.storage.delete(&stored_key).await {
                        warn!(error = %e, key = %stored_key, "Failed to remove superseded permit document");
                    }
                    return Err(Error::Conflict {
                        message: format!("permit generation for application {id} was taken over"),
                    });
                };

                counter!("permisos_permits_issued_total").increment(1);
                info!(folio = %claim.folio, "Permit issued");
                self.notify_permit_ready(&issued).await;
                Ok(issued)
            }
            Err(generation_error) => {
                counter!("permisos_permit_generation_failures_total").increment(1);
                error!(error = %generation_error, "Permit generation failed");

                let reason = generation_error.to_string();
                let recorded = self
                    .db
                    .with_transaction(TransactionMode::ReadWrite, |conn| {
                        Box::pin(async move {
                            let current = Applications::new(&mut *conn).get_for_update(id).await?;
                            let still_ours = current.is_some_and(|a| {
                                a.status == ApplicationStatus::GeneratingPermit && a.permit_generation_started_at == Some(claimed_at)
                            });
                            if !still_ours {
                                return Ok::<_, Error>(None);
                            }
                            transition(conn, id, ApplicationStatus::ErrorGeneratingPermit, actor, Some(reason.as_str()))
                                .await
                                .map(Some)
                        })
                    })
                    .await;
                match recorded {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!("Generation failed after the claim was taken over; leaving status alone"),
                    Err(e) => error!(error = %e, "Failed to record permit generation failure"),
                }

                Err(generation_error)
            }
        }
    }

    /// Move to GENERATING_PERMIT (or take over an abandoned claim) and reserve the folio.
    async fn claim(&self, id: ApplicationId, actor: Actor) -> Result<Claim> {
        let timeout = chrono::Duration::from_std(self.config.permits.generation_timeout).unwrap_or(chrono::Duration::minutes(10));
        let stale_before = Utc::now() - timeout;

        let application = self
            .db
            .with_transaction(TransactionMode::ReadWrite, |conn| {
                Box::pin(async move {
                    let outcome = transition(&mut *conn, id, ApplicationStatus::GeneratingPermit, actor, None).await?;
                    let mut applications = Applications::new(conn);

                    let application = match outcome {
                        TransitionOutcome::Applied { application, .. } => application,
                        TransitionOutcome::Unchanged { .. } => {
                            let reclaimed = applications.reclaim_generation(id, stale_before).await?.ok_or_else(|| Error::Conflict {
                                message: format!("permit generation for application {id} is already in progress"),
                            })?;
                            warn!("Taking over abandoned permit generation");
                            reclaimed
                        }
                    };

                    if application.folio.is_some() {
                        return Ok::<_, Error>(application);
                    }
                    let folio = format_folio(Utc::now(), applications.next_folio_number().await?);
                    Ok(applications.reserve_folio(id, &folio).await?)
                })
            })
            .await?;

        let folio = application.folio.clone().ok_or_else(|| Error::Internal {
            operation: format!("reserve folio for application {id}"),
        })?;
        let claimed_at = application.permit_generation_started_at.ok_or_else(|| Error::Internal {
            operation: format!("claim permit generation for application {id}"),
        })?;

        Ok(Claim {
            application,
            folio,
            claimed_at,
        })
    }

    /// Run [`issue`](Self::issue) in the background; failures are logged.
    ///
    /// The task is tracked until it finishes, see [`wait_for_in_flight`](Self::wait_for_in_flight).
    pub fn spawn_issue(&self, id: ApplicationId, actor: Actor) {
        let issuer = self.clone();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Reap finished tasks so the set only holds live ones
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            if let Err(e) = issuer.issue(id, actor).await {
                warn!(application_id = %abbrev_uuid(&id), error = %e, "Background permit issuance failed");
            }
        });
    }

    /// Wait for every issuance started by [`spawn_issue`](Self::spawn_issue) so far.
    pub async fn wait_for_in_flight(&self) {
        let mut tasks = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        if !tasks.is_empty() {
            info!(count = tasks.len(), "Waiting for in-flight permit issuance");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Permit issuance task panicked");
            }
        }
    }

    async fn generate(&self, claim: &Claim) -> Result<PermitDocumentUpdate> {
        let Claim {
            application,
            folio,
            claimed_at,
        } = claim;
        let valid_from = Utc::now();
        let valid_until = valid_from + chrono::Duration::days(i64::from(self.config.permits.validity_days));

        let document = PermitDocument::new(application, folio, valid_from, valid_until, &self.config.permits.issuing_authority);
        let pdf = self.renderer.render_pdf(&document)?;

        // One file per claim, so a superseded generation never overwrites the live one
        let key = format!(
            "{:04}/{:02}/{folio}-{}.pdf",
            valid_from.year(),
            valid_from.month(),
            claimed_at.timestamp_micros()
        );
        self.storage.store(&key, &pdf).await?;

        Ok(PermitDocumentUpdate {
            folio: folio.to_string(),
            permit_file_path: key,
            valid_from,
            valid_until,
        })
    }

    async fn notify_permit_ready(&self, application: &ApplicationDBResponse) {
        let result: Result<()> = async {
            let mut conn = self.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
            let Some(user) = Users::new(&mut conn).get_by_id(application.user_id).await? else {
                return Ok(());
            };
            EmailService::new(&self.config)?.send_permit_ready_email(&user, application).await
        }
        .await;

        if let Err(e) = result {
            warn!(application_id = %abbrev_uuid(&application.id), error = %e, "Failed to send permit ready email");
        }
    }
}

/// `PD-<year>-<sequence>`, zero-padded to six digits.
pub fn format_folio(now: DateTime<Utc>, sequence: i64) -> String {
    format!("PD-{}-{sequence:06}", now.year())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::users::Role;
    use crate::db::pool::DEFAULT_SLOW_QUERY_THRESHOLD;
    use crate::permits::storage::{FileSystemError, LocalPermitStorage};
    use crate::test_utils::{create_test_application, create_test_config, create_test_user};
    use chrono::TimeZone;
    use sqlx::PgPool;

    struct FailingStorage;

    #[async_trait::async_trait]
    impl PermitStorage for FailingStorage {
        async fn store(&self, key: &str, _contents: &[u8]) -> std::result::Result<(), FileSystemError> {
            Err(FileSystemError::Io {
                path: key.to_string(),
                source: std::io::Error::other("disk full"),
            })
        }
        async fn retrieve(&self, key: &str) -> std::result::Result<Vec<u8>, FileSystemError> {
            Err(FileSystemError::NotFound { path: key.to_string() })
        }
        async fn delete(&self, _key: &str) -> std::result::Result<bool, FileSystemError> {
            Ok(false)
        }
        async fn exists(&self, _key: &str) -> std::result::Result<bool, FileSystemError> {
            Ok(false)
        }
    }

    /// Local storage that takes a while, and counts what it was asked to store.
    struct SlowStorage {
        inner: LocalPermitStorage,
        delay: std::time::Duration,
        stored: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl PermitStorage for SlowStorage {
        async fn store(&self, key: &str, contents: &[u8]) -> std::result::Result<(), FileSystemError> {
            tokio::time::sleep(self.delay).await;
            self.stored.lock().unwrap().push(key.to_string());
            self.inner.store(key, contents).await
        }
        async fn retrieve(&self, key: &str) -> std::result::Result<Vec<u8>, FileSystemError> {
            self.inner.retrieve(key).await
        }
        async fn delete(&self, key: &str) -> std::result::Result<bool, FileSystemError> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> std::result::Result<bool, FileSystemError> {
            self.inner.exists(key).await
        }
    }

    async fn paid_application(pool: &PgPool) -> ApplicationDBResponse {
        let user = create_test_user(pool, Role::Client).await;
        let application = create_test_application(pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        transition(&mut conn, application.id, ApplicationStatus::PaymentReceived, Actor::System("test"), None)
            .await
            .unwrap()
            .into_application()
    }

    #[test]
    fn test_folio_format() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(format_folio(now, 1000), "PD-2025-001000");
    }

    #[sqlx::test]
    async fn test_issue_stores_pdf_and_marks_ready(pool: PgPool) {
        let application = paid_application(&pool).await;
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalPermitStorage::new(dir.path()));
        let issuer = PermitIssuer::new(
            Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD),
            storage.clone(),
            PermitRenderer::default(),
            create_test_config(),
        );

        let issued = issuer.issue(application.id, Actor::System("test")).await.unwrap();

        assert_eq!(issued.status, ApplicationStatus::PermitReady);
        assert!(issued.permit_generated_at.is_some());
        let folio = issued.folio.clone().unwrap();
        assert!(folio.starts_with("PD-"));
        let path = issued.permit_file_path.clone().unwrap();
        assert!(path.contains(&format!("/{folio}-")));
        assert!(path.ends_with(".pdf"));
        assert!(storage.exists(&path).await.unwrap());
        assert!(issued.valid_until.unwrap() > issued.valid_from.unwrap());
    }

    #[sqlx::test]
    async fn test_storage_failure_moves_to_error_state_and_can_retry(pool: PgPool) {
        let application = paid_application(&pool).await;
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);

        let failing = PermitIssuer::new(db.clone(), Arc::new(FailingStorage), PermitRenderer::default(), create_test_config());
        let err = failing.issue(application.id, Actor::System("test")).await.unwrap_err();
        assert!(matches!(err, Error::FileSystem(FileSystemError::Io { .. })));

        let mut conn = pool.acquire().await.unwrap();
        let failed = Applications::new(&mut conn).get_by_id(application.id).await.unwrap().unwrap();
        assert_eq!(failed.status, ApplicationStatus::ErrorGeneratingPermit);
        assert!(failed.permit_file_path.is_none());

        let dir = tempfile::tempdir().unwrap();
        let working = PermitIssuer::new(db, Arc::new(LocalPermitStorage::new(dir.path())), PermitRenderer::default(), create_test_config());
        let issued = working.issue(application.id, Actor::System("test")).await.unwrap();
        assert_eq!(issued.status, ApplicationStatus::PermitReady);
    }

    #[sqlx::test]
    async fn test_unpaid_application_cannot_be_issued(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let dir = tempfile::tempdir().unwrap();
        let issuer = PermitIssuer::new(
            Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD),
            Arc::new(LocalPermitStorage::new(dir.path())),
            PermitRenderer::default(),
            create_test_config(),
        );

        let err = issuer.issue(application.id, Actor::System("test")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[sqlx::test]
    async fn test_concurrent_issue_produces_one_permit(pool: PgPool) {
        let application = paid_application(&pool).await;
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SlowStorage {
            inner: LocalPermitStorage::new(dir.path()),
            delay: std::time::Duration::from_millis(300),
            stored: Mutex::new(Vec::new()),
        });
        let issuer = PermitIssuer::new(
            Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD),
            storage.clone(),
            PermitRenderer::default(),
            create_test_config(),
        );

        let (first, second) = tokio::join!(
            issuer.issue(application.id, Actor::System("webhook")),
            issuer.issue(application.id, Actor::System("admin")),
        );

        let (issued, rejected) = match (first, second) {
            (Ok(issued), Err(e)) | (Err(e), Ok(issued)) => (issued, e),
            (first, second) => panic!("expected exactly one issuance, got {first:?} and {second:?}"),
        };
        assert!(matches!(rejected, Error::Conflict { .. }));

        let mut conn = pool.acquire().await.unwrap();
        let saved = Applications::new(&mut conn).get_by_id(application.id).await.unwrap().unwrap();
        assert_eq!(saved.status, ApplicationStatus::PermitReady);
        assert_eq!(saved.folio, issued.folio);
        assert_eq!(saved.permit_file_path, issued.permit_file_path);

        let stored = storage.stored.lock().unwrap().clone();
        assert_eq!(stored.len(), 1);
        assert_eq!(Some(&stored[0]), saved.permit_file_path.as_ref());
        assert!(stored[0].contains(saved.folio.as_deref().unwrap()));
    }

    #[sqlx::test]
    async fn test_abandoned_generation_is_taken_over(pool: PgPool) {
        let application = paid_application(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        transition(&mut conn, application.id, ApplicationStatus::GeneratingPermit, Actor::System("test"), None)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let issuer = PermitIssuer::new(
            Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD),
            Arc::new(LocalPermitStorage::new(dir.path())),
            PermitRenderer::default(),
            create_test_config(),
        );

        // Claim is fresh: someone else is still working on it
        let err = issuer.issue(application.id, Actor::System("test")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        sqlx::query("UPDATE permit_applications SET permit_generation_started_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(application.id)
            .execute(&pool)
            .await
            .unwrap();

        let issued = issuer.issue(application.id, Actor::System("test")).await.unwrap();
        assert_eq!(issued.status, ApplicationStatus::PermitReady);
        assert!(issued.folio.is_some());
    }

    #[sqlx::test]
    async fn test_spawned_issuance_is_awaited(pool: PgPool) {
        let application = paid_application(&pool).await;
        let dir = tempfile::tempdir().unwrap();
        let issuer = PermitIssuer::new(
            Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD),
            Arc::new(SlowStorage {
                inner: LocalPermitStorage::new(dir.path()),
                delay: std::time::Duration::from_millis(200),
                stored: Mutex::new(Vec::new()),
            }),
            PermitRenderer::default(),
            create_test_config(),
        );

        issuer.spawn_issue(application.id, Actor::System("test"));
        issuer.wait_for_in_flight().await;

        let mut conn = pool.acquire().await.unwrap();
        let saved = Applications::new(&mut conn).get_by_id(application.id).await.unwrap().unwrap();
        assert_eq!(saved.status, ApplicationStatus::PermitReady);
    }
}
