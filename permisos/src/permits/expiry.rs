//! Background expiry of stale applications, and recovery of stalled issuance.
//!
//! Issued permits past `valid_until` and OXXO vouchers past `oxxo_expires_at` move to EXPIRED.
//! Each application expires in its own transaction through [`transition`], so one failure
//! does not hold back the rest of the batch.
//!
//! Issuance started from a request runs detached; if the process dies first the application
//! sits in PAYMENT_RECEIVED or GENERATING_PERMIT. [`recover_issuance`] picks those up once they
//! are older than the generation timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    db::{
        handlers::Applications,
        pool::{Database, TransactionMode},
    },
    errors::{Error, Result},
    permits::{
        issuer::PermitIssuer,
        status::ApplicationStatus,
        transitions::{Actor, transition},
    },
    types::abbrev_uuid,
};

const SWEEP_BATCH_SIZE: i64 = 100;
const ACTOR: Actor = Actor::System("expiry_sweeper");
const RECOVERY_ACTOR: Actor = Actor::System("issuance_recovery");

/// Expire everything due at `now`. Returns how many applications were expired.
#[instrument(skip(db), err)]
pub async fn sweep_once(db: &Database, now: DateTime<Utc>) -> Result<usize> {
    let due = db
        .with_connection("expiry_due", |conn| {
            Box::pin(async move { Applications::new(conn).due_for_expiry(now, SWEEP_BATCH_SIZE).await })
        })
        .await?;

    let mut expired = 0;
    for application in due {
        let id = application.id;
        let reason = match application.status {
            ApplicationStatus::AwaitingOxxoPayment => "oxxo voucher not paid before deadline",
            _ => "permit validity ended",
        };

        let outcome = db
            .with_transaction(TransactionMode::ReadWrite, |conn| {
                Box::pin(async move { transition(conn, id, ApplicationStatus::Expired, ACTOR, Some(reason)).await })
            })
            .await;

        match outcome {
            Ok(outcome) if outcome.is_applied() => expired += 1,
            Ok(_) => {}
            // Paid or cancelled between the scan and the lock
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(application_id = %abbrev_uuid(&id), %from, "Skipped expiry; status changed since scan");
            }
            Err(e) => warn!(application_id = %abbrev_uuid(&id), error = %e, "Failed to expire application"),
        }
    }

    if expired > 0 {
        counter!("permisos_applications_expired_total").increment(expired as u64);
        info!(expired, "Expired stale applications");
    }
    Ok(expired)
}

/// Re-run issuance for paid applications stalled since before `stale_before`.
///
/// Returns how many were issued. Failures are logged and left for the next pass.
#[instrument(skip(db, issuer), err)]
pub async fn recover_issuance(db: &Database, issuer: &PermitIssuer, stale_before: DateTime<Utc>) -> Result<usize> {
    let stalled = db
        .with_connection("issuance_due", |conn| {
            Box::pin(async move { Applications::new(conn).due_for_issuance(stale_before, SWEEP_BATCH_SIZE).await })
        })
        .await?;

    let mut recovered = 0;
    for application in stalled {
        let id = application.id;
        info!(application_id = %abbrev_uuid(&id), status = %application.status, "Resuming stalled permit issuance");
        match issuer.issue(id, RECOVERY_ACTOR).await {
            Ok(_) => recovered += 1,
            // Someone else got there between the scan and the claim
            Err(Error::Conflict { .. } | Error::InvalidTransition { .. }) => {
                debug!(application_id = %abbrev_uuid(&id), "Skipped recovery; issuance already moving");
            }
            Err(e) => warn!(application_id = %abbrev_uuid(&id), error = %e, "Issuance recovery failed"),
        }
    }

    if recovered > 0 {
        counter!("permisos_permits_recovered_total").increment(recovered as u64);
    }
    Ok(recovered)
}

/// Every `interval` until `shutdown` is cancelled: run [`sweep_once`], then [`recover_issuance`].
pub fn spawn_expiry_sweeper(db: Database, issuer: PermitIssuer, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting expiry sweeper");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let generation_timeout = chrono::Duration::from_std(issuer.generation_timeout()).unwrap_or(chrono::Duration::minutes(10));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = sweep_once(&db, now).await {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                    if let Err(e) = recover_issuance(&db, &issuer, now - generation_timeout).await {
                        warn!(error = %e, "Issuance recovery failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Repository;
    use crate::db::models::applications::{PaymentMethod, PaymentReferenceUpdate, PermitDocumentUpdate};
    use crate::db::models::users::Role;
    use crate::db::pool::DEFAULT_SLOW_QUERY_THRESHOLD;
    use crate::permits::{document::PermitRenderer, storage::LocalPermitStorage};
    use crate::test_utils::{create_test_application, create_test_config, create_test_user};
    use sqlx::PgPool;
    use std::sync::Arc;

    async fn issued_permit(pool: &PgPool, valid_until: DateTime<Utc>) -> uuid::Uuid {
        let user = create_test_user(pool, Role::Client).await;
        let application = create_test_application(pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        transition(&mut conn, application.id, ApplicationStatus::PaymentReceived, Actor::System("test"), None)
            .await
            .unwrap();
        let claimed_at = transition(&mut conn, application.id, ApplicationStatus::GeneratingPermit, Actor::System("test"), None)
            .await
            .unwrap()
            .into_application()
            .permit_generation_started_at
            .unwrap();
        Applications::new(&mut conn)
            .set_permit_document(
                application.id,
                claimed_at,
                &PermitDocumentUpdate {
                    folio: format!("PD-TEST-{}", &application.id.to_string()[..8]),
                    permit_file_path: "2025/01/test.pdf".to_string(),
                    valid_from: valid_until - chrono::Duration::days(30),
                    valid_until,
                },
            )
            .await
            .unwrap()
            .unwrap();
        transition(&mut conn, application.id, ApplicationStatus::PermitReady, Actor::System("test"), None)
            .await
            .unwrap();
        application.id
    }

    #[sqlx::test]
    async fn test_sweep_expires_only_due_permits(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let now = Utc::now();
        let stale = issued_permit(&pool, now - chrono::Duration::days(1)).await;
        let fresh = issued_permit(&pool, now + chrono::Duration::days(10)).await;

        assert_eq!(sweep_once(&db, now).await.unwrap(), 1);

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);
        let stale = repo.get_by_id(stale).await.unwrap().unwrap();
        assert_eq!(stale.status, ApplicationStatus::Expired);
        assert!(stale.expired_at.is_some());
        assert_eq!(repo.get_by_id(fresh).await.unwrap().unwrap().status, ApplicationStatus::PermitReady);

        // Nothing left to do
        drop(repo);
        assert_eq!(sweep_once(&db, now).await.unwrap(), 0);
    }

    #[sqlx::test]
    async fn test_sweep_expires_unpaid_oxxo_vouchers(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        Applications::new(&mut conn)
            .set_payment_reference(
                application.id,
                &PaymentReferenceUpdate {
                    payment_method: PaymentMethod::Oxxo,
                    payment_reference: "pi_voucher".to_string(),
                    oxxo_reference: Some("93000012345678".to_string()),
                    oxxo_expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
                },
            )
            .await
            .unwrap();
        transition(&mut conn, application.id, ApplicationStatus::AwaitingOxxoPayment, Actor::System("test"), None)
            .await
            .unwrap();

        assert_eq!(sweep_once(&db, Utc::now()).await.unwrap(), 1);
        let expired = Applications::new(&mut conn).get_by_id(application.id).await.unwrap().unwrap();
        assert_eq!(expired.status, ApplicationStatus::Expired);
    }

    fn test_issuer(db: &Database, dir: &std::path::Path) -> PermitIssuer {
        PermitIssuer::new(
            db.clone(),
            Arc::new(LocalPermitStorage::new(dir)),
            PermitRenderer::default(),
            create_test_config(),
        )
    }

    #[sqlx::test]
    async fn test_recovery_issues_stalled_applications(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let dir = tempfile::tempdir().unwrap();
        let issuer = test_issuer(&db, dir.path());
        let user = create_test_user(&pool, Role::Client).await;

        // Paid, but the process died before issuance started
        let paid = create_test_application(&pool, user.id).await;
        // Claimed an hour ago and never finished
        let abandoned = create_test_application(&pool, user.id).await;
        // Paid just now; the request that paid it is still issuing
        let recent = create_test_application(&pool, user.id).await;

        let mut conn = pool.acquire().await.unwrap();
        for id in [paid.id, abandoned.id, recent.id] {
            transition(&mut conn, id, ApplicationStatus::PaymentReceived, Actor::System("test"), None)
                .await
                .unwrap();
        }
        transition(&mut conn, abandoned.id, ApplicationStatus::GeneratingPermit, Actor::System("test"), None)
            .await
            .unwrap();
        sqlx::query(
            "UPDATE permit_applications SET updated_at = NOW() - INTERVAL '1 hour', permit_generation_started_at = NOW() - INTERVAL '1 hour' WHERE id = ANY($1)",
        )
        .bind(vec![paid.id, abandoned.id])
        .execute(&pool)
        .await
        .unwrap();

        let recovered = recover_issuance(&db, &issuer, Utc::now() - chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(recovered, 2);

        let mut repo = Applications::new(&mut conn);
        assert_eq!(repo.get_by_id(paid.id).await.unwrap().unwrap().status, ApplicationStatus::PermitReady);
        assert_eq!(repo.get_by_id(abandoned.id).await.unwrap().unwrap().status, ApplicationStatus::PermitReady);
        assert_eq!(repo.get_by_id(recent.id).await.unwrap().unwrap().status, ApplicationStatus::PaymentReceived);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let options = sqlx::postgres::PgConnectOptions::new();
        let pool = sqlx::postgres::PgPoolOptions::new().connect_lazy_with(options);
        let db = Database::from_pool(pool, DEFAULT_SLOW_QUERY_THRESHOLD);
        let dir = tempfile::tempdir().unwrap();
        let issuer = test_issuer(&db, dir.path());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let handle = spawn_expiry_sweeper(db, issuer, Duration::from_secs(3600), shutdown);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
