//! Applying verified payment events to applications.
//!
//! Every event is handled in one transaction: claim the provider event id, lock the application,
//! transition it, log the verification, and record the outcome. A replayed event id finds its
//! claim already taken and changes nothing. If anything fails the claim rolls back with the rest
//! and the provider's retry gets a clean attempt.

use metrics::counter;
use tracing::{info, instrument, warn};

use crate::{
    db::{
        handlers::{Applications, PaymentVerifications, Repository, WebhookEvents},
        models::{
            applications::{ApplicationDBResponse, PaymentMethod, PaymentReferenceUpdate},
            audit::{PaymentVerificationCreateDBRequest, VerificationSource},
            webhook_events::WebhookOutcome,
        },
        pool::{Database, TransactionMode},
    },
    errors::{Error, Result},
    payment_providers::WebhookEvent,
    permits::{
        status::ApplicationStatus,
        transitions::{Actor, TransitionOutcome, transition},
    },
    types::{ApplicationId, abbrev_uuid},
};

const ACTOR: Actor = Actor::System("payment_webhook");

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResult {
    /// The event id was processed before
    Replayed,
    Processed {
        outcome: WebhookOutcome,
        application_id: Option<ApplicationId>,
        status: Option<ApplicationStatus>,
    },
}

impl WebhookResult {
    /// Payment confirmed by this delivery; the permit should be issued.
    pub fn payment_received(&self) -> Option<ApplicationId> {
        match self {
            WebhookResult::Processed {
                outcome: WebhookOutcome::Applied,
                application_id: Some(id),
                status: Some(ApplicationStatus::PaymentReceived),
            } => Some(*id),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            WebhookResult::Replayed => "replayed",
            WebhookResult::Processed { outcome, .. } => outcome.as_str(),
        }
    }
}

/// Apply a verified event.
#[instrument(skip(db, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
pub async fn process_event(db: &Database, event: &WebhookEvent) -> Result<WebhookResult> {
    let event = event.clone();
    let result = db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let Some(claim_id) = WebhookEvents::new(&mut *conn).claim(&event.id, &event.event_type).await? else {
                    return Ok(WebhookResult::Replayed);
                };

                let (outcome, application) = apply(conn, &event).await?;
                let application_id = application.as_ref().map(|a| a.id);
                WebhookEvents::new(&mut *conn)
                    .set_outcome(claim_id, application_id, outcome)
                    .await?;

                Ok::<_, Error>(WebhookResult::Processed {
                    outcome,
                    application_id,
                    status: application.map(|a| a.status),
                })
            })
        })
        .await?;

    counter!("permisos_webhook_events_total", "outcome" => result.label()).increment(1);
    Ok(result)
}

async fn find_application(conn: &mut sqlx::PgConnection, event: &WebhookEvent) -> Result<Option<ApplicationDBResponse>> {
    let mut repo = Applications::new(conn);
    if let Some(id) = event.application_id {
        if let Some(application) = repo.get_by_id(id).await? {
            return Ok(Some(application));
        }
    }
    match event.payment_reference.as_deref() {
        Some(reference) => Ok(repo.find_by_payment_reference(reference).await?),
        None => Ok(None),
    }
}

async fn apply(conn: &mut sqlx::PgConnection, event: &WebhookEvent) -> Result<(WebhookOutcome, Option<ApplicationDBResponse>)> {
    let Some(target) = event.target_status() else {
        info!("Acknowledged event with no status effect");
        return Ok((WebhookOutcome::Unmatched, None));
    };

    let Some(found) = find_application(&mut *conn, event).await? else {
        warn!(reference = ?event.payment_reference, "No application matches payment event");
        return Ok((WebhookOutcome::Unmatched, None));
    };

    // Re-read under lock; the unlocked lookup only resolved the id
    let Some(current) = Applications::new(&mut *conn).get_for_update(found.id).await? else {
        return Ok((WebhookOutcome::Unmatched, None));
    };
    let application_id = current.id;

    if current.status == target {
        return Ok((WebhookOutcome::Unchanged, Some(current)));
    }
    if current.status.payment_settled() || !current.status.can_transition_to(target) {
        warn!(
            application_id = %abbrev_uuid(&application_id),
            current = %current.status,
            requested = %target,
            "Ignoring payment event that does not apply to current status"
        );
        return Ok((WebhookOutcome::Ignored, Some(current)));
    }

    if let (ApplicationStatus::AwaitingOxxoPayment, Some(voucher)) = (target, &event.oxxo) {
        let reference = event
            .payment_reference
            .clone()
            .or_else(|| current.payment_reference.clone())
            .unwrap_or_else(|| event.id.clone());
        Applications::new(&mut *conn)
            .set_payment_reference(
                application_id,
                &PaymentReferenceUpdate {
                    payment_method: PaymentMethod::Oxxo,
                    payment_reference: reference,
                    oxxo_reference: Some(voucher.reference.clone()),
                    oxxo_expires_at: Some(voucher.expires_at),
                },
            )
            .await?;
    }

    let (from, to, application) =
        match transition(&mut *conn, application_id, target, ACTOR, event.failure_message.as_deref()).await? {
            TransitionOutcome::Applied { from, to, application } => (from, to, application),
            TransitionOutcome::Unchanged { application } => return Ok((WebhookOutcome::Unchanged, Some(application))),
        };

    PaymentVerifications::new(&mut *conn)
        .append(&PaymentVerificationCreateDBRequest {
            application_id,
            verified_by: None,
            source: VerificationSource::Webhook,
            action: event.event_type.clone(),
            previous_status: from,
            new_status: to,
            provider_event_id: Some(event.id.clone()),
            notes: event.failure_message.clone(),
        })
        .await?;

    info!(application_id = %abbrev_uuid(&application_id), %from, %to, "Applied payment event");
    Ok((WebhookOutcome::Applied, Some(application)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::users::Role;
    use crate::db::pool::DEFAULT_SLOW_QUERY_THRESHOLD;
    use crate::payment_providers::OxxoVoucher;
    use crate::test_utils::{create_test_application, create_test_user};
    use chrono::Utc;
    use sqlx::PgPool;

    fn event(id: &str, event_type: &str, application_id: ApplicationId) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            payment_reference: Some("pi_test".to_string()),
            application_id: Some(application_id),
            oxxo: None,
            failure_message: None,
        }
    }

    async fn status_of(pool: &PgPool, id: ApplicationId) -> ApplicationDBResponse {
        let mut conn = pool.acquire().await.unwrap();
        Applications::new(&mut conn).get_by_id(id).await.unwrap().unwrap()
    }

    #[sqlx::test]
    async fn test_success_event_marks_payment_received(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;

        let result = process_event(&db, &event("evt_1", "payment_intent.succeeded", application.id))
            .await
            .unwrap();
        assert_eq!(result.payment_received(), Some(application.id));

        let updated = status_of(&pool, application.id).await;
        assert_eq!(updated.status, ApplicationStatus::PaymentReceived);
        assert!(updated.payment_verified_at.is_some());

        let mut conn = pool.acquire().await.unwrap();
        let log = PaymentVerifications::new(&mut conn)
            .list_for_application(application.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].provider_event_id.as_deref(), Some("evt_1"));
        assert_eq!(log[0].source, "webhook");
    }

    #[sqlx::test]
    async fn test_replayed_event_is_a_no_op(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let failed = event("evt_fail", "payment_intent.payment_failed", application.id);

        process_event(&db, &failed).await.unwrap();
        // Customer retries and the retry succeeds
        process_event(&db, &event("evt_ok", "payment_intent.succeeded", application.id))
            .await
            .unwrap();
        // The provider redelivers the old failure
        assert_eq!(process_event(&db, &failed).await.unwrap(), WebhookResult::Replayed);

        assert_eq!(status_of(&pool, application.id).await.status, ApplicationStatus::PaymentReceived);
        let mut conn = pool.acquire().await.unwrap();
        let log = PaymentVerifications::new(&mut conn)
            .list_for_application(application.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[sqlx::test]
    async fn test_success_after_permit_issued_does_not_regress(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        for status in [
            ApplicationStatus::PaymentReceived,
            ApplicationStatus::GeneratingPermit,
            ApplicationStatus::PermitReady,
        ] {
            transition(&mut conn, application.id, status, Actor::System("test"), None).await.unwrap();
        }

        for (id, kind) in [
            ("evt_late_ok", "payment_intent.succeeded"),
            ("evt_late_fail", "payment_intent.payment_failed"),
        ] {
            let result = process_event(&db, &event(id, kind, application.id)).await.unwrap();
            assert!(matches!(
                result,
                WebhookResult::Processed {
                    outcome: WebhookOutcome::Ignored,
                    ..
                }
            ));
        }
        assert_eq!(status_of(&pool, application.id).await.status, ApplicationStatus::PermitReady);

        let record = WebhookEvents::new(&mut conn).get_by_provider_id("evt_late_ok").await.unwrap().unwrap();
        assert_eq!(record.outcome, "ignored");
        assert_eq!(record.application_id, Some(application.id));
    }

    #[sqlx::test]
    async fn test_lookup_falls_back_to_payment_reference(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        Applications::new(&mut conn)
            .set_payment_reference(
                application.id,
                &PaymentReferenceUpdate {
                    payment_method: PaymentMethod::Card,
                    payment_reference: "pi_by_reference".to_string(),
                    oxxo_reference: None,
                    oxxo_expires_at: None,
                },
            )
            .await
            .unwrap();

        let mut processing = event("evt_proc", "payment_intent.processing", application.id);
        processing.application_id = None;
        processing.payment_reference = Some("pi_by_reference".to_string());
        process_event(&db, &processing).await.unwrap();

        assert_eq!(status_of(&pool, application.id).await.status, ApplicationStatus::PaymentProcessing);
    }

    #[sqlx::test]
    async fn test_oxxo_voucher_event_records_voucher(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let expires_at = Utc::now() + chrono::Duration::days(3);

        let mut voucher_event = event("evt_voucher", "payment_intent.requires_action", application.id);
        voucher_event.oxxo = Some(OxxoVoucher {
            reference: "93000012345678".to_string(),
            expires_at,
            voucher_url: None,
        });
        process_event(&db, &voucher_event).await.unwrap();

        let updated = status_of(&pool, application.id).await;
        assert_eq!(updated.status, ApplicationStatus::AwaitingOxxoPayment);
        assert_eq!(updated.payment_method, PaymentMethod::Oxxo);
        assert_eq!(updated.oxxo_reference.as_deref(), Some("93000012345678"));
        assert!(updated.payment_initiated_at.is_some());
    }

    #[sqlx::test]
    async fn test_unknown_application_and_event_types_are_unmatched(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);

        let mut orphan = event("evt_orphan", "payment_intent.succeeded", uuid::Uuid::new_v4());
        orphan.payment_reference = Some("pi_unknown".to_string());
        let result = process_event(&db, &orphan).await.unwrap();
        assert!(matches!(
            result,
            WebhookResult::Processed {
                outcome: WebhookOutcome::Unmatched,
                application_id: None,
                ..
            }
        ));

        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let refund = event("evt_refund", "charge.refunded", application.id);
        let result = process_event(&db, &refund).await.unwrap();
        assert!(result.payment_received().is_none());
        assert_eq!(status_of(&pool, application.id).await.status, ApplicationStatus::AwaitingPayment);
    }

    #[sqlx::test]
    async fn test_failure_mid_transaction_leaves_nothing_behind(pool: PgPool) {
        let db = Database::from_pool(pool.clone(), DEFAULT_SLOW_QUERY_THRESHOLD);
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let succeeded = event("evt_rollback", "payment_intent.succeeded", application.id);

        // Make the verification log insert, which runs after the transition, blow up
        sqlx::raw_sql(
            r#"
            CREATE FUNCTION fail_verification_insert() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'verification log unavailable';
            END;
            $$ LANGUAGE plpgsql;
            CREATE TRIGGER fail_verification_insert BEFORE INSERT ON payment_verification_log
                FOR EACH ROW EXECUTE FUNCTION fail_verification_insert();
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(process_event(&db, &succeeded).await.is_err());

        let unchanged = status_of(&pool, application.id).await;
        assert_eq!(unchanged.status, ApplicationStatus::AwaitingPayment);
        assert!(unchanged.payment_verified_at.is_none());
        let mut conn = pool.acquire().await.unwrap();
        assert!(WebhookEvents::new(&mut conn).get_by_provider_id("evt_rollback").await.unwrap().is_none());
        drop(conn);

        sqlx::raw_sql("DROP TRIGGER fail_verification_insert ON payment_verification_log")
            .execute(&pool)
            .await
            .unwrap();

        // The provider's retry of the same event goes through
        let result = process_event(&db, &succeeded).await.unwrap();
        assert_eq!(result.payment_received(), Some(application.id));
        let applied = status_of(&pool, application.id).await;
        assert_eq!(applied.status, ApplicationStatus::PaymentReceived);
        assert!(applied.payment_verified_at.is_some());
    }
}
