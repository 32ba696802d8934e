//! Starting payments and receiving the provider's webhooks.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    AppState,
    api::{
        handlers::applications::{application_not_found, load_application},
        models::{
            applications::{PaymentCreate, PaymentResponse},
            users::CurrentUser,
        },
    },
    auth::permissions::can_access_application,
    db::{
        handlers::{Applications, Repository, Users},
        models::applications::PaymentReferenceUpdate,
        pool::TransactionMode,
    },
    errors::{Error, Result},
    payment_providers::{PaymentError, PaymentRequest, webhook::{self, WebhookResult}},
    permits::transitions::{Actor, transition},
    types::{ApplicationId, abbrev_uuid},
};

/// Acknowledgement returned to the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    /// `applied`, `unchanged`, `ignored`, `unmatched` or `replayed`
    pub outcome: String,
}

/// Start a card or OXXO payment for an application
#[utoipa::path(
    post,
    path = "/applications/{id}/payments",
    request_body = PaymentCreate,
    tag = "payments",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Payment started", body = PaymentResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application does not accept payments in its current status"),
        (status = 501, description = "No payment provider configured"),
        (status = 502, description = "Payment provider error"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id), method = ?request.payment_method))]
pub async fn create_payment(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    current_user: CurrentUser,
    Json(request): Json<PaymentCreate>,
) -> Result<Json<PaymentResponse>> {
    let provider = state.payment_provider.clone().ok_or(PaymentError::NotConfigured)?;

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let application = load_application(&mut conn, id, &current_user).await?;
    if !application.status.accepts_payment() {
        return Err(Error::Conflict {
            message: format!("Payments cannot be started for an application in status {}", application.status),
        });
    }
    let user = Users::new(&mut conn)
        .get_by_id(application.user_id)
        .await?
        .ok_or_else(|| application_not_found(id))?;
    drop(conn);

    let intent = provider
        .create_payment(PaymentRequest {
            application: &application,
            user: &user,
            method: request.payment_method,
            voucher_lifetime: state.config.permits.oxxo_voucher_lifetime,
        })
        .await?;

    let update = PaymentReferenceUpdate {
        payment_method: request.payment_method,
        payment_reference: intent.reference.clone(),
        oxxo_reference: intent.oxxo.as_ref().map(|v| v.reference.clone()),
        oxxo_expires_at: intent.oxxo.as_ref().map(|v| v.expires_at),
    };
    let target = request.payment_method.awaiting_status();
    let actor = Actor::User(current_user.id);
    let application = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                // Re-check under the row lock; a webhook may have settled it meanwhile
                let current = Applications::new(&mut *conn)
                    .get_for_update(id)
                    .await?
                    .ok_or_else(|| application_not_found(id))?;
                can_access_application(&current_user, &current)?;
                if !current.status.accepts_payment() {
                    return Err(Error::Conflict {
                        message: format!("Payments cannot be started for an application in status {}", current.status),
                    });
                }

                Applications::new(&mut *conn).set_payment_reference(id, &update).await?;
                let outcome = transition(&mut *conn, id, target, actor, Some("payment started")).await?;
                Ok::<_, Error>(outcome.into_application())
            })
        })
        .await?;

    info!(provider = provider.name(), reference = %intent.reference, "Payment started");
    Ok(Json(PaymentResponse::new(application, intent)))
}

/// Receive a payment provider webhook.
///
/// Deliveries are deduplicated by event id. Events that cannot change the application are
/// acknowledged so the provider stops retrying; database failures answer 500 so it retries.
#[utoipa::path(
    post,
    path = "/webhooks/payments",
    tag = "payments",
    request_body(content = String, content_type = "application/json", description = "Provider event, signed in the stripe-signature header"),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Invalid signature or malformed event"),
        (status = 501, description = "No payment provider configured"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn payment_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<WebhookAck>> {
    let Some(provider) = state.payment_provider.as_ref() else {
        warn!("Payment webhook called but no payment provider is configured");
        return Err(PaymentError::NotConfigured.into());
    };

    let event = provider.verify_webhook(&headers, &body).inspect_err(|e| {
        warn!(provider = provider.name(), error = %e, "Rejected payment webhook");
    })?;
    info!(event_id = %event.id, event_type = %event.event_type, "Received payment webhook");

    let result = webhook::process_event(&state.db, &event).await?;
    if let Some(application_id) = result.payment_received() {
        state.issuer.spawn_issue(application_id, Actor::System("payment_webhook"));
    }

    let outcome = match result {
        WebhookResult::Replayed => "replayed",
        WebhookResult::Processed { outcome, .. } => outcome.as_str(),
    };
    Ok(Json(WebhookAck {
        received: true,
        outcome: outcome.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        db::models::{applications::PaymentMethod, users::Role},
        payment_providers::SIGNATURE_HEADER,
        permits::status::ApplicationStatus,
        test_utils::{
            TEST_WEBHOOK_SECRET, create_test_application, create_test_config, create_test_state, create_test_state_with_config,
            create_test_user, payment_intent_json, session_cookie_for, sign_webhook, webhook_event_body,
        },
    };
    use axum::{Router, http::StatusCode, routing::post};
    use axum_test::TestServer;
    use serde_json::json;
    use sqlx::PgPool;

    fn payments_router(state: AppState) -> TestServer {
        let app = Router::new()
            .route("/api/v1/applications/{id}/payments", post(create_payment))
            .route("/webhooks/payments", post(payment_webhook))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    fn signed_event(event_id: &str, event_type: &str, application_id: ApplicationId, reference: &str) -> (Vec<u8>, String) {
        let body = webhook_event_body(event_id, event_type, payment_intent_json(reference, Some(application_id)));
        let header = sign_webhook(TEST_WEBHOOK_SECRET, &body);
        (body, header)
    }

    async fn status_of(pool: &PgPool, id: ApplicationId) -> ApplicationStatus {
        let mut conn = pool.acquire().await.unwrap();
        Applications::new(&mut conn).get_by_id(id).await.unwrap().unwrap().status
    }

    #[sqlx::test]
    async fn test_card_payment_records_reference(pool: PgPool) {
        let server = payments_router(create_test_state(pool.clone()));
        let user = create_test_user(&pool, Role::Client).await;
        let cookie = session_cookie_for(&pool, &user, false).await;
        let application = create_test_application(&pool, user.id).await;

        let response = server
            .post(&format!("/api/v1/applications/{}/payments", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "payment_method": "card" }))
            .await;
        response.assert_status_ok();

        let payment: PaymentResponse = response.json();
        assert!(payment.payment_reference.starts_with("pi_dummy_"));
        assert!(payment.client_secret.is_some());
        assert_eq!(payment.application.payment_reference.as_deref(), Some(payment.payment_reference.as_str()));
        assert_eq!(payment.application.status, ApplicationStatus::AwaitingPayment);
    }

    #[sqlx::test]
    async fn test_oxxo_payment_moves_to_awaiting_voucher(pool: PgPool) {
        let server = payments_router(create_test_state(pool.clone()));
        let user = create_test_user(&pool, Role::Client).await;
        let cookie = session_cookie_for(&pool, &user, false).await;
        let application = create_test_application(&pool, user.id).await;

        let response = server
            .post(&format!("/api/v1/applications/{}/payments", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "payment_method": "oxxo" }))
            .await;
        response.assert_status_ok();

        let payment: PaymentResponse = response.json();
        assert!(payment.oxxo_reference.is_some());
        assert!(payment.oxxo_expires_at.is_some());
        assert_eq!(payment.application.status, ApplicationStatus::AwaitingOxxoPayment);
        assert_eq!(payment.application.payment_method, PaymentMethod::Oxxo);
    }

    #[sqlx::test]
    async fn test_payment_rejected_once_settled(pool: PgPool) {
        let server = payments_router(create_test_state(pool.clone()));
        let user = create_test_user(&pool, Role::Client).await;
        let cookie = session_cookie_for(&pool, &user, false).await;
        let application = create_test_application(&pool, user.id).await;

        let mut conn = pool.acquire().await.unwrap();
        transition(&mut conn, application.id, ApplicationStatus::PaymentReceived, Actor::System("test"), None)
            .await
            .unwrap();

        server
            .post(&format!("/api/v1/applications/{}/payments", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "payment_method": "card" }))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_no_provider_is_not_implemented(pool: PgPool) {
        let config = Config {
            payment: None,
            ..create_test_config()
        };
        let server = payments_router(create_test_state_with_config(pool.clone(), config));
        let user = create_test_user(&pool, Role::Client).await;
        let cookie = session_cookie_for(&pool, &user, false).await;
        let application = create_test_application(&pool, user.id).await;

        server
            .post(&format!("/api/v1/applications/{}/payments", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "payment_method": "card" }))
            .await
            .assert_status(StatusCode::NOT_IMPLEMENTED);

        server
            .post("/webhooks/payments")
            .bytes(Bytes::from_static(b"{}"))
            .await
            .assert_status(StatusCode::NOT_IMPLEMENTED);
    }

    #[sqlx::test]
    async fn test_webhook_rejects_bad_signature(pool: PgPool) {
        let server = payments_router(create_test_state(pool.clone()));
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let (body, _) = signed_event("evt_forged", "payment_intent.succeeded", application.id, "pi_forged");
        let forged = sign_webhook("whsec_wrong", &body);

        server
            .post("/webhooks/payments")
            .add_header(SIGNATURE_HEADER, forged.as_str())
            .bytes(Bytes::from(body.clone()))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/webhooks/payments")
            .bytes(Bytes::from(body))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        assert_eq!(status_of(&pool, application.id).await, ApplicationStatus::AwaitingPayment);
    }

    #[sqlx::test]
    async fn test_webhook_success_is_applied_once(pool: PgPool) {
        let server = payments_router(create_test_state(pool.clone()));
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let (body, header) = signed_event("evt_success_1", "payment_intent.succeeded", application.id, "pi_success");

        let response = server
            .post("/webhooks/payments")
            .add_header(SIGNATURE_HEADER, header.as_str())
            .bytes(Bytes::from(body.clone()))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<WebhookAck>().outcome, "applied");
        assert!(status_of(&pool, application.id).await.payment_settled());

        let response = server
            .post("/webhooks/payments")
            .add_header(SIGNATURE_HEADER, header.as_str())
            .bytes(Bytes::from(body))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<WebhookAck>().outcome, "replayed");

        let deliveries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_webhook_events WHERE provider_event_id = 'evt_success_1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(deliveries, 1);
    }

    #[sqlx::test]
    async fn test_late_failure_event_does_not_regress_settled_payment(pool: PgPool) {
        let server = payments_router(create_test_state(pool.clone()));
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

        let (body, header) = signed_event("evt_late_fail", "payment_intent.payment_failed", application.id, "pi_late");
        let response = server
            .post("/webhooks/payments")
            .add_header(SIGNATURE_HEADER, header.as_str())
            .bytes(Bytes::from(body))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<WebhookAck>().outcome, "ignored");
        assert_eq!(status_of(&pool, application.id).await, ApplicationStatus::PermitReady);
    }
}
