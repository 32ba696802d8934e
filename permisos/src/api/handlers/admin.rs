//! Staff endpoints for reviewing applications, payments and the audit log.
//!
//! Every handler takes [`AdminUser`], so only admin accounts logged in through the admin portal
//! reach them.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde_json::json;
use tracing::info;

use crate::{
    AppState,
    api::{
        handlers::applications::application_not_found,
        models::{
            admin::{DashboardStats, SecurityEventsQuery},
            applications::{ApplicationResponse, ListApplicationsQuery, PaymentDecision, RenewalDecision, StatusChangeRequest},
            pagination::PaginatedResponse,
        },
    },
    auth::{ClientInfo, current_user::AdminUser},
    db::{
        handlers::{Applications, PaymentVerifications, Repository, SecurityEvents, Users},
        models::{
            applications::{ApplicationDBResponse, ApplicationFilter, ApplicationUpdateDBRequest},
            audit::{
                PaymentVerificationCreateDBRequest, PaymentVerificationRecord, SecurityAction, SecurityEventCreateDBRequest,
                SecurityEventFilter, SecurityEventRecord, VerificationSource,
            },
            users::UserFilter,
        },
        pool::TransactionMode,
    },
    errors::{Error, Result},
    permits::{
        status::ApplicationStatus,
        transitions::{Actor, transition},
    },
    types::{ApplicationId, UserId, abbrev_uuid},
};

/// Statuses only the permit issuer moves applications into.
const ISSUER_MANAGED: [ApplicationStatus; 3] = [
    ApplicationStatus::GeneratingPermit,
    ApplicationStatus::PermitReady,
    ApplicationStatus::ErrorGeneratingPermit,
];

fn clean_notes(notes: Option<String>) -> Option<String> {
    notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// List all applications
#[utoipa::path(
    get,
    path = "/applications",
    tag = "admin",
    params(ListApplicationsQuery),
    responses(
        (status = 200, description = "Page of applications", body = PaginatedResponse<ApplicationResponse>),
        (status = 403, description = "Admin portal session required"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_applications(
    State(state): State<AppState>,
    Query(query): Query<ListApplicationsQuery>,
    _: AdminUser,
) -> Result<Json<PaginatedResponse<ApplicationResponse>>> {
    let page = query.pagination.page();
    let filter = ApplicationFilter {
        user_id: None,
        status: query.status,
        search: query.search.filter(|s| !s.trim().is_empty()),
        skip: page.skip,
        limit: page.limit,
    };

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut applications = Applications::new(&mut conn);
    let data = applications.list(&filter).await?;
    let total_count = applications.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        data.into_iter().map(ApplicationResponse::from).collect(),
        total_count,
        page,
    )))
}

/// Get any application, including staff notes
#[utoipa::path(
    get,
    path = "/applications/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Application", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn get_application(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    _: AdminUser,
) -> Result<Json<ApplicationResponse>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let application = Applications::new(&mut conn)
        .get_by_id(id)
        .await?
        .ok_or_else(|| application_not_found(id))?;
    Ok(Json(ApplicationResponse::from(application)))
}

/// Move an application to another status.
///
/// Only transitions in the status table are accepted. Moving to PAYMENT_RECEIVED schedules
/// permit issuance.
#[utoipa::path(
    patch,
    path = "/applications/{id}/status",
    request_body = StatusChangeRequest,
    tag = "admin",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Updated application", body = ApplicationResponse),
        (status = 400, description = "Status is managed by permit issuance"),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Transition not allowed from the current status"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id), target = %request.status))]
pub async fn change_status(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    AdminUser(admin): AdminUser,
    Json(request): Json<StatusChangeRequest>,
) -> Result<Json<ApplicationResponse>> {
    let target = request.status;
    if ISSUER_MANAGED.contains(&target) {
        return Err(Error::BadRequest {
            message: format!("{target} is set by permit issuance; use regenerate-permit instead"),
        });
    }

    let reason = clean_notes(request.reason);
    let actor = Actor::User(admin.id);
    let outcome = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move { transition(conn, id, target, actor, reason.as_deref()).await })
        })
        .await?;

    if outcome.is_applied() && target == ApplicationStatus::PaymentReceived {
        state.issuer.spawn_issue(id, actor);
    }
    Ok(Json(ApplicationResponse::from(outcome.into_application())))
}

/// Record a payment confirmed outside the provider and start issuance
#[utoipa::path(
    post,
    path = "/applications/{id}/verify-payment",
    request_body = PaymentDecision,
    tag = "admin",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Payment verified", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application is not awaiting payment"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    request: Option<Json<PaymentDecision>>,
) -> Result<Json<ApplicationResponse>> {
    let notes = clean_notes(request.and_then(|Json(r)| r.notes));
    let application = record_payment_decision(&state, id, admin.id, PaymentDecisionKind::Verified, notes, client).await?;

    state.issuer.spawn_issue(id, Actor::User(admin.id));
    info!(admin_id = %abbrev_uuid(&admin.id), "Payment verified manually");
    Ok(Json(ApplicationResponse::from(application)))
}

/// Reject a payment so the applicant can pay again
#[utoipa::path(
    post,
    path = "/applications/{id}/reject-payment",
    request_body = PaymentDecision,
    tag = "admin",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Payment rejected", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Payment already settled"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn reject_payment(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    request: Option<Json<PaymentDecision>>,
) -> Result<Json<ApplicationResponse>> {
    let notes = clean_notes(request.and_then(|Json(r)| r.notes));
    let application = record_payment_decision(&state, id, admin.id, PaymentDecisionKind::Rejected, notes, client).await?;
    Ok(Json(ApplicationResponse::from(application)))
}

#[derive(Debug, Clone, Copy)]
enum PaymentDecisionKind {
    Verified,
    Rejected,
}

impl PaymentDecisionKind {
    fn target(self) -> ApplicationStatus {
        match self {
            PaymentDecisionKind::Verified => ApplicationStatus::PaymentReceived,
            PaymentDecisionKind::Rejected => ApplicationStatus::PaymentFailed,
        }
    }

    fn action(self) -> SecurityAction {
        match self {
            PaymentDecisionKind::Verified => SecurityAction::PaymentVerified,
            PaymentDecisionKind::Rejected => SecurityAction::PaymentRejected,
        }
    }

    fn label(self) -> &'static str {
        match self {
            PaymentDecisionKind::Verified => "admin.verify_payment",
            PaymentDecisionKind::Rejected => "admin.reject_payment",
        }
    }

    fn verb(self) -> &'static str {
        match self {
            PaymentDecisionKind::Verified => "verified",
            PaymentDecisionKind::Rejected => "rejected",
        }
    }
}

/// Status change, verification log row and audit event, committed together.
async fn record_payment_decision(
    state: &AppState,
    id: ApplicationId,
    admin_id: UserId,
    decision: PaymentDecisionKind,
    notes: Option<String>,
    client: ClientInfo,
) -> Result<ApplicationDBResponse> {
    state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let current = Applications::new(&mut *conn)
                    .get_for_update(id)
                    .await?
                    .ok_or_else(|| application_not_found(id))?;
                let target = decision.target();
                if current.status.payment_settled() || current.status == target {
                    return Err(Error::Conflict {
                        message: format!("Payment cannot be {} in status {}", decision.verb(), current.status),
                    });
                }

                let application = transition(&mut *conn, id, target, Actor::User(admin_id), notes.as_deref())
                    .await?
                    .into_application();

                PaymentVerifications::new(&mut *conn)
                    .append(&PaymentVerificationCreateDBRequest {
                        application_id: id,
                        verified_by: Some(admin_id),
                        source: VerificationSource::Admin,
                        action: decision.label().to_string(),
                        previous_status: current.status,
                        new_status: application.status,
                        provider_event_id: None,
                        notes: notes.clone(),
                    })
                    .await?;

                SecurityEvents::new(&mut *conn)
                    .append(
                        &SecurityEventCreateDBRequest::new(Some(admin_id), decision.action())
                            .entity("permit_application", id)
                            .details(json!({
                                "previous_status": current.status,
                                "payment_reference": current.payment_reference,
                                "notes": notes,
                            }))
                            .client(&client),
                    )
                    .await?;
                Ok::<_, Error>(application)
            })
        })
        .await
}

/// Payment verification history of an application
#[utoipa::path(
    get,
    path = "/applications/{id}/payment-verifications",
    tag = "admin",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Verification log, oldest first", body = [PaymentVerificationRecord]),
        (status = 404, description = "Application not found"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn list_payment_verifications(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    _: AdminUser,
) -> Result<Json<Vec<PaymentVerificationRecord>>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Applications::new(&mut conn).get_by_id(id).await?.is_none() {
        return Err(application_not_found(id));
    }
    let records = PaymentVerifications::new(&mut conn).list_for_application(id).await?;
    Ok(Json(records))
}

/// Generate the permit again after a failed or interrupted issuance
#[utoipa::path(
    post,
    path = "/applications/{id}/regenerate-permit",
    tag = "admin",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Permit issued", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application is not waiting for a permit"),
        (status = 500, description = "Permit generation failed again"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn regenerate_permit(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    AdminUser(admin): AdminUser,
) -> Result<Json<ApplicationResponse>> {
    let application = state.issuer.issue(id, Actor::User(admin.id)).await?;
    Ok(Json(ApplicationResponse::from(application)))
}

/// Approve or reject a renewal request.
///
/// Approval moves the renewal straight on to waiting for payment.
#[utoipa::path(
    post,
    path = "/applications/{id}/renewal-decision",
    request_body = RenewalDecision,
    tag = "admin",
    params(("id" = String, Path, description = "Renewal application ID")),
    responses(
        (status = 200, description = "Decision recorded", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application is not a pending renewal"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id), approved = request.approved))]
pub async fn decide_renewal(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    AdminUser(admin): AdminUser,
    Json(request): Json<RenewalDecision>,
) -> Result<Json<ApplicationResponse>> {
    let notes = clean_notes(request.notes);
    let actor = Actor::User(admin.id);
    let application = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let current = Applications::new(&mut *conn)
                    .get_for_update(id)
                    .await?
                    .ok_or_else(|| application_not_found(id))?;
                if current.status != ApplicationStatus::RenewalPending {
                    return Err(Error::Conflict {
                        message: format!("Application is not a pending renewal ({})", current.status),
                    });
                }

                if notes.is_some() {
                    Applications::new(&mut *conn)
                        .update(
                            id,
                            &ApplicationUpdateDBRequest {
                                admin_notes: notes.clone(),
                                ..Default::default()
                            },
                        )
                        .await?;
                }

                let decided = if request.approved {
                    ApplicationStatus::RenewalApproved
                } else {
                    ApplicationStatus::RenewalRejected
                };
                let application = transition(&mut *conn, id, decided, actor, notes.as_deref()).await?.into_application();
                if !request.approved {
                    return Ok::<_, Error>(application);
                }

                let awaiting = application.payment_method.awaiting_status();
                let outcome = transition(&mut *conn, id, awaiting, actor, Some("renewal approved")).await?;
                Ok(outcome.into_application())
            })
        })
        .await?;

    Ok(Json(ApplicationResponse::from(application)))
}

/// Application and account totals for the dashboard
#[utoipa::path(
    get,
    path = "/dashboard/stats",
    tag = "admin",
    responses(
        (status = 200, description = "Dashboard statistics", body = DashboardStats),
        (status = 403, description = "Admin portal session required"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn dashboard_stats(State(state): State<AppState>, _: AdminUser) -> Result<Json<DashboardStats>> {
    let stats = state
        .db
        .with_transaction(TransactionMode::ReadOnly, |conn| {
            Box::pin(async move {
                let status_counts = Applications::new(&mut *conn).status_counts().await?;
                let total_users = Users::new(&mut *conn).count(&UserFilter::default()).await?;

                let count_of = |statuses: &[ApplicationStatus]| -> i64 {
                    status_counts
                        .iter()
                        .filter(|c| statuses.contains(&c.status))
                        .map(|c| c.count)
                        .sum()
                };
                let awaiting_issuance = count_of(&[
                    ApplicationStatus::PaymentReceived,
                    ApplicationStatus::GeneratingPermit,
                    ApplicationStatus::ErrorGeneratingPermit,
                ]);
                let pending_renewals = count_of(&[ApplicationStatus::RenewalPending]);

                Ok::<_, Error>(DashboardStats {
                    total_applications: status_counts.iter().map(|c| c.count).sum(),
                    status_counts,
                    awaiting_issuance,
                    pending_renewals,
                    total_users,
                })
            })
        })
        .await?;

    Ok(Json(stats))
}

/// Browse the security audit log, newest first
#[utoipa::path(
    get,
    path = "/security-events",
    tag = "admin",
    params(SecurityEventsQuery),
    responses(
        (status = 200, description = "Page of security events", body = PaginatedResponse<SecurityEventRecord>),
        (status = 403, description = "Admin portal session required"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_security_events(
    State(state): State<AppState>,
    Query(query): Query<SecurityEventsQuery>,
    _: AdminUser,
) -> Result<Json<PaginatedResponse<SecurityEventRecord>>> {
    let page = query.pagination.page();
    let filter = SecurityEventFilter {
        user_id: query.user_id,
        action_type: query.action_type.filter(|s| !s.trim().is_empty()),
        skip: page.skip,
        limit: page.limit,
    };

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut events = SecurityEvents::new(&mut conn);
    let data = events.list(&filter).await?;
    let total_count = events.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(data, total_count, page)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::models::{
            applications::PaymentMethod,
            users::{Role, UserDBResponse},
        },
        test_utils::{create_test_application, create_test_state, create_test_user, session_cookie_for, test_application_request},
    };
    use axum::{
        Router,
        http::StatusCode,
        routing::{get, patch, post},
    };
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use sqlx::PgPool;

    fn admin_router(state: AppState) -> TestServer {
        let app = Router::new()
            .route("/admin/api/v1/applications", get(list_applications))
            .route("/admin/api/v1/applications/{id}", get(get_application))
            .route("/admin/api/v1/applications/{id}/status", patch(change_status))
            .route("/admin/api/v1/applications/{id}/verify-payment", post(verify_payment))
            .route("/admin/api/v1/applications/{id}/reject-payment", post(reject_payment))
            .route("/admin/api/v1/applications/{id}/payment-verifications", get(list_payment_verifications))
            .route("/admin/api/v1/applications/{id}/regenerate-permit", post(regenerate_permit))
            .route("/admin/api/v1/applications/{id}/renewal-decision", post(decide_renewal))
            .route("/admin/api/v1/dashboard/stats", get(dashboard_stats))
            .route("/admin/api/v1/security-events", get(list_security_events))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    async fn admin(pool: &PgPool) -> (UserDBResponse, String) {
        let admin = create_test_user(pool, Role::Admin).await;
        let cookie = session_cookie_for(pool, &admin, true).await;
        (admin, cookie)
    }

    async fn renewal_for(pool: &PgPool, user_id: UserId, original: &ApplicationDBResponse) -> ApplicationDBResponse {
        let mut request = test_application_request(user_id, PaymentMethod::Oxxo);
        request.renewed_from_id = Some(original.id);
        let mut conn = pool.acquire().await.unwrap();
        Applications::new(&mut conn).create(&request).await.unwrap()
    }

    #[sqlx::test]
    async fn test_client_session_cannot_use_admin_api(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let client = create_test_user(&pool, Role::Client).await;
        let cookie = session_cookie_for(&pool, &client, false).await;

        server
            .get("/admin/api/v1/applications")
            .add_header("cookie", cookie.as_str())
            .await
            .assert_status(StatusCode::FORBIDDEN);
        server.get("/admin/api/v1/dashboard/stats").await.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    async fn test_list_applications_across_users_with_status_filter(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (_, cookie) = admin(&pool).await;
        let first = create_test_user(&pool, Role::Client).await;
        let second = create_test_user(&pool, Role::Client).await;
        create_test_application(&pool, first.id).await;
        let paid = create_test_application(&pool, second.id).await;

        let mut conn = pool.acquire().await.unwrap();
        transition(&mut conn, paid.id, ApplicationStatus::PaymentFailed, Actor::System("test"), None)
            .await
            .unwrap();

        let page: PaginatedResponse<ApplicationResponse> = server
            .get("/admin/api/v1/applications")
            .add_header("cookie", cookie.as_str())
            .await
            .json();
        assert_eq!(page.total_count, 2);

        let page: PaginatedResponse<ApplicationResponse> = server
            .get("/admin/api/v1/applications")
            .add_query_param("status", "PAYMENT_FAILED")
            .add_header("cookie", cookie.as_str())
            .await
            .json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].id, paid.id);
    }

    #[sqlx::test]
    async fn test_status_change_validates_transition(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (_, cookie) = admin(&pool).await;
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;

        let response = server
            .patch(&format!("/admin/api/v1/applications/{}/status", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "status": "COMPLETED" }))
            .await;
        response.assert_status(StatusCode::CONFLICT);

        server
            .patch(&format!("/admin/api/v1/applications/{}/status", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "status": "PERMIT_READY" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let response = server
            .patch(&format!("/admin/api/v1/applications/{}/status", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "status": "CANCELLED", "reason": "duplicate" }))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<ApplicationResponse>().status, ApplicationStatus::Cancelled);
    }

    #[sqlx::test]
    async fn test_verify_payment_logs_and_issues_permit(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (admin, cookie) = admin(&pool).await;
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;

        let response = server
            .post(&format!("/admin/api/v1/applications/{}/verify-payment", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "notes": "Comprobante de transferencia" }))
            .await;
        response.assert_status_ok();
        assert!(response.json::<ApplicationResponse>().status.payment_settled());

        let response = server
            .get(&format!("/admin/api/v1/applications/{}/payment-verifications", application.id))
            .add_header("cookie", cookie.as_str())
            .await;
        response.assert_status_ok();
        let records: Vec<Value> = response.json();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["source"], "admin");
        assert_eq!(records[0]["verified_by"], admin.id.to_string());
        assert_eq!(records[0]["previous_status"], "AWAITING_PAYMENT");
        assert_eq!(records[0]["new_status"], "PAYMENT_RECEIVED");

        // Settled payments cannot be verified or rejected again
        server
            .post(&format!("/admin/api/v1/applications/{}/reject-payment", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({}))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_reject_payment(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (_, cookie) = admin(&pool).await;
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;

        let response = server
            .post(&format!("/admin/api/v1/applications/{}/reject-payment", application.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "notes": "Referencia inexistente" }))
            .await;
        response.assert_status_ok();
        let rejected: ApplicationResponse = response.json();
        assert_eq!(rejected.status, ApplicationStatus::PaymentFailed);

        let events: PaginatedResponse<Value> = server
            .get("/admin/api/v1/security-events")
            .add_query_param("action_type", SecurityAction::PaymentRejected.as_str())
            .add_header("cookie", cookie.as_str())
            .await
            .json();
        assert_eq!(events.total_count, 1);
        assert_eq!(events.data[0]["entity_id"], application.id.to_string());
    }

    #[sqlx::test]
    async fn test_regenerate_permit_after_failure(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (_, cookie) = admin(&pool).await;
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;

        server
            .post(&format!("/admin/api/v1/applications/{}/regenerate-permit", application.id))
            .add_header("cookie", cookie.as_str())
            .await
            .assert_status(StatusCode::CONFLICT);

        let mut conn = pool.acquire().await.unwrap();
        for status in [
            ApplicationStatus::PaymentReceived,
            ApplicationStatus::GeneratingPermit,
            ApplicationStatus::ErrorGeneratingPermit,
        ] {
            transition(&mut conn, application.id, status, Actor::System("test"), None).await.unwrap();
        }

        let response = server
            .post(&format!("/admin/api/v1/applications/{}/regenerate-permit", application.id))
            .add_header("cookie", cookie.as_str())
            .await;
        response.assert_status_ok();
        let issued: ApplicationResponse = response.json();
        assert_eq!(issued.status, ApplicationStatus::PermitReady);
        assert!(issued.folio.is_some());
        assert!(issued.permit_available);
    }

    #[sqlx::test]
    async fn test_renewal_decisions(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (_, cookie) = admin(&pool).await;
        let user = create_test_user(&pool, Role::Client).await;
        let original = create_test_application(&pool, user.id).await;

        let approved = renewal_for(&pool, user.id, &original).await;
        assert_eq!(approved.status, ApplicationStatus::RenewalPending);
        let response = server
            .post(&format!("/admin/api/v1/applications/{}/renewal-decision", approved.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "approved": true, "notes": "Documentos en orden" }))
            .await;
        response.assert_status_ok();
        let body: ApplicationResponse = response.json();
        assert_eq!(body.status, ApplicationStatus::AwaitingOxxoPayment);
        assert_eq!(body.admin_notes.as_deref(), Some("Documentos en orden"));

        let rejected = renewal_for(&pool, user.id, &original).await;
        let response = server
            .post(&format!("/admin/api/v1/applications/{}/renewal-decision", rejected.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "approved": false }))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<ApplicationResponse>().status, ApplicationStatus::RenewalRejected);

        server
            .post(&format!("/admin/api/v1/applications/{}/renewal-decision", original.id))
            .add_header("cookie", cookie.as_str())
            .json(&json!({ "approved": true }))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_dashboard_stats(pool: PgPool) {
        let server = admin_router(create_test_state(pool.clone()));
        let (_, cookie) = admin(&pool).await;
        let user = create_test_user(&pool, Role::Client).await;
        let original = create_test_application(&pool, user.id).await;
        create_test_application(&pool, user.id).await;
        renewal_for(&pool, user.id, &original).await;

        let response = server.get("/admin/api/v1/dashboard/stats").add_header("cookie", cookie.as_str()).await;
        response.assert_status_ok();
        let stats: DashboardStats = response.json();
        assert_eq!(stats.total_applications, 3);
        assert_eq!(stats.pending_renewals, 1);
        assert_eq!(stats.awaiting_issuance, 0);
        assert_eq!(stats.total_users, 2);
        let awaiting = stats
            .status_counts
            .iter()
            .find(|c| c.status == ApplicationStatus::AwaitingPayment)
            .map(|c| c.count);
        assert_eq!(awaiting, Some(2));
    }
}
