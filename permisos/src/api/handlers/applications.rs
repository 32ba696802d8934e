use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use serde_json::json;
use sqlx::PgConnection;
use tracing::info;

use crate::{
    AppState,
    api::models::{
        applications::{ApplicationCreate, ApplicationResponse, ApplicationUpdate, ListApplicationsQuery, RenewalCreate},
        pagination::PaginatedResponse,
        users::CurrentUser,
    },
    auth::{ClientInfo, permissions::can_access_application},
    db::{
        handlers::{Applications, Repository, SecurityEvents},
        models::{
            applications::{ApplicationCreateDBRequest, ApplicationDBResponse, ApplicationFilter, PaymentMethod},
            audit::{SecurityAction, SecurityEventCreateDBRequest},
        },
        pool::TransactionMode,
    },
    errors::{Error, Result},
    permits::{
        status::ApplicationStatus,
        transitions::{Actor, transition},
    },
    types::{ApplicationId, abbrev_uuid},
};

pub(crate) fn application_not_found(id: ApplicationId) -> Error {
    Error::NotFound {
        resource: "Application".to_string(),
        id: id.to_string(),
    }
}

/// Load an application the caller may see.
pub(crate) async fn load_application(conn: &mut PgConnection, id: ApplicationId, user: &CurrentUser) -> Result<ApplicationDBResponse> {
    let application = Applications::new(conn)
        .get_by_id(id)
        .await?
        .ok_or_else(|| application_not_found(id))?;
    can_access_application(user, &application)?;
    Ok(application)
}

/// Start a permit application
#[utoipa::path(
    post,
    path = "/applications",
    request_body = ApplicationCreate,
    tag = "applications",
    responses(
        (status = 201, description = "Application created", body = ApplicationResponse),
        (status = 401, description = "Not logged in"),
        (status = 422, description = "Invalid applicant or vehicle data"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %abbrev_uuid(&current_user.id)))]
pub async fn create_application(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<ApplicationCreate>,
) -> Result<(StatusCode, Json<ApplicationResponse>)> {
    let details = request.validate()?;

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let application = Applications::new(&mut conn)
        .create(&ApplicationCreateDBRequest {
            user_id: current_user.id,
            details,
            payment_method: request.payment_method.unwrap_or(PaymentMethod::Card),
            amount: state.config.permits.fee,
            currency: state.config.permits.currency.clone(),
            renewed_from_id: None,
            renewal_reason: None,
        })
        .await?;

    info!(application_id = %abbrev_uuid(&application.id), status = %application.status, "Created application");
    Ok((StatusCode::CREATED, Json(ApplicationResponse::from(application).for_client())))
}

/// List the caller's applications
#[utoipa::path(
    get,
    path = "/applications",
    tag = "applications",
    params(ListApplicationsQuery),
    responses(
        (status = 200, description = "Page of applications", body = PaginatedResponse<ApplicationResponse>),
        (status = 401, description = "Not logged in"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_applications(
    State(state): State<AppState>,
    Query(query): Query<ListApplicationsQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<ApplicationResponse>>> {
    let page = query.pagination.page();
    let filter = ApplicationFilter {
        user_id: Some(current_user.id),
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
        data.into_iter().map(|a| ApplicationResponse::from(a).for_client()).collect(),
        total_count,
        page,
    )))
}

/// Get one of the caller's applications
#[utoipa::path(
    get,
    path = "/applications/{id}",
    tag = "applications",
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
    current_user: CurrentUser,
) -> Result<Json<ApplicationResponse>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let application = load_application(&mut conn, id, &current_user).await?;
    Ok(Json(ApplicationResponse::from(application).for_client()))
}

/// Correct applicant or vehicle data before payment
#[utoipa::path(
    patch,
    path = "/applications/{id}",
    request_body = ApplicationUpdate,
    tag = "applications",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Updated application", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application can no longer be edited"),
        (status = 422, description = "Invalid input"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn update_application(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    current_user: CurrentUser,
    Json(request): Json<ApplicationUpdate>,
) -> Result<Json<ApplicationResponse>> {
    let update = request.validate()?;

    let application = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let current = Applications::new(&mut *conn)
                    .get_for_update(id)
                    .await?
                    .ok_or_else(|| application_not_found(id))?;
                can_access_application(&current_user, &current)?;
                if !current.status.is_editable() {
                    return Err(Error::Conflict {
                        message: format!("Application can no longer be edited in status {}", current.status),
                    });
                }
                Ok::<_, Error>(Applications::new(&mut *conn).update(id, &update).await?)
            })
        })
        .await?;

    Ok(Json(ApplicationResponse::from(application).for_client()))
}

/// Cancel an application that has not been paid
#[utoipa::path(
    post,
    path = "/applications/{id}/cancel",
    tag = "applications",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Cancelled application", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application cannot be cancelled in its current status"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn cancel_application(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    current_user: CurrentUser,
) -> Result<Json<ApplicationResponse>> {
    let application = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                load_application(&mut *conn, id, &current_user).await?;
                let outcome = transition(
                    &mut *conn,
                    id,
                    ApplicationStatus::Cancelled,
                    Actor::User(current_user.id),
                    Some("cancelled by applicant"),
                )
                .await?;
                Ok::<_, Error>(outcome.into_application())
            })
        })
        .await?;

    Ok(Json(ApplicationResponse::from(application).for_client()))
}

/// Request a renewal of an issued or expired permit.
///
/// Creates a new application in RENEWAL_PENDING carrying over the vehicle data; staff approve
/// or reject it before payment.
#[utoipa::path(
    post,
    path = "/applications/{id}/renewals",
    request_body = RenewalCreate,
    tag = "applications",
    params(("id" = String, Path, description = "Application to renew")),
    responses(
        (status = 201, description = "Renewal application created", body = ApplicationResponse),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Application has no permit to renew, or a renewal is already open"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn create_renewal(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    current_user: CurrentUser,
    request: Option<Json<RenewalCreate>>,
) -> Result<(StatusCode, Json<ApplicationResponse>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let fee = state.config.permits.fee;
    let currency = state.config.permits.currency.clone();

    let renewal = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let original = Applications::new(&mut *conn)
                    .get_for_update(id)
                    .await?
                    .ok_or_else(|| application_not_found(id))?;
                can_access_application(&current_user, &original)?;
                if original.user_id != current_user.id {
                    return Err(application_not_found(id));
                }
                if !(original.status.has_permit() || original.status == ApplicationStatus::Expired) || original.folio.is_none() {
                    return Err(Error::Conflict {
                        message: format!("Only issued or expired permits can be renewed, application is {}", original.status),
                    });
                }

                let open_renewal: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM permit_applications WHERE renewed_from_id = $1 AND status <> ALL($2))",
                )
                .bind(id)
                .bind(vec![ApplicationStatus::Cancelled, ApplicationStatus::Expired, ApplicationStatus::RenewalRejected])
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| Error::Database(e.into()))?;
                if open_renewal {
                    return Err(Error::Conflict {
                        message: "A renewal for this permit is already in progress".to_string(),
                    });
                }

                let renewal = Applications::new(&mut *conn)
                    .create(&ApplicationCreateDBRequest {
                        user_id: original.user_id,
                        details: original.details(),
                        payment_method: request.payment_method.unwrap_or(original.payment_method),
                        amount: fee,
                        currency,
                        renewed_from_id: Some(original.id),
                        renewal_reason: request.reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
                    })
                    .await?;
                Ok::<_, Error>(renewal)
            })
        })
        .await?;

    info!(renewal_id = %abbrev_uuid(&renewal.id), "Created renewal application");
    Ok((StatusCode::CREATED, Json(ApplicationResponse::from(renewal).for_client())))
}

/// Download the permit PDF
#[utoipa::path(
    get,
    path = "/applications/{id}/permit",
    tag = "applications",
    params(("id" = String, Path, description = "Application ID")),
    responses(
        (status = 200, description = "Permit document", content_type = "application/pdf"),
        (status = 404, description = "Application not found"),
        (status = 409, description = "Permit not issued yet"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(application_id = %abbrev_uuid(&id)))]
pub async fn download_permit(
    State(state): State<AppState>,
    Path(id): Path<ApplicationId>,
    current_user: CurrentUser,
    client: ClientInfo,
) -> Result<impl IntoResponse> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let application = load_application(&mut conn, id, &current_user).await?;

    let (Some(path), Some(folio)) = (application.permit_file_path.as_deref(), application.folio.as_deref()) else {
        return Err(Error::Conflict {
            message: format!("No permit has been issued for this application ({})", application.status),
        });
    };
    if !application.status.has_permit() {
        return Err(Error::Conflict {
            message: format!("The permit is not available in status {}", application.status),
        });
    }

    let pdf = state.storage.retrieve(path).await?;

    SecurityEvents::new(&mut conn)
        .append(
            &SecurityEventCreateDBRequest::new(Some(current_user.id), SecurityAction::PermitDownloaded)
                .entity("permit_application", id)
                .details(json!({ "folio": folio }))
                .client(&client),
        )
        .await?;

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"permiso-{folio}.pdf\"")).map_err(|e| Error::Internal {
        operation: format!("build content disposition: {e}"),
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Bytes::from(pdf),
    ))
}
