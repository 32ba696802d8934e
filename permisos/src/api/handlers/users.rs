use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde_json::json;
use tracing::info;

use crate::{
    AppState,
    api::models::{
        applications::{ApplicationResponse, ListApplicationsQuery},
        pagination::PaginatedResponse,
        users::{AdminUserUpdate, CurrentUser, ListUsersQuery, UserResponse, UserUpdate},
    },
    auth::{ClientInfo, current_user::AdminUser},
    db::{
        handlers::{Applications, Repository, SecurityEvents, Sessions, Users},
        models::{
            applications::ApplicationFilter,
            audit::{SecurityAction, SecurityEventCreateDBRequest},
            users::{AccountStatus, Role, UserFilter, UserUpdateDBRequest},
        },
        pool::TransactionMode,
    },
    errors::{Error, Result, Validator},
    types::{UserId, abbrev_uuid},
};

fn user_not_found(id: UserId) -> Error {
    Error::NotFound {
        resource: "User".to_string(),
        id: id.to_string(),
    }
}

/// Get the authenticated user's profile
#[utoipa::path(
    get,
    path = "/users/current",
    tag = "users",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Not logged in"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_current_user(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<UserResponse>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn)
        .get_by_id(current_user.id)
        .await?
        .ok_or_else(|| user_not_found(current_user.id))?;

    let mut response = UserResponse::from(user);
    response.is_admin_portal = current_user.is_admin_portal;
    Ok(Json(response))
}

/// Update the authenticated user's name
#[utoipa::path(
    patch,
    path = "/users/current",
    request_body = UserUpdate,
    tag = "users",
    responses(
        (status = 200, description = "Updated user", body = UserResponse),
        (status = 401, description = "Not logged in"),
        (status = 422, description = "Invalid input"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_current_user(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(update): Json<UserUpdate>,
) -> Result<Json<UserResponse>> {
    let mut validator = Validator::new();
    if let Some(first_name) = &update.first_name {
        validator.required(first_name, "first_name");
    }
    if let Some(last_name) = &update.last_name {
        validator.required(last_name, "last_name");
    }
    validator.finish()?;

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn)
        .update(
            current_user.id,
            &UserUpdateDBRequest {
                first_name: update.first_name.map(|s| s.trim().to_string()),
                last_name: update.last_name.map(|s| s.trim().to_string()),
                ..Default::default()
            },
        )
        .await?;

    let mut response = UserResponse::from(user);
    response.is_admin_portal = current_user.is_admin_portal;
    Ok(Json(response))
}

/// List user accounts
#[utoipa::path(
    get,
    path = "/users",
    tag = "admin",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Page of users", body = PaginatedResponse<UserResponse>),
        (status = 401, description = "Not logged in"),
        (status = 403, description = "Admin portal session required"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
    _: AdminUser,
) -> Result<Json<PaginatedResponse<UserResponse>>> {
    let page = query.pagination.page();
    let filter = UserFilter {
        role: query.role,
        account_status: query.account_status,
        search: query.search.filter(|s| !s.trim().is_empty()),
        skip: page.skip,
        limit: page.limit,
    };

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut conn);
    let data = users.list(&filter).await?;
    let total_count = users.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        data.into_iter().map(UserResponse::from).collect(),
        total_count,
        page,
    )))
}

/// Get a user account
#[utoipa::path(
    get,
    path = "/users/{user_id}",
    tag = "admin",
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "User", body = UserResponse),
        (status = 403, description = "Admin portal session required"),
        (status = 404, description = "User not found"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %abbrev_uuid(&user_id)))]
pub async fn get_user(State(state): State<AppState>, Path(user_id): Path<UserId>, _: AdminUser) -> Result<Json<UserResponse>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn).get_by_id(user_id).await?.ok_or_else(|| user_not_found(user_id))?;
    Ok(Json(UserResponse::from(user)))
}

/// Change a user's role, portal access or account status.
///
/// Disabling an account ends all of its sessions.
#[utoipa::path(
    patch,
    path = "/users/{user_id}",
    request_body = AdminUserUpdate,
    tag = "admin",
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Updated user", body = UserResponse),
        (status = 400, description = "Admins cannot demote or disable themselves"),
        (status = 403, description = "Admin portal session required"),
        (status = 404, description = "User not found"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %abbrev_uuid(&user_id)))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    Json(update): Json<AdminUserUpdate>,
) -> Result<Json<UserResponse>> {
    if user_id == admin.id
        && (update.account_status == Some(AccountStatus::Disabled)
            || update.role.is_some_and(|role| role != Role::Admin)
            || update.is_admin_portal == Some(false))
    {
        return Err(Error::BadRequest {
            message: "You cannot remove your own admin access".to_string(),
        });
    }

    let admin_id = admin.id;
    let user = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let mut users = Users::new(&mut *conn);
                let before = users.get_by_id(user_id).await?.ok_or_else(|| user_not_found(user_id))?;
                let user = users
                    .update(
                        user_id,
                        &UserUpdateDBRequest {
                            role: update.role,
                            is_admin_portal: update.is_admin_portal,
                            account_status: update.account_status,
                            ..Default::default()
                        },
                    )
                    .await?;

                let disabled = before.account_status != AccountStatus::Disabled && user.account_status == AccountStatus::Disabled;
                let lost_portal = before.is_admin_portal && !user.is_admin_portal;
                let sessions_revoked = if disabled || lost_portal {
                    Sessions::new(&mut *conn).delete_for_user(user_id).await?
                } else {
                    0
                };

                SecurityEvents::new(&mut *conn)
                    .append(
                        &SecurityEventCreateDBRequest::new(Some(admin_id), SecurityAction::UserUpdated)
                            .entity("user", user_id)
                            .details(json!({
                                "role": { "from": before.role, "to": user.role },
                                "is_admin_portal": { "from": before.is_admin_portal, "to": user.is_admin_portal },
                                "account_status": { "from": before.account_status, "to": user.account_status },
                                "sessions_revoked": sessions_revoked,
                            }))
                            .client(&client),
                    )
                    .await?;
                Ok::<_, Error>(user)
            })
        })
        .await?;

    info!(admin_id = %abbrev_uuid(&admin_id), "Updated user account");
    Ok(Json(UserResponse::from(user)))
}

/// List one user's applications
#[utoipa::path(
    get,
    path = "/users/{user_id}/applications",
    tag = "admin",
    params(("user_id" = String, Path, description = "User ID"), ListApplicationsQuery),
    responses(
        (status = 200, description = "Page of the user's applications", body = PaginatedResponse<ApplicationResponse>),
        (status = 403, description = "Admin portal session required"),
        (status = 404, description = "User not found"),
    ),
    security(("session_cookie" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %abbrev_uuid(&user_id)))]
pub async fn list_user_applications(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<ListApplicationsQuery>,
    _: AdminUser,
) -> Result<Json<PaginatedResponse<ApplicationResponse>>> {
    let page = query.pagination.page();
    let filter = ApplicationFilter {
        user_id: Some(user_id),
        status: query.status,
        search: query.search.filter(|s| !s.trim().is_empty()),
        skip: page.skip,
        limit: page.limit,
    };

    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Users::new(&mut conn).get_by_id(user_id).await?.is_none() {
        return Err(user_not_found(user_id));
    }
    let mut applications = Applications::new(&mut conn);
    let data = applications.list(&filter).await?;
    let total_count = applications.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        data.into_iter().map(ApplicationResponse::from).collect(),
        total_count,
        page,
    )))
}
