use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    AppState,
    api::models::{
        auth::{
            AuthResponse, AuthSuccessResponse, ChangePasswordRequest, LoginRequest, LoginResponse, LogoutResponse,
            PasswordResetConfirmRequest, PasswordResetRequest, PasswordResetResponse, RegisterRequest, RegisterResponse, RegistrationInfo,
        },
        users::{CurrentUser, UserResponse},
    },
    auth::{
        ClientInfo,
        password::{self, Argon2Params},
        session,
    },
    db::{
        handlers::{PasswordResetTokens, Repository, SecurityEvents, Sessions, Users},
        models::{
            audit::{SecurityAction, SecurityEventCreateDBRequest},
            users::{Role, UserCreateDBRequest, UserUpdateDBRequest},
        },
        pool::TransactionMode,
    },
    email::EmailService,
    errors::{Error, Result, Validator},
    types::{Operation, Permission, Resource, abbrev_uuid},
};

const INVALID_CREDENTIALS: &str = "Invalid email or password";

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn require_native_auth(state: &AppState) -> Result<()> {
    if state.config.auth.native.enabled {
        Ok(())
    } else {
        Err(Error::BadRequest {
            message: "Native authentication is disabled".to_string(),
        })
    }
}

/// Get registration information
#[utoipa::path(
    get,
    path = "/authentication/register",
    tag = "authentication",
    responses(
        (status = 200, description = "Registration info", body = RegistrationInfo),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_registration_info(State(state): State<AppState>) -> Result<Json<RegistrationInfo>> {
    let enabled = state.config.auth.native.enabled && state.config.auth.native.allow_registration;
    Ok(Json(RegistrationInfo {
        enabled,
        message: if enabled {
            "Registration is enabled".to_string()
        } else {
            "Registration is disabled".to_string()
        },
    }))
}

/// Register a new citizen account
#[utoipa::path(
    post,
    path = "/authentication/register",
    request_body = RegisterRequest,
    tag = "authentication",
    responses(
        (status = 201, description = "User registered successfully", body = AuthResponse),
        (status = 400, description = "Registration is disabled"),
        (status = 409, description = "User already exists"),
        (status = 422, description = "Invalid input"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register(State(state): State<AppState>, client: ClientInfo, Json(request): Json<RegisterRequest>) -> Result<RegisterResponse> {
    require_native_auth(&state)?;
    if !state.config.auth.native.allow_registration {
        return Err(Error::BadRequest {
            message: "User registration is disabled".to_string(),
        });
    }

    let email = normalize_email(&request.email);
    Validator::new()
        .required(&email, "email")
        .check(email.is_empty() || (email.contains('@') && email.len() <= 255), "email", "is not a valid email address")
        .required(&request.first_name, "first_name")
        .required(&request.last_name, "last_name")
        .finish()?;
    password::validate_password(&request.password, &state.config.auth.native.password)?;

    let password_hash = password::hash_password(request.password, Argon2Params::from(&state.config.auth.native.password)).await?;

    let config = state.config.clone();
    let create = UserCreateDBRequest {
        email,
        password_hash,
        first_name: request.first_name.trim().to_string(),
        last_name: request.last_name.trim().to_string(),
        role: Role::Client,
        is_admin_portal: false,
    };
    let (user, token) = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let mut users = Users::new(&mut *conn);
                if users.get_user_by_email(&create.email).await?.is_some() {
                    return Err(Error::Conflict {
                        message: "An account with this email address already exists".to_string(),
                    });
                }
                let user = users.create(&create).await?;

                let token = session::create_session(&mut *conn, &user, false, &client, &config).await?;
                SecurityEvents::new(&mut *conn)
                    .append(
                        &SecurityEventCreateDBRequest::new(Some(user.id), SecurityAction::Register)
                            .entity("user", user.id)
                            .client(&client),
                    )
                    .await?;
                Ok::<_, Error>((user, token))
            })
        })
        .await?;

    info!(user_id = %abbrev_uuid(&user.id), "Registered new user");
    Ok(RegisterResponse {
        cookie: session::session_cookie(&token, &state.config),
        auth_response: AuthResponse {
            user: UserResponse::from(user),
            message: "Registration successful".to_string(),
        },
    })
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/authentication/login",
    request_body = LoginRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account cannot use the admin portal"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, client: ClientInfo, Json(request): Json<LoginRequest>) -> Result<LoginResponse> {
    require_native_auth(&state)?;

    let email = normalize_email(&request.email);
    let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn).get_user_by_email(&email).await?;

    let verified = match &user {
        Some(user) => password::verify_password(request.password, user.password_hash.clone()).await?,
        None => false,
    };
    let Some(user) = user.filter(|_| verified) else {
        SecurityEvents::new(&mut conn)
            .append(
                &SecurityEventCreateDBRequest::new(None, SecurityAction::LoginFailure)
                    .details(json!({ "email": email }))
                    .client(&client),
            )
            .await?;
        return Err(Error::Unauthenticated {
            message: Some(INVALID_CREDENTIALS.to_string()),
        });
    };

    if !user.is_active() {
        return Err(Error::Unauthenticated {
            message: Some("Account disabled".to_string()),
        });
    }

    if request.admin_portal && !(user.role == Role::Admin && user.is_admin_portal) {
        return Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Applications, Operation::ReadAll),
            action: Operation::ReadAll,
            resource: "admin portal".to_string(),
        });
    }
    drop(conn);

    let config = state.config.clone();
    let admin_portal = request.admin_portal;
    let (user, token) = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let token = session::create_session(&mut *conn, &user, admin_portal, &client, &config).await?;
                Users::new(&mut *conn).record_login(user.id).await?;
                SecurityEvents::new(&mut *conn)
                    .append(
                        &SecurityEventCreateDBRequest::new(Some(user.id), SecurityAction::LoginSuccess)
                            .details(json!({ "admin_portal": admin_portal }))
                            .client(&client),
                    )
                    .await?;
                Ok::<_, Error>((user, token))
            })
        })
        .await?;

    let mut user_response = UserResponse::from(user);
    user_response.is_admin_portal &= admin_portal;

    Ok(LoginResponse {
        cookie: session::session_cookie(&token, &state.config),
        auth_response: AuthResponse {
            user: user_response,
            message: "Login successful".to_string(),
        },
    })
}

/// Logout (end the session)
#[utoipa::path(
    post,
    path = "/authentication/logout",
    tag = "authentication",
    responses(
        (status = 200, description = "Logout successful", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap, client: ClientInfo) -> Result<LogoutResponse> {
    if let Some(token) = session::read_session_cookie(&headers, &state.config) {
        let token = token.to_string();
        let config = state.config.clone();
        state
            .db
            .with_transaction(TransactionMode::ReadWrite, |conn| {
                Box::pin(async move {
                    if let Some(user_session) = session::resolve_session(&mut *conn, &token, &config).await? {
                        session::revoke_session(&mut *conn, &token, &config).await?;
                        SecurityEvents::new(&mut *conn)
                            .append(&SecurityEventCreateDBRequest::new(Some(user_session.user_id), SecurityAction::Logout).client(&client))
                            .await?;
                    }
                    Ok::<_, Error>(())
                })
            })
            .await?;
    }

    Ok(LogoutResponse {
        cookie: session::clear_session_cookie(&state.config),
        auth_response: AuthSuccessResponse {
            message: "Logout successful".to_string(),
        },
    })
}

/// Request password reset (send email)
#[utoipa::path(
    post,
    path = "/authentication/password-resets",
    request_body = PasswordResetRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Password reset email sent when the account exists", body = PasswordResetResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<PasswordResetResponse>> {
    require_native_auth(&state)?;

    let email = normalize_email(&request.email);
    let config = state.config.clone();
    let issued = state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                // Unknown and disabled accounts get the same response as real ones
                let Some(user) = Users::new(&mut *conn).get_user_by_email(&email).await?.filter(|u| u.is_active()) else {
                    return Ok(None);
                };

                let (raw_token, token) = PasswordResetTokens::new(&mut *conn).create_for_user(user.id, &config).await?;
                SecurityEvents::new(&mut *conn)
                    .append(&SecurityEventCreateDBRequest::new(Some(user.id), SecurityAction::PasswordResetRequested).client(&client))
                    .await?;
                Ok::<_, Error>(Some((user, token.id, raw_token)))
            })
        })
        .await?;

    if let Some((user, token_id, raw_token)) = issued {
        let sent = match EmailService::new(&state.config) {
            Ok(service) => service.send_password_reset_email(&user, &token_id, &raw_token).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(user_id = %abbrev_uuid(&user.id), error = %e, "Failed to send password reset email");
        }
    }

    Ok(Json(PasswordResetResponse {
        message: "If an account with that email exists, a password reset link has been sent.".to_string(),
    }))
}

/// Confirm password reset with token
#[utoipa::path(
    post,
    path = "/authentication/password-resets/{token_id}/confirm",
    request_body = PasswordResetConfirmRequest,
    tag = "authentication",
    params(("token_id" = uuid::Uuid, Path, description = "Reset token ID from the email link")),
    responses(
        (status = 200, description = "Password reset successful", body = PasswordResetResponse),
        (status = 400, description = "Invalid or expired token"),
        (status = 422, description = "Password does not meet the rules"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Path(token_id): Path<Uuid>,
    client: ClientInfo,
    Json(request): Json<PasswordResetConfirmRequest>,
) -> Result<Json<PasswordResetResponse>> {
    require_native_auth(&state)?;
    password::validate_password(&request.new_password, &state.config.auth.native.password)?;

    let password_hash = password::hash_password(request.new_password, Argon2Params::from(&state.config.auth.native.password)).await?;
    let raw_token = request.token;

    state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                let token = PasswordResetTokens::new(&mut *conn)
                    .find_valid_token_by_id(token_id, &raw_token)
                    .await?
                    .ok_or_else(|| Error::BadRequest {
                        message: "Invalid or expired reset token".to_string(),
                    })?;

                Users::new(&mut *conn)
                    .update(
                        token.user_id,
                        &UserUpdateDBRequest {
                            password_hash: Some(password_hash),
                            ..Default::default()
                        },
                    )
                    .await?;

                // Spend every outstanding token and sign out everywhere
                PasswordResetTokens::new(&mut *conn).invalidate_for_user(token.user_id).await?;
                Sessions::new(&mut *conn).delete_for_user(token.user_id).await?;
                SecurityEvents::new(&mut *conn)
                    .append(&SecurityEventCreateDBRequest::new(Some(token.user_id), SecurityAction::PasswordResetCompleted).client(&client))
                    .await?;
                Ok::<_, Error>(())
            })
        })
        .await?;

    Ok(Json(PasswordResetResponse {
        message: "Password has been reset successfully".to_string(),
    }))
}

/// Change password for authenticated user
#[utoipa::path(
    post,
    path = "/authentication/password-change",
    request_body = ChangePasswordRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Password changed successfully", body = AuthSuccessResponse),
        (status = 401, description = "Current password is incorrect"),
        (status = 422, description = "New password does not meet the rules"),
    ),
    security(
        ("session_cookie" = [])
    )
)]
#[tracing::instrument(skip_all, fields(user_id = %abbrev_uuid(&current_user.id)))]
pub async fn change_password(
    State(state): State<AppState>,
    current_user: CurrentUser,
    client: ClientInfo,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<AuthSuccessResponse>> {
    require_native_auth(&state)?;

    let user = {
        let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;
        Users::new(&mut conn)
            .get_by_id(current_user.id)
            .await?
            .ok_or(Error::Unauthenticated { message: None })?
    };

    if !password::verify_password(request.current_password, user.password_hash).await? {
        return Err(Error::Unauthenticated {
            message: Some("Current password is incorrect".to_string()),
        });
    }
    password::validate_password(&request.new_password, &state.config.auth.native.password)?;
    let password_hash = password::hash_password(request.new_password, Argon2Params::from(&state.config.auth.native.password)).await?;

    let user_id = current_user.id;
    state
        .db
        .with_transaction(TransactionMode::ReadWrite, |conn| {
            Box::pin(async move {
                Users::new(&mut *conn)
                    .update(
                        user_id,
                        &UserUpdateDBRequest {
                            password_hash: Some(password_hash),
                            ..Default::default()
                        },
                    )
                    .await?;
                SecurityEvents::new(&mut *conn)
                    .append(&SecurityEventCreateDBRequest::new(Some(user_id), SecurityAction::PasswordChanged).client(&client))
                    .await?;
                Ok::<_, Error>(())
            })
        })
        .await?;

    Ok(Json(AuthSuccessResponse {
        message: "Password changed successfully".to_string(),
    }))
}
