//! OpenAPI document served at `/admin/docs`.
//!
//! Client and admin handlers declare paths relative to their mount point; [`ApiDoc`] nests them
//! under `/api/v1` and `/admin/api/v1`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::api;

/// Documents the session cookie set by login and registration.
struct SessionCookieAddon;

impl Modify for SessionCookieAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.security_schemes.insert(
            "session_cookie".to_string(),
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                "permisos_session",
                "Opaque session token set by `POST /authentication/login`. Admin endpoints need a session \
                 opened with `admin_portal: true`.",
            ))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::users::get_current_user,
        api::handlers::users::update_current_user,
        api::handlers::applications::create_application,
        api::handlers::applications::list_applications,
        api::handlers::applications::get_application,
        api::handlers::applications::update_application,
        api::handlers::applications::cancel_application,
        api::handlers::applications::create_renewal,
        api::handlers::applications::download_permit,
        api::handlers::payments::create_payment,
    ),
    components(schemas(
        api::models::users::UserResponse,
        api::models::users::UserUpdate,
        api::models::applications::ApplicationCreate,
        api::models::applications::ApplicationUpdate,
        api::models::applications::ApplicationResponse,
        api::models::applications::PaymentCreate,
        api::models::applications::PaymentResponse,
        api::models::applications::RenewalCreate,
    ))
)]
pub struct ClientApiDoc;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::admin::list_applications,
        api::handlers::admin::get_application,
        api::handlers::admin::change_status,
        api::handlers::admin::verify_payment,
        api::handlers::admin::reject_payment,
        api::handlers::admin::list_payment_verifications,
        api::handlers::admin::regenerate_permit,
        api::handlers::admin::decide_renewal,
        api::handlers::admin::dashboard_stats,
        api::handlers::admin::list_security_events,
        api::handlers::users::list_users,
        api::handlers::users::get_user,
        api::handlers::users::update_user,
        api::handlers::users::list_user_applications,
    ),
    components(schemas(
        api::models::admin::DashboardStats,
        api::models::applications::StatusChangeRequest,
        api::models::applications::PaymentDecision,
        api::models::applications::RenewalDecision,
        api::models::users::AdminUserUpdate,
        crate::db::models::applications::StatusCount,
        crate::db::models::audit::PaymentVerificationRecord,
        crate::db::models::audit::SecurityEventRecord,
    ))
)]
pub struct AdminApiDoc;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::get_registration_info,
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::auth::logout,
        api::handlers::auth::request_password_reset,
        api::handlers::auth::confirm_password_reset,
        api::handlers::auth::change_password,
        api::handlers::payments::payment_webhook,
    ),
    nest(
        (path = "/api/v1", api = ClientApiDoc),
        (path = "/admin/api/v1", api = AdminApiDoc),
    ),
    components(schemas(
        api::models::auth::RegisterRequest,
        api::models::auth::LoginRequest,
        api::models::auth::AuthResponse,
        api::models::auth::AuthSuccessResponse,
        api::models::auth::RegistrationInfo,
        api::models::auth::PasswordResetRequest,
        api::models::auth::PasswordResetConfirmRequest,
        api::models::auth::PasswordResetResponse,
        api::models::auth::ChangePasswordRequest,
        api::handlers::payments::WebhookAck,
        crate::errors::FieldError,
        crate::permits::status::ApplicationStatus,
        crate::db::models::applications::PaymentMethod,
        crate::db::models::users::Role,
        crate::db::models::users::AccountStatus,
    )),
    modifiers(&SessionCookieAddon),
    tags(
        (name = "authentication", description = "Account registration, login and password management."),
        (name = "users", description = "The logged-in user's profile."),
        (name = "applications", description = "Vehicle circulation permit applications.

An application starts in `AWAITING_PAYMENT` (or `AWAITING_OXXO_PAYMENT` for cash vouchers), moves to
`PAYMENT_RECEIVED` when the provider confirms the charge, and to `PERMIT_READY` once the permit PDF
is issued. Renewals start in `RENEWAL_PENDING` and wait for staff approval."),
        (name = "payments", description = "Card and OXXO payments, and the provider webhook."),
        (name = "admin", description = "Staff review of applications, payments, accounts and the security log. \
Requires an admin account logged in through the admin portal."),
    ),
    info(
        title = "Permisos Digitales API",
        version = "1.0.0",
        description = "Online application, payment and issuance of vehicle circulation permits.",
    ),
)]
pub struct ApiDoc;
