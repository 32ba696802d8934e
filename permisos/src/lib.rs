//! # permisos: Permisos Digitales backend
//!
//! `permisos` runs the online service for vehicle circulation permits. Citizens register, fill
//! in a permit application, pay by card or with an OXXO cash voucher, and download the permit
//! PDF once it is issued. Staff review applications, confirm or reject payments by hand, decide
//! on renewals and follow the security log through an admin API.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); all state lives in PostgreSQL.
//!
//! ### Request Flow
//!
//! Client requests (`/api/v1/*`) and admin requests (`/admin/api/v1/*`) are authenticated by
//! the session cookie set at login. Handlers extract a [`auth::current_user::CurrentUser`] (or
//! `AdminUser` for staff routes), check ownership, and talk to the database through repositories
//! in [`db::handlers`]. Every status change goes through [`permits::transitions::transition`],
//! which enforces the lifecycle table in [`permits::status`] and writes the audit trail.
//!
//! Payment providers call `/webhooks/payments`. The body is verified against the provider's
//! signature, deduplicated by event id and applied to the application it names. A confirmed
//! payment starts permit issuance in the background.
//!
//! ### Core Components
//!
//! - [`api`]: request/response models and handlers
//! - [`auth`]: password hashing, sessions and the user extractors
//! - [`db`]: the [`db::pool::Database`] handle, repositories and row models
//! - [`permits`]: status lifecycle, issuance, storage and expiry
//! - [`payment_providers`]: the provider trait, Stripe and a dummy provider for development
//!
//! **Background services** run alongside the HTTP server. Today that is the expiry sweeper,
//! which retires issued permits past their validity and OXXO vouchers nobody paid, and resumes
//! permit issuance that stalled (for instance because the process restarted mid-generation).
//! Shutdown waits for issuance started by requests to finish.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use permisos::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = permisos::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     permisos::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
mod email;
pub mod errors;
mod openapi;
pub mod payment_providers;
pub mod permits;
pub mod telemetry;
mod types;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    http::{self, HeaderValue},
    routing::{get, patch, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::{
    auth::password::{self, Argon2Params},
    config::CorsOrigin,
    db::{
        handlers::{Repository, Users},
        models::users::{Role, UserCreateDBRequest, UserUpdateDBRequest},
        pool::Database,
    },
    errors::Error,
    openapi::ApiDoc,
    payment_providers::{PaymentProvider, create_provider},
    permits::{
        document::PermitRenderer,
        issuer::PermitIssuer,
        storage::{LocalPermitStorage, PermitStorage},
    },
};

pub use config::Config;
pub use types::{ApplicationId, UserId};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .db(db)
///     .config(config)
///     .storage(storage)
///     .issuer(issuer)
///     .maybe_payment_provider(provider)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    /// Where issued permit PDFs are kept
    pub storage: Arc<dyn PermitStorage>,
    /// `None` when no provider is configured; payment routes then answer 501
    pub payment_provider: Option<Arc<dyn PaymentProvider>>,
    pub issuer: PermitIssuer,
}

/// Get the permisos database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create the initial admin user if it doesn't exist.
///
/// Idempotent: an existing account with `email` gets its password reset and is promoted to an
/// admin with portal access, so a locked-out deployment can be recovered by restarting with a
/// new `admin_password`.
#[instrument(skip_all)]
pub async fn create_initial_admin_user(email: &str, password: &str, params: Argon2Params, db: &PgPool) -> Result<UserId, Error> {
    let password_hash = password::hash_password(password.to_string(), params).await?;

    let mut tx = db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut tx);

    let id = match users.get_user_by_email(email).await? {
        Some(existing) => {
            users
                .update(
                    existing.id,
                    &UserUpdateDBRequest {
                        role: Some(Role::Admin),
                        is_admin_portal: Some(true),
                        password_hash: Some(password_hash),
                        ..Default::default()
                    },
                )
                .await?;
            existing.id
        }
        None => {
            users
                .create(&UserCreateDBRequest {
                    email: email.to_string(),
                    password_hash,
                    first_name: "Administrador".to_string(),
                    last_name: "Permisos".to_string(),
                    role: Role::Admin,
                    is_admin_portal: true,
                })
                .await?
                .id
        }
    };

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;
    Ok(id)
}

/// Connect to the configured database (or adopt `pool`), run migrations and bootstrap the admin.
async fn setup_database(config: &Config, pool: Option<PgPool>) -> anyhow::Result<Database> {
    let db = match pool {
        Some(pool) => Database::from_pool(pool, config.database.slow_query_threshold),
        None => {
            info!("Connecting to database");
            Database::connect(&config.database.url, &config.database.pool, config.database.slow_query_threshold).await?
        }
    };

    migrator().run(db.pool()).await?;

    match config.admin_password.as_deref() {
        Some(admin_password) => {
            let params = Argon2Params::from(&config.auth.native.password);
            let admin_id = create_initial_admin_user(&config.admin_email, admin_password, params, db.pool())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create initial admin user: {e}"))?;
            debug!(%admin_id, "Initial admin user ready");
        }
        None => debug!("No admin_password configured; skipping admin bootstrap"),
    }

    Ok(db)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.auth.security.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(config.auth.security.cors.allow_credentials)
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::PATCH, http::Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT])
        .expose_headers([http::header::LOCATION, http::header::CONTENT_DISPOSITION]);

    if let Some(max_age) = config.auth.security.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the main application router with all endpoints and middleware.
///
/// - Authentication routes at `/authentication/*`
/// - Citizen API at `/api/v1/*`
/// - Staff API at `/admin/api/v1/*`, with its reference docs at `/admin/docs`
/// - The payment provider webhook at `/webhooks/payments`
/// - Prometheus metrics at `/internal/metrics` when enabled
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let auth_routes = Router::new()
        .route(
            "/authentication/register",
            get(api::handlers::auth::get_registration_info).post(api::handlers::auth::register),
        )
        .route("/authentication/login", post(api::handlers::auth::login))
        .route("/authentication/logout", post(api::handlers::auth::logout))
        .route("/authentication/password-resets", post(api::handlers::auth::request_password_reset))
        .route(
            "/authentication/password-resets/{token_id}/confirm",
            post(api::handlers::auth::confirm_password_reset),
        )
        .route("/authentication/password-change", post(api::handlers::auth::change_password))
        .with_state(state.clone());

    let client_routes = Router::new()
        .route(
            "/users/current",
            get(api::handlers::users::get_current_user).patch(api::handlers::users::update_current_user),
        )
        .route(
            "/applications",
            get(api::handlers::applications::list_applications).post(api::handlers::applications::create_application),
        )
        .route(
            "/applications/{id}",
            get(api::handlers::applications::get_application).patch(api::handlers::applications::update_application),
        )
        .route("/applications/{id}/cancel", post(api::handlers::applications::cancel_application))
        .route("/applications/{id}/payments", post(api::handlers::payments::create_payment))
        .route("/applications/{id}/renewals", post(api::handlers::applications::create_renewal))
        .route("/applications/{id}/permit", get(api::handlers::applications::download_permit))
        .with_state(state.clone());

    let admin_routes = Router::new()
        // Applications
        .route("/applications", get(api::handlers::admin::list_applications))
        .route("/applications/{id}", get(api::handlers::admin::get_application))
        .route("/applications/{id}/status", patch(api::handlers::admin::change_status))
        .route("/applications/{id}/verify-payment", post(api::handlers::admin::verify_payment))
        .route("/applications/{id}/reject-payment", post(api::handlers::admin::reject_payment))
        .route(
            "/applications/{id}/payment-verifications",
            get(api::handlers::admin::list_payment_verifications),
        )
        .route("/applications/{id}/regenerate-permit", post(api::handlers::admin::regenerate_permit))
        .route("/applications/{id}/renewal-decision", post(api::handlers::admin::decide_renewal))
        // Accounts
        .route("/users", get(api::handlers::users::list_users))
        .route(
            "/users/{user_id}",
            get(api::handlers::users::get_user).patch(api::handlers::users::update_user),
        )
        .route("/users/{user_id}/applications", get(api::handlers::users::list_user_applications))
        // Overview
        .route("/dashboard/stats", get(api::handlers::admin::dashboard_stats))
        .route("/security-events", get(api::handlers::admin::list_security_events))
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        // Called by the payment provider, authenticated by signature rather than session
        .route("/webhooks/payments", post(api::handlers::payments::payment_webhook))
        .with_state(state.clone())
        .merge(auth_routes)
        .nest("/api/v1", client_routes)
        .nest("/admin/api/v1", admin_routes)
        .merge(Scalar::with_url("/admin/docs", ApiDoc::openapi()));

    let cors_layer = create_cors_layer(&state.config)?;
    let mut router = router.layer(cors_layer);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Container for background services and their lifecycle management.
///
/// Dropping the struct cancels the shutdown token through `drop_guard`, so tasks never outlive
/// the application that started them.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    issuer: PermitIssuer,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    ///
    /// Permit issuance already under way is allowed to finish.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
        self.issuer.wait_for_in_flight().await;
    }
}

/// Start the expiry sweeper unless its interval is zero.
fn setup_background_services(
    db: &Database,
    config: &Config,
    issuer: &PermitIssuer,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> BackgroundServices {
    let mut background_tasks = Vec::new();

    let interval = config.permits.expiry_sweep_interval;
    if interval.is_zero() {
        info!("Expiry sweeper disabled");
    } else {
        background_tasks.push(permits::expiry::spawn_expiry_sweeper(
            db.clone(),
            issuer.clone(),
            interval,
            shutdown_token.clone(),
        ));
    }

    BackgroundServices {
        background_tasks,
        issuer: issuer.clone(),
        drop_guard: Some(shutdown_token.clone().drop_guard()),
        shutdown_token,
    }
}

/// A fully wired server.
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations, bootstraps the
///    admin account and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown future resolves, background services stop and the pool closes
pub struct Application {
    router: Router,
    config: Config,
    db: Database,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Like [`new`](Self::new), but reuse `pool` instead of connecting to `database.url`.
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("Starting permisos with configuration: {:#?}", config);

        let db = setup_database(&config, pool).await?;

        let storage: Arc<dyn PermitStorage> = Arc::new(LocalPermitStorage::new(config.storage.permits_dir.clone()));
        let renderer = PermitRenderer::from_config(&config.permits).await?;
        let issuer = PermitIssuer::new(db.clone(), storage.clone(), renderer, config.clone());

        let payment_provider = config.payment.as_ref().map(create_provider);
        match &payment_provider {
            Some(provider) => info!(provider = provider.name(), "Payment provider configured"),
            None => info!("No payment provider configured; payment endpoints are disabled"),
        }

        let app_state = AppState::builder()
            .db(db.clone())
            .config(config.clone())
            .storage(storage)
            .maybe_payment_provider(payment_provider)
            .issuer(issuer.clone())
            .build();

        let router = build_router(&app_state)?;

        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let bg_services = setup_background_services(&db, &config, &issuer, shutdown_token);

        Ok(Self {
            router,
            config,
            db,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Permisos listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.db.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
