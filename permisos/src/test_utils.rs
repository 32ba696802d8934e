//! Test utilities shared by unit and integration tests.

use std::sync::Arc;

use axum_test::TestServer;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    AppState, BackgroundServices,
    auth::{
        ClientInfo,
        password::{self, Argon2Params},
        session,
    },
    config::{
        AuthConfig, Config, DummyConfig, EmailConfig, EmailTransportConfig, NativeAuthConfig, PasswordConfig, PaymentConfig,
        SessionConfig, StorageConfig,
    },
    db::{
        handlers::{Applications, Repository, Users},
        models::{
            applications::{ApplicantDetails, ApplicationCreateDBRequest, ApplicationDBResponse, PaymentMethod},
            users::{Role, UserCreateDBRequest, UserDBResponse},
        },
        pool::{DEFAULT_SLOW_QUERY_THRESHOLD, Database},
    },
    payment_providers::create_provider,
    permits::{document::PermitRenderer, issuer::PermitIssuer, storage::LocalPermitStorage},
    types::{ApplicationId, UserId},
};

/// Password given to every user made by [`create_test_user`].
pub const TEST_PASSWORD: &str = "correct-horse-battery";
/// Secret the dummy payment provider checks webhook signatures against.
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_dummy";

fn test_argon2_params() -> Argon2Params {
    Argon2Params {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    }
}

pub fn create_test_config() -> Config {
    // Each config gets its own scratch directory so parallel tests never share files
    let scratch = std::env::temp_dir().join(format!("permisos-test-{}", Uuid::new_v4()));
    let params = test_argon2_params();

    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_email: "admin@test.com".to_string(),
        admin_password: None,
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        payment: Some(PaymentConfig::Dummy(DummyConfig {
            webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        })),
        auth: AuthConfig {
            native: NativeAuthConfig {
                password: PasswordConfig {
                    argon2_memory_kib: params.memory_kib,
                    argon2_iterations: params.iterations,
                    argon2_parallelism: params.parallelism,
                    ..Default::default()
                },
                session: SessionConfig {
                    cookie_secure: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
        email: EmailConfig {
            transport: EmailTransportConfig::File {
                path: scratch.join("emails").to_string_lossy().to_string(),
            },
            ..Default::default()
        },
        storage: StorageConfig {
            permits_dir: scratch.join("permits"),
        },
        enable_metrics: false,
        enable_otel_export: false,
        ..Default::default()
    }
}

/// State wired the way [`crate::Application`] wires it, without background services.
pub fn create_test_state(pool: PgPool) -> AppState {
    create_test_state_with_config(pool, create_test_config())
}

pub fn create_test_state_with_config(pool: PgPool, config: Config) -> AppState {
    let db = Database::from_pool(pool, DEFAULT_SLOW_QUERY_THRESHOLD);
    let storage = Arc::new(LocalPermitStorage::new(config.storage.permits_dir.clone()));
    let issuer = PermitIssuer::new(db.clone(), storage.clone(), PermitRenderer::default(), config.clone());

    AppState::builder()
        .db(db)
        .maybe_payment_provider(config.payment.as_ref().map(create_provider))
        .config(config)
        .storage(storage)
        .issuer(issuer)
        .build()
}

pub async fn create_test_app(pool: PgPool) -> (TestServer, BackgroundServices) {
    let config = create_test_config();

    let app = crate::Application::new_with_pool(config, Some(pool))
        .await
        .expect("Failed to create application");

    app.into_test_server()
}

pub async fn create_test_user(pool: &PgPool, role: Role) -> UserDBResponse {
    let password_hash = password::hash_password(TEST_PASSWORD.to_string(), test_argon2_params())
        .await
        .expect("Failed to hash test password");

    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let suffix = Uuid::new_v4().simple().to_string();
    Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            email: format!("user-{suffix}@example.com"),
            password_hash,
            first_name: "Ana".to_string(),
            last_name: format!("Prueba {}", &suffix[..8]),
            role,
            is_admin_portal: role == Role::Admin,
        })
        .await
        .expect("Failed to create test user")
}

pub fn test_application_request(user_id: UserId, payment_method: PaymentMethod) -> ApplicationCreateDBRequest {
    ApplicationCreateDBRequest {
        user_id,
        details: ApplicantDetails {
            applicant_name: "Ana Prueba López".to_string(),
            curp_rfc: "PULA900101MDFRPN09".to_string(),
            address: "Calle Hidalgo 12, Centro".to_string(),
            make: "Nissan".to_string(),
            model: "Versa".to_string(),
            color: "Gris".to_string(),
            vin: "3N1AB7AP5KY250312".to_string(),
            engine_number: "HR16DE123456".to_string(),
            model_year: 2019,
        },
        payment_method,
        amount: Decimal::new(15000, 2),
        currency: "MXN".to_string(),
        renewed_from_id: None,
        renewal_reason: None,
    }
}

/// A card application waiting for payment.
pub async fn create_test_application(pool: &PgPool, user_id: UserId) -> ApplicationDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Applications::new(&mut conn)
        .create(&test_application_request(user_id, PaymentMethod::Card))
        .await
        .expect("Failed to create test application")
}

/// `Cookie` header value for a fresh session of `user`.
pub async fn session_cookie_for(pool: &PgPool, user: &UserDBResponse, admin_portal: bool) -> String {
    let config = create_test_config();
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let token = session::create_session(&mut conn, user, admin_portal, &ClientInfo::default(), &config)
        .await
        .expect("Failed to create session");
    format!("{}={}", config.auth.native.session.cookie_name, token)
}

/// `stripe-signature` header value for `body`, signed now with `secret`.
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};

    let timestamp = chrono::Utc::now().timestamp();
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// A PaymentIntent object as the provider sends it, optionally tagged with an application.
pub fn payment_intent_json(id: &str, application_id: Option<ApplicationId>) -> serde_json::Value {
    let metadata = match application_id {
        Some(application_id) => json!({ "application_id": application_id.to_string() }),
        None => json!({}),
    };
    json!({
        "id": id,
        "object": "payment_intent",
        "amount": 15000,
        "amount_capturable": 0,
        "amount_received": 0,
        "capture_method": "automatic",
        "confirmation_method": "automatic",
        "created": 1_704_067_200,
        "currency": "mxn",
        "livemode": false,
        "metadata": metadata,
        "payment_method_types": ["card"],
        "status": "requires_payment_method"
    })
}

/// Raw webhook body wrapping `object`.
pub fn webhook_event_body(event_id: &str, event_type: &str, object: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "object": "event",
        "api_version": "2024-06-20",
        "created": chrono::Utc::now().timestamp(),
        "livemode": false,
        "pending_webhooks": 1,
        "request": { "id": null, "idempotency_key": null },
        "type": event_type,
        "data": { "object": object }
    }))
    .expect("event JSON serializes")
}
