//! Payment provider abstraction layer
//!
//! [`PaymentProvider`] starts payments for an application and authenticates the provider's
//! webhooks. Both implementations speak Stripe's event format, so webhook processing in
//! [`webhook`] does not care which one is configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::{
    config::PaymentConfig,
    db::models::applications::{ApplicationDBResponse, PaymentMethod},
    db::models::users::UserDBResponse,
    permits::status::ApplicationStatus,
    types::ApplicationId,
};

pub mod dummy;
pub mod stripe;
pub mod webhook;

/// Create a payment provider from configuration
///
/// This is the single point where we convert config into provider instances.
pub fn create_provider(config: &PaymentConfig) -> Arc<dyn PaymentProvider> {
    match config {
        PaymentConfig::Stripe(stripe_config) => Arc::new(stripe::StripeProvider::from(stripe_config)),
        PaymentConfig::Dummy(dummy_config) => Arc::new(dummy::DummyProvider::from(dummy_config)),
    }
}

/// Result type for payment provider operations
pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("No payment provider is configured")]
    NotConfigured,

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("Amount {0} cannot be charged")]
    InvalidAmount(Decimal),

    #[error("Payment provider request failed: {0}")]
    ProviderRequest(String),

    /// The provider answered with an error body
    #[error("Payment provider rejected the request ({status}): {message}")]
    ProviderRejected { status: u16, message: String },
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::NotConfigured => StatusCode::NOT_IMPLEMENTED,
            PaymentError::InvalidSignature(_) | PaymentError::MalformedEvent(_) | PaymentError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            // Card declines come back as 402
            PaymentError::ProviderRejected { status: 402, .. } => StatusCode::PAYMENT_REQUIRED,
            PaymentError::ProviderRequest(_) | PaymentError::ProviderRejected { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::NotConfigured => "Payments are not available".to_string(),
            PaymentError::InvalidSignature(_) => "Invalid signature".to_string(),
            PaymentError::MalformedEvent(_) => "Malformed event".to_string(),
            PaymentError::InvalidAmount(_) => "Invalid payment amount".to_string(),
            PaymentError::ProviderRejected { status: 402, message } => message.clone(),
            PaymentError::ProviderRequest(_) | PaymentError::ProviderRejected { .. } => {
                "The payment provider could not process the request".to_string()
            }
        }
    }
}

/// Smallest currency unit (centavos) for `amount`.
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .filter(|units| *units > 0)
        .ok_or(PaymentError::InvalidAmount(amount))
}

/// What to charge and who for.
#[derive(Debug, Clone, Copy)]
pub struct PaymentRequest<'a> {
    pub application: &'a ApplicationDBResponse,
    pub user: &'a UserDBResponse,
    pub method: PaymentMethod,
    /// How long an OXXO voucher stays payable
    pub voucher_lifetime: Duration,
}

/// Cash voucher details the customer takes to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OxxoVoucher {
    pub reference: String,
    pub expires_at: DateTime<Utc>,
    pub voucher_url: Option<String>,
}

/// A payment started with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    /// Provider id, stored as the application's payment reference
    pub reference: String,
    /// Passed to the browser to confirm a card payment
    pub client_secret: Option<String>,
    pub oxxo: Option<OxxoVoucher>,
}

/// An authenticated webhook event, reduced to what the application needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Provider event id; unique per delivery attempt group
    pub id: String,
    pub event_type: String,
    /// PaymentIntent id when the event is about one
    pub payment_reference: Option<String>,
    /// From the payment's metadata, set when the payment was created
    pub application_id: Option<ApplicationId>,
    pub oxxo: Option<OxxoVoucher>,
    pub failure_message: Option<String>,
}

impl WebhookEvent {
    /// Status this event moves the application to. `None` for events with no status effect.
    pub fn target_status(&self) -> Option<ApplicationStatus> {
        match self.event_type.as_str() {
            "payment_intent.succeeded" => Some(ApplicationStatus::PaymentReceived),
            "payment_intent.processing" => Some(ApplicationStatus::PaymentProcessing),
            "payment_intent.payment_failed" | "payment_intent.canceled" => Some(ApplicationStatus::PaymentFailed),
            "payment_intent.requires_action" if self.oxxo.is_some() => Some(ApplicationStatus::AwaitingOxxoPayment),
            _ => None,
        }
    }
}

impl TryFrom<::stripe::Event> for WebhookEvent {
    type Error = PaymentError;

    fn try_from(event: ::stripe::Event) -> Result<Self> {
        let mut webhook_event = Self {
            id: event.id.to_string(),
            event_type: event.type_.to_string(),
            payment_reference: None,
            application_id: None,
            oxxo: None,
            failure_message: None,
        };

        // Only PaymentIntent events carry anything we act on
        let ::stripe::EventObject::PaymentIntent(intent) = event.data.object else {
            return Ok(webhook_event);
        };

        if let Some(id) = intent.metadata.get("application_id") {
            let id = id
                .parse()
                .map_err(|_| PaymentError::MalformedEvent(format!("invalid application_id '{id}'")))?;
            webhook_event.application_id = Some(id);
        }
        webhook_event.payment_reference = Some(intent.id.to_string());
        webhook_event.oxxo = intent
            .next_action
            .as_ref()
            .and_then(|action| action.oxxo_display_details.as_ref())
            .and_then(OxxoVoucher::from_display_details);
        webhook_event.failure_message = intent.last_payment_error.and_then(|e| e.message);

        Ok(webhook_event)
    }
}

impl OxxoVoucher {
    fn from_display_details(details: &::stripe::PaymentIntentNextActionDisplayOxxoDetails) -> Option<Self> {
        Some(Self {
            reference: details.number.clone()?,
            expires_at: DateTime::from_timestamp(details.expires_after?, 0)?,
            voucher_url: details.hosted_voucher_url.clone(),
        })
    }
}

/// Abstract payment provider interface
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Short provider name for logs and metrics
    fn name(&self) -> &'static str;

    /// Start a payment for an application.
    ///
    /// Card payments return a client secret for the browser; OXXO payments return the voucher.
    async fn create_payment(&self, request: PaymentRequest<'_>) -> Result<PaymentIntent>;

    /// Authenticate a webhook delivery and parse its event.
    ///
    /// Fails with [`PaymentError::InvalidSignature`] before looking at the body.
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent>;
}

/// Header the provider puts the webhook signature in.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Authenticate a `stripe-signature` delivery and convert its event.
///
/// Both providers sign with the same scheme, so the dummy provider goes through here too.
pub(crate) fn construct_event(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<WebhookEvent> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or_else(|| {
            tracing::error!("Missing stripe-signature header");
            PaymentError::InvalidSignature(format!("missing {SIGNATURE_HEADER} header"))
        })?
        .to_str()
        .map_err(|_| PaymentError::InvalidSignature("header is not ASCII".to_string()))?;
    let body = std::str::from_utf8(body).map_err(|_| PaymentError::MalformedEvent("body is not UTF-8".to_string()))?;

    let event = ::stripe::Webhook::construct_event(body, signature, secret).map_err(|e| match e {
        ::stripe::WebhookError::BadParse(e) => PaymentError::MalformedEvent(e.to_string()),
        other => {
            tracing::warn!("Rejected webhook delivery: {:?}", other);
            PaymentError::InvalidSignature(other.to_string())
        }
    })?;

    tracing::trace!("Validated webhook event: {:?}", event.type_);
    WebhookEvent::try_from(event)
}
