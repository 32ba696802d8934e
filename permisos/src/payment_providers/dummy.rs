//! Dummy payment provider implementation
//!
//! Creates payments without leaving the process. Webhooks still have to be Stripe-format events
//! signed with the configured secret, so local setups exercise the same verification path as
//! production.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use tracing::info;

use crate::{
    config::DummyConfig,
    db::models::applications::PaymentMethod,
    payment_providers::{
        OxxoVoucher, PaymentIntent, PaymentProvider, PaymentRequest, Result, WebhookEvent, construct_event, to_minor_units,
    },
    types::abbrev_uuid,
};

/// Dummy payment provider; every payment is created successfully
pub struct DummyProvider {
    webhook_secret: String,
}

impl From<&DummyConfig> for DummyProvider {
    fn from(config: &DummyConfig) -> Self {
        Self {
            webhook_secret: config.webhook_secret.clone(),
        }
    }
}

#[async_trait]
impl PaymentProvider for DummyProvider {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn create_payment(&self, request: PaymentRequest<'_>) -> Result<PaymentIntent> {
        // Same amount checks as a real provider
        to_minor_units(request.application.amount)?;

        let id = uuid::Uuid::new_v4();
        let reference = format!("pi_dummy_{}", id.simple());
        let oxxo = match request.method {
            PaymentMethod::Card => None,
            PaymentMethod::Oxxo => {
                let lifetime = chrono::Duration::from_std(request.voucher_lifetime).unwrap_or(chrono::Duration::days(3));
                Some(OxxoVoucher {
                    reference: format!("{:014}", id.as_u128() % 100_000_000_000_000),
                    expires_at: Utc::now() + lifetime,
                    voucher_url: None,
                })
            }
        };

        info!(
            application_id = %abbrev_uuid(&request.application.id),
            reference = %reference,
            "Dummy provider created payment"
        );

        Ok(PaymentIntent {
            client_secret: Some(format!("{reference}_secret_dummy")),
            reference,
            oxxo,
        })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent> {
        construct_event(headers, body, &self.webhook_secret)
    }
}

impl DummyProvider {
    /// Voucher lifetime used when a caller has none configured.
    pub const DEFAULT_VOUCHER_LIFETIME: Duration = Duration::from_secs(3 * 86_400);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::users::Role;
    use crate::payment_providers::{PaymentError, SIGNATURE_HEADER};
    use crate::test_utils::{create_test_application, create_test_user, payment_intent_json, sign_webhook, webhook_event_body};
    use axum::http::HeaderValue;
    use sqlx::PgPool;

    fn provider() -> DummyProvider {
        DummyProvider::from(&DummyConfig {
            webhook_secret: "whsec_dummy".to_string(),
        })
    }

    #[sqlx::test]
    async fn test_card_and_oxxo_payments(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let provider = provider();

        let card = provider
            .create_payment(PaymentRequest {
                application: &application,
                user: &user,
                method: PaymentMethod::Card,
                voucher_lifetime: DummyProvider::DEFAULT_VOUCHER_LIFETIME,
            })
            .await
            .unwrap();
        assert!(card.reference.starts_with("pi_dummy_"));
        assert!(card.oxxo.is_none());

        let oxxo = provider
            .create_payment(PaymentRequest {
                application: &application,
                user: &user,
                method: PaymentMethod::Oxxo,
                voucher_lifetime: DummyProvider::DEFAULT_VOUCHER_LIFETIME,
            })
            .await
            .unwrap();
        let voucher = oxxo.oxxo.unwrap();
        assert_eq!(voucher.reference.len(), 14);
        assert!(voucher.expires_at > Utc::now() + chrono::Duration::days(2));
        assert_ne!(card.reference, oxxo.reference);
    }

    #[test]
    fn test_webhooks_must_be_signed() {
        let provider = provider();
        let body = webhook_event_body("evt_dummy", "payment_intent.processing", payment_intent_json("pi_dummy_1", None));

        assert!(matches!(
            provider.verify_webhook(&HeaderMap::new(), &body),
            Err(PaymentError::InvalidSignature(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sign_webhook("whsec_dummy", &body)).unwrap());
        let event = provider.verify_webhook(&headers, &body).unwrap();
        assert_eq!(event.id, "evt_dummy");
        assert_eq!(event.target_status(), Some(crate::permits::status::ApplicationStatus::PaymentProcessing));
    }
}
