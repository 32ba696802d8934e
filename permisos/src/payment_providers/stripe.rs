//! Stripe payment provider implementation
//!
//! Card payments are confirmed by the browser with the returned client secret. OXXO payments are
//! confirmed here so the voucher comes back in the same response.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use stripe::{
    Client, CreatePaymentIntent, CreatePaymentIntentPaymentMethodData, CreatePaymentIntentPaymentMethodDataBillingDetails,
    CreatePaymentIntentPaymentMethodDataType, CreatePaymentIntentPaymentMethodOptions, CreatePaymentIntentPaymentMethodOptionsOxxo,
    Currency, StripeError,
};
use tracing::{error, info, instrument};
use url::Url;

use crate::{
    config::StripeConfig,
    db::models::applications::PaymentMethod,
    payment_providers::{
        OxxoVoucher, PaymentError, PaymentIntent, PaymentProvider, PaymentRequest, Result, WebhookEvent, construct_event,
        to_minor_units,
    },
    types::abbrev_uuid,
};

/// Stripe payment provider
pub struct StripeProvider {
    api_key: String,
    api_base: Url,
    webhook_secret: String,
}

impl From<&StripeConfig> for StripeProvider {
    fn from(config: &StripeConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            api_base: config.api_base.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }
}

impl StripeProvider {
    /// Get a Stripe client
    fn client(&self) -> Client {
        Client::from_url(self.api_base.as_str(), &self.api_key)
    }

    /// OXXO vouchers live whole days, 1 to 7.
    fn voucher_days(request: &PaymentRequest<'_>) -> u32 {
        (request.voucher_lifetime.as_secs() / 86_400).clamp(1, 7) as u32
    }
}

fn map_stripe_error(e: StripeError) -> PaymentError {
    match e {
        StripeError::Stripe(request_error) => PaymentError::ProviderRejected {
            status: request_error.http_status,
            message: request_error.message.unwrap_or_else(|| "no message".to_string()),
        },
        other => PaymentError::ProviderRequest(other.to_string()),
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, request), fields(application_id = %abbrev_uuid(&request.application.id), method = ?request.method), err)]
    async fn create_payment(&self, request: PaymentRequest<'_>) -> Result<PaymentIntent> {
        let application = request.application;
        let client = self.client();
        let description = format!("Permiso de circulación {}", application.vin);

        let currency: Currency = application
            .currency
            .to_lowercase()
            .parse()
            .map_err(|_| PaymentError::ProviderRequest(format!("unsupported currency {}", application.currency)))?;

        let mut params = CreatePaymentIntent::new(to_minor_units(application.amount)?, currency);
        params.metadata = Some(HashMap::from([("application_id".to_string(), application.id.to_string())]));
        params.receipt_email = Some(&request.user.email);
        params.description = Some(&description);

        match request.method {
            PaymentMethod::Card => {
                params.payment_method_types = Some(vec!["card".to_string()]);
            }
            PaymentMethod::Oxxo => {
                params.payment_method_types = Some(vec!["oxxo".to_string()]);
                params.payment_method_data = Some(CreatePaymentIntentPaymentMethodData {
                    type_: CreatePaymentIntentPaymentMethodDataType::Oxxo,
                    billing_details: Some(CreatePaymentIntentPaymentMethodDataBillingDetails {
                        name: Some(application.applicant_name.clone()),
                        email: Some(request.user.email.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                params.payment_method_options = Some(CreatePaymentIntentPaymentMethodOptions {
                    oxxo: Some(CreatePaymentIntentPaymentMethodOptionsOxxo {
                        expires_after_days: Some(Self::voucher_days(&request)),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                params.confirm = Some(true);
            }
        }

        let intent = stripe::PaymentIntent::create(&client, params).await.map_err(|e| {
            error!("Failed to create Stripe payment intent: {:?}", e);
            map_stripe_error(e)
        })?;

        let oxxo = intent
            .next_action
            .as_ref()
            .and_then(|action| action.oxxo_display_details.as_ref())
            .and_then(OxxoVoucher::from_display_details);
        if request.method == PaymentMethod::Oxxo && oxxo.is_none() {
            return Err(PaymentError::ProviderRequest("OXXO payment intent without voucher details".to_string()));
        }

        info!(reference = %intent.id, "Created Stripe payment intent");
        Ok(PaymentIntent {
            reference: intent.id.to_string(),
            client_secret: intent.client_secret,
            oxxo,
        })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent> {
        construct_event(headers, body, &self.webhook_secret)
    }
}
