//! API request/response models for permit applications.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::{
    db::models::applications::{ApplicantDetails, ApplicationDBResponse, ApplicationUpdateDBRequest, PaymentMethod},
    errors::{Result, Validator},
    payment_providers::PaymentIntent,
    permits::status::ApplicationStatus,
    types::{ApplicationId, UserId},
};

const MAX_TEXT_LENGTH: usize = 255;
const FIRST_MODEL_YEAR: i32 = 1900;

/// Vehicle identification numbers are 17 characters and never use I, O or Q.
fn is_valid_vin(vin: &str) -> bool {
    vin.len() == 17 && vin.chars().all(|c| c.is_ascii_alphanumeric() && !matches!(c.to_ascii_uppercase(), 'I' | 'O' | 'Q'))
}

/// CURP is 18 characters; RFC is 12 (companies) or 13 (individuals).
fn is_valid_curp_rfc(value: &str) -> bool {
    matches!(value.len(), 12 | 13 | 18) && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '&' || c == 'Ñ')
}

fn max_model_year() -> i32 {
    Utc::now().year() + 1
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplicationCreate {
    pub applicant_name: String,
    /// CURP or RFC of the applicant
    pub curp_rfc: String,
    pub address: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub vin: String,
    pub engine_number: String,
    pub model_year: i32,
    /// Defaults to card
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
}

impl ApplicationCreate {
    /// Check every field, reporting all problems at once.
    pub fn validate(&self) -> Result<ApplicantDetails> {
        let mut v = Validator::new();
        for (field, value) in [
            ("applicant_name", &self.applicant_name),
            ("curp_rfc", &self.curp_rfc),
            ("address", &self.address),
            ("make", &self.make),
            ("model", &self.model),
            ("color", &self.color),
            ("vin", &self.vin),
            ("engine_number", &self.engine_number),
        ] {
            v.required(value, field)
                .check(value.trim().chars().count() <= MAX_TEXT_LENGTH, field, "is too long");
        }

        let vin = self.vin.trim().to_uppercase();
        let curp_rfc = self.curp_rfc.trim().to_uppercase();
        v.check(vin.is_empty() || is_valid_vin(&vin), "vin", "must be 17 letters or digits, without I, O or Q")
            .check(curp_rfc.is_empty() || is_valid_curp_rfc(&curp_rfc), "curp_rfc", "is not a valid CURP or RFC")
            .check(
                (FIRST_MODEL_YEAR..=max_model_year()).contains(&self.model_year),
                "model_year",
                "is out of range",
            )
            .finish()?;

        Ok(ApplicantDetails {
            applicant_name: self.applicant_name.trim().to_string(),
            curp_rfc,
            address: self.address.trim().to_string(),
            make: self.make.trim().to_string(),
            model: self.model.trim().to_string(),
            color: self.color.trim().to_string(),
            vin,
            engine_number: self.engine_number.trim().to_string(),
            model_year: self.model_year,
        })
    }
}

/// Corrections to applicant or vehicle data. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ApplicationUpdate {
    pub applicant_name: Option<String>,
    pub curp_rfc: Option<String>,
    pub address: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub vin: Option<String>,
    pub engine_number: Option<String>,
    pub model_year: Option<i32>,
}

impl ApplicationUpdate {
    pub fn validate(&self) -> Result<ApplicationUpdateDBRequest> {
        let mut v = Validator::new();
        for (field, value) in [
            ("applicant_name", &self.applicant_name),
            ("curp_rfc", &self.curp_rfc),
            ("address", &self.address),
            ("make", &self.make),
            ("model", &self.model),
            ("color", &self.color),
            ("vin", &self.vin),
            ("engine_number", &self.engine_number),
        ] {
            if let Some(value) = value {
                v.required(value, field)
                    .check(value.trim().chars().count() <= MAX_TEXT_LENGTH, field, "is too long");
            }
        }
        if let Some(vin) = &self.vin {
            v.check(is_valid_vin(&vin.trim().to_uppercase()), "vin", "must be 17 letters or digits, without I, O or Q");
        }
        if let Some(curp_rfc) = &self.curp_rfc {
            v.check(is_valid_curp_rfc(&curp_rfc.trim().to_uppercase()), "curp_rfc", "is not a valid CURP or RFC");
        }
        if let Some(year) = self.model_year {
            v.check((FIRST_MODEL_YEAR..=max_model_year()).contains(&year), "model_year", "is out of range");
        }
        v.finish()?;

        Ok(ApplicationUpdateDBRequest {
            applicant_name: self.applicant_name.clone(),
            curp_rfc: self.curp_rfc.clone(),
            address: self.address.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            color: self.color.clone(),
            vin: self.vin.clone(),
            engine_number: self.engine_number.clone(),
            model_year: self.model_year,
            admin_notes: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplicationResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ApplicationId,
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub status: ApplicationStatus,
    pub applicant_name: String,
    pub curp_rfc: String,
    pub address: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub vin: String,
    pub engine_number: String,
    pub model_year: i32,
    pub payment_method: PaymentMethod,
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub currency: String,
    pub payment_reference: Option<String>,
    pub oxxo_reference: Option<String>,
    pub oxxo_expires_at: Option<DateTime<Utc>>,
    pub folio: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    /// The permit PDF can be downloaded
    pub permit_available: bool,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub renewed_from_id: Option<ApplicationId>,
    pub renewal_reason: Option<String>,
    /// Only included for admin sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_notes: Option<String>,
    pub payment_verified_at: Option<DateTime<Utc>>,
    pub permit_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ApplicationDBResponse> for ApplicationResponse {
    fn from(db: ApplicationDBResponse) -> Self {
        Self {
            permit_available: db.status.has_permit() && db.permit_file_path.is_some(),
            id: db.id,
            user_id: db.user_id,
            status: db.status,
            applicant_name: db.applicant_name,
            curp_rfc: db.curp_rfc,
            address: db.address,
            make: db.make,
            model: db.model,
            color: db.color,
            vin: db.vin,
            engine_number: db.engine_number,
            model_year: db.model_year,
            payment_method: db.payment_method,
            amount: db.amount,
            currency: db.currency,
            payment_reference: db.payment_reference,
            oxxo_reference: db.oxxo_reference,
            oxxo_expires_at: db.oxxo_expires_at,
            folio: db.folio,
            valid_from: db.valid_from,
            valid_until: db.valid_until,
            renewed_from_id: db.renewed_from_id,
            renewal_reason: db.renewal_reason,
            admin_notes: db.admin_notes,
            payment_verified_at: db.payment_verified_at,
            permit_generated_at: db.permit_generated_at,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

impl ApplicationResponse {
    /// Drop staff-only fields for the citizen API.
    pub fn for_client(mut self) -> Self {
        self.admin_notes = None;
        self
    }
}

/// Query parameters for listing applications
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListApplicationsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    pub status: Option<ApplicationStatus>,

    /// Case-insensitive match on applicant name, VIN or folio
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentCreate {
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentResponse {
    pub application: ApplicationResponse,
    pub payment_reference: String,
    /// Confirms a card payment in the browser
    pub client_secret: Option<String>,
    pub oxxo_reference: Option<String>,
    pub oxxo_expires_at: Option<DateTime<Utc>>,
    pub voucher_url: Option<String>,
}

impl PaymentResponse {
    pub fn new(application: ApplicationDBResponse, intent: PaymentIntent) -> Self {
        let (oxxo_reference, oxxo_expires_at, voucher_url) = match intent.oxxo {
            Some(voucher) => (Some(voucher.reference), Some(voucher.expires_at), voucher.voucher_url),
            None => (None, None, None),
        };
        Self {
            application: ApplicationResponse::from(application).for_client(),
            payment_reference: intent.reference,
            client_secret: intent.client_secret,
            oxxo_reference,
            oxxo_expires_at,
            voucher_url,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RenewalCreate {
    pub reason: Option<String>,
    /// Defaults to the method of the original application
    pub payment_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusChangeRequest {
    pub status: ApplicationStatus,
    pub reason: Option<String>,
}

/// Manual payment verification or rejection by staff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PaymentDecision {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RenewalDecision {
    pub approved: bool,
    pub notes: Option<String>,
}
