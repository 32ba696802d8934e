//! Database models for permit applications.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::permits::status::ApplicationStatus;
use crate::types::{ApplicationId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "payment_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    /// Cash voucher paid at an OXXO store
    Oxxo,
}

impl PaymentMethod {
    /// Status a new (or restarted) application waits in for this method.
    pub fn awaiting_status(self) -> ApplicationStatus {
        match self {
            PaymentMethod::Card => ApplicationStatus::AwaitingPayment,
            PaymentMethod::Oxxo => ApplicationStatus::AwaitingOxxoPayment,
        }
    }
}

/// Applicant and vehicle data, shared by create and update requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicantDetails {
    pub applicant_name: String,
    pub curp_rfc: String,
    pub address: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub vin: String,
    pub engine_number: String,
    pub model_year: i32,
}

#[derive(Debug, Clone)]
pub struct ApplicationCreateDBRequest {
    pub user_id: UserId,
    pub details: ApplicantDetails,
    pub payment_method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    /// Set for renewals; the new application starts in RENEWAL_PENDING
    pub renewed_from_id: Option<ApplicationId>,
    pub renewal_reason: Option<String>,
}

impl ApplicationCreateDBRequest {
    pub fn initial_status(&self) -> ApplicationStatus {
        if self.renewed_from_id.is_some() {
            ApplicationStatus::RenewalPending
        } else {
            self.payment_method.awaiting_status()
        }
    }
}

/// Field-level edits. Status is deliberately absent: it only moves through the transition service.
#[derive(Debug, Clone, Default)]
pub struct ApplicationUpdateDBRequest {
    pub applicant_name: Option<String>,
    pub curp_rfc: Option<String>,
    pub address: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub vin: Option<String>,
    pub engine_number: Option<String>,
    pub model_year: Option<i32>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ApplicationDBResponse {
    pub id: ApplicationId,
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
    pub amount: Decimal,
    pub currency: String,
    pub payment_reference: Option<String>,
    pub oxxo_reference: Option<String>,
    pub oxxo_expires_at: Option<DateTime<Utc>>,
    pub folio: Option<String>,
    pub permit_file_path: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub renewed_from_id: Option<ApplicationId>,
    pub renewal_reason: Option<String>,
    pub admin_notes: Option<String>,
    pub payment_initiated_at: Option<DateTime<Utc>>,
    pub payment_verified_at: Option<DateTime<Utc>>,
    pub payment_failed_at: Option<DateTime<Utc>>,
    pub permit_generation_started_at: Option<DateTime<Utc>>,
    pub permit_generated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub renewal_decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationDBResponse {
    pub fn details(&self) -> ApplicantDetails {
        ApplicantDetails {
            applicant_name: self.applicant_name.clone(),
            curp_rfc: self.curp_rfc.clone(),
            address: self.address.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            color: self.color.clone(),
            vin: self.vin.clone(),
            engine_number: self.engine_number.clone(),
            model_year: self.model_year,
        }
    }
}

/// Payment details recorded when a payment is started with the provider.
#[derive(Debug, Clone)]
pub struct PaymentReferenceUpdate {
    pub payment_method: PaymentMethod,
    pub payment_reference: String,
    pub oxxo_reference: Option<String>,
    pub oxxo_expires_at: Option<DateTime<Utc>>,
}

/// Permit document details recorded once the PDF is stored.
#[derive(Debug, Clone)]
pub struct PermitDocumentUpdate {
    pub folio: String,
    pub permit_file_path: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationFilter {
    pub user_id: Option<UserId>,
    pub status: Option<ApplicationStatus>,
    /// Case-insensitive match on applicant name, VIN or folio
    pub search: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

/// One row of the per-status dashboard counts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct StatusCount {
    pub status: ApplicationStatus,
    pub count: i64,
}
