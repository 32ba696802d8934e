//! Permit application lifecycle.
//!
//! ```text
//!                       ┌──────────────────────┐
//!  AWAITING_PAYMENT ◄──►│ AWAITING_OXXO_PAYMENT│
//!        │   ▲          └──────────┬───────────┘
//!        ▼   │                     │
//!  PAYMENT_PROCESSING ──► PAYMENT_FAILED (retry → AWAITING_*)
//!        │                         │
//!        ▼                         ▼
//!  PAYMENT_RECEIVED ──► GENERATING_PERMIT ◄──► ERROR_GENERATING_PERMIT
//!                              │
//!                              ▼
//!                        PERMIT_READY ──► COMPLETED | EXPIRED
//!
//!  RENEWAL_PENDING ──► RENEWAL_APPROVED ──► AWAITING_PAYMENT | AWAITING_OXXO_PAYMENT
//!          └────────► RENEWAL_REJECTED ──► CANCELLED
//! ```
//!
//! Unpaid and renewal states can also be cancelled; unpaid states can expire.
//! [`ApplicationStatus::allowed_targets`] is the authoritative table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "application_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    AwaitingPayment,
    AwaitingOxxoPayment,
    PaymentProcessing,
    PaymentFailed,
    PaymentReceived,
    GeneratingPermit,
    ErrorGeneratingPermit,
    PermitReady,
    Completed,
    Cancelled,
    Expired,
    RenewalPending,
    RenewalApproved,
    RenewalRejected,
}

/// Timestamp column stamped when an application enters a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    PaymentInitiated,
    PaymentVerified,
    PaymentFailed,
    PermitGenerationStarted,
    PermitGenerated,
    Completed,
    Cancelled,
    Expired,
    RenewalDecided,
}

impl Milestone {
    pub fn column(self) -> &'static str {
        match self {
            Milestone::PaymentInitiated => "payment_initiated_at",
            Milestone::PaymentVerified => "payment_verified_at",
            Milestone::PaymentFailed => "payment_failed_at",
            Milestone::PermitGenerationStarted => "permit_generation_started_at",
            Milestone::PermitGenerated => "permit_generated_at",
            Milestone::Completed => "completed_at",
            Milestone::Cancelled => "cancelled_at",
            Milestone::Expired => "expired_at",
            Milestone::RenewalDecided => "renewal_decided_at",
        }
    }
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 14] = [
        ApplicationStatus::AwaitingPayment,
        ApplicationStatus::AwaitingOxxoPayment,
        ApplicationStatus::PaymentProcessing,
        ApplicationStatus::PaymentFailed,
        ApplicationStatus::PaymentReceived,
        ApplicationStatus::GeneratingPermit,
        ApplicationStatus::ErrorGeneratingPermit,
        ApplicationStatus::PermitReady,
        ApplicationStatus::Completed,
        ApplicationStatus::Cancelled,
        ApplicationStatus::Expired,
        ApplicationStatus::RenewalPending,
        ApplicationStatus::RenewalApproved,
        ApplicationStatus::RenewalRejected,
    ];

    /// Statuses reachable in one step.
    pub fn allowed_targets(self) -> &'static [ApplicationStatus] {
        use ApplicationStatus::*;
        match self {
            AwaitingPayment => &[AwaitingOxxoPayment, PaymentProcessing, PaymentReceived, PaymentFailed, Cancelled, Expired],
            AwaitingOxxoPayment => &[AwaitingPayment, PaymentProcessing, PaymentReceived, PaymentFailed, Cancelled, Expired],
            PaymentProcessing => &[PaymentReceived, PaymentFailed, Cancelled],
            PaymentFailed => &[AwaitingPayment, AwaitingOxxoPayment, PaymentProcessing, PaymentReceived, Cancelled, Expired],
            PaymentReceived => &[GeneratingPermit],
            GeneratingPermit => &[PermitReady, ErrorGeneratingPermit],
            ErrorGeneratingPermit => &[GeneratingPermit],
            PermitReady => &[Completed, Expired],
            RenewalPending => &[RenewalApproved, RenewalRejected, Cancelled],
            RenewalApproved => &[AwaitingPayment, AwaitingOxxoPayment, Cancelled],
            RenewalRejected => &[Cancelled],
            Completed | Cancelled | Expired => &[],
        }
    }

    pub fn can_transition_to(self, target: ApplicationStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Statuses a fresh application may be created in.
    pub fn is_initial(self) -> bool {
        matches!(
            self,
            ApplicationStatus::AwaitingPayment | ApplicationStatus::AwaitingOxxoPayment | ApplicationStatus::RenewalPending
        )
    }

    /// True once the fee has been confirmed. Later payment events must not move these back.
    pub fn payment_settled(self) -> bool {
        use ApplicationStatus::*;
        match self {
            PaymentReceived | GeneratingPermit | ErrorGeneratingPermit | PermitReady | Completed => true,
            AwaitingPayment | AwaitingOxxoPayment | PaymentProcessing | PaymentFailed | Cancelled | Expired | RenewalPending
            | RenewalApproved | RenewalRejected => false,
        }
    }

    /// Applicant and vehicle data can still be corrected.
    pub fn is_editable(self) -> bool {
        matches!(
            self,
            ApplicationStatus::AwaitingPayment
                | ApplicationStatus::AwaitingOxxoPayment
                | ApplicationStatus::PaymentFailed
                | ApplicationStatus::RenewalPending
        )
    }

    /// A payment can be started (or restarted) from here.
    pub fn accepts_payment(self) -> bool {
        matches!(
            self,
            ApplicationStatus::AwaitingPayment | ApplicationStatus::AwaitingOxxoPayment | ApplicationStatus::PaymentFailed
        )
    }

    /// The permit document can be downloaded.
    pub fn has_permit(self) -> bool {
        matches!(self, ApplicationStatus::PermitReady | ApplicationStatus::Completed)
    }

    pub fn milestone(self) -> Option<Milestone> {
        use ApplicationStatus::*;
        match self {
            AwaitingOxxoPayment | PaymentProcessing => Some(Milestone::PaymentInitiated),
            PaymentReceived => Some(Milestone::PaymentVerified),
            PaymentFailed => Some(Milestone::PaymentFailed),
            GeneratingPermit => Some(Milestone::PermitGenerationStarted),
            PermitReady => Some(Milestone::PermitGenerated),
            Completed => Some(Milestone::Completed),
            Cancelled => Some(Milestone::Cancelled),
            Expired => Some(Milestone::Expired),
            RenewalApproved | RenewalRejected => Some(Milestone::RenewalDecided),
            AwaitingPayment | ErrorGeneratingPermit | RenewalPending => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        use ApplicationStatus::*;
        match self {
            AwaitingPayment => "AWAITING_PAYMENT",
            AwaitingOxxoPayment => "AWAITING_OXXO_PAYMENT",
            PaymentProcessing => "PAYMENT_PROCESSING",
            PaymentFailed => "PAYMENT_FAILED",
            PaymentReceived => "PAYMENT_RECEIVED",
            GeneratingPermit => "GENERATING_PERMIT",
            ErrorGeneratingPermit => "ERROR_GENERATING_PERMIT",
            PermitReady => "PERMIT_READY",
            Completed => "COMPLETED",
            Cancelled => "CANCELLED",
            Expired => "EXPIRED",
            RenewalPending => "RENEWAL_PENDING",
            RenewalApproved => "RENEWAL_APPROVED",
            RenewalRejected => "RENEWAL_REJECTED",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown application status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ApplicationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApplicationStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
