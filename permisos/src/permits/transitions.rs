//! Applying status changes.
//!
//! [`transition`] is the only writer of `permit_applications.status`. It runs on a caller-supplied
//! connection so the change commits (or rolls back) together with whatever else the caller
//! writes in the same transaction, typically an audit row.

use std::fmt;

use metrics::counter;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument};

use crate::{
    db::{
        handlers::{Applications, SecurityEvents},
        models::{
            applications::ApplicationDBResponse,
            audit::{SecurityAction, SecurityEventCreateDBRequest},
        },
    },
    errors::{Error, Result},
    permits::status::ApplicationStatus,
    types::{ApplicationId, UserId, abbrev_uuid},
};

/// Who asked for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(UserId),
    /// Background work: payment webhooks, permit issuance, expiry sweeps
    System(&'static str),
}

impl Actor {
    pub fn user_id(self) -> Option<UserId> {
        match self {
            Actor::User(id) => Some(id),
            Actor::System(_) => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", abbrev_uuid(id)),
            Actor::System(name) => write!(f, "system:{name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        from: ApplicationStatus,
        to: ApplicationStatus,
        application: ApplicationDBResponse,
    },
    /// The application was already in the requested status
    Unchanged { application: ApplicationDBResponse },
}

impl TransitionOutcome {
    pub fn application(&self) -> &ApplicationDBResponse {
        match self {
            TransitionOutcome::Applied { application, .. } | TransitionOutcome::Unchanged { application } => application,
        }
    }

    pub fn into_application(self) -> ApplicationDBResponse {
        match self {
            TransitionOutcome::Applied { application, .. } | TransitionOutcome::Unchanged { application } => application,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Move application `id` to `target`.
///
/// Locks the row for the rest of the caller's transaction, so concurrent transitions on the
/// same application serialize. Targets outside the adjacency table fail with
/// [`Error::InvalidTransition`] and nothing is written.
#[instrument(skip(conn, reason), fields(application_id = %abbrev_uuid(&id), %target, %actor), err)]
pub async fn transition(
    conn: &mut PgConnection,
    id: ApplicationId,
    target: ApplicationStatus,
    actor: Actor,
    reason: Option<&str>,
) -> Result<TransitionOutcome> {
    let current = Applications::new(conn)
        .get_for_update(id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Application".to_string(),
            id: id.to_string(),
        })?;

    let from = current.status;
    if from == target {
        return Ok(TransitionOutcome::Unchanged { application: current });
    }
    if !from.can_transition_to(target) {
        return Err(Error::InvalidTransition { from, to: target });
    }

    let application = Applications::new(conn)
        .apply_status(id, from, target)
        .await?
        .ok_or_else(|| Error::Conflict {
            message: format!("application {id} changed status concurrently"),
        })?;

    SecurityEvents::new(conn)
        .append(
            &SecurityEventCreateDBRequest::new(actor.user_id(), SecurityAction::ApplicationStatusChanged)
                .entity("permit_application", id)
                .details(json!({
                    "from": from,
                    "to": target,
                    "actor": actor.to_string(),
                    "reason": reason,
                })),
        )
        .await?;

    counter!("permisos_status_transitions_total", "from" => from.as_str(), "to" => target.as_str()).increment(1);
    info!(%from, to = %target, "Application status changed");

    Ok(TransitionOutcome::Applied {
        from,
        to: target,
        application,
    })
}
