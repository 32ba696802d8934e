//! Common type definitions and access-control vocabulary.
//!
//! - ID aliases for entities ([`UserId`], [`ApplicationId`])
//! - [`Resource`] / [`Operation`] pairs used in authorization errors
//! - [`abbrev_uuid`] for compact log fields

use std::fmt;
use uuid::Uuid;

pub type UserId = Uuid;
pub type ApplicationId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

// *-All means any record, *-Own means records owned by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateOwn,
    ReadAll,
    ReadOwn,
    UpdateAll,
    UpdateOwn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Users,
    Applications,
    Payments,
    Permits,
    AuditLogs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Allow(Resource, Operation),
    /// Caller owns the specific record
    Owner,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateOwn => write!(f, "Create"),
            Operation::ReadAll | Operation::ReadOwn => write!(f, "Read"),
            Operation::UpdateAll | Operation::UpdateOwn => write!(f, "Update"),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Users => write!(f, "users"),
            Resource::Applications => write!(f, "permit applications"),
            Resource::Payments => write!(f, "payments"),
            Resource::Permits => write!(f, "permits"),
            Resource::AuditLogs => write!(f, "audit logs"),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Allow(resource, operation) => write!(f, "{operation} {resource}"),
            Permission::Owner => write!(f, "ownership of the resource"),
        }
    }
}
