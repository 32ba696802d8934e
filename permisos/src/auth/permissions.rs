//! Access checks shared by client and admin handlers.

use crate::{
    api::models::users::CurrentUser,
    db::models::{applications::ApplicationDBResponse, users::Role},
    errors::Error,
    types::{Operation, Permission, Resource},
};

/// Staff can act on admin routes only from an admin-portal session.
pub fn is_admin_session(user: &CurrentUser) -> bool {
    user.role == Role::Admin && user.is_admin_portal
}

pub fn require_admin(user: CurrentUser) -> Result<CurrentUser, Error> {
    if is_admin_session(&user) {
        Ok(user)
    } else {
        Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Applications, Operation::ReadAll),
            action: Operation::ReadAll,
            resource: "admin resource".to_string(),
        })
    }
}

/// Clients see their own applications; admin sessions see all of them.
///
/// Someone else's application is reported as not found so ids cannot be enumerated.
pub fn can_access_application(user: &CurrentUser, application: &ApplicationDBResponse) -> Result<(), Error> {
    if application.user_id == user.id || is_admin_session(user) {
        Ok(())
    } else {
        Err(Error::NotFound {
            resource: "Application".to_string(),
            id: application.id.to_string(),
        })
    }
}
