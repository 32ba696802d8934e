use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{debug, instrument, trace};

use crate::{
    AppState,
    api::models::users::CurrentUser,
    auth::{permissions, session},
    db::handlers::{Repository, Users},
    errors::{Error, Result},
    types::abbrev_uuid,
};

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        if !state.config.auth.native.enabled {
            return Err(Error::Unauthenticated { message: None });
        }

        let Some(token) = session::read_session_cookie(&parts.headers, &state.config) else {
            trace!("No session cookie in request");
            return Err(Error::Unauthenticated { message: None });
        };

        let mut conn = state.db.pool().acquire().await.map_err(|e| Error::Database(e.into()))?;

        let Some(user_session) = session::resolve_session(&mut conn, token, &state.config).await? else {
            trace!("Session cookie did not match a live session");
            return Err(Error::Unauthenticated {
                message: Some("Session expired".to_string()),
            });
        };

        let user = Users::new(&mut conn)
            .get_by_id(user_session.user_id)
            .await?
            .ok_or(Error::Unauthenticated { message: None })?;

        if !user.is_active() {
            debug!(user_id = %abbrev_uuid(&user.id), "Rejected session for disabled account");
            return Err(Error::Unauthenticated {
                message: Some("Account disabled".to_string()),
            });
        }

        let mut current_user = CurrentUser::from(user);
        // Portal access is a property of the login, not only of the account
        current_user.is_admin_portal &= user_session.is_admin_portal;

        debug!(user_id = %abbrev_uuid(&current_user.id), "Authenticated session user");
        Ok(current_user)
    }
}

/// A user logged in through the admin portal with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        permissions::require_admin(user).map(AdminUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::ClientInfo,
        db::models::users::{AccountStatus, Role, UserUpdateDBRequest},
        test_utils::{create_test_state, create_test_user},
    };
    use axum::http::{Request, header};
    use sqlx::PgPool;

    fn parts_with_cookie(cookie: &str) -> Parts {
        let request = Request::builder()
            .uri("http://localhost/api/v1/users/current")
            .header(header::COOKIE, cookie)
            .body(())
            .unwrap();
        request.into_parts().0
    }

    #[sqlx::test]
    async fn test_session_cookie_resolves_user(pool: PgPool) {
        let state = create_test_state(pool.clone());
        let user = create_test_user(&pool, Role::Client).await;
        let mut conn = pool.acquire().await.unwrap();
        let token = session::create_session(&mut conn, &user, false, &ClientInfo::default(), &state.config)
            .await
            .unwrap();

        let mut parts = parts_with_cookie(&format!("permisos_session={token}"));
        let current = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap();

        assert_eq!(current.id, user.id);
        assert_eq!(current.email, user.email);
        assert!(!current.is_admin_portal);
    }

    #[sqlx::test]
    async fn test_missing_or_unknown_cookie_is_unauthorized(pool: PgPool) {
        let state = create_test_state(pool);

        let request = Request::builder().uri("http://localhost/test").body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);

        let mut parts = parts_with_cookie("permisos_session=not-a-session");
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    async fn test_disabled_account_is_rejected(pool: PgPool) {
        let state = create_test_state(pool.clone());
        let user = create_test_user(&pool, Role::Client).await;
        let mut conn = pool.acquire().await.unwrap();
        let token = session::create_session(&mut conn, &user, false, &ClientInfo::default(), &state.config)
            .await
            .unwrap();

        Users::new(&mut conn)
            .update(
                user.id,
                &UserUpdateDBRequest {
                    account_status: Some(AccountStatus::Disabled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut parts = parts_with_cookie(&format!("permisos_session={token}"));
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    async fn test_admin_requires_portal_login(pool: PgPool) {
        let state = create_test_state(pool.clone());
        let admin = create_test_user(&pool, Role::Admin).await;
        let mut conn = pool.acquire().await.unwrap();

        let client_portal = session::create_session(&mut conn, &admin, false, &ClientInfo::default(), &state.config)
            .await
            .unwrap();
        let mut parts = parts_with_cookie(&format!("permisos_session={client_portal}"));
        let err = AdminUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);

        let admin_portal = session::create_session(&mut conn, &admin, true, &ClientInfo::default(), &state.config)
            .await
            .unwrap();
        let mut parts = parts_with_cookie(&format!("permisos_session={admin_portal}"));
        let AdminUser(current) = AdminUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(current.id, admin.id);
        assert!(current.is_admin_portal);
    }
}
