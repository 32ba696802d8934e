//! Server-side sessions.
//!
//! The cookie carries a random token. The database stores `hex(hmac_sha256(secret_key, token))`
//! as the session id, so the raw token never touches the database.

use axum::http::{HeaderMap, header};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    auth::{ClientInfo, password},
    config::Config,
    db::{
        handlers::Sessions,
        models::{
            sessions::{SessionCreateDBRequest, UserSession},
            users::UserDBResponse,
        },
    },
    errors::Error,
    types::abbrev_uuid,
};

type HmacSha256 = Hmac<Sha256>;

/// Keyed digest of a session token, used as the `user_sessions` primary key.
pub fn session_id(token: &str, config: &Config) -> Result<String, Error> {
    let secret_key = config.secret_key.as_deref().ok_or_else(|| Error::Internal {
        operation: "derive session id: secret_key is required".to_string(),
    })?;

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|e| Error::Internal {
        operation: format!("create session HMAC: {e}"),
    })?;
    mac.update(token.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Open a session for `user`, returning the cookie token.
#[instrument(skip_all, fields(user_id = %abbrev_uuid(&user.id), is_admin_portal), err)]
pub async fn create_session(
    conn: &mut PgConnection,
    user: &UserDBResponse,
    is_admin_portal: bool,
    client: &ClientInfo,
    config: &Config,
) -> Result<String, Error> {
    let token = password::random_token();
    let timeout = chrono::Duration::from_std(config.auth.native.session.timeout).map_err(|e| Error::Internal {
        operation: format!("convert session timeout: {e}"),
    })?;

    Sessions::new(conn)
        .create(&SessionCreateDBRequest {
            id: session_id(&token, config)?,
            user_id: user.id,
            is_admin_portal,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            expires_at: Utc::now() + timeout,
        })
        .await?;

    Ok(token)
}

/// Find the live session for a cookie token.
#[instrument(skip_all, err)]
pub async fn resolve_session(conn: &mut PgConnection, token: &str, config: &Config) -> Result<Option<UserSession>, Error> {
    let id = session_id(token, config)?;
    Ok(Sessions::new(conn).touch_active(&id).await?)
}

/// End the session for a cookie token. Unknown tokens are not an error.
#[instrument(skip_all, err)]
pub async fn revoke_session(conn: &mut PgConnection, token: &str, config: &Config) -> Result<bool, Error> {
    let id = session_id(token, config)?;
    Ok(Sessions::new(conn).delete(&id).await?)
}

/// The session token from the request's `Cookie` header, if present.
pub fn read_session_cookie<'h>(headers: &'h HeaderMap, config: &Config) -> Option<&'h str> {
    let cookie_name = config.auth.native.session.cookie_name.as_str();

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value)
}

/// `Set-Cookie` value for a new session.
pub fn session_cookie(token: &str, config: &Config) -> String {
    let session_config = &config.auth.native.session;
    cookie_string(&session_config.cookie_name, token, session_config.timeout.as_secs(), config)
}

/// `Set-Cookie` value that removes the session cookie.
pub fn clear_session_cookie(config: &Config) -> String {
    cookie_string(&config.auth.native.session.cookie_name, "", 0, config)
}

fn cookie_string(name: &str, value: &str, max_age: u64, config: &Config) -> String {
    let session_config = &config.auth.native.session;
    let secure = if session_config.cookie_secure { "; Secure" } else { "" };
    let same_site = match session_config.cookie_same_site.to_ascii_lowercase().as_str() {
        "strict" => "Strict",
        "none" => "None",
        _ => "Lax",
    };

    format!("{name}={value}; Path=/; HttpOnly; SameSite={same_site}; Max-Age={max_age}{secure}")
}
