//! Argon2id hashing for account passwords and password reset tokens, and the random tokens
//! handed out for sessions and resets.
//!
//! Hashing is deliberately slow, so request handlers go through [`hash_password`] and
//! [`verify_password`], which run on the blocking pool.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use rand::prelude::RngExt;
use rand::rng;

use crate::config::PasswordConfig;
use crate::errors::{Error, FieldError};

/// Bytes of entropy in [`random_token`].
const TOKEN_BYTES: usize = 32;

/// Cost parameters for new hashes. Existing hashes carry their own.
#[derive(Debug, Clone, Copy)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    fn hasher(self) -> Result<Argon2<'static>, Error> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None).map_err(|e| Error::Internal {
            operation: format!("build argon2 params: {e}"),
        })?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl From<&PasswordConfig> for Argon2Params {
    fn from(config: &PasswordConfig) -> Self {
        Self {
            memory_kib: config.argon2_memory_kib,
            iterations: config.argon2_iterations,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// PHC-format hash of `secret` with a fresh salt.
pub fn hash_secret(secret: &str, params: Argon2Params) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = params.hasher()?.hash_password(secret.as_bytes(), &salt).map_err(|e| Error::Internal {
        operation: format!("hash secret: {e}"),
    })?;
    Ok(hash.to_string())
}

/// Check `secret` against a stored PHC hash. A hash that does not parse is an error, not a mismatch.
pub fn verify_secret(secret: &str, stored: &str) -> Result<bool, Error> {
    let parsed = PasswordHash::new(stored).map_err(|e| Error::Internal {
        operation: format!("parse stored hash: {e}"),
    })?;
    Ok(Argon2::default().verify_password(secret.as_bytes(), &parsed).is_ok())
}

/// Length rules for a new password, counted in characters.
pub fn validate_password(password: &str, config: &PasswordConfig) -> Result<(), Error> {
    let length = password.chars().count();
    let message = if length < config.min_length {
        format!("must be at least {} characters", config.min_length)
    } else if length > config.max_length {
        format!("must be no more than {} characters", config.max_length)
    } else {
        return Ok(());
    };

    Err(Error::Validation {
        fields: vec![FieldError::new("password", message)],
    })
}

async fn on_blocking_pool<T, F>(what: &str, work: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| Error::Internal {
        operation: format!("join {what} task: {e}"),
    })?
}

pub async fn hash_password(password: String, params: Argon2Params) -> Result<String, Error> {
    on_blocking_pool("password hashing", move || hash_secret(&password, params)).await
}

pub async fn verify_password(password: String, stored: String) -> Result<bool, Error> {
    on_blocking_pool("password verification", move || verify_secret(&password, &stored)).await
}

/// 256 random bits, base64url without padding. Used for session cookies and reset links.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rng().fill(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
