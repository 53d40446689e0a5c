//! Credential verification and bearer tokens.
//!
//! Passwords are stored as salted SHA-256 digests and checked with a
//! constant-time compare. Tokens are self-validating HS256 JWTs carrying the
//! principal and an absolute expiry, so the server keeps no session state.
//!
//! Every failure in this module collapses to [`AuthError::InvalidCredentials`]
//! before it reaches a caller: the API never distinguishes an unknown user
//! from a wrong password or a bad token.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::{Service, config::AuthSettings, error::ApiError};

/// Tolerated clock skew, in seconds, for future-dated `iat` claims minted by
/// peers with drifting clocks. Expiry itself is checked exactly.
const CLOCK_SKEW_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        ApiError::Auth
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

struct StoredCredential {
    salt: String,
    digest: [u8; 32],
}

/// In-memory username → salted-digest map.
#[derive(Default)]
pub struct CredentialStore {
    users: HashMap<String, StoredCredential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, username: &str, password: &str) {
        let salt = Uuid::new_v4().to_string();
        let digest = salted_digest(&salt, password);
        self.users.insert(username.to_string(), StoredCredential { salt, digest });
    }

    /// Check a password. Unknown users burn the same hash work as known ones
    /// so lookups are not distinguishable by timing.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        static NO_SUCH_USER_SALT: &str = "no-such-user";
        match self.users.get(username) {
            Some(stored) => {
                constant_time_eq(&salted_digest(&stored.salt, password), &stored.digest)
            }
            None => {
                let _ = salted_digest(NO_SUCH_USER_SALT, password);
                false
            }
        }
    }
}

fn salted_digest(salt: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Issues and verifies bearer tokens against the credential store.
pub struct Authenticator {
    credentials: CredentialStore,
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiration_minutes: i64,
}

impl Authenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        let mut credentials = CredentialStore::new();
        credentials.add_user(&settings.demo_user, &settings.demo_password);
        Self::with_credentials(settings, credentials)
    }

    pub fn with_credentials(settings: &AuthSettings, credentials: CredentialStore) -> Self {
        Self {
            credentials,
            encoding: EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
            expiration_minutes: settings.jwt_expiration_minutes,
        }
    }

    /// Verify the credential pair and mint a signed token for the principal.
    pub fn issue(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if !self.credentials.verify(username, password) {
            return Err(AuthError::InvalidCredentials);
        }
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: username.to_string(),
            exp: now + self.expiration_minutes * 60,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| AuthError::InvalidCredentials)
    }

    /// Validate signature and expiry; return the embedded principal.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked exactly below; a zero-minute token is invalid
        // the moment it is issued.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["sub", "exp"]);

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::InvalidCredentials)?;

        let now = Utc::now().timestamp();
        if now >= data.claims.exp {
            return Err(AuthError::InvalidCredentials);
        }
        if data.claims.iat > now + CLOCK_SKEW_LEEWAY_SECS {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(data.claims.sub)
    }
}

/// The authenticated identity, extracted from the `Authorization: Bearer`
/// header. Handlers that take this parameter require a valid token.
#[derive(Debug, Clone)]
pub struct AuthPrincipal(pub String);

impl FromRequestParts<Arc<Service>> for AuthPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<Service>,
    ) -> Result<Self, Self::Rejection> {
        let authenticator = state.authenticator.clone();
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Auth)?;
        let principal = authenticator.verify(token)?;
        Ok(AuthPrincipal(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(minutes: i64) -> Authenticator {
        let settings = AuthSettings {
            jwt_secret: "test-secret".to_string(),
            jwt_expiration_minutes: minutes,
            ..AuthSettings::default()
        };
        Authenticator::new(&settings)
    }

    #[test]
    fn issue_then_verify_round_trips() {
        let auth = authority(30);
        let token = auth.issue("demo", "demo-password").expect("issue");
        assert_eq!(auth.verify(&token).expect("verify"), "demo");
    }

    #[test]
    fn wrong_password_and_unknown_user_look_identical() {
        let auth = authority(30);
        let wrong = auth.issue("demo", "nope").unwrap_err();
        let unknown = auth.issue("nobody", "nope").unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[test]
    fn zero_minute_token_is_expired_at_issuance() {
        let auth = authority(0);
        let token = auth.issue("demo", "demo-password").expect("issue");
        assert!(auth.verify(&token).is_err());
    }

    #[test]
    fn tampered_token_fails_verification() {
        let auth = authority(30);
        let token = auth.issue("demo", "demo-password").expect("issue");
        let mut tampered = token.clone();
        // Flip a character in the signature segment.
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });
        assert!(auth.verify(&tampered).is_err());
    }

    #[test]
    fn token_signed_with_other_secret_fails() {
        let auth = authority(30);
        let other = Authenticator::new(&AuthSettings {
            jwt_secret: "different-secret".to_string(),
            ..AuthSettings::default()
        });
        let token = other.issue("demo", "demo-password").expect("issue");
        assert!(auth.verify(&token).is_err());
    }

    #[test]
    fn credential_store_verifies_salted_digests() {
        let mut store = CredentialStore::new();
        store.add_user("alice", "s3cret");
        assert!(store.verify("alice", "s3cret"));
        assert!(!store.verify("alice", "s3cret "));
        assert!(!store.verify("bob", "s3cret"));
    }
}
