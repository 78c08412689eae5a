//! Join credentials and signed session payloads.
//!
//! A join token binds a topic to the time it was issued:
//!
//! ```text
//! <issued_at unix secs>.<hex blake3 keyed hash of "topic|issued_at">
//! ```
//!
//! A session payload is the JSON object hex-encoded, followed by its MAC.
//! Tokens and sessions use different keys derived from the same secret, so
//! one can never be replayed as the other.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;

/// Environment variable that overrides the configured secret.
pub const SECRET_ENV: &str = "LUMEN_SECRET";

const TOKEN_CONTEXT: &str = "lumen 2024 join token";
const SESSION_CONTEXT: &str = "lumen 2024 session payload";

/// Tokens issued slightly in the future are accepted up to this skew.
const CLOCK_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential is malformed")]
    Malformed,

    #[error("credential signature does not match")]
    BadSignature,

    #[error("credential expired {age}s after issue (max {max_age}s)")]
    Expired { age: u64, max_age: u64 },

    #[error("session payload is not a JSON object")]
    InvalidSession,
}

/// Pick the signing secret: environment, then config, then a random one.
pub fn resolve_secret(configured: Option<&str>) -> String {
    if let Ok(secret) = std::env::var(SECRET_ENV)
        && !secret.is_empty()
    {
        return secret;
    }
    if let Some(secret) = configured.filter(|s| !s.is_empty()) {
        return secret.to_string();
    }
    crate::warn!("auth"; "no secret configured; tokens will not survive a restart");
    uuid::Uuid::new_v4().simple().to_string()
}

/// Signs and checks credentials with one secret.
#[derive(Clone)]
pub struct Signer {
    token_key: [u8; 32],
    session_key: [u8; 32],
    max_age: Duration,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: &str, max_age: Duration) -> Self {
        Self {
            token_key: blake3::derive_key(TOKEN_CONTEXT, secret.as_bytes()),
            session_key: blake3::derive_key(SESSION_CONTEXT, secret.as_bytes()),
            max_age,
        }
    }

    pub fn issue_token(&self, topic: &str) -> String {
        self.issue_token_at(topic, unix_now())
    }

    pub fn issue_token_at(&self, topic: &str, issued_at: u64) -> String {
        let mac = self.token_mac(topic, issued_at);
        format!("{issued_at}.{}", mac.to_hex())
    }

    pub fn validate_token(&self, token: &str, topic: &str) -> Result<(), AuthError> {
        self.validate_token_at(token, topic, unix_now())
    }

    pub fn validate_token_at(&self, token: &str, topic: &str, now: u64) -> Result<(), AuthError> {
        let (issued_at, mac) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let issued_at: u64 = issued_at.parse().map_err(|_| AuthError::Malformed)?;
        let mac = blake3::Hash::from_hex(mac).map_err(|_| AuthError::Malformed)?;

        // blake3::Hash equality is constant time.
        if mac != self.token_mac(topic, issued_at) {
            return Err(AuthError::BadSignature);
        }
        if issued_at > now + CLOCK_SKEW.as_secs() {
            return Err(AuthError::Malformed);
        }
        let age = now.saturating_sub(issued_at);
        if age > self.max_age.as_secs() {
            return Err(AuthError::Expired {
                age,
                max_age: self.max_age.as_secs(),
            });
        }
        Ok(())
    }

    fn token_mac(&self, topic: &str, issued_at: u64) -> blake3::Hash {
        blake3::keyed_hash(&self.token_key, format!("{topic}|{issued_at}").as_bytes())
    }

    pub fn sign_session(&self, session: &Map<String, Value>) -> String {
        let body = Value::Object(session.clone()).to_string();
        let mac = blake3::keyed_hash(&self.session_key, body.as_bytes());
        format!("{}.{}", hex::encode(body), mac.to_hex())
    }

    pub fn verify_session(&self, signed: &str) -> Result<Map<String, Value>, AuthError> {
        let (body, mac) = signed.split_once('.').ok_or(AuthError::Malformed)?;
        let body = hex::decode(body).map_err(|_| AuthError::Malformed)?;
        let mac = blake3::Hash::from_hex(mac).map_err(|_| AuthError::Malformed)?;
        if mac != blake3::keyed_hash(&self.session_key, &body) {
            return Err(AuthError::BadSignature);
        }
        match serde_json::from_slice(&body) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(AuthError::InvalidSession),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ============================================================================
// Tests
// ============================================================================
