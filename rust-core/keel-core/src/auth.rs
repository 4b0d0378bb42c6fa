//! # Authentication
//!
//! HS256 bearer tokens. [`JwtGuard`] issues and verifies tokens; the
//! `auth` middleware stores verified claims on the request.

use crate::error::{abort, Error, Result};
use crate::request::Request;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use std::time::Duration;

/// Default token lifetime
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// JWT issuer and verifier sharing one secret
#[derive(Clone)]
pub struct JwtGuard {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for JwtGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtGuard")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JwtGuard {
    /// Create a guard from a shared secret
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl: DEFAULT_TTL,
        }
    }

    /// Set the lifetime of issued tokens
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a token for `subject`
    ///
    /// Fields of `extra` (when it is an object) are added to the claims;
    /// `sub`, `iat` and `exp` are always set by the guard.
    ///
    /// # Errors
    ///
    /// Returns a 500 error if the token cannot be signed.
    pub fn issue(&self, subject: impl Into<String>, extra: &Value) -> Result<String> {
        let mut claims = extra.as_object().cloned().unwrap_or_else(Map::new);
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        claims.insert("sub".to_string(), Value::String(subject.into()));
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert("exp".to_string(), Value::from(now.saturating_add(ttl)));
        self.sign(&Value::Object(claims))
    }

    /// Sign claims as they are
    ///
    /// # Errors
    ///
    /// Returns a 500 error if the token cannot be signed.
    pub fn sign(&self, claims: &Value) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to sign token");
            abort(500, "Failed to sign token")
        })
    }

    /// Verify a token and return its claims
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` for a malformed, forged or expired token.
    pub fn verify(&self, token: &str) -> Result<Value> {
        decode::<Value>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::warn!(error = %e, "JWT validation failed");
                Error::Unauthorized {
                    message: "Invalid or expired token".to_string(),
                }
            })
    }

    /// Verify the bearer token of a request
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` if the header is missing or the token
    /// does not verify.
    pub fn authenticate(&self, request: &Request) -> Result<Value> {
        let token = bearer_token(request).ok_or_else(|| Error::Unauthorized {
            message: "Missing or invalid Authorization header".to_string(),
        })?;
        self.verify(token)
    }
}

/// Token from an `Authorization: Bearer <token>` header
#[must_use]
pub fn bearer_token(request: &Request) -> Option<&str> {
    request
        .header("authorization")
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
