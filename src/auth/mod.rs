//! Bearer token identity.
//!
//! Tokens are HS256-signed JWTs carrying subject, display name, and roles.
//! The signing algorithm is pinned: a token presenting any other `alg` fails
//! verification, which closes the classic algorithm-confusion hole.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default token issuer.
pub const DEFAULT_ISSUER: &str = "gadgetd";

/// Claims carried by every identity token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Display name.
    pub username: String,
    /// Role names, possibly empty.
    pub roles: Vec<String>,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    Missing,
    #[error("invalid token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued by unknown issuer")]
    WrongIssuer,
    #[error("failed to sign token")]
    Signing,
}

/// Mints and verifies identity tokens with a single symmetric secret.
pub struct TokenManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    issuer: String,
}

impl TokenManager {
    pub fn new(secret: &str, ttl: Duration, issuer: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            issuer: issuer.into(),
        }
    }

    /// Mint a token for a user. Validity starts now and runs for the
    /// configured TTL.
    pub fn mint(
        &self,
        user_id: &str,
        username: &str,
        roles: Vec<String>,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            roles,
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AuthError::Signing)
    }

    /// Verify a token and return its claims.
    ///
    /// Only HS256 is accepted; issuer, signature, not-before, and expiry are
    /// all enforced with zero leeway.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => Err(match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
                jsonwebtoken::errors::ErrorKind::InvalidSignature
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
                _ => AuthError::Malformed,
            }),
        }
    }

    /// Mint a fresh token carrying the same identity as a still-valid one.
    pub fn refresh(&self, token: &str) -> Result<String, AuthError> {
        let claims = self.verify(token)?;
        self.mint(&claims.sub, &claims.username, claims.roles)
    }
}

/// True iff `required` is empty or the user holds any of the required roles.
pub fn roles_match(user_roles: &[String], required: &[&str]) -> bool {
    required.is_empty() || user_roles.iter().any(|r| required.contains(&r.as_str()))
}

/// Pick the bearer value out of an `Authorization` header, falling back to a
/// `token` query parameter.
pub fn extract_token(auth_header: Option<&str>, query_token: Option<&str>) -> Option<String> {
    if let Some(header) = auth_header {
        if let Some(token) = header.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    query_token
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

/// Hex SHA-256 digest, used for password comparison in the login table.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
