//! Requester identity resolution from bearer tokens.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// A resolved requester identity (the username carried in the token).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requester(pub String);

impl Requester {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token has expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Invalid(err.to_string()),
        }
    }
}

/// Resolves a bearer token into a requester identity.
pub trait IdentityVerifier: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Requester, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// HS256 JWT verifier; the `sub` claim is the requester identity.
pub struct JwtIdentityVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str, token_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            token_ttl,
        }
    }

    /// Issue a token for `subject` valid for the configured lifetime.
    pub fn issue(&self, subject: &str) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.issue_with_expiry(subject, now, now + self.token_ttl.as_secs() as i64)
    }

    fn issue_with_expiry(&self, subject: &str, iat: i64, exp: i64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: subject.to_string(),
            exp,
            iat,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn resolve(&self, token: &str) -> Result<Requester, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(Requester(data.claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> JwtIdentityVerifier {
        JwtIdentityVerifier::new("test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn issued_token_resolves_to_subject() {
        let v = verifier();
        let token = v.issue("alice").unwrap();
        assert_eq!(v.resolve(&token).unwrap(), Requester("alice".into()));
    }

    #[test]
    fn expired_token_is_rejected() {
        let v = verifier();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let token = v.issue_with_expiry("alice", now - 7200, now - 3600).unwrap();
        assert!(matches!(v.resolve(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn foreign_signature_is_invalid() {
        let other = JwtIdentityVerifier::new("other-secret", Duration::from_secs(3600));
        let token = other.issue("mallory").unwrap();
        assert!(matches!(verifier().resolve(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            verifier().resolve("not-a-token"),
            Err(AuthError::Invalid(_))
        ));
    }
}
