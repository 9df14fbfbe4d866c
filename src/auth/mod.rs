//! Authentication collaborator.
//!
//! The broker never issues or stores credentials. It only needs to turn an
//! opaque token presented on websocket upgrade into an authenticated
//! `(client_id, role)` pair. [`AuthVerifier`] is the seam a real deployment
//! swaps: a production system would have this call out to the login
//! service; this crate ships a self-contained JWT-backed implementation so
//! the broker is runnable standalone.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "PRODUCER",
            Role::Consumer => "CONSUMER",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: String,
    pub role: Role,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token is invalid or expired")]
    InvalidToken,
    #[error("token does not carry a usable role")]
    MissingRole,
}

/// External auth collaborator contract: `verify(token) -> {client_id, role}`.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

pub type SharedAuthVerifier = Arc<dyn AuthVerifier>;

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    /// authenticated client id
    sub: String,
    role: Role,
    exp: usize,
    iat: usize,
}

/// Reference `AuthVerifier` backed by HMAC-signed JWTs, matching how the
/// rest of this stack carries bearer material: a single shared secret,
/// default validation, no refresh handling (token refresh is out of scope
/// and lives with the login service, not here).
pub struct JwtAuthVerifier {
    decoding_key: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
}

impl JwtAuthVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: jsonwebtoken::DecodingKey::from_secret(
                secret.as_bytes(),
            ),
            validation: jsonwebtoken::Validation::default(),
        }
    }
}

impl AuthVerifier for JwtAuthVerifier {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let data = jsonwebtoken::decode::<JwtClaims>(
            token,
            &self.decoding_key,
            &self.validation,
        )
        .map_err(|_| AuthError::InvalidToken)?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::MissingRole);
        }

        Ok(AuthContext {
            client_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_for(
        secret: &str,
        sub: &str,
        role: Role,
        exp_offset_secs: i64,
    ) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as usize;
        let claims = JwtClaims {
            sub: sub.into(),
            role,
            iat: now,
            exp: (now as i64 + exp_offset_secs) as usize,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let verifier = JwtAuthVerifier::new("test-secret");
        let token = token_for("test-secret", "kiosk-1", Role::Producer, 3600);
        let ctx = verifier.verify(&token).unwrap();
        assert_eq!(ctx.client_id, "kiosk-1");
        assert_eq!(ctx.role, Role::Producer);
    }

    #[test]
    fn expired_token_rejected() {
        let verifier = JwtAuthVerifier::new("test-secret");
        let token = token_for("test-secret", "kiosk-1", Role::Producer, -10);
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn tampered_signature_rejected() {
        let verifier = JwtAuthVerifier::new("test-secret");
        let token = token_for("other-secret", "kiosk-1", Role::Producer, 3600);
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidToken)
        ));
    }
}
