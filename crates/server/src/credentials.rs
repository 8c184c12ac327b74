//! Access and refresh credential minting.
//!
//! Access tokens are compact HS256 JWTs; refresh tokens are opaque random
//! strings whose binding to a user lives in the refresh-token store.

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AuthConfig, MIN_JWT_SECRET_LEN};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    iat: i64,
    nbf: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8], access_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            access_ttl,
        }
    }

    /// Build a signer from configuration. Returns `true` alongside the signer
    /// when no secret was configured and an ephemeral one was generated.
    pub fn from_config(config: &AuthConfig) -> Result<(Self, bool)> {
        match config.jwt_secret.as_deref() {
            Some(secret) => {
                if secret.len() < MIN_JWT_SECRET_LEN {
                    bail!("auth.jwt_secret must be at least {MIN_JWT_SECRET_LEN} bytes");
                }
                Ok((Self::new(secret.as_bytes(), config.access_ttl()), false))
            }
            None => {
                let secret: [u8; 32] = rand::random();
                Ok((Self::new(&secret, config.access_ttl()), true))
            }
        }
    }

    pub fn issue_access(&self, user_id: Uuid) -> Result<String, TokenError> {
        let issued_at = Utc::now().timestamp();
        let ttl = i64::try_from(self.access_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = AccessClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            nbf: issued_at,
            exp: issued_at.saturating_add(ttl),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Signing)
    }

    pub fn issue_refresh(&self) -> String {
        parley_crypto::generate_refresh_token()
    }

    /// Verify signature and lifetime, returning the embedded user id.
    ///
    /// Only HS256 is accepted. Zero clock skew: a token whose expiry equals
    /// the current second is already expired.
    pub fn validate_access(&self, token: &str) -> Result<Uuid, TokenError> {
        let data = decode::<AccessClaims>(token, &self.decoding, &self.validation).map_err(
            |err| match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            },
        )?;

        if data.claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Uuid::parse_str(&data.claims.sub).map_err(|_| TokenError::Invalid)
    }
}
