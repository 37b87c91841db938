//! Bearer credential verification
//!
//! Verifies HMAC-signed JWTs with a pre-shared secret and extracts the
//! identity claims forwarded to backends. The verifier holds only immutable
//! state and is shared across request tasks without locking.

use crate::config::TokenConfig;
use crate::error::{GatewayError, VerificationError, VerificationFailure};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

pub const CLAIM_USER_ID: &str = "user_id";
pub const CLAIM_USERNAME: &str = "username";
pub const CLAIM_DISPLAY_NAME: &str = "nickname";

// =============================================================================
// IDENTITY CLAIMS
// =============================================================================

/// Identity extracted from a verified credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject id (forwarded as a decimal string)
    pub user_id: i64,

    pub username: String,

    /// Optional display name
    pub display_name: Option<String>,
}

/// Claims as they appear on the wire; everything is optional so a missing
/// claim is reported as such rather than as a JSON error
#[derive(Debug, Deserialize)]
struct WireClaims {
    #[serde(default)]
    user_id: Option<serde_json::Value>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

impl TryFrom<WireClaims> for IdentityClaims {
    type Error = VerificationError;

    fn try_from(wire: WireClaims) -> Result<Self, Self::Error> {
        let user_id = match wire.user_id {
            None | Some(serde_json::Value::Null) => {
                return Err(VerificationError::new(VerificationFailure::MissingClaim(CLAIM_USER_ID)))
            }
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            // Some issuers encode large ids as strings
            Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
            Some(_) => None,
        }
        .ok_or_else(|| VerificationError::new(VerificationFailure::InvalidClaim(CLAIM_USER_ID)))?;

        let username = wire
            .username
            .ok_or_else(|| VerificationError::new(VerificationFailure::MissingClaim(CLAIM_USERNAME)))?;

        Ok(Self {
            user_id,
            username,
            display_name: wire.nickname,
        })
    }
}

// =============================================================================
// VERIFIER
// =============================================================================

/// Credential verification contract
pub trait CredentialVerifier: Send + Sync {
    /// Verify a bearer credential and extract its identity claims.
    ///
    /// # Errors
    ///
    /// Any failure (malformed, bad signature, expired, missing claim) yields
    /// the same opaque [`VerificationError`].
    fn verify(&self, token: &str) -> Result<IdentityClaims, VerificationError>;
}

/// HMAC JWT verifier configured once at startup
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Build a verifier from token configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] for an empty secret or a
    /// non-HMAC algorithm.
    pub fn new(config: &TokenConfig) -> Result<Self, GatewayError> {
        let secret = config.secret.expose_secret();
        if secret.is_empty() {
            return Err(GatewayError::InvalidConfig("token secret must not be empty".to_string()));
        }

        let algorithm = Algorithm::from_str(&config.algorithm)
            .ok()
            .filter(|alg| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
            .ok_or_else(|| {
                GatewayError::InvalidConfig(format!("unsupported token algorithm '{}'", config.algorithm))
            })?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway_seconds;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.required_spec_claims = if config.require_expiry {
            HashSet::from(["exp".to_string()])
        } else {
            HashSet::new()
        };
        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<IdentityClaims, VerificationError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(VerificationError::new(VerificationFailure::Malformed));
        }

        let data = decode::<WireClaims>(token, &self.key, &self.validation)?;
        IdentityClaims::try_from(data.claims)
    }
}
