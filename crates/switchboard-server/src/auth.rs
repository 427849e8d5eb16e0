//! Handshake authentication.
//!
//! Clients pass a JWT in the `token` query parameter of the upgrade request.
//! The signature and `exp` are checked, plus `iss` and `aud` when
//! configured; the `sub` claim becomes the connection's user id.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::config::{AuthConfig, JwtAlgorithm};

/// Why a handshake token was rejected.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token, or an empty one.
    #[error("Missing token")]
    MissingToken,

    /// Bad signature, expired, wrong issuer or audience, or not a JWT.
    #[error("Invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    /// The token carries no usable `sub` claim.
    #[error("Token has no subject")]
    MissingSubject,

    /// The server's key material is unusable.
    #[error("Invalid auth configuration: {0}")]
    Config(String),
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

/// Validates handshake tokens.
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    /// Build a validator from the `[auth]` section.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if the secret is empty or the public key
    /// cannot be read.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let (key, algorithm) = match config.algorithm {
            JwtAlgorithm::Hs256 => {
                if config.secret.is_empty() {
                    return Err(AuthError::Config(
                        "auth.secret (or SWITCHBOARD_JWT_SECRET) must be set for hs256".to_string(),
                    ));
                }
                (DecodingKey::from_secret(config.secret.as_bytes()), Algorithm::HS256)
            }
            JwtAlgorithm::Rs256 => {
                let path = config.public_key_path.as_deref().ok_or_else(|| {
                    AuthError::Config("auth.public_key_path must be set for rs256".to_string())
                })?;
                let expanded = shellexpand::tilde(path);
                let pem = std::fs::read(expanded.as_ref())
                    .map_err(|e| AuthError::Config(format!("{path}: {e}")))?;
                let key = DecodingKey::from_rsa_pem(&pem)
                    .map_err(|e| AuthError::Config(format!("{path}: {e}")))?;
                (key, Algorithm::RS256)
            }
        };

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }

    /// Check a token and return the user id it names.
    ///
    /// # Errors
    ///
    /// Returns the reason the token was rejected.
    pub fn authenticate(&self, token: Option<&str>) -> Result<String, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        data.claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or(AuthError::MissingSubject)
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}
