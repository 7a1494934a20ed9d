//! # JWT Service
//!
//! Bearer-token validation for the match core. Token issuance lives in the
//! external auth service; the core only needs to mint short-lived access
//! tokens (for tooling and tests) and to verify the tokens it receives on
//! the control API and the match channel.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Expiration time for access tokens.
const ACCESS_TOKEN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors that can occur during JWT operations
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Token encoding failed: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
}

/// JWT claims structure for access tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as string)
    pub sub: String,
    /// Expiration timestamp (Unix epoch)
    pub exp: u64,
    /// Issued at timestamp (Unix epoch)
    pub iat: u64,
}

/// Service for signing and verifying access tokens.
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(encoding_key: EncodingKey, decoding_key: DecodingKey) -> Self {
        Self {
            encoding_key,
            decoding_key,
        }
    }

    /// Convenience constructor from a shared HS256 secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self::new(
            EncodingKey::from_secret(secret),
            DecodingKey::from_secret(secret),
        )
    }

    /// Creates a signed access token for the user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn create_access_token(&self, user_id: Uuid) -> Result<String, JwtError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time should not be before UNIX EPOCH")
            .as_secs();

        let claims = Claims {
            sub: user_id.as_simple().to_string(),
            exp: now + ACCESS_TOKEN_EXPIRY.as_secs(),
            iat: now,
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)?;
        debug!("Access token created");
        Ok(token)
    }

    /// Validates an access token and returns its claims.
    ///
    /// Verifies the signature and expiration; no database lookups.
    #[instrument(skip(self, token), fields(token_length = token.len()))]
    pub fn validate_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        match decode::<Claims>(token, &self.decoding_key, &Validation::default()) {
            Ok(token_data) => {
                debug!(user_id = %token_data.claims.sub, "Access token validated");
                Ok(token_data.claims)
            }
            Err(e) if e.kind() == &jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                warn!("Access token expired");
                Err(JwtError::TokenExpired)
            }
            Err(e) => {
                warn!(error = %e, "Invalid access token");
                Err(JwtError::InvalidToken)
            }
        }
    }
}
