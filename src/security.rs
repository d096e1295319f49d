// Token and credential service: password hashing, opaque tokens, and the
// HS256 bearer tokens used by operators and device agents.

use crate::error::ApiError;
use base64::Engine;
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// bcrypt truncates silently beyond this; reject instead.
pub const MAX_PASSWORD_BYTES: usize = 72;

/// Role claim carried by device access tokens.
pub const DEVICE_ROLE: &str = "DEVICE";

pub const AUTH_TOKEN_PURPOSE_SET_PASSWORD: &str = "set_password";
pub const AUTH_TOKEN_PURPOSE_RESET_PASSWORD: &str = "reset_password";

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("PASSWORD_TOO_LONG: password exceeds {MAX_PASSWORD_BYTES} bytes")]
    PasswordTooLong,

    #[error("TOKEN_EXPIRED: bearer token is expired")]
    TokenExpired,

    #[error("TOKEN_INVALID: bearer token could not be decoded")]
    TokenInvalid,

    #[error("hashing failure: {0}")]
    Hash(String),
}

impl From<SecurityError> for ApiError {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::PasswordTooLong => ApiError::Validation(e.to_string()),
            SecurityError::TokenExpired | SecurityError::TokenInvalid => {
                ApiError::Unauthorized(e.to_string())
            }
            SecurityError::Hash(msg) => ApiError::Internal(msg),
        }
    }
}

/// Hashes a password with bcrypt, rejecting inputs longer than 72 bytes.
pub fn hash_password(password: &str, cost: u32) -> Result<String, SecurityError> {
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(SecurityError::PasswordTooLong);
    }
    bcrypt::hash(password, cost).map_err(|e| SecurityError::Hash(e.to_string()))
}

/// Verifies a password against a stored bcrypt hash.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    if password.len() > MAX_PASSWORD_BYTES {
        return false;
    }
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

/// Generates an opaque random token (32 bytes, base64url encoded).
pub fn generate_token() -> String {
    let token_bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token_bytes)
}

/// SHA-256 digest of an opaque token, lowercase hex, for at-rest storage.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

/// Constant-time comparison of two token hashes.
pub fn token_hashes_match(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

/// Bearer token claims for both users and devices.
///
/// `role` is the user's global role, or `DEVICE` for agent tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

impl JwtClaims {
    pub fn is_device(&self) -> bool {
        self.role == DEVICE_ROLE
    }

    pub fn subject_id(&self) -> Result<Uuid, SecurityError> {
        Uuid::parse_str(&self.sub).map_err(|_| SecurityError::TokenInvalid)
    }
}

/// Signs and validates HS256 bearer tokens over the configured server secret.
#[derive(Clone)]
pub struct JwtCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCodec {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        validation.leeway = 10;

        JwtCodec {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mints a user access token carrying the global role.
    pub fn mint_user_token(
        &self,
        user_id: Uuid,
        role: &str,
        ttl_minutes: i64,
    ) -> Result<String, SecurityError> {
        self.mint(user_id, role, ttl_minutes)
    }

    /// Mints a device access token with `role = DEVICE`.
    pub fn mint_device_token(
        &self,
        device_id: Uuid,
        ttl_minutes: i64,
    ) -> Result<String, SecurityError> {
        self.mint(device_id, DEVICE_ROLE, ttl_minutes)
    }

    fn mint(&self, subject: Uuid, role: &str, ttl_minutes: i64) -> Result<String, SecurityError> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            sub: subject.to_string(),
            role: role.to_string(),
            iat: now,
            exp: now + ttl_minutes * 60,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| SecurityError::Hash(e.to_string()))
    }

    /// Decodes and validates a bearer token.
    pub fn validate(&self, token: &str) -> Result<JwtClaims, SecurityError> {
        decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                _ => SecurityError::TokenInvalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("hunter2", 4).unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn test_password_length_limit() {
        let at_limit = "a".repeat(MAX_PASSWORD_BYTES);
        assert!(hash_password(&at_limit, 4).is_ok());

        let over_limit = "a".repeat(MAX_PASSWORD_BYTES + 1);
        let err = hash_password(&over_limit, 4).unwrap_err();
        assert!(matches!(err, SecurityError::PasswordTooLong));
        assert!(err.to_string().contains("PASSWORD_TOO_LONG"));
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_generate_token_is_random_and_long() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 32 bytes -> 43 chars of unpadded base64url
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn test_token_hashes_match() {
        let hash = hash_token("secret");
        assert!(token_hashes_match(&hash, &hash_token("secret")));
        assert!(!token_hashes_match(&hash, &hash_token("other")));
    }

    #[test]
    fn test_jwt_roundtrip_user() {
        let codec = JwtCodec::new("test-secret");
        let user_id = Uuid::new_v4();
        let token = codec.mint_user_token(user_id, "ADMIN", 30).unwrap();

        let claims = codec.validate(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, "ADMIN");
        assert!(!claims.is_device());
        assert_eq!(claims.subject_id().unwrap(), user_id);
    }

    #[test]
    fn test_jwt_device_role() {
        let codec = JwtCodec::new("test-secret");
        let device_id = Uuid::new_v4();
        let token = codec.mint_device_token(device_id, 10).unwrap();

        let claims = codec.validate(&token).unwrap();
        assert!(claims.is_device());
    }

    #[test]
    fn test_jwt_rejects_wrong_secret() {
        let codec = JwtCodec::new("secret-a");
        let other = JwtCodec::new("secret-b");
        let token = codec.mint_user_token(Uuid::new_v4(), "VIEW", 30).unwrap();

        let err = other.validate(&token).unwrap_err();
        assert!(matches!(err, SecurityError::TokenInvalid));
    }

    #[test]
    fn test_jwt_rejects_expired() {
        let codec = JwtCodec::new("test-secret");
        // Minted already expired, beyond the 10s leeway.
        let token = codec.mint_user_token(Uuid::new_v4(), "VIEW", -5).unwrap();

        let err = codec.validate(&token).unwrap_err();
        assert!(matches!(err, SecurityError::TokenExpired));
    }
}
