//! Signed validation tokens.
//!
//! `GET /{key}/validate/jwt` returns the validation result plus an
//! Ed25519-signed JWT encoding it, so downstream services can verify a
//! license check offline against the published public key.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{SigningKey, VerifyingKey};
use jwt_simple::prelude::*;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Token lifetime. The token attests a point-in-time check, not the license
/// itself, so it stays short.
const TOKEN_TTL_SECS: u64 = 3600;

/// Claims embedded in a validation token. The license key appears only in
/// masked form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationClaims {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub license_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub checked_at: i64,
}

/// Generate a new Ed25519 key pair.
/// Returns (private_key_bytes, public_key_base64)
pub fn generate_keypair() -> (Vec<u8>, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    let private_bytes = signing_key.to_bytes().to_vec();
    let public_b64 = BASE64.encode(verifying_key.to_bytes());

    (private_bytes, public_b64)
}

/// Derive the base64 public key from a 32-byte private key.
pub fn public_key_from_private(private_key: &[u8]) -> Result<String> {
    let key_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| AppError::Internal("Invalid private key length".into()))?;
    let signing_key = SigningKey::from_bytes(&key_bytes);
    Ok(BASE64.encode(signing_key.verifying_key().to_bytes()))
}

/// Sign validation claims with an Ed25519 private key.
pub fn sign_validation_claims(
    claims: &ValidationClaims,
    private_key: &[u8],
    jti: &str,
) -> Result<String> {
    if private_key.len() != 32 {
        return Err(AppError::Internal("Invalid private key length".into()));
    }

    let key_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| AppError::Internal("Failed to convert key bytes".into()))?;

    let signing_key = SigningKey::from_bytes(&key_bytes);
    let key_pair = Ed25519KeyPair::from_bytes(&signing_key.to_keypair_bytes())
        .map_err(|e| AppError::Internal(format!("Failed to create key pair: {}", e)))?;

    let jwt_claims = Claims::with_custom_claims(claims.clone(), Duration::from_secs(TOKEN_TTL_SECS))
        .with_issuer("keywarden")
        .with_subject(&claims.license_key)
        .with_jwt_id(jti);

    key_pair
        .sign(jwt_claims)
        .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

/// Verify a validation token and extract its claims.
pub fn verify_validation_token(
    token: &str,
    public_key_b64: &str,
) -> Result<JWTClaims<ValidationClaims>> {
    let public_bytes = BASE64
        .decode(public_key_b64)
        .map_err(|e| AppError::Internal(format!("Invalid public key encoding: {}", e)))?;

    let key_bytes: [u8; 32] = public_bytes
        .as_slice()
        .try_into()
        .map_err(|_| AppError::Internal("Invalid public key length".into()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| AppError::Internal(format!("Invalid public key: {}", e)))?;

    let public_key = Ed25519PublicKey::from_bytes(&verifying_key.to_bytes())
        .map_err(|e| AppError::Internal(format!("Failed to create public key: {}", e)))?;

    public_key
        .verify_token::<ValidationClaims>(token, None)
        .map_err(|e| AppError::BadRequest(format!("Invalid token: {}", e)))
}
