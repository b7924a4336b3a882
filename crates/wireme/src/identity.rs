// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to decode base64 key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("random source unavailable: {0}")]
    Entropy(String),
}

/// Key operations the core needs, kept behind a trait so tests can swap in
/// deterministic fakes.
pub trait Identity {
    /// Derive the base64 public key for a base64 private key.
    fn public_key(private_key: &str) -> Result<String, IdentityError>;

    /// Generate a fresh base64 private key.
    fn generate_private_key() -> Result<String, IdentityError>;

    /// Generate a fresh base64 pre-shared key.
    fn generate_preshared_key() -> Result<String, IdentityError>;
}

/// Curve25519 keys computed in-process.
pub struct X25519;

impl Identity for X25519 {
    fn public_key(private_key: &str) -> Result<String, IdentityError> {
        let secret = StaticSecret::from(decode_key(private_key)?);
        let public = PublicKey::from(&secret);
        Ok(BASE64.encode(public.as_bytes()))
    }

    fn generate_private_key() -> Result<String, IdentityError> {
        let secret = StaticSecret::from(random_bytes()?);
        Ok(BASE64.encode(secret.to_bytes()))
    }

    fn generate_preshared_key() -> Result<String, IdentityError> {
        Ok(BASE64.encode(random_bytes()?))
    }
}

fn random_bytes() -> Result<[u8; 32], IdentityError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| IdentityError::Entropy(e.to_string()))?;
    Ok(bytes)
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = BASE64.decode(b64.trim())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyLength(len))
}

/// First 8 hex characters of the SHA-256 of the key text. Only used to keep
/// saved filenames apart, not as a security boundary.
pub fn fingerprint(public_key: &str) -> String {
    if public_key.is_empty() {
        return "unknown".to_string();
    }
    let digest = Sha256::digest(public_key.as_bytes());
    hex::encode(digest)[..8].to_string()
}
