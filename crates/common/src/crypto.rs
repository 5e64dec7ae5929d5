//! Key and token helpers for netmesh
//!
//! WireGuard keys are x25519 keys in standard base64. Bearer tokens
//! (enrollment, captive portal, sessions) are random hex strings; only their
//! SHA-256 digest is ever persisted.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length in bytes of generated bearer tokens
pub const TOKEN_BYTES: usize = 32;

/// WireGuard keypair, both halves base64 encoded
#[derive(Clone, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl WgKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut private_key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key_bytes);

        // WireGuard key clamping
        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        let secret = StaticSecret::from(private_key_bytes);
        let public = PublicKey::from(&secret);

        Self {
            private_key: STANDARD.encode(private_key_bytes),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }
}

/// Check that `key` is a base64 encoded 32 byte x25519 public key
pub fn validate_public_key(key: &str) -> Result<()> {
    let bytes = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::validation(format!("public key is not valid base64: {}", e)))?;
    if bytes.len() != 32 {
        return Err(Error::validation(format!(
            "public key must be 32 bytes (got {})",
            bytes.len()
        )));
    }
    Ok(())
}

/// Random bearer token as lowercase hex
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of a token, hex encoded. This is the form stored and looked up.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two secrets without short-circuiting on the first mismatch
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        v |= x ^ y;
    }
    v == 0
}

/// Check a presented bearer token against the configured one.
/// Digests are compared so the secret's length does not matter.
pub fn verify_token(presented: &str, expected: &str) -> bool {
    constant_time_eq(&hash_token(presented), &hash_token(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));

        assert!(verify_token("admin-secret", "admin-secret"));
        assert!(!verify_token("admin-secreT", "admin-secret"));
        assert!(!verify_token("", "admin-secret"));
    }

    #[test]
    fn test_keypair_generation() {
        let kp = WgKeyPair::generate();
        assert_eq!(kp.private_key.len(), 44);
        assert_eq!(kp.public_key.len(), 44);
        assert!(validate_public_key(&kp.public_key).is_ok());
        assert_ne!(kp.public_key, WgKeyPair::generate().public_key);
        assert!(!format!("{:?}", kp).contains(&kp.private_key));
    }

    #[test]
    fn test_public_key_validation() {
        assert!(validate_public_key("not base64!").is_err());
        assert!(validate_public_key(&STANDARD.encode([0u8; 16])).is_err());
        assert!(validate_public_key(&STANDARD.encode([7u8; 32])).is_ok());
    }

    #[test]
    fn test_tokens() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert_ne!(token, generate_token());

        let hash = hash_token(&token);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token(&token));
        assert_ne!(hash, hash_token("other"));
    }
}
