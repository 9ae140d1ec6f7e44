//! Cryptographic primitives for XP Tunnel
//!
//! This module provides:
//! - XChaCha20-Poly1305 AEAD record encryption
//! - HKDF-SHA256 key derivation for password provisioning
//! - Shared-key handling (generation, base64 encoding)
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::RecordCipher;
pub use kdf::{derive_key, KDF_INFO};

use thiserror::Error;

/// Length of the symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the XChaCha20-Poly1305 nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key must be {KEY_LEN} bytes")]
    InvalidKeyLength,

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("invalid base64 key: {0}")]
    InvalidKeyEncoding(String),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(buf);
}

/// Generate a fresh 32-byte shared key
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    random_bytes(&mut key);
    key
}

/// Encode a key as standard base64 for configuration files
pub fn key_to_base64(key: &[u8; KEY_LEN]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Decode a base64 key from configuration, enforcing the key length
pub fn key_from_base64(s: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_key_base64_roundtrip() {
        let key = generate_key();
        let encoded = key_to_base64(&key);
        let decoded = key_from_base64(&encoded).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_key_base64_rejects_short() {
        use base64::Engine;
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(matches!(
            key_from_base64(&short),
            Err(CryptoError::InvalidKeyLength)
        ));
    }
}
