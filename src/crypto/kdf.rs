//! Key derivation
//!
//! HKDF-SHA256 for deriving a tunnel key from a password. Current
//! deployments supply raw 32-byte keys; this exists for password-based
//! provisioning.

use super::{CryptoError, KEY_LEN};
use hkdf::Hkdf;
use sha2::Sha256;

/// Domain-separation label for tunnel key derivation
pub const KDF_INFO: &[u8] = b"xp-proto-v1";

/// Derive a 32-byte tunnel key from a password and salt
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut key = [0u8; KEY_LEN];
    hk.expand(KDF_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let k1 = derive_key("hunter2", b"salt").unwrap();
        let k2 = derive_key("hunter2", b"salt").unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_derive_salt_sensitive() {
        let k1 = derive_key("hunter2", b"salt-a").unwrap();
        let k2 = derive_key("hunter2", b"salt-b").unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_derive_password_sensitive() {
        let k1 = derive_key("hunter2", b"salt").unwrap();
        let k2 = derive_key("hunter3", b"salt").unwrap();
        assert_ne!(k1, k2);
    }
}
