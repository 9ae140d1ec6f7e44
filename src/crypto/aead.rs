//! AEAD record encryption
//!
//! Each record is sealed with XChaCha20-Poly1305 under a per-record nonce
//! of the form `counter_le_u64 || random_u128`. The counter guarantees the
//! sender never reuses a nonce within a session; the 128 random bits make
//! reuse require both counter rollover and a random collision.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

/// Record cipher for one direction of a tunnel.
///
/// The sender owns its counter; the receiver verifies nothing beyond AEAD
/// integrity, so both halves of a tunnel can hold independent clones.
#[derive(Clone)]
pub struct RecordCipher {
    aead: XChaCha20Poly1305,
    counter: u64,
}

impl RecordCipher {
    /// Create a cipher from a 32-byte shared key
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        })
    }

    /// Encrypt a plaintext record, emitting `nonce || ciphertext || tag`.
    ///
    /// The nonce travels in the clear, which is standard for
    /// XChaCha20-Poly1305.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        random_bytes(&mut nonce[8..]);

        let ciphertext = self
            .aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Verify and decrypt a record produced by [`seal`](Self::seal).
    ///
    /// Failure is fatal for the owning tunnel; no plaintext ever surfaces.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < NONCE_LEN {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);

        self.aead
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Decryption)
    }

    /// Current nonce counter value
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_LEN;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = RecordCipher::new(&key).unwrap();
        let opener = RecordCipher::new(&key).unwrap();

        let plaintext = b"Hello, XP Tunnel!";
        let wire = sealer.seal(plaintext).unwrap();
        let recovered = opener.open(&wire).unwrap();

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_wire_length() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = RecordCipher::new(&key).unwrap();

        let plaintext = [0u8; 100];
        let wire = sealer.seal(&plaintext).unwrap();
        assert_eq!(wire.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
    }

    #[test]
    fn test_nonce_counter_monotonic() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = RecordCipher::new(&key).unwrap();

        let wire1 = sealer.seal(b"one").unwrap();
        let wire2 = sealer.seal(b"two").unwrap();

        let c1 = u64::from_le_bytes(wire1[..8].try_into().unwrap());
        let c2 = u64::from_le_bytes(wire2[..8].try_into().unwrap());
        assert_eq!(c1, 0);
        assert_eq!(c2, c1 + 1);
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = RecordCipher::new(&key).unwrap();
        let opener = RecordCipher::new(&key).unwrap();

        let mut wire = sealer.seal(b"payload").unwrap();

        // A single bit flip anywhere in nonce or ciphertext must fail
        for i in 0..wire.len() {
            wire[i] ^= 0x01;
            assert!(opener.open(&wire).is_err(), "flip at byte {i} accepted");
            wire[i] ^= 0x01;
        }
        assert!(opener.open(&wire).is_ok());
    }

    #[test]
    fn test_short_wire_rejected() {
        let key = [0x42u8; KEY_LEN];
        let opener = RecordCipher::new(&key).unwrap();
        assert!(matches!(
            opener.open(&[0u8; 10]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut sealer = RecordCipher::new(&[0x42u8; KEY_LEN]).unwrap();
        let opener = RecordCipher::new(&[0x43u8; KEY_LEN]).unwrap();

        let wire = sealer.seal(b"payload").unwrap();
        assert!(opener.open(&wire).is_err());
    }
}
