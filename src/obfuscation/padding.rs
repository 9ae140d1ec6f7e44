//! Length-hiding record padding
//!
//! Each framed payload carries a 2-byte big-endian length prefix followed
//! by the payload and a random trailer. The receiver needs no state: the
//! prefix alone recovers the payload, and the trailer is discarded.

use crate::crypto::random_bytes;
use rand::rngs::OsRng;
use rand::Rng;

/// Padding configuration
#[derive(Debug, Clone, Copy)]
pub struct PaddingConfig {
    /// Append a random trailer to every record
    pub enabled: bool,
    /// Minimum trailer length in bytes
    pub min_pad: usize,
    /// Maximum trailer length in bytes
    pub max_pad: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_pad: 16,
            max_pad: 256,
        }
    }
}

impl PaddingConfig {
    /// Padding off: records carry only the length prefix
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Pads and unpads framed payloads
#[derive(Debug, Clone)]
pub struct Padder {
    config: PaddingConfig,
}

impl Padder {
    pub fn new(config: PaddingConfig) -> Self {
        Self { config }
    }

    /// Frame a payload: `u16be(len) || payload || random trailer`.
    ///
    /// The declared length always references the real payload.
    pub fn pad(&self, data: &[u8]) -> Vec<u8> {
        let pad_len = if self.config.enabled {
            OsRng.gen_range(self.config.min_pad..=self.config.max_pad)
        } else {
            0
        };

        let mut framed = Vec::with_capacity(2 + data.len() + pad_len);
        framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
        framed.extend_from_slice(data);
        if pad_len > 0 {
            let start = framed.len();
            framed.resize(start + pad_len, 0);
            random_bytes(&mut framed[start..]);
        }
        framed
    }

    /// Recover the payload from a framed buffer.
    ///
    /// Buffers shorter than the prefix pass through unchanged, and a
    /// declared length longer than the remainder yields the full remainder:
    /// unpadding never shrinks the payload below what the sender framed.
    pub fn unpad<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        if data.len() < 2 {
            return data;
        }
        let declared = u16::from_be_bytes([data[0], data[1]]) as usize;
        if declared > data.len() - 2 {
            return &data[2..];
        }
        &data[2..2 + declared]
    }
}

impl Default for Padder {
    fn default() -> Self {
        Self::new(PaddingConfig::default())
    }
}
