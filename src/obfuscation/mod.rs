//! Traffic obfuscation layer
//!
//! Provides the three DPI countermeasures applied to tunnel traffic:
//!
//! 1. **Padding**: random trailers hide plaintext sizes from length analysis
//! 2. **Fragmentation**: the TLS ClientHello is split across many TCP
//!    segments so SNI filters cannot reassemble it cheaply
//! 3. **Timing jitter**: inter-write delays mimic HTTP browsing patterns

mod fragment;
mod padding;
mod timing;

pub use fragment::{Chunk, FragmentConfig, Fragmenter, FragmentingStream};
pub use padding::{Padder, PaddingConfig};
pub use timing::{TimingConfig, TimingObfuscator};

/// Obfuscation settings for one endpoint, assembled from configuration
#[derive(Debug, Clone)]
pub struct ObfuscationConfig {
    pub fragment: FragmentConfig,
    pub padding: PaddingConfig,
    pub timing: TimingConfig,
}

impl ObfuscationConfig {
    /// All features enabled with default tuning
    pub fn enabled() -> Self {
        Self {
            fragment: FragmentConfig::default(),
            padding: PaddingConfig::default(),
            timing: TimingConfig::default(),
        }
    }

    /// All features off (plain framing, no sleeps) for tests and
    /// latency-sensitive deployments
    pub fn disabled() -> Self {
        Self {
            fragment: FragmentConfig::disabled(),
            padding: PaddingConfig::disabled(),
            timing: TimingConfig::disabled(),
        }
    }

    /// Build from the per-endpoint feature flags
    pub fn from_flags(fragment: bool, padding: bool, timing_jitter: bool) -> Self {
        let mut cfg = Self::enabled();
        cfg.fragment.enabled = fragment;
        cfg.padding.enabled = padding;
        cfg.timing.enabled = timing_jitter;
        cfg
    }
}
