//! Timing obfuscation to defeat traffic analysis
//!
//! Censors fingerprint proxy traffic by inter-packet timing: tunnel writes
//! arrive back-to-back while real browsing is bursty. Before every record
//! write we sample a delay from a three-class mixture shaped like HTTP
//! request spacing.

use rand::rngs::OsRng;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Timing obfuscation configuration
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// Enable inter-write jitter
    pub enabled: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl TimingConfig {
    /// No jitter (for tests and latency-sensitive paths)
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Injects HTTP-browsing-like delays before tunnel writes
#[derive(Debug, Clone)]
pub struct TimingObfuscator {
    config: TimingConfig,
}

impl TimingObfuscator {
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    /// Sleep for one sampled inter-write delay.
    ///
    /// Classes: common 70% (1-20 ms), medium 20% (50-200 ms),
    /// rare 10% (200-500 ms). No-op when disabled.
    pub async fn jitter(&self) {
        if !self.config.enabled {
            return;
        }
        sleep(Self::sample()).await;
    }

    fn sample() -> Duration {
        let class: u32 = OsRng.gen_range(0..100);
        let millis = match class {
            0..=69 => OsRng.gen_range(1..=20),
            70..=89 => OsRng.gen_range(50..=200),
            _ => OsRng.gen_range(200..=500),
        };
        Duration::from_millis(millis)
    }
}

impl Default for TimingObfuscator {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}
