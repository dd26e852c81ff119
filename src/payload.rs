//! What to send and when to send it.

use std::time::Duration;

use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};

/// Payload selection policy for a session's write loop.
#[derive(Clone, Debug)]
pub enum PayloadMode {
    /// The same literal message on every send.
    Fixed(String),
    /// A fresh alphanumeric string of `len` bytes per send.
    Random { len: usize },
}

/// Draws payloads per the configured mode. Each session owns one, so random
/// draws never contend on a shared generator.
pub struct PayloadSource {
    mode: PayloadMode,
    rng: StdRng,
}

impl PayloadSource {
    pub fn new(mode: PayloadMode) -> Self {
        Self {
            mode,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn next_payload(&mut self) -> String {
        match &self.mode {
            PayloadMode::Fixed(message) => message.clone(),
            PayloadMode::Random { len } => (&mut self.rng)
                .sample_iter(&Alphanumeric)
                .take(*len)
                .map(char::from)
                .collect(),
        }
    }
}

/// Gap between sends: a fixed interval, overridden by a target bitrate when
/// one is configured.
#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    interval: Duration,
    bitrate: Option<u64>,
}

impl Pacing {
    pub fn new(interval: Duration, bitrate: Option<u64>) -> Self {
        Self { interval, bitrate }
    }

    /// Sleep to insert after a send of `payload_len` bytes. A zero bitrate or
    /// zero-size payload falls back to the fixed interval.
    pub fn gap(&self, payload_len: usize) -> Duration {
        match self.bitrate {
            Some(bits_per_sec) if bits_per_sec > 0 && payload_len > 0 => {
                Duration::from_secs_f64(payload_len as f64 * 8.0 / bits_per_sec as f64)
            }
            _ => self.interval,
        }
    }
}
