//! Exponential backoff with jitter for reconnects and re-resolution.

use std::{fmt, time::Duration};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use wayfinder_types::config::BackoffConfig;

/// Stateful delay sequence: `initial`, `initial * multiplier`, ... capped at
/// `max`, each value spread by ±`jitter`.
pub struct ConnectionBackoff {
    config: BackoffConfig,
    delays: ExponentialBackoff,
    attempts: u32,
}

impl ConnectionBackoff {
    /// Creates a backoff sequence positioned at its first delay.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let delays = build(&config);
        Self { config, delays, attempts: 0 }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let base = self.delays.next().unwrap_or(self.config.max);
        apply_jitter(base, self.config.jitter)
    }

    /// Rewinds to the first delay.
    pub fn reset(&mut self) {
        self.delays = build(&self.config);
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl fmt::Debug for ConnectionBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBackoff")
            .field("config", &self.config)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

fn build(config: &BackoffConfig) -> ExponentialBackoff {
    ExponentialBuilder::new()
        .with_min_delay(config.initial)
        .with_max_delay(config.max)
        .with_factor(config.multiplier as f32)
        .with_max_times(usize::MAX)
        .build()
}

/// Spreads `dur` uniformly over `[dur * (1 - factor), dur * (1 + factor)]`.
pub(crate) fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rng.random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}
