//! Synthetic log sources.
//!
//! Each [`LogEmitter`] writes `name:value` lines into the pipeline's input channel
//! at its own cadence until shutdown. Values are drawn uniformly from a small
//! alphabet (`0..=value_max`), which is what makes stuck windows show up by
//! chance. Every emitter owns its RNG; given a seed, its output is reproducible.

use crate::shutdown::ShutdownListener;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Default inclusive upper bound of emitted values.
pub const DEFAULT_VALUE_MAX: i64 = 9;

/// Default pause between two lines of one emitter.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Seeded RNG wrapper for reproducible emitter output.
pub struct SeededRng {
    inner: ChaCha8Rng,
}

impl SeededRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let inner = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { inner }
    }

    /// true with probability `rate`.
    pub fn chance(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.gen::<f64>() < rate
    }

    /// Uniform sample from `range`.
    pub fn gen_range<T, R>(&mut self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.inner.gen_range(range)
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeededRng")
            .field("inner", &"<ChaCha8Rng>")
            .finish()
    }
}

/// One independent source of raw log lines.
#[derive(Debug)]
pub struct LogEmitter {
    name: String,
    interval: Duration,
    interval_jitter: Duration,
    value_max: i64,
    malformed_rate: f64,
    rng: SeededRng,
}

impl LogEmitter {
    /// Emitter named `name`; the same seed yields the same line sequence.
    pub fn new(name: impl Into<String>, seed: Option<u64>) -> Self {
        Self {
            name: name.into(),
            interval: DEFAULT_INTERVAL,
            interval_jitter: Duration::ZERO,
            value_max: DEFAULT_VALUE_MAX,
            malformed_rate: 0.0,
            rng: SeededRng::new(seed),
        }
    }

    /// Pause between two lines.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spread emitters out: the actual interval is drawn once from
    /// `[interval, interval + jitter)` when the emitter starts running.
    pub fn with_interval_jitter(mut self, jitter: Duration) -> Self {
        self.interval_jitter = jitter;
        self
    }

    /// Inclusive upper bound of emitted values. Negative bounds become zero.
    pub fn with_value_max(mut self, value_max: i64) -> Self {
        self.value_max = value_max.max(0);
        self
    }

    /// Probability of producing a line that fails the record grammar.
    pub fn with_malformed_rate(mut self, rate: f64) -> Self {
        self.malformed_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Key this emitter writes under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Produce the next raw line.
    pub fn next_line(&mut self) -> String {
        if self.rng.chance(self.malformed_rate) {
            return self.malformed_line();
        }
        let value = self.rng.gen_range(0..=self.value_max);
        format!("{}:{}", self.name, value)
    }

    fn malformed_line(&mut self) -> String {
        match self.rng.gen_range(0..3u8) {
            0 => self.name.clone(),
            1 => format!("{}:", self.name),
            _ => format!("{}={}", self.name, self.rng.gen_range(0..=self.value_max)),
        }
    }

    fn resolve_interval(&mut self) -> Duration {
        if self.interval_jitter.is_zero() {
            return self.interval;
        }
        let extra = self.rng.gen_range(0..self.interval_jitter.as_nanos() as u64);
        self.interval + Duration::from_nanos(extra)
    }

    /// Emit lines until shutdown or until the receiving side is gone.
    ///
    /// Returns the number of lines sent.
    pub async fn run(
        mut self,
        out: mpsc::UnboundedSender<String>,
        mut shutdown: ShutdownListener,
    ) -> u64 {
        let interval = self.resolve_interval();
        debug!(emitter = %self.name, ?interval, "Emitter started");
        let mut sent = 0u64;

        while !shutdown.is_triggered() {
            let line = self.next_line();
            trace!(emitter = %self.name, %line, "Emitting");
            if out.send(line).is_err() {
                break;
            }
            sent += 1;

            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = sleep(interval) => {}
            }
        }

        debug!(emitter = %self.name, sent, "Emitter stopped");
        sent
    }
}
