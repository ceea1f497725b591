//! Per-key sliding window over the most recent values.
//!
//! The aggregator owns one bounded history per source key and hands out a
//! [`WindowSnapshot`] on every update once that history is full. The table is
//! private to whichever task owns the aggregator, so no locking is involved.
//!
//! # Idle keys
//!
//! By default a key's history lives as long as the aggregator. With an idle TTL
//! configured, keys that have not been updated for longer than the TTL are
//! dropped; a key that comes back after that starts from an empty window.

use crate::core::{WindowSnapshot, WINDOW_CAPACITY};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

struct Window {
    history: VecDeque<i64>,
    last_seen: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            history: VecDeque::with_capacity(WINDOW_CAPACITY + 1),
            last_seen: now,
        }
    }
}

/// Bounded per-key history with snapshot emission.
pub struct WindowAggregator {
    windows: HashMap<String, Window>,
    idle_ttl: Option<Duration>,
    last_sweep: Option<Instant>,
}

impl Default for WindowAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowAggregator {
    /// Aggregator that keeps every key for its whole lifetime.
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
            idle_ttl: None,
            last_sweep: None,
        }
    }

    /// Aggregator that forgets keys idle for longer than `ttl`.
    pub fn with_idle_ttl(ttl: Duration) -> Self {
        Self {
            idle_ttl: Some(ttl),
            ..Self::new()
        }
    }

    /// Record `value` for `key` and return a snapshot if the window is full.
    pub fn update(&mut self, key: &str, value: i64) -> Option<WindowSnapshot> {
        self.update_at(key, value, Instant::now())
    }

    /// Same as [`update`](Self::update) with an explicit clock reading.
    pub fn update_at(&mut self, key: &str, value: i64, now: Instant) -> Option<WindowSnapshot> {
        if let Some(ttl) = self.idle_ttl {
            self.expire_key(key, ttl, now);
            self.maybe_sweep(ttl, now);
        }

        let window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(now));

        window.last_seen = now;
        window.history.push_back(value);
        while window.history.len() > WINDOW_CAPACITY {
            window.history.pop_front();
        }

        (window.history.len() == WINDOW_CAPACITY).then(|| WindowSnapshot {
            key: key.to_string(),
            values: window.history.iter().copied().collect(),
        })
    }

    /// Current history for `key`, oldest first.
    pub fn history(&self, key: &str) -> Option<Vec<i64>> {
        self.windows
            .get(key)
            .map(|window| window.history.iter().copied().collect())
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Idle-key TTL, if eviction is enabled.
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl
    }

    /// Drop every key idle for longer than the TTL. Returns how many were removed.
    ///
    /// A no-op when no TTL is configured.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.idle_ttl else {
            return 0;
        };
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.saturating_duration_since(window.last_seen) <= ttl);
        self.last_sweep = Some(now);
        let evicted = before - self.windows.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.windows.len(), "Evicted idle keys");
        }
        evicted
    }

    fn expire_key(&mut self, key: &str, ttl: Duration, now: Instant) {
        let stale = self
            .windows
            .get(key)
            .is_some_and(|window| now.saturating_duration_since(window.last_seen) > ttl);
        if stale {
            debug!(key, "Key was idle past TTL, restarting its window");
            self.windows.remove(key);
        }
    }

    // Full sweeps run at most once per TTL so the per-update cost stays flat.
    fn maybe_sweep(&mut self, ttl: Duration, now: Instant) {
        let due = match self.last_sweep {
            Some(last) => now.saturating_duration_since(last) >= ttl,
            None => {
                self.last_sweep = Some(now);
                false
            }
        };
        if due {
            self.evict_idle(now);
        }
    }
}
