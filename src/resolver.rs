//! Anomaly resolver: flags windows whose values are all identical.

use crate::core::{AnomalyReport, WindowSnapshot, WINDOW_CAPACITY};
use crate::error::{AppResult, PipelineError};
use std::time::Instant;
use tracing::warn;

/// Stateless check over window snapshots.
///
/// The only state is the instant the resolver was created, used to stamp
/// reports with the time elapsed since startup.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyResolver {
    started: Instant,
}

impl Default for AnomalyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyResolver {
    /// Resolver whose clock starts now.
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// Resolver whose clock started at `started`.
    pub fn started_at(started: Instant) -> Self {
        Self { started }
    }

    /// Instant reports are measured from.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Report the snapshot's key if its window is stuck on one value.
    ///
    /// A snapshot of the wrong length is logged and skipped.
    pub fn check(&self, snapshot: &WindowSnapshot) -> Option<AnomalyReport> {
        match self.try_check(snapshot) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "Got bad snapshot, skipping");
                None
            }
        }
    }

    /// Like [`check`](Self::check) but surfaces a malformed snapshot as
    /// [`PipelineError::ProtocolViolation`].
    pub fn try_check(&self, snapshot: &WindowSnapshot) -> AppResult<Option<AnomalyReport>> {
        let values: [i64; WINDOW_CAPACITY] = snapshot.values.as_slice().try_into().map_err(|_| {
            PipelineError::ProtocolViolation {
                key: snapshot.key.clone(),
                len: snapshot.values.len(),
                expected: WINDOW_CAPACITY,
            }
        })?;

        if !values.iter().all(|v| *v == values[0]) {
            return Ok(None);
        }

        Ok(Some(AnomalyReport {
            key: snapshot.key.clone(),
            values,
            detected_at: self.started.elapsed(),
            reported_at: chrono::Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn snapshot(values: &[i64]) -> WindowSnapshot {
        WindowSnapshot {
            key: "p0".to_string(),
            values: values.to_vec(),
        }
    }

    #[test]
    fn identical_values_are_reported() {
        let resolver = AnomalyResolver::new();
        let report = resolver.check(&snapshot(&[4, 4, 4])).unwrap();
        assert_eq!(report.key, "p0");
        assert_eq!(report.values, [4, 4, 4]);
        assert_eq!(report.stuck_value(), 4);
    }

    #[test]
    fn differing_values_are_not_reported() {
        let resolver = AnomalyResolver::new();
        assert!(resolver.check(&snapshot(&[4, 4, 5])).is_none());
        assert!(resolver.check(&snapshot(&[1, 2, 1])).is_none());
        assert!(resolver.check(&snapshot(&[5, 4, 4])).is_none());
    }

    #[test]
    fn detected_at_is_measured_from_start() {
        let started = Instant::now() - std::time::Duration::from_secs(2);
        let resolver = AnomalyResolver::started_at(started);
        let report = resolver.check(&snapshot(&[0, 0, 0])).unwrap();
        assert!(report.detected_at >= std::time::Duration::from_secs(2));
    }

    #[test]
    fn wrong_length_is_a_protocol_violation() {
        let resolver = AnomalyResolver::new();
        match resolver.try_check(&snapshot(&[1, 1])) {
            Err(PipelineError::ProtocolViolation { key, len, expected }) => {
                assert_eq!(key, "p0");
                assert_eq!(len, 2);
                assert_eq!(expected, WINDOW_CAPACITY);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    #[traced_test]
    fn check_logs_and_skips_wrong_length() {
        let resolver = AnomalyResolver::new();
        assert!(resolver.check(&snapshot(&[3, 3, 3, 3])).is_none());
        assert!(resolver.check(&snapshot(&[])).is_none());
        assert!(logs_contain("Got bad snapshot"));
    }
}
