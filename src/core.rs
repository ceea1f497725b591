//! Core data types shared by every pipeline stage.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of most recent values kept per source key.
pub const WINDOW_CAPACITY: usize = 3;

/// A validated `name:value` record produced by the parser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    /// Source name, one or more word characters.
    pub key: String,
    /// Decimal value that followed the colon.
    pub value: i64,
}

impl ParsedRecord {
    /// Build a record from a key and value.
    pub fn new(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Copy of a full window, emitted by the aggregator on every update once the
/// window holds [`WINDOW_CAPACITY`] values.
///
/// `values` is kept as a `Vec` on the wire between aggregator and resolver so
/// the resolver can reject a malformed snapshot instead of trusting the sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Source the window belongs to.
    pub key: String,
    /// Values in arrival order, oldest first.
    pub values: Vec<i64>,
}

/// A source whose latest window holds one repeated value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Source that looks stuck.
    pub key: String,
    /// The window that triggered the report, oldest first.
    pub values: [i64; WINDOW_CAPACITY],
    /// Time since the resolver started.
    #[serde(with = "humantime_serde")]
    pub detected_at: Duration,
    /// Wall-clock time of detection.
    pub reported_at: chrono::DateTime<chrono::Utc>,
}

impl AnomalyReport {
    /// The value the source is stuck on.
    pub fn stuck_value(&self) -> i64 {
        self.values[0]
    }
}

impl fmt::Display for AnomalyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is broken, received: {:?} (after {:.3}s)",
            self.key,
            self.values,
            self.detected_at.as_secs_f64()
        )
    }
}

/// Counters a stage task returns when its loop exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Items taken off the inbound channel.
    pub received: u64,
    /// Items sent downstream.
    pub forwarded: u64,
    /// Items logged and discarded.
    pub dropped: u64,
}

impl fmt::Display for StageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} forwarded={} dropped={}",
            self.received, self.forwarded, self.dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_display_names_key_and_values() {
        let report = AnomalyReport {
            key: "p3".to_string(),
            values: [7, 7, 7],
            detected_at: Duration::from_millis(1500),
            reported_at: chrono::Utc::now(),
        };
        let line = report.to_string();
        assert!(line.starts_with("p3 is broken, received: [7, 7, 7]"));
        assert!(line.contains("1.500s"));
        assert_eq!(report.stuck_value(), 7);
    }

    #[test]
    fn report_serializes_duration_as_human_readable() {
        let report = AnomalyReport {
            key: "p0".to_string(),
            values: [1, 1, 1],
            detected_at: Duration::from_millis(250),
            reported_at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["detected_at"], "250ms");
        assert_eq!(json["values"], serde_json::json!([1, 1, 1]));
    }
}
