//! Custom error types for the pipeline.
//!
//! Two families live here:
//!
//! - **`ParseError`**: a raw line failed the record grammar. The parser stage logs it and
//!   drops the line; it never travels further down the pipeline.
//! - **`PipelineError`**: everything else. Configuration and I/O problems surface to the
//!   binary at startup, while `ProtocolViolation` is only ever logged by the resolver.
//!
//! No stage loop returns an error. Data errors are logged and the offending item is
//! discarded, so the only way a running pipeline stops is cancellation or a closed
//! input channel.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AppResult<T> = std::result::Result<T, PipelineError>;

/// A raw record that could not be turned into a `ParsedRecord`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line does not start with (or, in strict mode, is not) `name:value`.
    #[error("Malformed record: {0:?}")]
    Malformed(String),

    /// The value does not fit in an `i64`.
    #[error("Record value out of range: {0:?}")]
    ValueOutOfRange(String),
}

/// Errors raised while configuring or running the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Figment could not extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Reading input failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A window snapshot did not carry exactly [`WINDOW_CAPACITY`](crate::core::WINDOW_CAPACITY) values.
    #[error("Snapshot for '{key}' has {len} values, expected {expected}")]
    ProtocolViolation {
        /// Key of the offending snapshot.
        key: String,
        /// Number of values it carried.
        len: usize,
        /// Number of values a snapshot must carry.
        expected: usize,
    },

    /// The global tracing subscriber could not be installed.
    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),
}

impl From<figment::Error> for PipelineError {
    fn from(value: figment::Error) -> Self {
        PipelineError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violation_message_names_key_and_length() {
        let err = PipelineError::ProtocolViolation {
            key: "p1".into(),
            len: 2,
            expected: 3,
        };
        assert_eq!(err.to_string(), "Snapshot for 'p1' has 2 values, expected 3");
    }

    #[test]
    fn figment_error_converts_through_box() {
        let err: PipelineError = figment::Error::from("missing field".to_string()).into();
        match err {
            PipelineError::Config(inner) => assert!(inner.to_string().contains("missing field")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn parse_error_quotes_input() {
        let err = ParseError::Malformed("bad_input".into());
        assert_eq!(err.to_string(), "Malformed record: \"bad_input\"");
    }
}
