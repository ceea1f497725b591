//! Record parser: turns raw `name:value` lines into [`ParsedRecord`]s.
//!
//! The grammar is a word-character key, a colon, and a decimal value. By default
//! only the start of the line has to match, so `"a:1extra"` is read as `a = 1`.
//! Strict mode anchors the grammar to the whole line instead.

use crate::core::ParsedRecord;
use crate::error::ParseError;
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static PREFIX_RECORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+):([0-9]+)").expect("Invalid record regex"));

#[allow(clippy::expect_used)]
static FULL_RECORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+):([0-9]+)$").expect("Invalid record regex"));

/// How much of a line the record grammar must cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// The grammar must match a prefix; trailing characters are ignored.
    #[default]
    Prefix,
    /// The grammar must match the whole line.
    FullLine,
}

/// Stateless validator for the wire record format.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordParser {
    mode: MatchMode,
}

impl RecordParser {
    /// Parser using the given match mode.
    pub fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    /// Parser that requires the full line to match.
    pub fn strict() -> Self {
        Self::new(MatchMode::FullLine)
    }

    /// Match mode this parser applies.
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Parse one raw line. A trailing `\n` or `\r\n` is not part of the record.
    pub fn parse(&self, raw: &str) -> Result<ParsedRecord, ParseError> {
        let line = raw.trim_end_matches(['\n', '\r']);
        let pattern = match self.mode {
            MatchMode::Prefix => &*PREFIX_RECORD,
            MatchMode::FullLine => &*FULL_RECORD,
        };

        let caps = pattern
            .captures(line)
            .ok_or_else(|| ParseError::Malformed(line.to_string()))?;

        let key = &caps[1];
        let value = caps[2]
            .parse::<i64>()
            .map_err(|_| ParseError::ValueOutOfRange(line.to_string()))?;

        Ok(ParsedRecord::new(key, value))
    }
}

/// Parse with the default prefix-matching parser.
pub fn parse(raw: &str) -> Result<ParsedRecord, ParseError> {
    RecordParser::default().parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_record() {
        assert_eq!(parse("sensor1:7"), Ok(ParsedRecord::new("sensor1", 7)));
    }

    #[test]
    fn rejects_missing_colon() {
        assert_eq!(
            parse("bad_input"),
            Err(ParseError::Malformed("bad_input".into()))
        );
    }

    #[test]
    fn prefix_mode_ignores_trailing_characters() {
        assert_eq!(parse("a:1extra"), Ok(ParsedRecord::new("a", 1)));
        assert_eq!(parse("p0:12:34"), Ok(ParsedRecord::new("p0", 12)));
    }

    #[test]
    fn strict_mode_rejects_trailing_characters() {
        let parser = RecordParser::strict();
        assert!(matches!(
            parser.parse("a:1extra"),
            Err(ParseError::Malformed(_))
        ));
        assert_eq!(parser.parse("a:1"), Ok(ParsedRecord::new("a", 1)));
    }

    #[test]
    fn line_terminators_are_stripped() {
        assert_eq!(parse("p2:5\n"), Ok(ParsedRecord::new("p2", 5)));
        assert_eq!(
            RecordParser::strict().parse("p2:5\r\n"),
            Ok(ParsedRecord::new("p2", 5))
        );
    }

    #[test]
    fn grammar_is_anchored_at_start() {
        assert!(parse(" p0:1").is_err());
        assert!(parse(":1").is_err());
        assert!(parse("p0:").is_err());
        assert!(parse("p0:-1").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn key_may_contain_underscores_and_digits() {
        assert_eq!(parse("bad_input:0"), Ok(ParsedRecord::new("bad_input", 0)));
        assert_eq!(parse("007:42"), Ok(ParsedRecord::new("007", 42)));
    }

    #[test]
    fn overflowing_value_is_rejected() {
        let raw = "p0:99999999999999999999";
        assert_eq!(
            parse(raw),
            Err(ParseError::ValueOutOfRange(raw.to_string()))
        );
    }

    #[test]
    fn leading_zeros_are_accepted() {
        assert_eq!(parse("p0:0007"), Ok(ParsedRecord::new("p0", 7)));
    }
}
