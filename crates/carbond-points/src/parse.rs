use thiserror::Error;

use crate::MetricBatch;

/// Errors produced by the plaintext line codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad message: {0:?}")]
    Malformed(String),
    #[error("bad value in {0:?}")]
    Value(String),
    #[error("bad timestamp in {0:?}")]
    Timestamp(String),
}

/// Parse one `metric value timestamp` plaintext protocol line.
///
/// Timestamps arrive as floats from some senders and are rounded to whole
/// seconds. Trailing `\n` / `\r` are tolerated.
pub fn parse_line(line: &str) -> Result<MetricBatch, ParseError> {
    let trimmed = line.trim_end_matches(['\n', '\r']);

    let mut fields = trimmed.split_whitespace();
    let (metric, value, timestamp) = match (fields.next(), fields.next(), fields.next()) {
        (Some(m), Some(v), Some(t)) if fields.next().is_none() => (m, v, t),
        _ => return Err(ParseError::Malformed(trimmed.to_string())),
    };

    let value: f64 = value
        .parse()
        .map_err(|_| ParseError::Value(trimmed.to_string()))?;

    let timestamp: f64 = timestamp
        .parse()
        .map_err(|_| ParseError::Timestamp(trimmed.to_string()))?;
    if !timestamp.is_finite() {
        return Err(ParseError::Timestamp(trimmed.to_string()));
    }

    Ok(MetricBatch::one_point(metric, value, timestamp.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_line() {
        let b = parse_line("hello.world 42.15 1422698155\n").unwrap();
        assert_eq!(b.metric, "hello.world");
        assert_eq!(b.data[0].value, 42.15);
        assert_eq!(b.data[0].timestamp, 1422698155);
    }

    #[test]
    fn rounds_float_timestamps() {
        let b = parse_line("m 1 1422698155.9").unwrap();
        assert_eq!(b.data[0].timestamp, 1422698156);
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(parse_line("m 1"), Err(ParseError::Malformed(_))));
        assert!(matches!(
            parse_line("m 1 2 extra"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(parse_line(""), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn rejects_bad_value_and_timestamp() {
        assert!(matches!(parse_line("m x 10"), Err(ParseError::Value(_))));
        assert!(matches!(
            parse_line("m 1 never"),
            Err(ParseError::Timestamp(_))
        ));
        assert!(matches!(
            parse_line("m 1 inf"),
            Err(ParseError::Timestamp(_))
        ));
    }
}
