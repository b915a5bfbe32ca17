//! # Duration Parsing
//!
//! Parses Kubernetes / Go style duration strings such as `30s`, `5m`, `72h`,
//! `1h30m`, `500ms` and `1d`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration '{input}': {reason}")]
pub struct DurationError {
    pub input: String,
    pub reason: String,
}

impl DurationError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// One <number><unit> segment; units are matched longest-first so `ms` wins over `m`
static SEGMENT_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?P<number>\d+)(?P<unit>ms|s|m|h|d)").ok());

/// Parse a duration string into `std::time::Duration`
///
/// Accepts one or more `<number><unit>` segments with units `ms`, `s`, `m`, `h`, `d`.
/// The segments must cover the whole (trimmed) input and the total must be positive.
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration, DurationError> {
    let trimmed = duration_str.trim();

    if trimmed.is_empty() {
        return Err(DurationError::new(duration_str, "duration string cannot be empty"));
    }

    let regex = SEGMENT_REGEX
        .as_ref()
        .ok_or_else(|| DurationError::new(trimmed, "duration pattern failed to compile"))?;

    let lower = trimmed.to_lowercase();
    let mut consumed = 0;
    let mut total = Duration::ZERO;

    for captures in regex.captures_iter(&lower) {
        let whole = captures
            .get(0)
            .ok_or_else(|| DurationError::new(trimmed, "failed to extract segment"))?;
        if whole.start() != consumed {
            return Err(DurationError::new(
                trimmed,
                "expected <number><unit> segments (e.g. '30s', '5m', '1h30m')",
            ));
        }
        consumed = whole.end();

        let number: u64 = captures
            .name("number")
            .map(|m| m.as_str())
            .unwrap_or_default()
            .parse()
            .map_err(|e| DurationError::new(trimmed, format!("invalid number: {e}")))?;

        let segment = match captures.name("unit").map(|m| m.as_str()) {
            Some("ms") => Duration::from_millis(number),
            Some("s") => Duration::from_secs(number),
            Some("m") => Duration::from_secs(number.saturating_mul(60)),
            Some("h") => Duration::from_secs(number.saturating_mul(3600)),
            Some("d") => Duration::from_secs(number.saturating_mul(86_400)),
            other => {
                return Err(DurationError::new(
                    trimmed,
                    format!("invalid unit {other:?}, expected ms, s, m, h or d"),
                ))
            }
        };
        total = total.saturating_add(segment);
    }

    if consumed != lower.len() {
        return Err(DurationError::new(
            trimmed,
            "expected <number><unit> segments (e.g. '30s', '5m', '1h30m')",
        ));
    }

    if total.is_zero() {
        return Err(DurationError::new(trimmed, "duration must be greater than 0"));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_units() {
        assert_eq!(parse_kubernetes_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_kubernetes_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_kubernetes_duration("72h").unwrap(), Duration::from_secs(72 * 3600));
        assert_eq!(parse_kubernetes_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_kubernetes_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_compound_and_whitespace() {
        assert_eq!(
            parse_kubernetes_duration(" 1h30m ").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_kubernetes_duration("1M5S").unwrap(),
            Duration::from_secs(65)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_kubernetes_duration("").is_err());
        assert!(parse_kubernetes_duration("abc").is_err());
        assert!(parse_kubernetes_duration("10").is_err());
        assert!(parse_kubernetes_duration("10x").is_err());
        assert!(parse_kubernetes_duration("5m foo").is_err());
        assert!(parse_kubernetes_duration("0s").is_err());
    }
}
