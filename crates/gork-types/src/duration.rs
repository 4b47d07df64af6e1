//! Go-style duration literals (`"30s"`, `"5m"`, `"1h30m"`) and their serde
//! adapters.
//!
//! Workflow documents express `schedule`, `timeout` and `retry_delay` as
//! duration strings. The parser accepts component chains with optional
//! fractions (`"2m5.5s"`, `"100ms"`) and the bare zero (`"0"`); only
//! non-negative durations are representable.

use std::time::Duration;

use thiserror::Error;

/// Failure to parse a duration literal.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration '{0}'")]
pub struct ParseDurationError(pub String);

/// Parse a duration literal into a `std::time::Duration`.
///
/// Supported units: `ns`, `us`, `ms`, `s`, `m`, `h`. Components compose
/// (`"1h30m"`), values may carry fractions (`"1.5s"`), and `"0"` is accepted
/// without a unit.
pub fn parse_duration(raw: &str) -> Result<Duration, ParseDurationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseDurationError(raw.to_string()));
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = trimmed;
    let mut total = 0.0f64;

    while !rest.is_empty() {
        let num_len = number_prefix_len(rest);
        if num_len == 0 {
            return Err(ParseDurationError(raw.to_string()));
        }

        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| ParseDurationError(raw.to_string()))?;
        if !value.is_finite() {
            return Err(ParseDurationError(raw.to_string()));
        }
        rest = &rest[num_len..];

        let (unit_len, scale) = unit_prefix(rest).ok_or_else(|| ParseDurationError(raw.to_string()))?;
        total += value * scale;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total).map_err(|_| ParseDurationError(raw.to_string()))
}

/// Render a duration as a compact literal (`"1h30m"`, `"250ms"`, `"0s"`).
///
/// Sub-millisecond precision is truncated; parse/format round-trips are
/// stable for millisecond-granularity values.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let total_ms = d.as_millis();
    let ms = total_ms % 1_000;
    let total_secs = total_ms / 1_000;
    let secs = total_secs % 60;
    let mins = (total_secs / 60) % 60;
    let hours = total_secs / 3_600;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    if ms > 0 {
        out.push_str(&format!("{ms}ms"));
    }
    if out.is_empty() {
        // Sub-millisecond remainder; render at the finest supported grain.
        out.push_str(&format!("{}us", d.as_micros()));
    }
    out
}

fn number_prefix_len(input: &str) -> usize {
    let mut len = 0usize;
    let mut saw_digit = false;
    let mut saw_dot = false;

    for ch in input.chars() {
        match ch {
            '0'..='9' => {
                saw_digit = true;
                len += 1;
            }
            '.' if !saw_dot => {
                saw_dot = true;
                len += 1;
            }
            _ => break,
        }
    }

    if saw_digit { len } else { 0 }
}

fn unit_prefix(input: &str) -> Option<(usize, f64)> {
    // Longest match first so "ms" is not read as "m".
    const UNITS: &[(&str, f64)] = &[
        ("ns", 1e-9),
        ("us", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3_600.0),
    ];
    UNITS
        .iter()
        .find(|(unit, _)| input.starts_with(unit))
        .map(|(unit, scale)| (unit.len(), *scale))
}

/// Serde adapter for duration fields expressed as literals in YAML/JSON.
///
/// Use with `#[serde(with = "duration_str", default)]`; a missing field
/// deserializes to `Duration::ZERO` and zero serializes as `"0s"`.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn parses_component_chains() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(
            parse_duration("2m5.5s").unwrap(),
            Duration::from_millis(125_500)
        );
    }

    #[test]
    fn parses_bare_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("s5").is_err());
    }

    #[test]
    fn format_round_trips() {
        for raw in ["30s", "5m", "1h30m", "250ms", "2m5s", "0s"] {
            let parsed = parse_duration(raw).unwrap();
            assert_eq!(parse_duration(&format_duration(parsed)).unwrap(), parsed);
        }
    }

    #[test]
    fn format_compact_forms() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1_250)), "1s250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
