//! Parsing of Kubernetes resource quantities and Go-style durations
//!
//! Quantities are reduced to a floating-point value in canonical units
//! (cores for cpu, bytes for memory). Durations accept the syntax used by
//! the rollout annotations, e.g. `90s`, `15m`, `1h30m` or `1.5h`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid quantity '{0}'")]
    Quantity(String),
    #[error("invalid duration '{0}'")]
    Duration(String),
}

/// Parse a quantity such as `100m`, `1.5`, `512Mi`, `1G` or `1e3`.
pub fn parse_quantity(input: &str) -> Result<f64, UnitError> {
    let s = input.trim();
    let err = || UnitError::Quantity(input.to_string());
    if s.is_empty() {
        return Err(err());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| err())?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let exponent: i32 = exp[1..].parse().map_err(|_| err())?;
            10f64.powi(exponent)
        }
        _ => return Err(err()),
    };

    let result = value * multiplier;
    if result.is_finite() && result >= 0.0 {
        Ok(result)
    } else {
        Err(err())
    }
}

/// Parse a duration string in Go syntax.
///
/// A duration is a sequence of decimal numbers, each with an optional
/// fraction and a unit suffix (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`).
/// The bare string `0` is accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, UnitError> {
    let s = input.trim();
    let err = || UnitError::Duration(input.to_string());
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(err());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        if number_len == 0 {
            return Err(err());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| err())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(err()),
        };
        rest = &rest[unit_len..];
        total_nanos += value * unit_nanos;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(err());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
