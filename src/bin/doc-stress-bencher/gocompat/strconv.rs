use std::time::Duration;

use anyhow::{Context, Result};

/// Accepts the same literals as Go's `strconv.ParseBool`.
pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(anyhow::anyhow!("Invalid boolean value: {s}")),
    }
}

/// Parses an unsigned integer the way Go's `strconv.ParseUint(s, 0, 64)`
/// does: the base is taken from a `0x`, `0o` or `0b` prefix, and single
/// underscores may separate digits.
pub fn parse_uint(s: &str) -> Result<u64> {
    let (digits, radix) = match s.get(..2) {
        Some("0x" | "0X") => (&s[2..], 16),
        Some("0o" | "0O") => (&s[2..], 8),
        Some("0b" | "0B") => (&s[2..], 2),
        _ => (s, 10),
    };
    anyhow::ensure!(
        digits.split('_').all(|group| !group.is_empty()),
        "Invalid integer literal: {s}",
    );

    let mut value = 0u64;
    for c in digits.chars().filter(|&c| c != '_') {
        let digit = c
            .to_digit(radix)
            .ok_or_else(|| anyhow::anyhow!("Invalid digit {c:?} in {s}"))?;
        value = value
            .checked_mul(u64::from(radix))
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or_else(|| anyhow::anyhow!("Integer out of range: {s}"))?;
    }
    Ok(value)
}

const NANOS_PER_UNIT: &[(&str, u64)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("\u{00B5}s", 1_000),
    ("\u{03BC}s", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3600 * 1_000_000_000),
];

/// Parses durations written like Go's `time.ParseDuration` expects,
/// e.g. `10m`, `1h30m`, `1.5s` or a bare `0`. Negative durations
/// are rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    anyhow::ensure!(!rest.starts_with('-'), "Negative duration: {s}");
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    anyhow::ensure!(!rest.is_empty(), "Invalid duration: {s}");

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        rest = tail;

        let number: f64 = number
            .parse()
            .with_context(|| format!("Invalid duration: {s}"))?;
        let nanos = NANOS_PER_UNIT
            .iter()
            .find_map(|&(name, nanos)| (name == unit).then_some(nanos))
            .ok_or_else(|| anyhow::anyhow!("Invalid duration unit {unit:?} in {s}"))?;
        let part = (number * nanos as f64).round();
        anyhow::ensure!(part < u64::MAX as f64, "Duration out of range: {s}");
        total = total
            .checked_add(Duration::from_nanos(part as u64))
            .ok_or_else(|| anyhow::anyhow!("Duration out of range: {s}"))?;
    }
    Ok(total)
}

/// Formats a duration for the help message, e.g. `10m0s` or `200ms`.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        return match d.subsec_nanos() {
            n if n % 1_000_000 == 0 => format!("{}ms", n / 1_000_000),
            n if n % 1_000 == 0 => format!("{}\u{00B5}s", n / 1_000),
            n => format!("{n}ns"),
        };
    }

    let secs = d.as_secs();
    let mut out = String::new();
    if secs >= 3600 {
        out.push_str(&format!("{}h", secs / 3600));
    }
    if secs >= 60 {
        out.push_str(&format!("{}m", secs / 60 % 60));
    }
    let millis = format!("{:03}", d.subsec_millis());
    match millis.trim_end_matches('0') {
        "" => out.push_str(&format!("{}s", secs % 60)),
        fraction => out.push_str(&format!("{}.{fraction}s", secs % 60)),
    }
    out
}
