//! String formats recognised by the `format` annotation.
//!
//! Each [`Format`] knows how to check a textual value. The same checks back the
//! `format` keyword in generated OpenAPI schemas, so the names follow the OpenAPI
//! vocabulary (`date-time`, `ipv4`, ...).

use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
    )
    .expect("email regex is valid")
});

static HOSTNAME_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("hostname regex is valid"));

/// A named string format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Email,
    Date,
    DateTime,
    Duration,
    Uuid,
    Uri,
    Ipv4,
    Ipv6,
    Hostname,
    Regex,
}

impl Format {
    /// Parses the annotation spelling of a format.
    pub fn parse(name: &str) -> Option<Self> {
        let format = match name.trim() {
            "email" => Format::Email,
            "date" => Format::Date,
            "date-time" => Format::DateTime,
            "duration" => Format::Duration,
            "uuid" => Format::Uuid,
            "uri" => Format::Uri,
            "ipv4" => Format::Ipv4,
            "ipv6" => Format::Ipv6,
            "hostname" => Format::Hostname,
            "regex" => Format::Regex,
            _ => return None,
        };
        Some(format)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Email => "email",
            Format::Date => "date",
            Format::DateTime => "date-time",
            Format::Duration => "duration",
            Format::Uuid => "uuid",
            Format::Uri => "uri",
            Format::Ipv4 => "ipv4",
            Format::Ipv6 => "ipv6",
            Format::Hostname => "hostname",
            Format::Regex => "regex",
        }
    }

    /// Returns true when `value` is well formed for this format.
    pub fn check(&self, value: &str) -> bool {
        match self {
            Format::Email => EMAIL.is_match(value),
            Format::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
            Format::DateTime => DateTime::parse_from_rfc3339(value).is_ok(),
            Format::Duration => {
                let unsigned = value.strip_prefix(['-', '+']).unwrap_or(value);
                parse_duration(unsigned).is_some()
            }
            Format::Uuid => uuid::Uuid::parse_str(value).is_ok(),
            Format::Uri => url::Url::parse(value).is_ok(),
            Format::Ipv4 => value.parse::<Ipv4Addr>().is_ok(),
            Format::Ipv6 => value.parse::<Ipv6Addr>().is_ok(),
            Format::Hostname => is_hostname(value),
            Format::Regex => Regex::new(value).is_ok(),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_hostname(value: &str) -> bool {
    let value = value.strip_suffix('.').unwrap_or(value);
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    value.split('.').all(|label| HOSTNAME_LABEL.is_match(label))
}

/// Reads a `duration` format value such as `300ms`, `1.5h` or `2h45m`.
///
/// Unlike config durations, fractional amounts are allowed. Valid units are `ns`, `us`
/// (or `µs`), `ms`, `s`, `m` and `h`, and a bare `0` is accepted. The sign is stripped by
/// the caller.
fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text == "0" {
        return Some(Duration::ZERO);
    }
    if text.is_empty() {
        return None;
    }

    let mut rest = text;
    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_nanos += number * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos.round() as u64))
}
