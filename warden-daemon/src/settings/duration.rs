//! Timing values in `warden.yaml`: `"150ms"`, `"30s"`, `"5m"`, `"1h"`, or a
//! bare number of seconds.
//!
//! Each timing setting deserializes through the module for its bounds
//! (`#[serde(with = "duration::debounce")]`), so an out-of-range value is
//! rejected while the file is parsed, with the offending key in the error.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Suffix and milliseconds per unit, `ms` ahead of `m` and `s`.
const UNITS: [(&str, u64); 4] = [("ms", 1), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)];

/// Inclusive range a timing setting must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: Duration,
    pub max: Option<Duration>,
}

impl Bounds {
    pub fn check(&self, value: Duration) -> Result<Duration, String> {
        let within = value >= self.min && self.max.is_none_or(|max| value <= max);
        if within {
            return Ok(value);
        }
        Err(match self.max {
            Some(max) => format!("{} is outside {}..={}", format(value), format(self.min), format(max)),
            None => format!("{} is below the minimum of {}", format(value), format(self.min)),
        })
    }
}

/// Debounce window for coalescing file events.
pub const DEBOUNCE: Bounds = Bounds {
    min: Duration::from_millis(50),
    max: Some(Duration::from_millis(200)),
};

/// Bound on a single liveness query.
pub const LIVENESS: Bounds = Bounds {
    min: Duration::from_secs(1),
    max: Some(Duration::from_secs(5)),
};

/// Timer periods; zero would spin.
pub const PERIOD: Bounds = Bounds {
    min: Duration::from_millis(1),
    max: None,
};

/// Delays and windows where zero is meaningful.
pub const ANY: Bounds = Bounds {
    min: Duration::ZERO,
    max: None,
};

pub fn parse(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (digits, scale) = UNITS
        .iter()
        .find_map(|(suffix, scale)| text.strip_suffix(suffix).map(|digits| (digits, *scale)))
        .unwrap_or((text, 1_000));
    let digits = digits.trim_end();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{}' is not a duration like 150ms, 30s or 5m", text));
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .map(Duration::from_millis)
        .ok_or_else(|| format!("'{}' is too large", text))
}

/// Largest unit that represents `value` exactly.
pub fn format(value: Duration) -> String {
    let millis = value.as_millis() as u64;
    if millis == 0 {
        return "0s".to_string();
    }
    UNITS
        .iter()
        .filter(|(_, scale)| millis.is_multiple_of(*scale))
        .max_by_key(|(_, scale)| *scale)
        .map(|(suffix, scale)| format!("{}{}", millis / scale, suffix))
        .unwrap_or_else(|| format!("{}ms", millis))
}

fn deserialize_within<'de, D: Deserializer<'de>>(deserializer: D, bounds: Bounds) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse(&text)
        .and_then(|value| bounds.check(value))
        .map_err(serde::de::Error::custom)
}

fn serialize_text<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(*value))
}

macro_rules! bounded {
    ($($name:ident => $bounds:expr),* $(,)?) => {$(
        pub mod $name {
            use super::*;

            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
                deserialize_within(deserializer, $bounds)
            }

            pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
                serialize_text(value, serializer)
            }
        }
    )*};
}

bounded! {
    debounce => DEBOUNCE,
    liveness => LIVENESS,
    period => PERIOD,
    any => ANY,
}
