//! Duration strings: "500ms", "5s", "10m", "24h", "30d", or bare seconds.

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Parse a duration string.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let input = s.trim();
    let invalid = |reason: &str| CoreError::Duration {
        input: s.to_string(),
        reason: reason.to_string(),
    };

    if input.is_empty() {
        return Err(invalid("empty"));
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid("expected a number"))?;

    let multiplier_ms: u64 = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(invalid("unknown unit (use ms, s, m, h or d)")),
    };

    value
        .checked_mul(multiplier_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid("overflow"))
}

/// Render a duration with the largest unit that divides it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if ms % size == 0 {
            return format!("{}{unit}", ms / size);
        }
    }
    format!("{ms}ms")
}

/// Serde adapter so config structs can hold `Duration` fields written as strings.
pub(crate) mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
