//! Human-readable durations for settings: `"250ms"`, `"5s"`, `"2m"`, `"1h"`, `"7d"`.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration_str(&s).map_err(serde::de::Error::custom)
}

/// The same format for `Option<Duration>` fields; use with `#[serde(default)]`.
pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| parse_duration_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |val: &str| -> Result<u64, String> {
        val.trim()
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    };
    let secs = |val: &str, scale: u64| -> Result<Duration, String> {
        parse(val)?
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' overflows"))
    };
    if let Some(val) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(val)?))
    } else if let Some(val) = s.strip_suffix('s') {
        secs(val, 1)
    } else if let Some(val) = s.strip_suffix('m') {
        secs(val, 60)
    } else if let Some(val) = s.strip_suffix('h') {
        secs(val, 3600)
    } else if let Some(val) = s.strip_suffix('d') {
        secs(val, 86400)
    } else {
        Err(format!("unknown duration format: {s}"))
    }
}
