//! Coercion of heterogeneous bus sensor values to a nullable real.
//!
//! Every component that reads a sensor must go through [`to_real`] rather
//! than matching on a raw bus value directly: the bus hands
//! back numbers, numeric strings, and a handful of "no data" sentinels,
//! and treating any of those inconsistently is a recurring source of bugs
//! in home-automation integrations.

use serde::{Deserialize, Serialize};

const UNAVAILABLE: &str = "unavailable";
const UNKNOWN: &str = "unknown";

/// A raw value as returned by the external bus for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Null,
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Text(v.to_owned())
    }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self {
        RawValue::Text(v)
    }
}

impl From<Option<f64>> for RawValue {
    fn from(v: Option<f64>) -> Self {
        match v {
            Some(n) => RawValue::Number(n),
            None => RawValue::Null,
        }
    }
}

/// Coerce a heterogeneous sensor reading to a finite real, or `None` if
/// the reading is absent.
///
/// Sentinel strings `"unavailable"`, `"unknown"` (case-insensitive) and
/// the empty string map to absent, as do non-numeric strings, `Null`,
/// and non-finite numbers (`NaN`/`inf`).
pub fn to_real(value: &RawValue) -> Option<f64> {
    let real = match value {
        RawValue::Null => return None,
        RawValue::Number(n) => *n,
        RawValue::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty()
                || trimmed.eq_ignore_ascii_case(UNAVAILABLE)
                || trimmed.eq_ignore_ascii_case(UNKNOWN)
            {
                return None;
            }
            trimmed.parse::<f64>().ok()?
        }
    };
    real.is_finite().then_some(real)
}
