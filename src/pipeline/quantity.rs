//! Kubernetes-style quantity strings converted to planner units

use super::errors::ValidationError;

const MIB: f64 = 1024.0 * 1024.0;

/// Parses a CPU quantity (`500m`, `1`, `0.5`) into milli-cores.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidQuantity`] for malformed or negative values.
pub fn cpu_millis(value: &str) -> Result<u32, ValidationError> {
    let trimmed = value.trim();
    let invalid = || ValidationError::InvalidQuantity {
        kind: "cpu".to_string(),
        value: value.to_string(),
    };

    let millis = match trimmed.strip_suffix('m') {
        Some(number) => number.parse::<f64>().map_err(|_| invalid())?,
        None => trimmed.parse::<f64>().map_err(|_| invalid())? * 1000.0,
    };
    to_u32(millis).ok_or_else(invalid)
}

/// Parses a memory quantity (`500Mi`, `1Gi`, `1G`, `1048576`) into MiB.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidQuantity`] for malformed or negative values.
pub fn memory_mib(value: &str) -> Result<u32, ValidationError> {
    let trimmed = value.trim();
    let invalid = || ValidationError::InvalidQuantity {
        kind: "memory".to_string(),
        value: value.to_string(),
    };

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let bytes_per_unit = match unit {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => MIB,
        "Gi" => MIB * 1024.0,
        "Ti" => MIB * 1024.0 * 1024.0,
        "K" | "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        _ => return Err(invalid()),
    };
    to_u32((number * bytes_per_unit / MIB).floor()).ok_or_else(invalid)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u32(value: f64) -> Option<u32> {
    (value.is_finite() && value >= 0.0 && value <= f64::from(u32::MAX))
        .then(|| value.round() as u32)
}
