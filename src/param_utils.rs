use crate::error::ConfigError;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Extract a parameter rounded to the nearest integer, falling back on non-finite input
pub fn get_rounded_param(params: &HashMap<String, f64>, key: &str, default: i64) -> i64 {
    match params.get(key) {
        Some(value) if value.is_finite() => value.round() as i64,
        _ => default,
    }
}

/// Extract a parameter as a fixed-point decimal; non-finite values are rejected
pub fn get_param_decimal(
    params: &HashMap<String, f64>,
    key: &str,
    default: Decimal,
) -> Result<Decimal, ConfigError> {
    let Some(raw) = params.get(key).copied() else {
        return Ok(default);
    };
    Decimal::from_f64(raw).ok_or_else(|| ConfigError::NotANumber {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn missing_parameters_use_defaults() {
        let params = HashMap::new();
        assert_eq!(get_param_f64(&params, "minConfidence", 0.5), 0.5);
        assert_eq!(get_rounded_param(&params, "maxPositions", 5), 5);
        assert_eq!(
            get_param_decimal(&params, "stopLossPct", dec!(0.08)).unwrap(),
            dec!(0.08)
        );
    }

    #[test]
    fn rounded_param_ignores_non_finite_values() {
        let mut params = HashMap::new();
        params.insert("maxPositions".to_string(), f64::NAN);
        params.insert("maxHoldingDays".to_string(), 29.6);
        assert_eq!(get_rounded_param(&params, "maxPositions", 5), 5);
        assert_eq!(get_rounded_param(&params, "maxHoldingDays", 60), 30);
    }

    #[test]
    fn decimal_param_rejects_nan() {
        let mut params = HashMap::new();
        params.insert("stopLossPct".to_string(), f64::NAN);
        assert!(get_param_decimal(&params, "stopLossPct", dec!(0.08)).is_err());
    }
}
