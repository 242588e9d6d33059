use crate::error::ConfigError;
use crate::models::Money;
use crate::param_utils::{get_param_decimal, get_param_f64, get_rounded_param};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::str::FromStr;

/// Settings keys understood by [`BacktestConfig::from_settings_map`].
pub const SETTING_KEYS: [&str; 14] = [
    "BACKTEST_STARTING_CAPITAL",
    "BACKTEST_POSITION_SIZE_PCT",
    "BACKTEST_MAX_POSITIONS",
    "BACKTEST_COMMISSION_PCT",
    "BACKTEST_STOP_LOSS_PCT",
    "BACKTEST_TAKE_PROFIT_PCT",
    "BACKTEST_MAX_HOLDING_DAYS",
    "BACKTEST_MIN_ML_CONFIDENCE",
    "BACKTEST_RISK_FREE_RATE",
    "STRATEGY_TRAILING_STOP_PCT",
    "STRATEGY_SUPPORT_WINDOW",
    "STRATEGY_RESISTANCE_WINDOW",
    "STRATEGY_BREAKOUT_WINDOW",
    "STRATEGY_MIN_CONFIDENCE",
];

/// Knobs that shape signal generation
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub trailing_stop_pct: Decimal,
    /// Calendar days used for the support level
    pub support_window: i64,
    /// Calendar days in which a dip below support must have happened
    pub reclaim_lookback: i64,
    pub resistance_window: i64,
    pub breakout_window: i64,
    /// Entry candidates below this confidence are suppressed
    pub min_confidence_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trailing_stop_pct: dec!(0.05),
            support_window: 20,
            reclaim_lookback: 5,
            resistance_window: 20,
            breakout_window: 30,
            min_confidence_threshold: 0.5,
        }
    }
}

/// Run parameters for one backtest. Clone it per run; never share one across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub starting_capital: Money,
    pub position_size_pct: Decimal,
    pub max_positions: usize,
    pub commission_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_holding_days: i64,
    /// Predictions below this confidence keep the ticker out of the day's entries
    pub min_ml_confidence: f64,
    pub risk_free_rate: f64,
    pub strategy: StrategyConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            starting_capital: dec!(100000),
            position_size_pct: dec!(0.10),
            max_positions: 5,
            commission_pct: dec!(0.001),
            stop_loss_pct: dec!(0.08),
            take_profit_pct: dec!(0.15),
            max_holding_days: 60,
            min_ml_confidence: 0.6,
            risk_free_rate: 0.02,
            strategy: StrategyConfig::default(),
        }
    }
}

impl BacktestConfig {
    /// Consume the config, returning it only if every field is within bounds.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.starting_capital <= Decimal::ZERO {
            return Err(ConfigError::out_of_range(
                "starting_capital",
                "> 0",
                self.starting_capital,
            ));
        }
        check_open_unit(
            "position_size_pct",
            self.position_size_pct,
            UpperBound::Inclusive,
        )?;
        if self.max_positions == 0 {
            return Err(ConfigError::out_of_range("max_positions", ">= 1", 0));
        }
        if self.commission_pct < Decimal::ZERO || self.commission_pct >= Decimal::ONE {
            return Err(ConfigError::out_of_range(
                "commission_pct",
                "within [0, 1)",
                self.commission_pct,
            ));
        }
        check_open_unit("stop_loss_pct", self.stop_loss_pct, UpperBound::Exclusive)?;
        check_open_unit(
            "take_profit_pct",
            self.take_profit_pct,
            UpperBound::Inclusive,
        )?;
        if self.max_holding_days < 1 {
            return Err(ConfigError::out_of_range(
                "max_holding_days",
                ">= 1",
                self.max_holding_days,
            ));
        }
        check_probability("min_ml_confidence", self.min_ml_confidence)?;
        if !self.risk_free_rate.is_finite() {
            return Err(ConfigError::out_of_range(
                "risk_free_rate",
                "finite",
                self.risk_free_rate,
            ));
        }

        let strategy = &self.strategy;
        check_open_unit(
            "trailing_stop_pct",
            strategy.trailing_stop_pct,
            UpperBound::Exclusive,
        )?;
        check_probability(
            "min_confidence_threshold",
            strategy.min_confidence_threshold,
        )?;
        for (field, window) in [
            ("reclaim_lookback", strategy.reclaim_lookback),
            ("resistance_window", strategy.resistance_window),
            ("breakout_window", strategy.breakout_window),
        ] {
            if window < 1 {
                return Err(ConfigError::out_of_range(field, ">= 1", window));
            }
        }
        if strategy.support_window <= strategy.reclaim_lookback {
            return Err(ConfigError::out_of_range(
                "support_window",
                "greater than reclaim_lookback",
                strategy.support_window,
            ));
        }

        Ok(())
    }

    /// Build a config from string settings; absent keys keep their defaults.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = setting_decimal(settings, "BACKTEST_STARTING_CAPITAL")? {
            config.starting_capital = value;
        }
        if let Some(value) = setting_decimal(settings, "BACKTEST_POSITION_SIZE_PCT")? {
            config.position_size_pct = value;
        }
        if let Some(value) = setting_integer(settings, "BACKTEST_MAX_POSITIONS")? {
            config.max_positions = usize::try_from(value).map_err(|_| {
                ConfigError::out_of_range("max_positions", ">= 1", value)
            })?;
        }
        if let Some(value) = setting_decimal(settings, "BACKTEST_COMMISSION_PCT")? {
            config.commission_pct = value;
        }
        if let Some(value) = setting_decimal(settings, "BACKTEST_STOP_LOSS_PCT")? {
            config.stop_loss_pct = value;
        }
        if let Some(value) = setting_decimal(settings, "BACKTEST_TAKE_PROFIT_PCT")? {
            config.take_profit_pct = value;
        }
        if let Some(value) = setting_integer(settings, "BACKTEST_MAX_HOLDING_DAYS")? {
            config.max_holding_days = value;
        }
        if let Some(value) = setting_f64(settings, "BACKTEST_MIN_ML_CONFIDENCE")? {
            config.min_ml_confidence = value;
        }
        if let Some(value) = setting_f64(settings, "BACKTEST_RISK_FREE_RATE")? {
            config.risk_free_rate = value;
        }
        if let Some(value) = setting_decimal(settings, "STRATEGY_TRAILING_STOP_PCT")? {
            config.strategy.trailing_stop_pct = value;
        }
        if let Some(value) = setting_integer(settings, "STRATEGY_SUPPORT_WINDOW")? {
            config.strategy.support_window = value;
        }
        if let Some(value) = setting_integer(settings, "STRATEGY_RESISTANCE_WINDOW")? {
            config.strategy.resistance_window = value;
        }
        if let Some(value) = setting_integer(settings, "STRATEGY_BREAKOUT_WINDOW")? {
            config.strategy.breakout_window = value;
        }
        if let Some(value) = setting_f64(settings, "STRATEGY_MIN_CONFIDENCE")? {
            config.strategy.min_confidence_threshold = value;
        }

        config.validated()
    }

    /// Overlay a numeric parameter map (as produced by a sweep grid) on this config.
    pub fn with_parameters(&self, parameters: &HashMap<String, f64>) -> Result<Self, ConfigError> {
        let max_positions = get_rounded_param(parameters, "maxPositions", self.max_positions as i64);
        let config = Self {
            starting_capital: get_param_decimal(
                parameters,
                "startingCapital",
                self.starting_capital,
            )?,
            position_size_pct: get_param_decimal(
                parameters,
                "positionSizePct",
                self.position_size_pct,
            )?,
            max_positions: usize::try_from(max_positions)
                .map_err(|_| ConfigError::out_of_range("max_positions", ">= 1", max_positions))?,
            commission_pct: get_param_decimal(parameters, "commissionPct", self.commission_pct)?,
            stop_loss_pct: get_param_decimal(parameters, "stopLossPct", self.stop_loss_pct)?,
            take_profit_pct: get_param_decimal(
                parameters,
                "takeProfitPct",
                self.take_profit_pct,
            )?,
            max_holding_days: get_rounded_param(
                parameters,
                "maxHoldingDays",
                self.max_holding_days,
            ),
            min_ml_confidence: get_param_f64(
                parameters,
                "minMlConfidence",
                self.min_ml_confidence,
            ),
            risk_free_rate: get_param_f64(parameters, "riskFreeRate", self.risk_free_rate),
            strategy: StrategyConfig {
                trailing_stop_pct: get_param_decimal(
                    parameters,
                    "trailingStopPct",
                    self.strategy.trailing_stop_pct,
                )?,
                support_window: get_rounded_param(
                    parameters,
                    "supportWindow",
                    self.strategy.support_window,
                ),
                reclaim_lookback: self.strategy.reclaim_lookback,
                resistance_window: get_rounded_param(
                    parameters,
                    "resistanceWindow",
                    self.strategy.resistance_window,
                ),
                breakout_window: get_rounded_param(
                    parameters,
                    "breakoutWindow",
                    self.strategy.breakout_window,
                ),
                min_confidence_threshold: get_param_f64(
                    parameters,
                    "minConfidence",
                    self.strategy.min_confidence_threshold,
                ),
            },
        };

        config.validated()
    }
}

#[derive(Clone, Copy)]
enum UpperBound {
    Inclusive,
    Exclusive,
}

fn check_open_unit(field: &'static str, value: Decimal, upper: UpperBound) -> Result<(), ConfigError> {
    let within = value > Decimal::ZERO
        && match upper {
            UpperBound::Inclusive => value <= Decimal::ONE,
            UpperBound::Exclusive => value < Decimal::ONE,
        };
    if within {
        return Ok(());
    }
    let expected = match upper {
        UpperBound::Inclusive => "within (0, 1]",
        UpperBound::Exclusive => "within (0, 1)",
    };
    Err(ConfigError::out_of_range(field, expected, value))
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, "within [0, 1]", value))
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_decimal(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Decimal>, ConfigError> {
    optional_setting(settings, key)
        .map(|raw| {
            Decimal::from_str(raw).map_err(|_| ConfigError::NotANumber {
                key: key.to_string(),
                value: raw.to_string(),
            })
        })
        .transpose()
}

fn setting_f64(settings: &HashMap<String, String>, key: &str) -> Result<Option<f64>, ConfigError> {
    optional_setting(settings, key)
        .map(|raw| match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(ConfigError::NotANumber {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        })
        .transpose()
}

fn setting_integer(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<i64>, ConfigError> {
    optional_setting(settings, key)
        .map(|raw| {
            raw.parse::<i64>().map_err(|_| ConfigError::NotANumber {
                key: key.to_string(),
                value: raw.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = BacktestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.starting_capital, dec!(100000));
        assert_eq!(config.max_positions, 5);
        assert_eq!(config.max_holding_days, 60);
    }

    #[test]
    fn rejects_non_positive_capital() {
        let config = BacktestConfig {
            starting_capital: dec!(-1),
            ..BacktestConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "starting_capital",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_max_positions() {
        let config = BacktestConfig {
            max_positions: 0,
            ..BacktestConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn rejects_percentages_outside_unit_interval() {
        let too_big = BacktestConfig {
            position_size_pct: dec!(1.5),
            ..BacktestConfig::default()
        };
        assert!(too_big.validate().is_err());

        let full_stop = BacktestConfig {
            stop_loss_pct: dec!(1),
            ..BacktestConfig::default()
        };
        assert!(full_stop.validate().is_err());

        let negative_fee = BacktestConfig {
            commission_pct: dec!(-0.001),
            ..BacktestConfig::default()
        };
        assert!(negative_fee.validate().is_err());

        let mut bad_confidence = BacktestConfig::default();
        bad_confidence.strategy.min_confidence_threshold = f64::NAN;
        assert!(bad_confidence.validate().is_err());
    }

    #[test]
    fn support_window_must_exceed_reclaim_lookback() {
        let mut config = BacktestConfig::default();
        config.strategy.support_window = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn settings_map_overrides_defaults() {
        let config = BacktestConfig::from_settings_map(&settings(&[
            ("BACKTEST_STARTING_CAPITAL", "25000"),
            ("BACKTEST_MAX_POSITIONS", " 3 "),
            ("BACKTEST_COMMISSION_PCT", "0"),
            ("STRATEGY_BREAKOUT_WINDOW", "10"),
            ("BACKTEST_STOP_LOSS_PCT", ""),
        ]))
        .unwrap();

        assert_eq!(config.starting_capital, dec!(25000));
        assert_eq!(config.max_positions, 3);
        assert_eq!(config.commission_pct, Decimal::ZERO);
        assert_eq!(config.strategy.breakout_window, 10);
        assert_eq!(config.stop_loss_pct, dec!(0.08));
    }

    #[test]
    fn settings_map_reports_unparseable_values() {
        let err = BacktestConfig::from_settings_map(&settings(&[(
            "BACKTEST_POSITION_SIZE_PCT",
            "ten percent",
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotANumber {
                key: "BACKTEST_POSITION_SIZE_PCT".to_string(),
                value: "ten percent".to_string(),
            }
        );
    }

    #[test]
    fn settings_map_fails_fast_on_invalid_values() {
        let result =
            BacktestConfig::from_settings_map(&settings(&[("BACKTEST_MAX_POSITIONS", "-2")]));
        assert!(result.is_err());
    }

    #[test]
    fn parameter_overlay_keeps_unspecified_fields() {
        let base = BacktestConfig::default();
        let mut parameters = HashMap::new();
        parameters.insert("stopLossPct".to_string(), 0.05);
        parameters.insert("maxPositions".to_string(), 2.0);

        let config = base.with_parameters(&parameters).unwrap();
        assert_eq!(config.stop_loss_pct, dec!(0.05));
        assert_eq!(config.max_positions, 2);
        assert_eq!(config.take_profit_pct, base.take_profit_pct);
        assert_eq!(config.strategy, base.strategy);
    }

    #[test]
    fn parameter_overlay_validates_result() {
        let mut parameters = HashMap::new();
        parameters.insert("maxPositions".to_string(), 0.0);
        assert!(BacktestConfig::default().with_parameters(&parameters).is_err());
    }
}
