use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Setting {key} must be a number (value: {value})")]
    NotANumber { key: String, value: String },
    #[error("{field} must be {expected} (value: {value})")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl ConfigError {
    pub(crate) fn out_of_range(
        field: &'static str,
        expected: &'static str,
        value: impl ToString,
    ) -> Self {
        ConfigError::OutOfRange {
            field,
            expected,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BacktestError {
    #[error("Invalid backtest configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("No trading days supplied")]
    NoTradingDays,
    #[error("Trading day {0} appears more than once")]
    DuplicateTradingDay(NaiveDate),
    #[error("Trading days must ascend ({previous} is followed by {next})")]
    UnorderedTradingDays { previous: NaiveDate, next: NaiveDate },
}
