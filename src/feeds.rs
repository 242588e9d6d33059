//! Read interfaces for the market data the simulator consumes.
//!
//! Implementations are expected to serve already-materialized data: every call is a
//! synchronous lookup and must not block on I/O.

use crate::models::{IndicatorSnapshot, Money, Prediction, PriceBar};
use anyhow::Result;
use chrono::NaiveDate;

pub trait PriceFeed {
    /// Closing price for `ticker` on `date`, if the ticker traded that day.
    fn get_price(&self, ticker: &str, date: NaiveDate) -> Option<Money>;

    /// Daily bars dated within `[date - window_days, date)`, oldest first.
    fn bars_before(&self, ticker: &str, date: NaiveDate, window_days: i64) -> Vec<PriceBar>;

    /// Most recent closing price dated on or before `date`.
    fn last_price_on_or_before(&self, ticker: &str, date: NaiveDate) -> Option<Money> {
        self.get_price(ticker, date)
    }
}

pub trait IndicatorFeed {
    fn get_indicators(&self, ticker: &str, date: NaiveDate) -> Option<IndicatorSnapshot>;
}

pub trait PredictionOracle {
    /// `Ok(None)` means no prediction is available; `Err` is a failed inference.
    fn predict(&self, ticker: &str, date: NaiveDate) -> Result<Option<Prediction>>;
}

/// Oracle used when no model is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPredictions;

impl PredictionOracle for NoPredictions {
    fn predict(&self, _ticker: &str, _date: NaiveDate) -> Result<Option<Prediction>> {
        Ok(None)
    }
}
