use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use log::{debug, info, warn};

use crate::config::BacktestConfig;
use crate::error::BacktestError;
use crate::feeds::{IndicatorFeed, PredictionOracle, PriceFeed};
use crate::models::{
    BacktestResults, EquityPoint, ExitReason, Money, Prediction, PredictionDirection,
};
use crate::performance::{PerformanceCalculator, PerformanceInputs};
use crate::position_book::{OpenOutcome, OpenRequest, PositionBook};
use crate::signals::{EntryEvaluation, SignalGenerator};

const PROGRESS_INTERVAL_DAYS: usize = 50;

/// Replays a list of trading days against the feeds and scores the result.
///
/// Each simulator runs once: [`Simulator::run`] consumes it, so no cash, positions or
/// equity history carry over between runs.
pub struct Simulator<'a> {
    config: BacktestConfig,
    prices: &'a dyn PriceFeed,
    indicators: &'a dyn IndicatorFeed,
    oracle: Option<&'a dyn PredictionOracle>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Simulator<'a> {
    pub fn new(
        config: BacktestConfig,
        prices: &'a dyn PriceFeed,
        indicators: &'a dyn IndicatorFeed,
    ) -> Result<Self, BacktestError> {
        Ok(Self {
            config: config.validated()?,
            prices,
            indicators,
            oracle: None,
            cancel: None,
        })
    }

    pub fn with_oracle(mut self, oracle: &'a dyn PredictionOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Stop after the day in progress once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(
        self,
        tickers: &[String],
        trading_days: &[NaiveDate],
    ) -> Result<BacktestResults, BacktestError> {
        validate_trading_days(trading_days)?;

        let mut candidates: Vec<&str> = tickers.iter().map(String::as_str).collect();
        candidates.sort_unstable();
        candidates.dedup();

        let generator = SignalGenerator::new(&self.config);
        let mut book = PositionBook::new(&self.config);
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(trading_days.len());
        let start_date = trading_days[0];
        let mut last_date = start_date;

        info!(
            "Backtesting {} tickers over {} trading days ({} to {})",
            candidates.len(),
            trading_days.len(),
            start_date,
            trading_days[trading_days.len() - 1]
        );

        for (day_idx, &date) in trading_days.iter().enumerate() {
            if day_idx > 0 && self.is_cancelled() {
                warn!("Backtest cancelled; stopping after {}", last_date);
                break;
            }

            let portfolio_value = book.portfolio_value(self.prices, date);
            if day_idx % PROGRESS_INTERVAL_DAYS == 0 {
                info!(
                    "Progress: {:5.1}% | Date: {} | Portfolio: {:.2} | Positions: {} | Trades: {}",
                    day_idx as f64 / trading_days.len() as f64 * 100.0,
                    date,
                    portfolio_value,
                    book.open_count(),
                    book.trades().len()
                );
            }
            equity_curve.push(EquityPoint {
                date,
                portfolio_value,
            });

            self.process_exits(&generator, &mut book, date);
            self.process_entries(&generator, &mut book, &candidates, date);
            last_date = date;
        }

        self.liquidate(&mut book, last_date);

        let ending_capital = book.portfolio_value(self.prices, last_date);
        let total_commission = book.commission_paid();
        let starting_capital = book.starting_capital();
        let results = PerformanceCalculator::calculate_performance(PerformanceInputs {
            start_date,
            end_date: last_date,
            starting_capital,
            ending_capital,
            total_commission,
            risk_free_rate: self.config.risk_free_rate,
            trades: book.into_trades(),
            equity_curve,
        });

        info!(
            "Backtest complete: {} trades, return {:.2} ({:.2}%), win rate {:.1}%",
            results.total_trades,
            results.total_return,
            results.total_return_pct,
            results.win_rate * 100.0
        );
        Ok(results)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    /// Oracle lookup that degrades to "no prediction" on failure.
    fn prediction(&self, ticker: &str, date: NaiveDate) -> Option<Prediction> {
        let oracle = self.oracle?;
        match oracle.predict(ticker, date) {
            Ok(prediction) => prediction,
            Err(err) => {
                warn!(
                    "Prediction failed for {} on {}: {:#}; using indicators only",
                    ticker, date, err
                );
                None
            }
        }
    }

    fn process_exits(&self, generator: &SignalGenerator, book: &mut PositionBook, date: NaiveDate) {
        let mut to_close: Vec<(String, Money, ExitReason)> = Vec::new();

        for ticker in book.held_tickers() {
            let Some(price) = self.prices.get_price(&ticker, date) else {
                continue;
            };
            book.update_trailing_stop(&ticker, price);
            let Some(position) = book.position(&ticker) else {
                continue;
            };

            let indicators = self
                .indicators
                .get_indicators(&ticker, date)
                .unwrap_or_default();
            let prediction = self.prediction(&ticker, date);
            if let Some(signal) = generator.evaluate_exit(
                position,
                date,
                price,
                self.prices,
                &indicators,
                prediction.as_ref(),
            ) {
                if let Some(reason) = signal.exit_reason() {
                    debug!("{} exit signal: {}", ticker, signal.rationale);
                    to_close.push((ticker, price, reason));
                }
            }
        }

        for (ticker, price, reason) in to_close {
            if let Some(trade) = book.close_position(&ticker, date, price, reason) {
                debug!(
                    "{} | {} | {} -> {} | {:.2} -> {:.2} | P&L {:.2} ({:+.1}%) | {}d",
                    if trade.is_winner() { "WIN" } else { "LOSS" },
                    trade.ticker,
                    trade.entry_reason,
                    trade.exit_reason,
                    trade.entry_price,
                    trade.exit_price,
                    trade.profit_loss,
                    trade.profit_pct,
                    trade.holding_days
                );
            }
        }
    }

    fn process_entries(
        &self,
        generator: &SignalGenerator,
        book: &mut PositionBook,
        candidates: &[&str],
        date: NaiveDate,
    ) {
        for &ticker in candidates {
            if !book.has_capacity() {
                break;
            }
            if book.holds(ticker) {
                continue;
            }
            let Some(price) = self.prices.get_price(ticker, date) else {
                continue;
            };

            let prediction = self.prediction(ticker, date);
            if let Some(prediction) = &prediction {
                if prediction.confidence < self.config.min_ml_confidence
                    || prediction.direction == PredictionDirection::Down
                {
                    continue;
                }
            }

            let indicators = self
                .indicators
                .get_indicators(ticker, date)
                .unwrap_or_default();
            let signal = match generator.evaluate_entry(
                ticker,
                date,
                price,
                self.prices,
                &indicators,
                prediction.as_ref(),
            ) {
                EntryEvaluation::Signal(signal) => signal,
                EntryEvaluation::Suppressed {
                    reason,
                    confidence,
                    threshold,
                } => {
                    debug!(
                        "{} {} suppressed: confidence {:.2} < {:.2}",
                        ticker, reason, confidence, threshold
                    );
                    continue;
                }
                EntryEvaluation::NoSignal { .. } => continue,
            };

            let (Some(reason), Some(stop_loss), Some(take_profit)) =
                (signal.entry_reason(), signal.stop_loss, signal.take_profit)
            else {
                continue;
            };

            match book.open_position(OpenRequest {
                ticker,
                date,
                price,
                reason,
                stop_loss,
                take_profit,
                confidence: signal.confidence,
            }) {
                OpenOutcome::Opened { shares, .. } => debug!(
                    "ENTRY | {} | {} | {} shares at {:.2} | SL {:.2} | TP {:.2} | conf {:.2}",
                    ticker, reason, shares, price, stop_loss, take_profit, signal.confidence
                ),
                OpenOutcome::Rejected(rejection) => {
                    debug!("{} entry rejected: {}", ticker, rejection)
                }
            }
        }
    }

    /// Close everything still open on `date`, falling back to the latest earlier price.
    fn liquidate(&self, book: &mut PositionBook, date: NaiveDate) {
        for ticker in book.held_tickers() {
            let Some(price) = self.prices.last_price_on_or_before(&ticker, date) else {
                warn!(
                    "No price for {} on or before {}; leaving position open",
                    ticker, date
                );
                continue;
            };
            book.close_position(&ticker, date, price, ExitReason::TimeExit);
        }
    }
}

fn validate_trading_days(trading_days: &[NaiveDate]) -> Result<(), BacktestError> {
    if trading_days.is_empty() {
        return Err(BacktestError::NoTradingDays);
    }
    for window in trading_days.windows(2) {
        let (previous, next) = (window[0], window[1]);
        if previous == next {
            return Err(BacktestError::DuplicateTradingDay(next));
        }
        if previous > next {
            return Err(BacktestError::UnorderedTradingDays { previous, next });
        }
    }
    Ok(())
}
