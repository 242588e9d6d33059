use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point money used for every cash, price and P&L figure.
pub type Money = Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryReason {
    SupportReclaim,
    BreakoutHigh,
    OversoldBounce,
    MlPrediction,
    Momentum,
}

impl EntryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::SupportReclaim => "support_reclaim",
            EntryReason::BreakoutHigh => "breakout_high",
            EntryReason::OversoldBounce => "oversold_bounce",
            EntryReason::MlPrediction => "ml_prediction",
            EntryReason::Momentum => "momentum",
        }
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    ResistanceHit,
    Overbought,
    MlSellSignal,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TimeExit => "time_exit",
            ExitReason::ResistanceHit => "resistance_hit",
            ExitReason::Overbought => "overbought",
            ExitReason::MlSellSignal => "ml_sell_signal",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalReason {
    Entry(EntryReason),
    Exit(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowSignal {
    Bullish,
    Bearish,
    Neutral,
}

/// Indicator values for one ticker on one day. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_12: Option<f64>,
    pub ema_26: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub rsi_14: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub atr_14: Option<f64>,
    #[serde(default)]
    pub put_call_ratio: Option<f64>,
    #[serde(default)]
    pub smart_money_index: Option<f64>,
    #[serde(default)]
    pub unusual_activity_score: Option<f64>,
    #[serde(default)]
    pub iv_rank: Option<f64>,
    #[serde(default)]
    pub flow_signal: Option<FlowSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub direction: PredictionDirection,
    pub confidence: f64,
    pub expected_return: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub high: Money,
    pub low: Money,
    pub close: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub entry_price: Money,
    pub entry_reason: EntryReason,
    pub shares: u64,
    pub stop_loss: Money,
    pub take_profit: Money,
    pub trailing_stop_pct: Decimal,
    pub highest_price: Option<Money>,
    pub entry_commission: Money,
    pub confidence: f64,
}

impl Position {
    pub fn cost_basis(&self) -> Money {
        self.entry_price * Decimal::from(self.shares)
    }

    pub fn holding_days(&self, date: NaiveDate) -> i64 {
        (date - self.entry_date).num_days()
    }

    /// Level below which the trailing stop fires, once a high-water mark exists.
    pub fn trailing_stop_level(&self) -> Option<Money> {
        self.highest_price
            .map(|high| high * (Decimal::ONE - self.trailing_stop_pct))
    }

    /// Raises the high-water mark and ratchets the stop. Returns the stop after the update.
    pub fn update_trailing_stop(&mut self, current_price: Money) -> Money {
        let highest = match self.highest_price {
            Some(high) if high >= current_price => high,
            _ => current_price,
        };
        self.highest_price = Some(highest);
        let trailing = highest * (Decimal::ONE - self.trailing_stop_pct);
        if trailing > self.stop_loss {
            self.stop_loss = trailing;
        }
        self.stop_loss
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_price: Money,
    pub exit_price: Money,
    pub shares: u64,
    pub entry_reason: EntryReason,
    pub exit_reason: ExitReason,
    pub profit_loss: Money,
    pub profit_pct: f64,
    pub holding_days: i64,
    pub confidence: f64,
    pub entry_commission: Money,
    pub exit_commission: Money,
}

impl Trade {
    pub fn cost_basis(&self) -> Money {
        self.entry_price * Decimal::from(self.shares)
    }

    pub fn is_winner(&self) -> bool {
        self.profit_loss > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub ticker: String,
    pub date: NaiveDate,
    pub action: SignalAction,
    pub reason: SignalReason,
    pub price: Money,
    pub confidence: f64,
    pub stop_loss: Option<Money>,
    pub take_profit: Option<Money>,
    pub indicators: IndicatorSnapshot,
    pub rationale: String,
}

impl Signal {
    pub fn entry_reason(&self) -> Option<EntryReason> {
        match self.reason {
            SignalReason::Entry(reason) => Some(reason),
            SignalReason::Exit(_) => None,
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        match self.reason {
            SignalReason::Exit(reason) => Some(reason),
            SignalReason::Entry(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub portfolio_value: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownInfo {
    pub max_drawdown: f64,
    pub max_drawdown_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResults {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub starting_capital: Money,
    pub ending_capital: Money,
    pub total_return: Money,
    pub total_return_pct: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_profit: Money,
    pub avg_loss: Money,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_date: Option<NaiveDate>,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub avg_holding_days: f64,
    pub total_commission: Money,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}
