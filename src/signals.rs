use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::BacktestConfig;
use crate::feeds::PriceFeed;
use crate::models::{
    EntryReason, ExitReason, FlowSignal, IndicatorSnapshot, Money, Position, Prediction,
    PredictionDirection, Signal, SignalAction, SignalReason,
};
use crate::trading_rules::{
    highest_high, is_breakout, is_support_reclaim, lowest_low, meets_confidence_threshold,
    near_resistance, protective_levels,
};

const DEFAULT_BASE_CONFIDENCE: f64 = 0.5;
const PREDICTION_OVERRIDE_CONFIDENCE: f64 = 0.70;
const BEARISH_EXIT_CONFIDENCE: f64 = 0.75;
const OVERSOLD_RSI: f64 = 30.0;
const OVERBOUGHT_RSI: f64 = 75.0;
const MOMENTUM_RSI: f64 = 50.0;
const NEUTRAL_RSI_BAND: (f64, f64) = (40.0, 60.0);
const WEAK_MACD_HISTOGRAM: f64 = 0.1;

/// Why no entry rule fired for a ticker.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    LowPredictionConfidence { confidence: f64, threshold: f64 },
    NeutralRsi(f64),
    WeakMacd(f64),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LowPredictionConfidence {
                confidence,
                threshold,
            } => write!(
                f,
                "prediction confidence {:.1}% < threshold {:.1}%",
                confidence * 100.0,
                threshold * 100.0
            ),
            SkipReason::NeutralRsi(rsi) => write!(f, "RSI neutral ({:.1})", rsi),
            SkipReason::WeakMacd(histogram) => write!(f, "MACD weak ({:.3})", histogram),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EntryEvaluation {
    Signal(Signal),
    /// A rule matched but its confidence fell below the configured threshold.
    Suppressed {
        reason: EntryReason,
        confidence: f64,
        threshold: f64,
    },
    NoSignal { skip_reasons: Vec<SkipReason> },
}

impl EntryEvaluation {
    pub fn into_signal(self) -> Option<Signal> {
        match self {
            EntryEvaluation::Signal(signal) => Some(signal),
            _ => None,
        }
    }
}

/// Everything an entry rule may look at.
pub struct EntryContext<'a> {
    pub price: Money,
    pub indicators: &'a IndicatorSnapshot,
    pub prediction: Option<&'a Prediction>,
    /// Lowest low of the support window, excluding the reclaim lookback.
    pub support: Option<Money>,
    /// Lowest low of the reclaim lookback.
    pub recent_low: Option<Money>,
    pub prior_high: Option<Money>,
    pub base_confidence: f64,
}

/// Everything an exit rule may look at. The position's trailing stop has already been
/// updated with `price`.
pub struct ExitContext<'a> {
    pub position: &'a Position,
    pub date: NaiveDate,
    pub price: Money,
    pub max_holding_days: i64,
    pub resistance: Option<Money>,
    pub indicators: &'a IndicatorSnapshot,
    pub prediction: Option<&'a Prediction>,
}

type EntryRule = fn(&EntryContext) -> Option<f64>;
type ExitRule = fn(&ExitContext) -> bool;

/// Entry rules in precedence order. Each returns the candidate confidence on a match.
pub const ENTRY_RULES: [(EntryReason, EntryRule); 5] = [
    (EntryReason::SupportReclaim, support_reclaim),
    (EntryReason::BreakoutHigh, breakout_high),
    (EntryReason::OversoldBounce, oversold_bounce),
    (EntryReason::MlPrediction, prediction_override),
    (EntryReason::Momentum, momentum),
];

/// Exit rules in precedence order.
pub const EXIT_RULES: [(ExitReason, ExitRule); 7] = [
    (ExitReason::StopLoss, stop_loss_hit),
    (ExitReason::TakeProfit, take_profit_hit),
    (ExitReason::TrailingStop, trailing_stop_hit),
    (ExitReason::TimeExit, holding_period_elapsed),
    (ExitReason::ResistanceHit, at_resistance),
    (ExitReason::Overbought, overbought_reversal),
    (ExitReason::MlSellSignal, bearish_prediction),
];

fn support_reclaim(ctx: &EntryContext) -> Option<f64> {
    let (support, recent_low) = (ctx.support?, ctx.recent_low?);
    is_support_reclaim(ctx.price, support, recent_low).then(|| ctx.base_confidence.max(0.60))
}

fn breakout_high(ctx: &EntryContext) -> Option<f64> {
    is_breakout(ctx.price, ctx.prior_high?).then(|| ctx.base_confidence.max(0.65))
}

fn oversold_bounce(ctx: &EntryContext) -> Option<f64> {
    let rsi = ctx.indicators.rsi_14?;
    let histogram = ctx.indicators.macd_histogram?;
    (rsi < OVERSOLD_RSI && histogram > 0.0).then(|| ctx.base_confidence.max(0.55))
}

fn prediction_override(ctx: &EntryContext) -> Option<f64> {
    let prediction = ctx.prediction?;
    (prediction.direction == PredictionDirection::Up
        && prediction.confidence > PREDICTION_OVERRIDE_CONFIDENCE)
        .then_some(prediction.confidence)
}

fn momentum(ctx: &EntryContext) -> Option<f64> {
    let rsi = ctx.indicators.rsi_14?;
    let histogram = ctx.indicators.macd_histogram?;
    (ctx.indicators.flow_signal == Some(FlowSignal::Bullish)
        && histogram > 0.0
        && rsi > MOMENTUM_RSI)
        .then(|| ctx.base_confidence.max(0.60))
}

fn stop_loss_hit(ctx: &ExitContext) -> bool {
    ctx.price <= ctx.position.stop_loss
}

fn take_profit_hit(ctx: &ExitContext) -> bool {
    ctx.price >= ctx.position.take_profit
}

fn trailing_stop_hit(ctx: &ExitContext) -> bool {
    ctx.position
        .trailing_stop_level()
        .map_or(false, |level| ctx.price < level)
}

fn holding_period_elapsed(ctx: &ExitContext) -> bool {
    ctx.position.holding_days(ctx.date) >= ctx.max_holding_days
}

fn at_resistance(ctx: &ExitContext) -> bool {
    ctx.resistance
        .map_or(false, |resistance| near_resistance(ctx.price, resistance))
}

fn overbought_reversal(ctx: &ExitContext) -> bool {
    match (ctx.indicators.rsi_14, ctx.indicators.macd_histogram) {
        (Some(rsi), Some(histogram)) => rsi > OVERBOUGHT_RSI && histogram < 0.0,
        _ => false,
    }
}

fn bearish_prediction(ctx: &ExitContext) -> bool {
    ctx.prediction.map_or(false, |prediction| {
        prediction.direction == PredictionDirection::Down
            && prediction.confidence > BEARISH_EXIT_CONFIDENCE
    })
}

/// Stateless rule evaluation over the run's configuration.
pub struct SignalGenerator {
    config: BacktestConfig,
}

impl SignalGenerator {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn evaluate_entry(
        &self,
        ticker: &str,
        date: NaiveDate,
        price: Money,
        prices: &dyn PriceFeed,
        indicators: &IndicatorSnapshot,
        prediction: Option<&Prediction>,
    ) -> EntryEvaluation {
        let strategy = &self.config.strategy;
        let reclaim_start = date - chrono::Duration::days(strategy.reclaim_lookback);
        let support_bars: Vec<_> = prices
            .bars_before(ticker, date, strategy.support_window)
            .into_iter()
            .filter(|bar| bar.date < reclaim_start)
            .collect();
        let recent_bars = prices.bars_before(ticker, date, strategy.reclaim_lookback);
        let breakout_bars = prices.bars_before(ticker, date, strategy.breakout_window);

        let ctx = EntryContext {
            price,
            indicators,
            prediction,
            support: lowest_low(&support_bars),
            recent_low: lowest_low(&recent_bars),
            prior_high: highest_high(&breakout_bars),
            base_confidence: prediction
                .map(|p| p.confidence)
                .unwrap_or(DEFAULT_BASE_CONFIDENCE),
        };

        let Some((reason, confidence)) = ENTRY_RULES
            .iter()
            .find_map(|(reason, rule)| rule(&ctx).map(|confidence| (*reason, confidence)))
        else {
            return EntryEvaluation::NoSignal {
                skip_reasons: self.skip_reasons(&ctx),
            };
        };

        let threshold = strategy.min_confidence_threshold;
        if !meets_confidence_threshold(confidence, threshold) {
            return EntryEvaluation::Suppressed {
                reason,
                confidence,
                threshold,
            };
        }

        let (stop_loss, take_profit) =
            protective_levels(price, self.config.stop_loss_pct, self.config.take_profit_pct);
        let rationale = entry_rationale(&ctx, reason, confidence, stop_loss, take_profit);

        EntryEvaluation::Signal(Signal {
            ticker: ticker.to_string(),
            date,
            action: SignalAction::Buy,
            reason: SignalReason::Entry(reason),
            price,
            confidence,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            indicators: indicators.clone(),
            rationale,
        })
    }

    /// Evaluate a held position. Call [`Position::update_trailing_stop`] with `price`
    /// before this so the ratcheted stop is seen by the rules.
    pub fn evaluate_exit(
        &self,
        position: &Position,
        date: NaiveDate,
        price: Money,
        prices: &dyn PriceFeed,
        indicators: &IndicatorSnapshot,
        prediction: Option<&Prediction>,
    ) -> Option<Signal> {
        let resistance_bars =
            prices.bars_before(&position.ticker, date, self.config.strategy.resistance_window);
        let ctx = ExitContext {
            position,
            date,
            price,
            max_holding_days: self.config.max_holding_days,
            resistance: highest_high(&resistance_bars),
            indicators,
            prediction,
        };

        let reason = EXIT_RULES
            .iter()
            .find(|(_, rule)| rule(&ctx))
            .map(|(reason, _)| *reason)?;

        Some(Signal {
            ticker: position.ticker.clone(),
            date,
            action: SignalAction::Sell,
            reason: SignalReason::Exit(reason),
            price,
            confidence: position.confidence,
            stop_loss: Some(position.stop_loss),
            take_profit: Some(position.take_profit),
            indicators: indicators.clone(),
            rationale: exit_rationale(&ctx, reason),
        })
    }

    fn skip_reasons(&self, ctx: &EntryContext) -> Vec<SkipReason> {
        let mut reasons = Vec::new();
        let threshold = self.config.strategy.min_confidence_threshold;
        if let Some(prediction) = ctx.prediction {
            if prediction.confidence < threshold {
                reasons.push(SkipReason::LowPredictionConfidence {
                    confidence: prediction.confidence,
                    threshold,
                });
            }
        }
        if let Some(rsi) = ctx.indicators.rsi_14 {
            if rsi > NEUTRAL_RSI_BAND.0 && rsi < NEUTRAL_RSI_BAND.1 {
                reasons.push(SkipReason::NeutralRsi(rsi));
            }
        }
        if let Some(histogram) = ctx.indicators.macd_histogram {
            if histogram.abs() < WEAK_MACD_HISTOGRAM {
                reasons.push(SkipReason::WeakMacd(histogram));
            }
        }
        reasons
    }
}

fn entry_rationale(
    ctx: &EntryContext,
    reason: EntryReason,
    confidence: f64,
    stop_loss: Money,
    take_profit: Money,
) -> String {
    let indicators = ctx.indicators;
    let mut parts = Vec::new();

    parts.push(match reason {
        EntryReason::SupportReclaim => format!(
            "support reclaim: price {:.2} back above support {:.2} after a dip to {:.2}",
            ctx.price,
            ctx.support.unwrap_or_default(),
            ctx.recent_low.unwrap_or_default()
        ),
        EntryReason::BreakoutHigh => format!(
            "breakout: price {:.2} cleared prior high {:.2}",
            ctx.price,
            ctx.prior_high.unwrap_or_default()
        ),
        EntryReason::OversoldBounce => format!(
            "oversold bounce: RSI {:.1} with MACD histogram {:.3} turning positive",
            indicators.rsi_14.unwrap_or_default(),
            indicators.macd_histogram.unwrap_or_default()
        ),
        EntryReason::MlPrediction => format!(
            "prediction: model expects an up move with {:.1}% confidence",
            confidence * 100.0
        ),
        EntryReason::Momentum => format!(
            "momentum: bullish options flow, MACD histogram {:.3}, RSI {:.1}",
            indicators.macd_histogram.unwrap_or_default(),
            indicators.rsi_14.unwrap_or_default()
        ),
    });

    if let (Some(sma_20), Some(sma_50)) = (indicators.sma_20, indicators.sma_50) {
        let trend = if sma_20 > sma_50 { "uptrend" } else { "downtrend" };
        parts.push(format!("SMA20 {:.2} vs SMA50 {:.2} ({})", sma_20, sma_50, trend));
    }
    if let Some(rsi) = indicators.rsi_14 {
        parts.push(format!("RSI {:.1}", rsi));
    }
    if let Some(histogram) = indicators.macd_histogram {
        let direction = if histogram > 0.0 { "bullish" } else { "bearish" };
        parts.push(format!("MACD {}", direction));
    }
    if let Some(prediction) = ctx.prediction {
        parts.push(format!(
            "prediction confidence {:.1}%",
            prediction.confidence * 100.0
        ));
    }

    let risk_pct = (ctx.price - stop_loss) / ctx.price * dec!(100);
    let reward_pct = (take_profit - ctx.price) / ctx.price * dec!(100);
    parts.push(format!(
        "entry {:.2}, stop {:.2} (-{:.1}%), target {:.2} (+{:.1}%)",
        ctx.price,
        stop_loss,
        risk_pct.round_dp(1),
        take_profit,
        reward_pct.round_dp(1)
    ));

    parts.join("; ")
}

fn exit_rationale(ctx: &ExitContext, reason: ExitReason) -> String {
    let position = ctx.position;
    let change_pct = if position.entry_price > Decimal::ZERO {
        (ctx.price - position.entry_price) / position.entry_price * dec!(100)
    } else {
        Decimal::ZERO
    };
    let detail = match reason {
        ExitReason::StopLoss => format!("price {:.2} at or below stop {:.2}", ctx.price, position.stop_loss),
        ExitReason::TakeProfit => {
            format!("price {:.2} reached target {:.2}", ctx.price, position.take_profit)
        }
        ExitReason::TrailingStop => format!(
            "price {:.2} fell below trailing level {:.2}",
            ctx.price,
            position.trailing_stop_level().unwrap_or_default()
        ),
        ExitReason::TimeExit => format!(
            "held {} days (limit {})",
            position.holding_days(ctx.date),
            ctx.max_holding_days
        ),
        ExitReason::ResistanceHit => format!(
            "price {:.2} near resistance {:.2}",
            ctx.price,
            ctx.resistance.unwrap_or_default()
        ),
        ExitReason::Overbought => format!(
            "RSI {:.1} overbought with MACD histogram {:.3}",
            ctx.indicators.rsi_14.unwrap_or_default(),
            ctx.indicators.macd_histogram.unwrap_or_default()
        ),
        ExitReason::MlSellSignal => format!(
            "model expects a down move with {:.1}% confidence",
            ctx.prediction.map(|p| p.confidence).unwrap_or_default() * 100.0
        ),
    };
    format!("{}: {} ({:+.1}% from entry)", reason, detail, change_pct.round_dp(1))
}
