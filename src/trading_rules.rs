use crate::models::{Money, PriceBar};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Lot size used by the affordability pre-check.
pub const ASSUMED_LOT_SHARES: u64 = 100;

const BREAKOUT_MARGIN: Decimal = dec!(1.005);
const RECLAIM_MARGIN: Decimal = dec!(1.01);
const RESISTANCE_PROXIMITY: Decimal = dec!(0.99);

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAllocation {
    pub shares: u64,
    pub cost: Money,
    pub commission: Money,
}

impl PositionAllocation {
    pub fn total_debit(&self) -> Money {
        self.cost + self.commission
    }
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(PositionAllocation),
    TooSmall,
    InsufficientCash { required: Money },
}

pub struct PositionSizingParams {
    pub price: Money,
    pub available_cash: Money,
    pub position_size_pct: Decimal,
    pub commission_pct: Decimal,
}

pub fn determine_position_size(params: PositionSizingParams) -> PositionSizingOutcome {
    let PositionSizingParams {
        price,
        available_cash,
        position_size_pct,
        commission_pct,
    } = params;

    if price <= Decimal::ZERO || available_cash <= Decimal::ZERO {
        return PositionSizingOutcome::TooSmall;
    }

    let allocation = available_cash * position_size_pct;
    let shares = (allocation / price).floor().to_u64().unwrap_or(0);
    if shares == 0 {
        return PositionSizingOutcome::TooSmall;
    }

    let cost = price * Decimal::from(shares);
    let commission = cost * commission_pct;
    let required = cost + commission;
    if required > available_cash {
        return PositionSizingOutcome::InsufficientCash { required };
    }

    PositionSizingOutcome::Sized(PositionAllocation {
        shares,
        cost,
        commission,
    })
}

/// Cash needed for one assumed lot including commission.
pub fn lot_cost(price: Money, commission_pct: Decimal) -> Money {
    let value = price * Decimal::from(ASSUMED_LOT_SHARES);
    value + value * commission_pct
}

/// Initial `(stop_loss, take_profit)` for a long entry at `price`.
pub fn protective_levels(
    price: Money,
    stop_loss_pct: Decimal,
    take_profit_pct: Decimal,
) -> (Money, Money) {
    (
        price * (Decimal::ONE - stop_loss_pct),
        price * (Decimal::ONE + take_profit_pct),
    )
}

pub fn lowest_low(bars: &[PriceBar]) -> Option<Money> {
    bars.iter().map(|bar| bar.low).min()
}

pub fn highest_high(bars: &[PriceBar]) -> Option<Money> {
    bars.iter().map(|bar| bar.high).max()
}

pub fn is_breakout(price: Money, prior_high: Money) -> bool {
    price > prior_high * BREAKOUT_MARGIN
}

pub fn is_support_reclaim(price: Money, support: Money, recent_low: Money) -> bool {
    recent_low < support && price > support * RECLAIM_MARGIN
}

pub fn near_resistance(price: Money, resistance: Money) -> bool {
    price >= resistance * RESISTANCE_PROXIMITY
}

pub fn meets_confidence_threshold(confidence: f64, min_confidence: f64) -> bool {
    confidence >= min_confidence
}
