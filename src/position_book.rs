use crate::config::BacktestConfig;
use crate::feeds::PriceFeed;
use crate::models::{EntryReason, ExitReason, Money, Position, Trade};
use crate::trading_rules::{
    determine_position_size, lot_cost, PositionSizingOutcome, PositionSizingParams,
};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;

/// Why `open_position` left the book untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenRejection {
    AlreadyHeld,
    AtCapacity,
    InvalidPrice,
    InvalidLevels,
    InsufficientCash { required: Money, available: Money },
    TooSmall,
}

impl fmt::Display for OpenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenRejection::AlreadyHeld => f.write_str("position already open"),
            OpenRejection::AtCapacity => f.write_str("max positions reached"),
            OpenRejection::InvalidPrice => f.write_str("price must be positive"),
            OpenRejection::InvalidLevels => {
                f.write_str("stop loss and take profit must bracket the entry price")
            }
            OpenRejection::InsufficientCash {
                required,
                available,
            } => write!(f, "need {:.2}, have {:.2}", required, available),
            OpenRejection::TooSmall => f.write_str("allocation buys zero shares"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened { shares: u64, commission: Money },
    Rejected(OpenRejection),
}

impl OpenOutcome {
    pub fn is_opened(&self) -> bool {
        matches!(self, OpenOutcome::Opened { .. })
    }
}

/// Entry request handed to [`PositionBook::open_position`].
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    pub ticker: &'a str,
    pub date: NaiveDate,
    pub price: Money,
    pub reason: EntryReason,
    pub stop_loss: Money,
    pub take_profit: Money,
    pub confidence: f64,
}

/// Cash, open positions and the closed-trade ledger for a single run.
///
/// Every mutating call either applies fully or leaves the book unchanged. Positions are
/// keyed by ticker in a `BTreeMap`, so iteration is always in ticker order.
#[derive(Debug)]
pub struct PositionBook {
    starting_capital: Money,
    position_size_pct: Decimal,
    commission_pct: Decimal,
    trailing_stop_pct: Decimal,
    max_positions: usize,
    cash: Money,
    positions: BTreeMap<String, Position>,
    trades: Vec<Trade>,
    commission_paid: Money,
}

impl PositionBook {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            starting_capital: config.starting_capital,
            position_size_pct: config.position_size_pct,
            commission_pct: config.commission_pct,
            trailing_stop_pct: config.strategy.trailing_stop_pct,
            max_positions: config.max_positions,
            cash: config.starting_capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            commission_paid: Decimal::ZERO,
        }
    }

    pub fn cash(&self) -> Money {
        self.cash
    }

    pub fn starting_capital(&self) -> Money {
        self.starting_capital
    }

    pub fn commission_paid(&self) -> Money {
        self.commission_paid
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.positions.len() < self.max_positions
    }

    pub fn holds(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(ticker)
    }

    /// Held tickers in lexical order.
    pub fn held_tickers(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<Trade> {
        self.trades
    }

    /// Capacity plus a round-lot affordability check.
    pub fn can_open(&self, price: Money) -> bool {
        self.has_capacity() && self.cash >= lot_cost(price, self.commission_pct)
    }

    pub fn open_position(&mut self, request: OpenRequest<'_>) -> OpenOutcome {
        let OpenRequest {
            ticker,
            date,
            price,
            reason,
            stop_loss,
            take_profit,
            confidence,
        } = request;

        if self.holds(ticker) {
            return OpenOutcome::Rejected(OpenRejection::AlreadyHeld);
        }
        if !self.has_capacity() {
            return OpenOutcome::Rejected(OpenRejection::AtCapacity);
        }
        if price <= Decimal::ZERO {
            return OpenOutcome::Rejected(OpenRejection::InvalidPrice);
        }
        if !(stop_loss < price && price < take_profit) {
            return OpenOutcome::Rejected(OpenRejection::InvalidLevels);
        }
        if !self.can_open(price) {
            return OpenOutcome::Rejected(OpenRejection::InsufficientCash {
                required: lot_cost(price, self.commission_pct),
                available: self.cash,
            });
        }

        let allocation = match determine_position_size(PositionSizingParams {
            price,
            available_cash: self.cash,
            position_size_pct: self.position_size_pct,
            commission_pct: self.commission_pct,
        }) {
            PositionSizingOutcome::Sized(allocation) => allocation,
            PositionSizingOutcome::TooSmall => {
                return OpenOutcome::Rejected(OpenRejection::TooSmall)
            }
            PositionSizingOutcome::InsufficientCash { required } => {
                return OpenOutcome::Rejected(OpenRejection::InsufficientCash {
                    required,
                    available: self.cash,
                })
            }
        };

        self.cash -= allocation.total_debit();
        self.commission_paid += allocation.commission;
        self.positions.insert(
            ticker.to_string(),
            Position {
                ticker: ticker.to_string(),
                entry_date: date,
                entry_price: price,
                entry_reason: reason,
                shares: allocation.shares,
                stop_loss,
                take_profit,
                trailing_stop_pct: self.trailing_stop_pct,
                highest_price: None,
                entry_commission: allocation.commission,
                confidence,
            },
        );
        self.debug_check_invariants();

        OpenOutcome::Opened {
            shares: allocation.shares,
            commission: allocation.commission,
        }
    }

    /// Ratchet the trailing stop of a held position. Returns the resulting stop.
    pub fn update_trailing_stop(&mut self, ticker: &str, current_price: Money) -> Option<Money> {
        self.positions
            .get_mut(ticker)
            .map(|position| position.update_trailing_stop(current_price))
    }

    pub fn close_position(
        &mut self,
        ticker: &str,
        date: NaiveDate,
        price: Money,
        exit_reason: ExitReason,
    ) -> Option<Trade> {
        let position = self.positions.remove(ticker)?;

        let shares = Decimal::from(position.shares);
        let proceeds = price * shares;
        let exit_commission = proceeds * self.commission_pct;
        let cost_basis = position.cost_basis();
        let profit_loss = proceeds - cost_basis - position.entry_commission - exit_commission;
        let profit_pct = (profit_loss / cost_basis * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);

        self.cash += proceeds - exit_commission;
        self.commission_paid += exit_commission;

        let trade = Trade {
            ticker: position.ticker,
            entry_date: position.entry_date,
            exit_date: date,
            entry_price: position.entry_price,
            exit_price: price,
            shares: position.shares,
            entry_reason: position.entry_reason,
            exit_reason,
            profit_loss,
            profit_pct,
            holding_days: (date - position.entry_date).num_days(),
            confidence: position.confidence,
            entry_commission: position.entry_commission,
            exit_commission,
        };
        self.trades.push(trade.clone());
        self.debug_check_invariants();

        Some(trade)
    }

    /// Cash plus open positions marked at `date`. Tickers without a price that day are
    /// left out of the valuation rather than marked stale.
    pub fn portfolio_value(&self, prices: &dyn PriceFeed, date: NaiveDate) -> Money {
        self.positions
            .values()
            .filter_map(|position| {
                prices
                    .get_price(&position.ticker, date)
                    .map(|price| price * Decimal::from(position.shares))
            })
            .fold(self.cash, |total, value| total + value)
    }

    /// `starting_capital - (cash + open cost and entry fees - realized P&L)`; zero while
    /// the books balance.
    pub fn conservation_residual(&self) -> Money {
        let open_outlay: Money = self
            .positions
            .values()
            .map(|position| position.cost_basis() + position.entry_commission)
            .sum();
        let realized: Money = self.trades.iter().map(|trade| trade.profit_loss).sum();
        self.starting_capital - (self.cash + open_outlay - realized)
    }

    /// `commission_paid` minus the fees recorded on trades and open positions; zero while
    /// the books balance.
    pub fn commission_residual(&self) -> Money {
        let closed: Money = self
            .trades
            .iter()
            .map(|trade| trade.entry_commission + trade.exit_commission)
            .sum();
        let open: Money = self
            .positions
            .values()
            .map(|position| position.entry_commission)
            .sum();
        self.commission_paid - closed - open
    }

    fn debug_check_invariants(&self) {
        debug_assert!(self.positions.len() <= self.max_positions);
        debug_assert_eq!(self.conservation_residual(), Decimal::ZERO);
        debug_assert_eq!(self.commission_residual(), Decimal::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceBar;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct FixedPrices(HashMap<&'static str, Money>);

    impl PriceFeed for FixedPrices {
        fn get_price(&self, ticker: &str, _date: NaiveDate) -> Option<Money> {
            self.0.get(ticker).copied()
        }

        fn bars_before(&self, _ticker: &str, _date: NaiveDate, _window: i64) -> Vec<PriceBar> {
            Vec::new()
        }
    }

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(offset)
    }

    fn request(ticker: &str, price: Money) -> OpenRequest<'_> {
        OpenRequest {
            ticker,
            date: day(0),
            price,
            reason: EntryReason::BreakoutHigh,
            stop_loss: price * dec!(0.92),
            take_profit: price * dec!(1.15),
            confidence: 0.65,
        }
    }

    fn assert_balanced(book: &PositionBook) {
        assert_eq!(book.conservation_residual(), Decimal::ZERO);
        assert_eq!(book.commission_residual(), Decimal::ZERO);
        assert!(book.open_count() <= book.max_positions);
    }

    #[test]
    fn opening_debits_cost_and_commission() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        let outcome = book.open_position(request("AAA", dec!(50)));

        assert_eq!(
            outcome,
            OpenOutcome::Opened {
                shares: 200,
                commission: dec!(10)
            }
        );
        assert_eq!(book.cash(), dec!(89990));
        assert_eq!(book.commission_paid(), dec!(10));
        let position = book.position("AAA").unwrap();
        assert_eq!(position.shares, 200);
        assert_eq!(position.cost_basis(), dec!(10000));
        assert_balanced(&book);
    }

    #[test]
    fn rejects_duplicate_ticker_without_side_effects() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        assert!(book.open_position(request("AAA", dec!(50))).is_opened());
        let cash = book.cash();

        let outcome = book.open_position(request("AAA", dec!(40)));
        assert_eq!(outcome, OpenOutcome::Rejected(OpenRejection::AlreadyHeld));
        assert_eq!(book.cash(), cash);
        assert_eq!(book.open_count(), 1);
        assert_balanced(&book);
    }

    #[test]
    fn rejects_when_at_capacity() {
        let config = BacktestConfig {
            max_positions: 2,
            ..BacktestConfig::default()
        };
        let mut book = PositionBook::new(&config);
        assert!(book.open_position(request("AAA", dec!(10))).is_opened());
        assert!(book.open_position(request("BBB", dec!(10))).is_opened());
        let cash = book.cash();

        let outcome = book.open_position(request("CCC", dec!(10)));
        assert_eq!(outcome, OpenOutcome::Rejected(OpenRejection::AtCapacity));
        assert_eq!(book.cash(), cash);
        assert_eq!(book.open_count(), 2);
    }

    #[test]
    fn rejects_when_round_lot_is_unaffordable() {
        let config = BacktestConfig {
            starting_capital: dec!(1000),
            ..BacktestConfig::default()
        };
        let mut book = PositionBook::new(&config);
        assert!(!book.can_open(dec!(20)));

        let outcome = book.open_position(request("AAA", dec!(20)));
        assert!(matches!(
            outcome,
            OpenOutcome::Rejected(OpenRejection::InsufficientCash { .. })
        ));
        assert_eq!(book.cash(), dec!(1000));
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn rejects_zero_share_allocation() {
        let config = BacktestConfig {
            starting_capital: dec!(100000),
            position_size_pct: dec!(0.001),
            ..BacktestConfig::default()
        };
        let mut book = PositionBook::new(&config);
        let outcome = book.open_position(request("AAA", dec!(500)));
        assert_eq!(outcome, OpenOutcome::Rejected(OpenRejection::TooSmall));
        assert_eq!(book.cash(), dec!(100000));
    }

    #[test]
    fn rejects_levels_that_do_not_bracket_entry() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        let mut bad = request("AAA", dec!(50));
        bad.stop_loss = dec!(55);
        assert_eq!(
            book.open_position(bad),
            OpenOutcome::Rejected(OpenRejection::InvalidLevels)
        );
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn closing_realizes_pnl_net_of_both_commissions() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        assert!(book.open_position(request("AAA", dec!(50))).is_opened());

        let trade = book
            .close_position("AAA", day(10), dec!(55), ExitReason::TakeProfit)
            .unwrap();

        // proceeds 11000, exit fee 11, entry fee 10
        assert_eq!(trade.profit_loss, dec!(979));
        assert_eq!(trade.exit_commission, dec!(11));
        assert_eq!(trade.holding_days, 10);
        assert!((trade.profit_pct - 9.79).abs() < 1e-9);
        assert_eq!(trade.confidence, 0.65);
        assert_eq!(book.cash(), dec!(89990) + dec!(11000) - dec!(11));
        assert_eq!(book.commission_paid(), dec!(21));
        assert_eq!(book.open_count(), 0);
        assert_eq!(book.trades().len(), 1);
        assert_balanced(&book);
    }

    #[test]
    fn closing_unknown_ticker_is_a_no_op() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        assert!(book
            .close_position("ZZZ", day(1), dec!(10), ExitReason::StopLoss)
            .is_none());
        assert!(book.trades().is_empty());
        assert_eq!(book.cash(), dec!(100000));
    }

    #[test]
    fn round_trip_at_same_price_without_commission_is_neutral() {
        let config = BacktestConfig {
            commission_pct: Decimal::ZERO,
            ..BacktestConfig::default()
        };
        let mut book = PositionBook::new(&config);
        assert!(book.open_position(request("AAA", dec!(37.13))).is_opened());
        let trade = book
            .close_position("AAA", day(0), dec!(37.13), ExitReason::TimeExit)
            .unwrap();
        assert_eq!(trade.profit_loss, Decimal::ZERO);
        assert_eq!(book.cash(), dec!(100000));
    }

    #[test]
    fn books_stay_balanced_across_a_sequence_of_operations() {
        let config = BacktestConfig {
            max_positions: 3,
            commission_pct: dec!(0.0025),
            ..BacktestConfig::default()
        };
        let mut book = PositionBook::new(&config);
        let steps: Vec<(&str, Option<Money>, Money)> = vec![
            ("AAA", None, dec!(12.34)),
            ("BBB", None, dec!(77.7)),
            ("AAA", Some(dec!(13.01)), dec!(0)),
            ("CCC", None, dec!(3.33)),
            ("DDD", None, dec!(250)),
            ("BBB", Some(dec!(70.05)), dec!(0)),
            ("EEE", None, dec!(41.5)),
            ("FFF", None, dec!(9.99)),
        ];

        for (ticker, exit_price, entry_price) in steps {
            match exit_price {
                Some(price) => {
                    book.close_position(ticker, day(3), price, ExitReason::StopLoss);
                }
                None => {
                    book.open_position(request(ticker, entry_price));
                }
            }
            assert_balanced(&book);
        }
        assert_eq!(book.open_count(), 3);
        assert_eq!(book.held_tickers(), vec!["CCC", "DDD", "EEE"]);
    }

    #[test]
    fn portfolio_value_skips_missing_prices() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        assert!(book.open_position(request("AAA", dec!(50))).is_opened());
        assert!(book.open_position(request("BBB", dec!(20))).is_opened());

        let mut prices = HashMap::new();
        prices.insert("AAA", dec!(60));
        let value = book.portfolio_value(&FixedPrices(prices), day(1));

        assert_eq!(value, book.cash() + dec!(60) * dec!(200));
    }

    #[test]
    fn trailing_stop_updates_through_the_book() {
        let mut book = PositionBook::new(&BacktestConfig::default());
        assert!(book.open_position(request("AAA", dec!(100))).is_opened());

        assert_eq!(book.update_trailing_stop("AAA", dec!(120)), Some(dec!(114.00)));
        assert_eq!(book.update_trailing_stop("AAA", dec!(110)), Some(dec!(114.00)));
        assert_eq!(book.update_trailing_stop("ZZZ", dec!(110)), None);
    }
}
