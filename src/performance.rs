use crate::models::*;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Standard deviations at or below this are treated as zero.
const STD_DEV_EPSILON: f64 = 1e-12;

/// Everything a finished run hands over for scoring.
pub struct PerformanceInputs {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub starting_capital: Money,
    pub ending_capital: Money,
    pub total_commission: Money,
    pub risk_free_rate: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate_performance(inputs: PerformanceInputs) -> BacktestResults {
        let PerformanceInputs {
            start_date,
            end_date,
            starting_capital,
            ending_capital,
            total_commission,
            risk_free_rate,
            trades,
            equity_curve,
        } = inputs;

        let (winners, losers): (Vec<&Trade>, Vec<&Trade>) =
            trades.iter().partition(|trade| trade.is_winner());
        let total_trades = trades.len();
        let win_rate = if total_trades > 0 {
            winners.len() as f64 / total_trades as f64
        } else {
            0.0
        };

        let gross_profit: Money = winners.iter().map(|trade| trade.profit_loss).sum();
        let gross_loss: Money = losers.iter().map(|trade| trade.profit_loss).sum();

        let total_return = ending_capital - starting_capital;
        let total_return_pct = if starting_capital > Decimal::ZERO {
            to_f64(total_return / starting_capital * Decimal::ONE_HUNDRED)
        } else {
            0.0
        };

        let holding_days: Vec<f64> = trades
            .iter()
            .map(|trade| trade.holding_days as f64)
            .collect();

        let returns = Self::daily_returns(&equity_curve);
        let drawdown = Self::calculate_max_drawdown(&equity_curve);

        BacktestResults {
            start_date,
            end_date,
            starting_capital,
            ending_capital,
            total_return,
            total_return_pct,
            total_trades,
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            win_rate,
            avg_profit: Self::average_money(gross_profit, winners.len()),
            avg_loss: Self::average_money(gross_loss, losers.len()),
            profit_factor: Self::profit_factor(gross_profit, gross_loss),
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_date: drawdown.max_drawdown_date,
            sharpe_ratio: Self::calculate_sharpe_ratio(&returns, risk_free_rate),
            sortino_ratio: Self::calculate_sortino_ratio(&returns, risk_free_rate),
            avg_holding_days: Self::average(&holding_days),
            total_commission,
            trades,
            equity_curve,
        }
    }

    /// Simple returns between consecutive equity points; 0 when the prior value is not
    /// positive.
    pub fn daily_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .map(|window| {
                let prev_value = window[0].portfolio_value;
                let curr_value = window[1].portfolio_value;
                if prev_value > Decimal::ZERO {
                    to_f64((curr_value - prev_value) / prev_value)
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub fn calculate_sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
        let Some(std_dev) = Self::usable_std_dev(returns) else {
            return 0.0;
        };
        Self::annualized_excess(returns, risk_free_rate) / (std_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }

    /// Like Sharpe but penalizing only downside volatility. Infinite when no day lost money.
    pub fn calculate_sortino_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.is_empty() {
            return f64::INFINITY;
        }
        let Some(downside_std) = Self::usable_std_dev(&downside) else {
            return 0.0;
        };
        Self::annualized_excess(returns, risk_free_rate)
            / (downside_std * TRADING_DAYS_PER_YEAR.sqrt())
    }

    pub fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> DrawdownInfo {
        let Some(first) = equity_curve.first() else {
            return DrawdownInfo {
                max_drawdown: 0.0,
                max_drawdown_date: None,
            };
        };

        let mut peak_value = first.portfolio_value;
        let mut max_drawdown = Decimal::ZERO;
        let mut max_drawdown_date = None;

        for point in equity_curve {
            if point.portfolio_value > peak_value {
                peak_value = point.portfolio_value;
            }
            if peak_value <= Decimal::ZERO {
                continue;
            }
            let drawdown = (peak_value - point.portfolio_value) / peak_value;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                max_drawdown_date = Some(point.date);
            }
        }

        DrawdownInfo {
            max_drawdown: to_f64(max_drawdown),
            max_drawdown_date,
        }
    }

    pub fn profit_factor(gross_profit: Money, gross_loss: Money) -> f64 {
        if gross_loss.is_zero() {
            return 0.0;
        }
        to_f64(gross_profit / gross_loss.abs())
    }

    fn annualized_excess(returns: &[f64], risk_free_rate: f64) -> f64 {
        returns.mean() * TRADING_DAYS_PER_YEAR - risk_free_rate
    }

    /// Sample standard deviation, or `None` when it is undefined or effectively zero.
    fn usable_std_dev(values: &[f64]) -> Option<f64> {
        if values.len() < 2 {
            return None;
        }
        let std_dev = values.std_dev();
        (std_dev.is_finite() && std_dev > STD_DEV_EPSILON).then_some(std_dev)
    }

    fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn average_money(total: Money, count: usize) -> Money {
        if count == 0 {
            Decimal::ZERO
        } else {
            total / Decimal::from(count)
        }
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(offset)
    }

    fn curve(values: &[Decimal]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| EquityPoint {
                date: day(i as i64),
                portfolio_value: *value,
            })
            .collect()
    }

    fn trade(ticker: &str, profit_loss: Decimal, holding_days: i64) -> Trade {
        Trade {
            ticker: ticker.to_string(),
            entry_date: day(0),
            exit_date: day(holding_days),
            entry_price: dec!(10),
            exit_price: dec!(10),
            shares: 100,
            entry_reason: EntryReason::BreakoutHigh,
            exit_reason: ExitReason::TakeProfit,
            profit_loss,
            profit_pct: 0.0,
            holding_days,
            confidence: 0.6,
            entry_commission: dec!(1),
            exit_commission: dec!(1),
        }
    }

    fn inputs(trades: Vec<Trade>, equity_curve: Vec<EquityPoint>) -> PerformanceInputs {
        PerformanceInputs {
            start_date: day(0),
            end_date: day(equity_curve.len().saturating_sub(1) as i64),
            starting_capital: dec!(100000),
            ending_capital: equity_curve
                .last()
                .map(|p| p.portfolio_value)
                .unwrap_or(dec!(100000)),
            total_commission: dec!(0),
            risk_free_rate: 0.02,
            trades,
            equity_curve,
        }
    }

    #[test]
    fn max_drawdown_reports_first_trough_after_peak() {
        let info = PerformanceCalculator::calculate_max_drawdown(&curve(&[
            dec!(100),
            dec!(120),
            dec!(90),
            dec!(110),
        ]));
        assert!((info.max_drawdown - 0.25).abs() < 1e-12);
        assert_eq!(info.max_drawdown_date, Some(day(2)));
    }

    #[test]
    fn drawdown_keeps_earliest_date_on_ties() {
        let info = PerformanceCalculator::calculate_max_drawdown(&curve(&[
            dec!(100),
            dec!(80),
            dec!(100),
            dec!(80),
        ]));
        assert!((info.max_drawdown - 0.2).abs() < 1e-12);
        assert_eq!(info.max_drawdown_date, Some(day(1)));
    }

    #[test]
    fn monotone_curve_has_no_drawdown() {
        let info =
            PerformanceCalculator::calculate_max_drawdown(&curve(&[dec!(100), dec!(101), dec!(105)]));
        assert_eq!(info.max_drawdown, 0.0);
        assert_eq!(info.max_drawdown_date, None);
    }

    #[test]
    fn constant_returns_give_zero_sharpe() {
        let returns = PerformanceCalculator::daily_returns(&curve(&[
            dec!(100),
            dec!(101),
            dec!(102.01),
            dec!(103.0301),
        ]));
        assert_eq!(returns.len(), 3);
        assert_eq!(PerformanceCalculator::calculate_sharpe_ratio(&returns, 0.02), 0.0);
    }

    #[test]
    fn sharpe_matches_hand_computation() {
        let returns = vec![0.01, -0.005, 0.02, 0.0];
        let mean = 0.00625;
        let variance = [0.01, -0.005, 0.02, 0.0]
            .iter()
            .map(|r: &f64| (r - mean).powi(2))
            .sum::<f64>()
            / 3.0;
        let expected = (mean * 252.0 - 0.02) / (variance.sqrt() * 252.0_f64.sqrt());
        let sharpe = PerformanceCalculator::calculate_sharpe_ratio(&returns, 0.02);
        assert!((sharpe - expected).abs() < 1e-9);
    }

    #[test]
    fn sharpe_needs_two_returns() {
        assert_eq!(PerformanceCalculator::calculate_sharpe_ratio(&[], 0.02), 0.0);
        assert_eq!(PerformanceCalculator::calculate_sharpe_ratio(&[0.03], 0.02), 0.0);
    }

    #[test]
    fn sortino_is_infinite_without_losing_days() {
        let returns = vec![0.01, 0.02, 0.0];
        assert_eq!(
            PerformanceCalculator::calculate_sortino_ratio(&returns, 0.02),
            f64::INFINITY
        );
    }

    #[test]
    fn sortino_with_single_losing_day_is_zero() {
        let returns = vec![0.01, -0.02, 0.03];
        assert_eq!(PerformanceCalculator::calculate_sortino_ratio(&returns, 0.02), 0.0);
    }

    #[test]
    fn sortino_uses_downside_deviation() {
        let returns = vec![0.02, -0.01, 0.015, -0.03];
        let mean = returns.iter().sum::<f64>() / 4.0;
        let downside_mean = -0.02;
        let downside_var: f64 = ((-0.01f64 - downside_mean).powi(2)
            + (-0.03f64 - downside_mean).powi(2))
            / 1.0;
        let expected = (mean * 252.0 - 0.02) / (downside_var.sqrt() * 252.0_f64.sqrt());
        let sortino = PerformanceCalculator::calculate_sortino_ratio(&returns, 0.02);
        assert!((sortino - expected).abs() < 1e-9);
    }

    #[test]
    fn winners_only_give_infinite_sortino_and_zero_profit_factor() {
        let equity = curve(&[dec!(100000), dec!(100500), dec!(101000)]);
        let results = PerformanceCalculator::calculate_performance(inputs(
            vec![trade("AAA", dec!(500), 4), trade("BBB", dec!(500), 8)],
            equity,
        ));

        assert_eq!(results.total_trades, 2);
        assert_eq!(results.winning_trades, 2);
        assert_eq!(results.losing_trades, 0);
        assert!((results.win_rate - 1.0).abs() < 1e-12);
        assert_eq!(results.profit_factor, 0.0);
        assert_eq!(results.sortino_ratio, f64::INFINITY);
        assert_eq!(results.avg_profit, dec!(500));
        assert_eq!(results.avg_loss, dec!(0));
        assert!((results.avg_holding_days - 6.0).abs() < 1e-12);
        assert_eq!(results.total_return, dec!(1000));
        assert!((results.total_return_pct - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mixed_ledger_statistics() {
        let equity = curve(&[dec!(100000), dec!(99000), dec!(100600)]);
        let results = PerformanceCalculator::calculate_performance(inputs(
            vec![
                trade("AAA", dec!(1200), 3),
                trade("BBB", dec!(-400), 5),
                trade("CCC", dec!(0), 1),
            ],
            equity,
        ));

        assert_eq!(results.winning_trades, 1);
        assert_eq!(results.losing_trades, 2);
        assert!((results.win_rate - 1.0 / 3.0).abs() < 1e-12);
        assert!((results.profit_factor - 3.0).abs() < 1e-12);
        assert_eq!(results.avg_profit, dec!(1200));
        assert_eq!(results.avg_loss, dec!(-200));
        assert!((results.max_drawdown - 0.01).abs() < 1e-12);
        assert_eq!(results.max_drawdown_date, Some(day(1)));
    }

    #[test]
    fn empty_run_reports_zeroes() {
        let results = PerformanceCalculator::calculate_performance(inputs(
            Vec::new(),
            curve(&[dec!(100000)]),
        ));
        assert_eq!(results.total_trades, 0);
        assert_eq!(results.win_rate, 0.0);
        assert_eq!(results.profit_factor, 0.0);
        assert_eq!(results.sharpe_ratio, 0.0);
        assert_eq!(results.sortino_ratio, 0.0);
        assert_eq!(results.avg_holding_days, 0.0);
        assert_eq!(results.total_return, dec!(0));
    }
}
