use crate::config::BacktestConfig;
use crate::error::{BacktestError, ConfigError};
use crate::feeds::{IndicatorFeed, PredictionOracle, PriceFeed};
use crate::models::BacktestResults;
use crate::simulator::Simulator;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use rayon::prelude::*;
use std::collections::HashMap;

/// One configuration to evaluate in a sweep.
#[derive(Debug, Clone)]
pub struct SweepCase {
    pub label: String,
    pub config: BacktestConfig,
}

#[derive(Debug)]
pub struct SweepOutcome {
    pub label: String,
    pub result: Result<BacktestResults, BacktestError>,
}

/// Stable, key-sorted label for a parameter overlay.
pub fn parameter_signature(parameters: &HashMap<String, f64>) -> String {
    let mut sorted: Vec<_> = parameters.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a `name=v1,v2,...` grid axis.
pub fn parse_grid_axis(raw: &str) -> Result<(String, Vec<f64>)> {
    let (name, values) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Grid axis '{}' must look like name=v1,v2", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Grid axis '{}' has no parameter name", raw));
    }
    let values = values
        .split(',')
        .map(|value| {
            value
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Invalid value '{}' for grid axis {}", value, name))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.is_empty() {
        return Err(anyhow!("Grid axis {} has no values", name));
    }
    Ok((name.to_string(), values))
}

/// Cartesian product of the axes, in axis order.
pub fn expand_grid(axes: &[(String, Vec<f64>)]) -> Vec<HashMap<String, f64>> {
    axes.iter().fold(vec![HashMap::new()], |combinations, (name, values)| {
        combinations
            .iter()
            .flat_map(|base| {
                values.iter().map(move |value| {
                    let mut next = base.clone();
                    next.insert(name.clone(), *value);
                    next
                })
            })
            .collect()
    })
}

/// Overlay each parameter set on `base`; any invalid combination fails the whole grid.
pub fn cases_from_grid(
    base: &BacktestConfig,
    grid: &[HashMap<String, f64>],
) -> Result<Vec<SweepCase>, ConfigError> {
    grid.iter()
        .map(|parameters| {
            Ok(SweepCase {
                label: parameter_signature(parameters),
                config: base.with_parameters(parameters)?,
            })
        })
        .collect()
}

/// Run every case in parallel. Each case gets its own simulator, so results only depend
/// on the case and the shared read-only data. Output order matches `cases`.
pub fn run_sweep<M>(
    data: &M,
    cases: &[SweepCase],
    tickers: &[String],
    trading_days: &[NaiveDate],
) -> Vec<SweepOutcome>
where
    M: PriceFeed + IndicatorFeed + PredictionOracle + Sync,
{
    info!(
        "Running {} sweep cases over {} trading days",
        cases.len(),
        trading_days.len()
    );
    cases
        .par_iter()
        .map(|case| {
            let result = Simulator::new(case.config.clone(), data, data)
                .map(|simulator| simulator.with_oracle(data))
                .and_then(|simulator| simulator.run(tickers, trading_days));
            if let Err(err) = &result {
                warn!("Sweep case {} failed: {}", case.label, err);
            }
            SweepOutcome {
                label: case.label.clone(),
                result,
            }
        })
        .collect()
}

fn objective_score(results: &BacktestResults) -> f64 {
    if results.sharpe_ratio.is_finite() {
        results.sharpe_ratio
    } else {
        f64::NEG_INFINITY
    }
}

/// Highest Sharpe ratio among runs whose max drawdown stays within `max_drawdown`.
pub fn best_outcome(outcomes: &[SweepOutcome], max_drawdown: f64) -> Option<&SweepOutcome> {
    outcomes
        .iter()
        .filter(|outcome| {
            outcome.result.as_ref().map_or(false, |results| {
                results.max_drawdown.is_finite() && results.max_drawdown <= max_drawdown
            })
        })
        .max_by(|a, b| {
            let score = |outcome: &SweepOutcome| {
                outcome
                    .result
                    .as_ref()
                    .map_or(f64::NEG_INFINITY, objective_score)
            };
            score(a).total_cmp(&score(b))
        })
}
