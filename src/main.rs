use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use signal_backtest::config::{BacktestConfig, SETTING_KEYS};
use signal_backtest::market_data::MarketData;
use signal_backtest::models::BacktestResults;
use signal_backtest::simulator::Simulator;
use signal_backtest::sweep::{
    best_outcome, cases_from_grid, expand_grid, parse_grid_axis, run_sweep,
};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "signal_backtest")]
#[command(about = "Day-by-day backtester for signal-driven long-only equity strategies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the market data snapshot file (.json or bincode)
    #[arg(long = "data-file", value_name = "PATH")]
    data_file: Option<PathBuf>,
    /// Comma separated tickers to trade (defaults to every ticker in the snapshot)
    #[arg(long, value_delimiter = ',')]
    tickers: Vec<String>,
    /// First trading day to simulate (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Last trading day to simulate (YYYY-MM-DD)
    #[arg(long)]
    end: Option<NaiveDate>,
    /// Write results as JSON to this path
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest with settings from the snapshot and environment
    Backtest {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Evaluate a parameter grid in parallel
    Sweep {
        #[command(flatten)]
        run: RunArgs,
        /// Grid axis as name=v1,v2 (repeatable), e.g. stopLossPct=0.05,0.08
        #[arg(long = "grid", value_name = "AXIS", required = true)]
        grid: Vec<String>,
        /// Ignore runs whose max drawdown ratio exceeds this when picking the best case
        #[arg(long, default_value_t = 0.5)]
        max_drawdown: f64,
        /// Worker threads for the sweep (defaults to one per logical CPU)
        #[arg(long)]
        threads: Option<usize>,
    },
}

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting backtester. Simulated results are not a guarantee of future returns.");

    match command {
        Commands::Backtest { run } => run_backtest(run),
        Commands::Sweep {
            run,
            grid,
            max_drawdown,
            threads,
        } => run_parameter_sweep(run, &grid, max_drawdown, threads),
    }
}

struct LoadedRun {
    data: MarketData,
    config: BacktestConfig,
    tickers: Vec<String>,
    trading_days: Vec<NaiveDate>,
}

fn load_run(args: &RunArgs) -> Result<LoadedRun> {
    let data_path = resolve_market_data_path(args.data_file.clone());
    let data = MarketData::load_from_file(&data_path)?;

    let settings = merged_settings(data.settings());
    let config = BacktestConfig::from_settings_map(&settings)
        .context("Invalid backtest configuration")?;

    let available = data.tickers();
    let tickers = if args.tickers.is_empty() {
        available
    } else {
        let requested: Vec<String> = args
            .tickers
            .iter()
            .map(|ticker| ticker.trim().to_ascii_uppercase())
            .filter(|ticker| !ticker.is_empty())
            .collect();
        for ticker in &requested {
            if !available.contains(ticker) {
                warn!("Ticker {} has no data in the snapshot", ticker);
            }
        }
        requested
    };
    if tickers.is_empty() {
        return Err(anyhow!("No tickers to backtest"));
    }

    let trading_days = data.trading_days_between(args.start, args.end)?;
    Ok(LoadedRun {
        data,
        config,
        tickers,
        trading_days,
    })
}

/// Snapshot settings overridden by any matching environment variables.
fn merged_settings(snapshot_settings: &HashMap<String, String>) -> HashMap<String, String> {
    let mut settings = snapshot_settings.clone();
    for key in SETTING_KEYS {
        if let Ok(value) = env::var(key) {
            settings.insert(key.to_string(), value);
        }
    }
    settings
}

fn run_backtest(args: RunArgs) -> Result<()> {
    let LoadedRun {
        data,
        config,
        tickers,
        trading_days,
    } = load_run(&args)?;

    let results = Simulator::new(config, &data, &data)?
        .with_oracle(&data)
        .run(&tickers, &trading_days)?;
    log_summary("Backtest", &results);

    if let Some(path) = args.output.as_deref() {
        write_json(path, &results)?;
    }
    Ok(())
}

fn run_parameter_sweep(
    args: RunArgs,
    grid: &[String],
    max_drawdown: f64,
    threads: Option<usize>,
) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to configure sweep thread pool")?;
    }

    let axes = grid
        .iter()
        .map(|raw| parse_grid_axis(raw))
        .collect::<Result<Vec<_>>>()?;
    let LoadedRun {
        data,
        config,
        tickers,
        trading_days,
    } = load_run(&args)?;
    let cases = cases_from_grid(&config, &expand_grid(&axes))
        .context("Sweep grid produced an invalid configuration")?;

    let outcomes = run_sweep(&data, &cases, &tickers, &trading_days);
    for outcome in &outcomes {
        match &outcome.result {
            Ok(results) => info!(
                "{}: return {:.2}% | sharpe {:.3} | max drawdown {:.1}% | trades {}",
                outcome.label,
                results.total_return_pct,
                results.sharpe_ratio,
                results.max_drawdown * 100.0,
                results.total_trades
            ),
            Err(err) => warn!("{}: failed ({})", outcome.label, err),
        }
    }

    let best = best_outcome(&outcomes, max_drawdown);
    match best {
        Some(outcome) => {
            info!("Best case: {}", outcome.label);
            if let Ok(results) = &outcome.result {
                log_summary("Best case", results);
            }
        }
        None => warn!(
            "No sweep case kept max drawdown at or below {:.0}%",
            max_drawdown * 100.0
        ),
    }

    if let Some(path) = args.output.as_deref() {
        let records: Vec<SweepRecord> = outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.result.as_ref().ok().map(|results| SweepRecord {
                    label: &outcome.label,
                    results,
                })
            })
            .collect();
        write_json(path, &records)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct SweepRecord<'a> {
    label: &'a str,
    results: &'a BacktestResults,
}

fn log_summary(title: &str, results: &BacktestResults) {
    info!(
        "{} {} to {}: {:.2} -> {:.2} ({:+.2}%)",
        title,
        results.start_date,
        results.end_date,
        results.starting_capital,
        results.ending_capital,
        results.total_return_pct
    );
    info!(
        "Trades: {} ({} won, {} lost) | win rate {:.1}% | profit factor {:.2}",
        results.total_trades,
        results.winning_trades,
        results.losing_trades,
        results.win_rate * 100.0,
        results.profit_factor
    );
    info!(
        "Avg profit {:.2} | avg loss {:.2} | avg hold {:.1}d | commission {:.2}",
        results.avg_profit,
        results.avg_loss,
        results.avg_holding_days,
        results.total_commission
    );
    info!(
        "Max drawdown {:.2}%{} | sharpe {:.3} | sortino {:.3}",
        results.max_drawdown * 100.0,
        results
            .max_drawdown_date
            .map(|date| format!(" on {}", date))
            .unwrap_or_default(),
        results.sharpe_ratio,
        results.sortino_ratio
    );
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Unable to create results file at {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
    info!("Results written to {}", path.display());
    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_MARKET_DATA_FILE)
}
