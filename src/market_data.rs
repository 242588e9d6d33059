use crate::feeds::{IndicatorFeed, PredictionOracle, PriceFeed};
use crate::models::{IndicatorSnapshot, Money, Prediction, PriceBar};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::info;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    candles: Vec<SnapshotCandle>,
    #[serde(default)]
    indicators: Vec<SnapshotIndicators>,
    #[serde(default)]
    predictions: Vec<SnapshotPrediction>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotCandle {
    ticker: String,
    date: NaiveDate,
    high: f64,
    low: f64,
    close: f64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotIndicators {
    ticker: String,
    date: NaiveDate,
    values: IndicatorSnapshot,
}

#[derive(Serialize, Deserialize)]
struct SnapshotPrediction {
    ticker: String,
    date: NaiveDate,
    prediction: Prediction,
}

impl SnapshotCandle {
    fn from_bar(ticker: &str, bar: &PriceBar) -> Self {
        Self {
            ticker: ticker.to_string(),
            date: bar.date,
            high: bar.high.to_f64().unwrap_or(0.0),
            low: bar.low.to_f64().unwrap_or(0.0),
            close: bar.close.to_f64().unwrap_or(0.0),
        }
    }

    fn into_bar(self) -> Result<(String, PriceBar)> {
        let bar = PriceBar {
            date: self.date,
            high: snapshot_price(self.high, "high", &self.ticker, self.date)?,
            low: snapshot_price(self.low, "low", &self.ticker, self.date)?,
            close: snapshot_price(self.close, "close", &self.ticker, self.date)?,
        };
        Ok((self.ticker, bar))
    }
}

fn snapshot_price(value: f64, field: &str, ticker: &str, date: NaiveDate) -> Result<Money> {
    if !value.is_finite() || value <= 0.0 {
        return Err(anyhow!(
            "Invalid {} price {} for {} on {}",
            field,
            value,
            ticker,
            date
        ));
    }
    Decimal::from_f64(value)
        .map(|price| price.round_dp(6))
        .ok_or_else(|| anyhow!("Unrepresentable {} price {} for {}", field, value, ticker))
}

enum SnapshotFormat {
    Json,
    Bincode,
}

impl SnapshotFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SnapshotFormat::Json,
            _ => SnapshotFormat::Bincode,
        }
    }
}

/// In-memory market data serving all three feeds from preloaded maps.
#[derive(Debug, Default, Clone)]
pub struct MarketData {
    bars: HashMap<String, BTreeMap<NaiveDate, PriceBar>>,
    indicators: HashMap<String, BTreeMap<NaiveDate, IndicatorSnapshot>>,
    predictions: HashMap<String, BTreeMap<NaiveDate, Prediction>>,
    settings: HashMap<String, String>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`MarketData::save_to_file`]. Files ending in `.json` are
    /// read as JSON, anything else as bincode.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot = match SnapshotFormat::for_path(path) {
            SnapshotFormat::Json => {
                serde_json::from_reader(reader).context("Snapshot JSON decode failed")?
            }
            SnapshotFormat::Bincode => {
                bincode::deserialize_from(reader).context("Snapshot decode failed")?
            }
        };

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let data = Self::from_snapshot(snapshot)?;
        if !data.has_data() {
            return Err(anyhow!("Market data snapshot has no usable candles"));
        }
        info!(
            "Loaded {} tickers across {} trading days",
            data.bars.len(),
            data.trading_days().len()
        );
        Ok(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = self.to_snapshot();
        match SnapshotFormat::for_path(path) {
            SnapshotFormat::Json => serde_json::to_writer_pretty(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?,
            SnapshotFormat::Bincode => bincode::serialize_into(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?,
        }
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    fn from_snapshot(snapshot: MarketDataSnapshot) -> Result<Self> {
        let mut data = Self {
            settings: snapshot.settings,
            ..Self::default()
        };
        for candle in snapshot.candles {
            let (ticker, bar) = candle.into_bar()?;
            data.insert_bar(&ticker, bar);
        }
        for entry in snapshot.indicators {
            data.insert_indicators(&entry.ticker, entry.date, entry.values);
        }
        for entry in snapshot.predictions {
            data.insert_prediction(&entry.ticker, entry.date, entry.prediction);
        }
        Ok(data)
    }

    fn to_snapshot(&self) -> MarketDataSnapshot {
        let mut candles = Vec::new();
        let mut indicators = Vec::new();
        let mut predictions = Vec::new();
        for ticker in self.tickers() {
            if let Some(bars) = self.bars.get(&ticker) {
                candles.extend(bars.values().map(|bar| SnapshotCandle::from_bar(&ticker, bar)));
            }
            if let Some(snapshots) = self.indicators.get(&ticker) {
                indicators.extend(snapshots.iter().map(|(date, values)| SnapshotIndicators {
                    ticker: ticker.clone(),
                    date: *date,
                    values: values.clone(),
                }));
            }
            if let Some(by_date) = self.predictions.get(&ticker) {
                predictions.extend(by_date.iter().map(|(date, prediction)| {
                    SnapshotPrediction {
                        ticker: ticker.clone(),
                        date: *date,
                        prediction: *prediction,
                    }
                }));
            }
        }

        MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            candles,
            indicators,
            predictions,
            settings: self.settings.clone(),
        }
    }

    pub fn insert_bar(&mut self, ticker: &str, bar: PriceBar) {
        self.bars
            .entry(ticker.to_string())
            .or_default()
            .insert(bar.date, bar);
    }

    /// Insert a bar whose high and low equal the close.
    pub fn insert_close(&mut self, ticker: &str, date: NaiveDate, close: Money) {
        self.insert_bar(
            ticker,
            PriceBar {
                date,
                high: close,
                low: close,
                close,
            },
        );
    }

    pub fn insert_indicators(&mut self, ticker: &str, date: NaiveDate, values: IndicatorSnapshot) {
        self.indicators
            .entry(ticker.to_string())
            .or_default()
            .insert(date, values);
    }

    pub fn insert_prediction(&mut self, ticker: &str, date: NaiveDate, prediction: Prediction) {
        self.predictions
            .entry(ticker.to_string())
            .or_default()
            .insert(date, prediction);
    }

    pub fn set_setting(&mut self, key: &str, value: &str) {
        self.settings.insert(key.to_string(), value.to_string());
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn has_data(&self) -> bool {
        self.bars.values().any(|bars| !bars.is_empty())
    }

    /// Tickers with at least one bar, in lexical order.
    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self
            .bars
            .iter()
            .filter(|(_, bars)| !bars.is_empty())
            .map(|(ticker, _)| ticker.clone())
            .collect();
        tickers.sort();
        tickers
    }

    /// Every date on which any ticker has a bar, ascending and unique.
    pub fn trading_days(&self) -> Vec<NaiveDate> {
        let days: BTreeSet<NaiveDate> = self
            .bars
            .values()
            .flat_map(|bars| bars.keys().copied())
            .collect();
        days.into_iter().collect()
    }

    pub fn trading_days_between(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<NaiveDate>> {
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                return Err(anyhow!(
                    "Invalid market data date range: {} is after {}",
                    start,
                    end
                ));
            }
        }

        let days: Vec<NaiveDate> = self
            .trading_days()
            .into_iter()
            .filter(|date| start_date.map_or(true, |start| *date >= start))
            .filter(|date| end_date.map_or(true, |end| *date <= end))
            .collect();

        if days.is_empty() {
            let range_description = match (start_date, end_date) {
                (Some(start), Some(end)) => {
                    format!("{} - {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
                }
                (Some(start), None) => format!("{} onward", start.format("%Y-%m-%d")),
                (None, Some(end)) => format!("through {}", end.format("%Y-%m-%d")),
                _ => "entire dataset".to_string(),
            };
            return Err(anyhow!("No trading days available for {}", range_description));
        }
        Ok(days)
    }
}

impl PriceFeed for MarketData {
    fn get_price(&self, ticker: &str, date: NaiveDate) -> Option<Money> {
        self.bars.get(ticker)?.get(&date).map(|bar| bar.close)
    }

    fn bars_before(&self, ticker: &str, date: NaiveDate, window_days: i64) -> Vec<PriceBar> {
        let Some(bars) = self.bars.get(ticker) else {
            return Vec::new();
        };
        let start = date - chrono::Duration::days(window_days.max(0));
        bars.range(start..date).map(|(_, bar)| *bar).collect()
    }

    fn last_price_on_or_before(&self, ticker: &str, date: NaiveDate) -> Option<Money> {
        self.bars
            .get(ticker)?
            .range(..=date)
            .next_back()
            .map(|(_, bar)| bar.close)
    }
}

impl IndicatorFeed for MarketData {
    fn get_indicators(&self, ticker: &str, date: NaiveDate) -> Option<IndicatorSnapshot> {
        self.indicators.get(ticker)?.get(&date).cloned()
    }
}

impl PredictionOracle for MarketData {
    fn predict(&self, ticker: &str, date: NaiveDate) -> Result<Option<Prediction>> {
        Ok(self
            .predictions
            .get(ticker)
            .and_then(|by_date| by_date.get(&date))
            .copied())
    }
}
