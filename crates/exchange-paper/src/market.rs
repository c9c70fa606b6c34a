use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use autotrader_core::{MarketData, MarketDataProvider};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

/// In-memory market data keyed by symbol.
#[derive(Default)]
pub struct PaperMarketData {
    data: RwLock<HashMap<String, MarketData>>,
}

impl PaperMarketData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, data: MarketData) {
        self.data.write().insert(data.symbol.clone(), data);
    }

    /// Moves the current price, keeping indicators as they were.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut data = self.data.write();
        data.entry(symbol.to_string())
            .or_insert_with(|| MarketData {
                symbol: symbol.to_string(),
                current_price: price,
                current_macd: None,
                mid_term: None,
                longer_term: None,
                intraday: None,
            })
            .current_price = price;
    }

    pub fn remove(&self, symbol: &str) {
        self.data.write().remove(symbol);
    }

    /// Loads a JSON array of [`MarketData`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read market file {}", path.display()))?;
        let rows: Vec<MarketData> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse market file {}", path.display()))?;
        let feed = Self::new();
        for row in rows {
            feed.set(row);
        }
        Ok(feed)
    }

    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.data.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[async_trait]
impl MarketDataProvider for PaperMarketData {
    async fn get(&self, symbol: &str) -> Result<MarketData> {
        self.data
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no market data for {symbol}"))
    }
}
