//! Market-data collaborator used by the data-enhancement round.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Price movement over one lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendWindow {
    /// Window label, e.g. `1w`, `1mo`, `3mo`.
    pub label: String,
    pub change: f64,
    pub change_percent: f64,
    pub old_price: f64,
    pub current_price: f64,
}

impl TrendWindow {
    pub fn between(label: impl Into<String>, old_price: f64, current_price: f64) -> Self {
        let change = current_price - old_price;
        let change_percent = if old_price == 0.0 {
            0.0
        } else {
            change / old_price * 100.0
        };
        Self {
            label: label.into(),
            change,
            change_percent,
            old_price,
            current_price,
        }
    }
}

/// Trend metrics for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTrend {
    pub symbol: String,
    pub current_price: f64,
    /// Shortest window first.
    pub windows: Vec<TrendWindow>,
    pub rsi: Option<f64>,
    pub volume: Option<u64>,
}

impl SymbolTrend {
    pub fn window(&self, label: &str) -> Option<&TrendWindow> {
        self.windows.iter().find(|w| w.label == label)
    }
}

/// Looks up trend metrics for a batch of symbols.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Trends for the symbols that could be resolved, in request order.
    /// Symbols that fail are omitted rather than reported.
    async fn get_trends(&self, symbols: &[String]) -> Vec<SymbolTrend>;
}

/// Shared reference to a market-data source
pub type SharedMarketData = std::sync::Arc<dyn MarketData>;

/// Fixed table of trends, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticMarketData {
    trends: Vec<SymbolTrend>,
}

impl StaticMarketData {
    pub fn new(trends: Vec<SymbolTrend>) -> Self {
        Self { trends }
    }
}

#[async_trait]
impl MarketData for StaticMarketData {
    async fn get_trends(&self, symbols: &[String]) -> Vec<SymbolTrend> {
        symbols
            .iter()
            .filter_map(|s| {
                self.trends
                    .iter()
                    .find(|t| t.symbol.eq_ignore_ascii_case(s))
                    .cloned()
            })
            .collect()
    }
}
