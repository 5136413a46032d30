//! Daily-chart market data and ticker extraction.
//!
//! Trends are computed from three months of daily closes:
//!
//! | Window | Lookback (trading days) |
//! |--------|-------------------------|
//! | 1w     | 7                       |
//! | 1mo    | 30                      |
//! | 3mo    | 90                      |
//!
//! RSI is the simple (non-smoothed) 14-sample variant.

use std::sync::LazyLock;

use async_trait::async_trait;
use deliberation::{MarketData, SymbolTrend, TrendWindow};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MarketConfig;

/// Trend windows and their lookback in trading days.
pub const TREND_WINDOWS: [(&str, usize); 3] = [("1w", 7), ("1mo", 30), ("3mo", 90)];

pub const RSI_PERIOD: usize = 14;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("chart endpoint returned HTTP {0}")]
    Status(u16),

    #[error("chart payload missing {0}")]
    Malformed(&'static str),
}

/// Simple RSI over the last `period` closes. `None` with fewer samples.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let (gains, losses) = window
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((0.0, 0.0), |(g, l), change| {
            if change > 0.0 {
                (g + change, l)
            } else {
                (g, l - change)
            }
        });
    let samples = (period - 1) as f64;
    let avg_gain = gains / samples;
    let avg_loss = losses / samples;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Build a trend from a chart API payload.
pub fn trend_from_chart(symbol: &str, payload: &Value) -> Result<SymbolTrend, MarketError> {
    let result = payload["chart"]["result"]
        .get(0)
        .ok_or(MarketError::Malformed("chart.result"))?;
    let quote = &result["indicators"]["quote"][0];
    let closes: Vec<f64> = quote["close"]
        .as_array()
        .ok_or(MarketError::Malformed("close series"))?
        .iter()
        .filter_map(Value::as_f64)
        .collect();
    let current_price = *closes.last().ok_or(MarketError::Malformed("closes"))?;

    let windows = TREND_WINDOWS
        .iter()
        .filter(|(_, days)| closes.len() >= *days)
        .map(|(label, days)| {
            let old = closes[closes.len() - days];
            let mut window = TrendWindow::between(*label, old, current_price);
            window.change = round2(window.change);
            window.change_percent = round2(window.change_percent);
            window.old_price = round2(window.old_price);
            window.current_price = round2(window.current_price);
            window
        })
        .collect();

    let volume = quote["volume"]
        .as_array()
        .and_then(|v| v.iter().rev().find_map(Value::as_u64));

    Ok(SymbolTrend {
        symbol: symbol.to_string(),
        current_price: round2(current_price),
        windows,
        rsi: rsi(&closes, RSI_PERIOD).map(round2),
        volume,
    })
}

/// Chart client for the public daily-chart endpoint.
pub struct YahooChartClient {
    http: reqwest::Client,
    base_url: String,
}

impl YahooChartClient {
    pub fn new(config: &MarketConfig) -> Result<Self, MarketError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MarketError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.chart_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch(&self, symbol: &str) -> Result<SymbolTrend, MarketError> {
        let url = format!("{}/{}", self.base_url, symbol);
        let response = self
            .http
            .get(&url)
            .query(&[("interval", "1d"), ("range", "3mo"), ("includePrePost", "false")])
            .send()
            .await
            .map_err(|e| MarketError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MarketError::Status(response.status().as_u16()));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| MarketError::Request(e.to_string()))?;
        trend_from_chart(symbol, &payload)
    }
}

#[async_trait]
impl MarketData for YahooChartClient {
    async fn get_trends(&self, symbols: &[String]) -> Vec<SymbolTrend> {
        let mut trends = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.fetch(symbol).await {
                Ok(trend) => {
                    debug!(symbol = %symbol, windows = trend.windows.len(), "trend loaded");
                    trends.push(trend);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "skipping symbol"),
            }
        }
        trends
    }
}

/// Maximum symbols taken from one piece of text.
pub const MAX_SYMBOLS: usize = 10;

/// Characters either side of a candidate searched for ticker context.
const CONTEXT_RADIUS: usize = 10;

/// Listings accepted wherever they appear.
const KNOWN_TICKERS: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "AMZN", "META", "TSLA", "NVDA", "NFLX", "BABA", "JPM", "JNJ", "WMT",
    "PG", "MA", "UNH", "HD", "DIS", "PYPL", "BAC", "XOM", "VZ", "ADBE", "CMCSA", "NKE", "CSCO",
    "PFE", "MRK", "ABT", "TMO",
];

/// Upper-case words that look like tickers but never are.
const NOT_TICKERS: &[&str] = &[
    "THE", "AND", "FOR", "ARE", "BUT", "NOT", "YOU", "ALL", "CAN", "HER", "WAS", "ONE", "OUR",
    "OUT", "DAY", "GET", "HAS", "HIM", "HIS", "HOW", "ITS", "MAY", "NEW", "NOW", "OLD", "SEE",
    "TWO", "WAY", "WHO", "BOY", "DID", "LET", "PUT", "SAY", "SHE", "TOO", "USE", "AI", "IT", "API",
    "CEO", "CFO", "CTO", "USA", "UK", "EU", "USD", "CNY", "GDP", "CPI", "PMI", "ETF", "IPO", "SEC",
    "FDA",
];

/// Markers that make an unknown upper-case word a ticker.
const TICKER_CONTEXT: &[&str] = &["$", "stock", "股价"];

/// Company names mapped to their listing.
const ALIASES: &[(&str, &str)] = &[
    ("Tesla", "TSLA"),
    ("特斯拉", "TSLA"),
    ("Apple", "AAPL"),
    ("苹果", "AAPL"),
    ("Microsoft", "MSFT"),
    ("微软", "MSFT"),
    ("Nvidia", "NVDA"),
    ("英伟达", "NVDA"),
    ("Google", "GOOGL"),
    ("谷歌", "GOOGL"),
    ("Amazon", "AMZN"),
    ("亚马逊", "AMZN"),
    ("Meta", "META"),
    ("脸书", "META"),
    ("Netflix", "NFLX"),
    ("奈飞", "NFLX"),
    ("Alibaba", "BABA"),
    ("阿里巴巴", "BABA"),
    ("Tencent", "TCEHY"),
    ("腾讯", "TCEHY"),
    ("BYD", "BYDDF"),
    ("比亚迪", "BYDDF"),
    ("NIO", "NIO"),
    ("蔚来", "NIO"),
    ("Li Auto", "LI"),
    ("理想", "LI"),
    ("XPeng", "XPEV"),
    ("小鹏", "XPEV"),
];

/// ASCII alphanumeric runs; CJK text around a ticker does not glue onto it.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+").expect("TOKEN_RE regex should compile"));

fn is_ticker_shaped(token: &str) -> bool {
    (2..=5).contains(&token.len()) && token.bytes().all(|b| b.is_ascii_uppercase())
}

/// Up to `radius` characters either side of `text[start..end]`.
fn surroundings(text: &str, start: usize, end: usize, radius: usize) -> &str {
    let from = text[..start]
        .char_indices()
        .rev()
        .take(radius)
        .last()
        .map_or(start, |(i, _)| i);
    let to = text[end..]
        .char_indices()
        .nth(radius)
        .map_or(text.len(), |(i, _)| end + i);
    &text[from..to]
}

fn has_ticker_context(window: &str) -> bool {
    let lower = window.to_lowercase();
    TICKER_CONTEXT.iter().any(|marker| lower.contains(marker))
}

/// Tickers mentioned in free text, first mention first, at most
/// [`MAX_SYMBOLS`].
///
/// Only words already written in upper case count. Known listings are taken
/// as is; other upper-case words need a `$`, "stock" or 股价 nearby. Company
/// names are mapped through a fixed alias table.
pub fn extract_symbols(text: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    let mut add = |symbol: &str| {
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    };

    for token in TOKEN_RE.find_iter(text) {
        let code = token.as_str();
        if !is_ticker_shaped(code) {
            continue;
        }
        if KNOWN_TICKERS.contains(&code) {
            add(code);
        } else if !NOT_TICKERS.contains(&code)
            && has_ticker_context(surroundings(text, token.start(), token.end(), CONTEXT_RADIUS))
        {
            add(code);
        }
    }
    for &(name, symbol) in ALIASES {
        if text.contains(name) {
            add(symbol);
        }
    }
    symbols.truncate(MAX_SYMBOLS);
    symbols
}
