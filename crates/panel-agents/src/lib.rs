//! Analyst panel runtime.
//!
//! Binds the deliberation core to concrete backends:
//! - `provider`: streaming OpenAI-compatible chat completions
//! - `market_data`: daily-chart trends, RSI and ticker extraction
//! - `roster`: the default eight-analyst panel
//! - `config`: TOML + environment configuration
//! - `app`: store/backends wiring and SSE frame output for the `panel` binary

#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod market_data;
pub mod provider;
pub mod roster;

pub use app::{pump_frames, Panel};
pub use config::{MarketConfig, PanelConfig, ProviderConfig};
pub use market_data::{extract_symbols, YahooChartClient};
pub use provider::{OpenAiCompatClient, SseDecoder};
pub use roster::{seed_default_roster, DEFAULT_ANALYSTS};
