//! Panel runtime configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (`--store`, `--rounds`, ...)
//! 2. Environment variables (`SILICONFLOW_API_KEY`, `PANEL_STORE_PATH`, ...)
//! 3. The TOML file passed with `--config`
//! 4. Built-in defaults
//!
//! ```toml
//! store_path = "panel-store.json"
//!
//! [provider]
//! base_url = "https://api.siliconflow.cn/v1"
//! temperature = 0.7
//!
//! [deliberation]
//! debate_rounds = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use deliberation::DeliberationConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";
const DEFAULT_CHART_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const DEFAULT_STORE_PATH: &str = "panel-store.json";

const ENV_API_KEY: &str = "SILICONFLOW_API_KEY";
const ENV_BASE_URL: &str = "SILICONFLOW_BASE_URL";
const ENV_STORE_PATH: &str = "PANEL_STORE_PATH";
const ENV_SECONDARY_MODEL: &str = "PANEL_SECONDARY_MODEL";
const ENV_BASELINE_MODEL: &str = "PANEL_BASELINE_MODEL";
const ENV_SUMMARY_MODEL: &str = "PANEL_SUMMARY_MODEL";

/// OpenAI-compatible chat-completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL up to and including the API version (`.../v1`).
    pub base_url: String,
    /// Bearer token. Only required when a live client is built.
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Whole-request ceiling enforced by the HTTP client.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 2000,
            request_timeout_secs: 60,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Daily-chart market data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Chart endpoint; the symbol is appended as the last path segment.
    pub chart_base_url: String,
    pub timeout_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            chart_base_url: DEFAULT_CHART_BASE_URL.to_string(),
            timeout_secs: 10,
        }
    }
}

impl MarketConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level configuration consumed by the `panel` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub provider: ProviderConfig,
    pub market: MarketConfig,
    /// JSON document holding agents, discussions and messages.
    pub store_path: PathBuf,
    pub deliberation: DeliberationConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            market: MarketConfig::default(),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            deliberation: DeliberationConfig::default(),
        }
    }
}

impl PanelConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse panel config TOML")
    }

    /// Load the TOML file, if any, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = get(ENV_BASE_URL) {
            self.provider.base_url = url;
        }
        if let Some(path) = get(ENV_STORE_PATH) {
            self.store_path = PathBuf::from(path);
        }
        if let Some(model) = get(ENV_SECONDARY_MODEL) {
            self.deliberation.secondary_model = model;
        }
        if let Some(model) = get(ENV_BASELINE_MODEL) {
            self.deliberation.baseline_model = model;
        }
        if let Some(model) = get(ENV_SUMMARY_MODEL) {
            self.deliberation.summary_model = Some(model);
        }
    }

    /// API key for live generation.
    pub fn require_api_key(&self) -> Result<&str> {
        self.provider
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .with_context(|| {
                format!(
                    "{} is not set (use --offline to run without a provider)",
                    ENV_API_KEY
                )
            })
    }

    /// Validate the config; return an error string if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.base_url.trim().is_empty() {
            return Err("provider.base_url must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(format!(
                "provider.temperature must be in [0, 2], got {}",
                self.provider.temperature
            ));
        }
        if self.provider.max_tokens == 0 {
            return Err("provider.max_tokens must be > 0".to_string());
        }
        if self.provider.request_timeout_secs == 0 {
            return Err("provider.request_timeout_secs must be > 0".to_string());
        }
        if self.market.timeout_secs == 0 {
            return Err("market.timeout_secs must be > 0".to_string());
        }
        if self.store_path.as_os_str().is_empty() {
            return Err("store_path must not be empty".to_string());
        }
        self.deliberation.validate()
    }
}
