//! Orchestrator configuration.
//!
//! | Setting                  | Default                         |
//! |--------------------------|---------------------------------|
//! | debate_rounds            | 2                               |
//! | debate_window            | 15 messages                     |
//! | continue_window          | 30 messages                     |
//! | chunk_size               | 50 characters                   |
//! | secondary_model          | deepseek-ai/DeepSeek-V3.2-Exp   |
//! | baseline_model           | Qwen/Qwen2.5-7B-Instruct        |
//! | summary_model            | baseline model                  |
//! | candidate_timeout_secs   | 90                              |
//! | turn_timeout_secs        | 180                             |
//! | max_parallel_agents      | 0 (no limit)                    |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::generation::retry::RetryPolicy;

pub const DEFAULT_SECONDARY_MODEL: &str = "deepseek-ai/DeepSeek-V3.2-Exp";
pub const DEFAULT_BASELINE_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliberationConfig {
    /// Rebuttal rounds run by `start`.
    pub debate_rounds: u32,
    /// History window for opening, debate, enhancement and ask contexts.
    pub debate_window: usize,
    /// History window for the sequential continue flow.
    pub continue_window: usize,
    /// Maximum characters per `content` frame for settled turns.
    pub chunk_size: usize,
    /// Second candidate of every fallback chain.
    pub secondary_model: String,
    /// Last candidate of every fallback chain.
    pub baseline_model: String,
    /// Model for summaries; falls back to `baseline_model`.
    pub summary_model: Option<String>,
    /// Ceiling for one candidate, streaming included.
    pub candidate_timeout_secs: u64,
    /// Ceiling for a whole agent turn across candidates.
    pub turn_timeout_secs: u64,
    /// Whether `start` ends with a summary.
    pub summarize_after_debate: bool,
    /// Concurrent agent turns per round; 0 runs every agent at once.
    pub max_parallel_agents: usize,
    /// Transport retry policy applied by the generation client.
    pub retry: RetryPolicy,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            debate_rounds: 2,
            debate_window: 15,
            continue_window: 30,
            chunk_size: 50,
            secondary_model: DEFAULT_SECONDARY_MODEL.to_string(),
            baseline_model: DEFAULT_BASELINE_MODEL.to_string(),
            summary_model: None,
            candidate_timeout_secs: 90,
            turn_timeout_secs: 180,
            summarize_after_debate: true,
            max_parallel_agents: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl DeliberationConfig {
    pub fn summary_model(&self) -> &str {
        self.summary_model
            .as_deref()
            .unwrap_or(self.baseline_model.as_str())
    }

    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_secs(self.candidate_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.debate_window == 0 {
            return Err("debate_window must be > 0".to_string());
        }
        if self.continue_window == 0 {
            return Err("continue_window must be > 0".to_string());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".to_string());
        }
        if self.candidate_timeout_secs == 0 || self.turn_timeout_secs == 0 {
            return Err("timeouts must be > 0".to_string());
        }
        if self.baseline_model.trim().is_empty() {
            return Err("baseline_model must not be empty".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(format!(
                "retry.backoff_multiplier must be >= 1, got {}",
                self.retry.backoff_multiplier
            ));
        }
        Ok(())
    }
}
