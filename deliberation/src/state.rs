//! Deliberation state machine: phases, transitions and per-run tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::DiscussionId;

/// Phase of one deliberation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliberationPhase {
    /// Run created, nothing generated yet.
    Idle,
    /// Every agent states an initial view.
    Opening,
    /// A numbered rebuttal round.
    Debating,
    /// Agents re-evaluate against injected market metrics.
    DataEnhancement,
    /// One non-agent call condenses the agent turns.
    Summarizing,
    /// Agents answer one after another (continue / ask).
    Conversing,
    /// Summary persisted and the discussion marked completed.
    Completed,
    /// Run ended without summarization.
    Finished,
    /// Client gone, discussion vanished or another fatal error.
    Aborted,
}

impl DeliberationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Finished | Self::Aborted)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [DeliberationPhase] {
        match self {
            Self::Idle => &[
                Self::Opening,
                Self::Debating,
                Self::DataEnhancement,
                Self::Summarizing,
                Self::Conversing,
                Self::Aborted,
            ],
            Self::Opening => &[
                Self::Debating,
                Self::Summarizing,
                Self::Finished,
                Self::Aborted,
            ],
            Self::Debating => &[
                Self::Debating,
                Self::DataEnhancement,
                Self::Summarizing,
                Self::Finished,
                Self::Aborted,
            ],
            Self::DataEnhancement => &[Self::Summarizing, Self::Finished, Self::Aborted],
            Self::Summarizing => &[Self::Completed, Self::Aborted],
            Self::Conversing => &[Self::Finished, Self::Aborted],
            Self::Completed | Self::Finished | Self::Aborted => &[],
        }
    }

    pub fn can_transition_to(self, to: DeliberationPhase) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for DeliberationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Opening => write!(f, "opening"),
            Self::Debating => write!(f, "debating"),
            Self::DataEnhancement => write!(f, "data_enhancement"),
            Self::Summarizing => write!(f, "summarizing"),
            Self::Conversing => write!(f, "conversing"),
            Self::Completed => write!(f, "completed"),
            Self::Finished => write!(f, "finished"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Entry point a run was started through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Start,
    Debate,
    Enhance,
    Summarize,
    Continue,
    Ask,
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Debate => write!(f, "debate"),
            Self::Enhance => write!(f, "enhance"),
            Self::Summarize => write!(f, "summarize"),
            Self::Continue => write!(f, "continue"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// Record of one settled round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub phase: DeliberationPhase,
    /// Debate round number; `None` for opening, enhancement and sequential turns.
    pub round: Option<u32>,
    pub successes: u32,
    pub failures: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: DeliberationPhase,
    pub to: DeliberationPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: DeliberationPhase,
    pub to: DeliberationPhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} -> {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// Tracks one run: current phase, transition history and round records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationSession {
    pub run_id: String,
    pub discussion_id: DiscussionId,
    pub flow: Flow,
    pub phase: DeliberationPhase,
    /// Last debate round entered (0 before the first).
    pub current_round: u32,
    pub rounds: Vec<RoundRecord>,
    pub transitions: Vec<PhaseTransition>,
    pub created_at: DateTime<Utc>,
}

impl DeliberationSession {
    pub fn new(run_id: &str, discussion_id: DiscussionId, flow: Flow) -> Self {
        Self {
            run_id: run_id.to_string(),
            discussion_id,
            flow,
            phase: DeliberationPhase::Idle,
            current_round: 0,
            rounds: Vec::new(),
            transitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Transition to a new phase with a reason.
    pub fn transition(
        &mut self,
        to: DeliberationPhase,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;

        if to == DeliberationPhase::Debating {
            self.current_round += 1;
        }
        Ok(())
    }

    /// Move to `Aborted` unless the run already ended.
    pub fn abort(&mut self, reason: &str) {
        if !self.phase.is_terminal() {
            // Every non-terminal phase may abort.
            let _ = self.transition(DeliberationPhase::Aborted, reason);
        }
    }

    pub fn record_round(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Failed agent turns across all rounds.
    pub fn total_failures(&self) -> u32 {
        self.rounds.iter().map(|r| r.failures).sum()
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} discussion={} round={} | {} rounds recorded, {} failed turns",
            self.phase,
            self.flow,
            self.discussion_id,
            self.current_round,
            self.rounds.len(),
            self.total_failures()
        )
    }
}
