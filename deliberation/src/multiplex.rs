//! Event Multiplexer: settled outcomes in, ordered frames out.

use crate::events::{ClientGone, Frame, FrameSink};
use crate::fallback::{RoundOutcome, TurnResult};

/// Which kind of round the outcomes belong to. Decides the `round` field of
/// the agent frames and the frame closing the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundKind {
    /// Closed by `all_done`, no round numbers.
    Opening,
    /// Closed by `round_end{n}`.
    Debate(u32),
    /// No closing frame; the caller ends the flow.
    Enhancement,
}

impl RoundKind {
    /// Value of the `round` field on agent frames.
    pub fn round(self) -> Option<u32> {
        match self {
            Self::Debate(n) => Some(n),
            Self::Opening | Self::Enhancement => None,
        }
    }

    fn terminator(self) -> Option<Frame> {
        match self {
            Self::Opening => Some(Frame::AllDone),
            Self::Debate(round) => Some(Frame::RoundEnd { round }),
            Self::Enhancement => None,
        }
    }
}

/// Split `text` into pieces of at most `size` characters, left to right.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct EventMultiplexer {
    chunk_size: usize,
}

impl EventMultiplexer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Frames for one agent's settled turn.
    pub fn agent_frames(&self, outcome: &RoundOutcome, round: Option<u32>) -> Vec<Frame> {
        let agent = &outcome.agent;
        let mut frames = vec![Frame::AgentStart {
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            agent_role: agent.role.clone(),
            round,
        }];
        match &outcome.result {
            TurnResult::Success(text) => {
                frames.extend(chunk_text(text, self.chunk_size).into_iter().map(Frame::content));
            }
            TurnResult::Failure(reason) => {
                frames.push(Frame::error(reason.clone()));
                frames.push(Frame::content(reason.clone()));
            }
        }
        frames.push(Frame::AgentEnd {
            agent_id: agent.id,
            round,
        });
        frames
    }

    /// Frames for a whole round, agents in the order given.
    pub fn round_frames(&self, outcomes: &[RoundOutcome], kind: RoundKind) -> Vec<Frame> {
        let mut frames: Vec<Frame> = outcomes
            .iter()
            .flat_map(|o| self.agent_frames(o, kind.round()))
            .collect();
        frames.extend(kind.terminator());
        frames
    }

    /// Write a round's frames to `sink`, stopping at the first failed send.
    pub fn emit_round(
        &self,
        sink: &FrameSink,
        outcomes: &[RoundOutcome],
        kind: RoundKind,
    ) -> Result<usize, ClientGone> {
        let frames = self.round_frames(outcomes, kind);
        let count = frames.len();
        for frame in frames {
            sink.emit(frame)?;
        }
        Ok(count)
    }
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new(50)
    }
}
