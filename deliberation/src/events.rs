//! Outbound frames and the sink they are written to.
//!
//! Frames are a closed enum inside the crate and only become JSON at the
//! edge, through [`Frame::to_sse`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::AgentId;

/// One client-visible event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    AgentStart {
        agent_id: AgentId,
        agent_name: String,
        agent_role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
    },
    Content {
        content: String,
    },
    Error {
        message: String,
    },
    AgentEnd {
        agent_id: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
    },
    RoundStart {
        round: u32,
    },
    RoundEnd {
        round: u32,
    },
    /// End of an opening round or a sequential flow.
    AllDone,
    DebateStarting,
    DebateDone,
    /// Symbols for which metrics were found.
    DataLoaded {
        symbols: Vec<String>,
    },
    EnhanceDone,
    /// End of a summary.
    Done,
}

impl Frame {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            content: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::Content { .. } => "content",
            Self::Error { .. } => "error",
            Self::AgentEnd { .. } => "agent_end",
            Self::RoundStart { .. } => "round_start",
            Self::RoundEnd { .. } => "round_end",
            Self::AllDone => "all_done",
            Self::DebateStarting => "debate_starting",
            Self::DebateDone => "debate_done",
            Self::DataLoaded { .. } => "data_loaded",
            Self::EnhanceDone => "enhance_done",
            Self::Done => "done",
        }
    }

    /// Encode as one server-sent-events record: `data: <json>\n\n`.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// The receiving side of a run has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct ClientGone;

/// Ordered frame channel towards one client.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
    sent: Arc<AtomicU64>,
}

impl FrameSink {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            tx,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, frame: Frame) -> Result<(), ClientGone> {
        self.tx.send(frame).map_err(|_| ClientGone)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiver is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Frames delivered so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
