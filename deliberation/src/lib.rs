//! Panel deliberation core.
//!
//! This library provides:
//! - Context building from shared, append-only discussion history
//! - Per-agent model fallback over a streaming generation backend
//! - Concurrent fan-out with results joined back into roster order
//! - Ordered, chunked frame streams for clients
//! - The multi-round debate state machine tying it together
//!
//! # Flows
//!
//! - `start`: opening round, N debate rounds, summary
//! - `debate`: N debate rounds on top of existing history
//! - `enhance_with_data`: one round re-evaluating against market metrics
//! - `summarize`: condense all agent turns and complete the discussion
//! - `continue_discussion`: every agent answers a user follow-up, live
//! - `ask_agent`: one agent answers a direct question, live
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deliberation::{Deliberation, DeliberationConfig, FlowRequest, MemoryStore, ScriptedClient};
//!
//! let store = Arc::new(MemoryStore::new());
//! let orchestrator =
//!     Deliberation::from_store(DeliberationConfig::default(), store, Arc::new(ScriptedClient::echo()))?
//!         .shared();
//! let (handle, mut frames, _cancel) = orchestrator.spawn(FlowRequest::Start { discussion_id: 1 });
//! while let Some(frame) = frames.recv().await {
//!     print!("{}", frame.to_sse()?);
//! }
//! let report = handle.await??;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fallback;
pub mod fanout;
pub mod generation;
pub mod market;
pub mod model;
pub mod multiplex;
pub mod orchestrator;
pub mod state;
pub mod store;

pub use config::DeliberationConfig;
pub use context::{AgentContext, ContextBuilder, ConversationWindow, HistorySnapshot, RoundPrompt};
pub use error::{DeliberationError, DeliberationResult};
pub use events::{ClientGone, Frame, FrameSink};
pub use fallback::{CandidateChain, FallbackExecutor, RoundOutcome, TurnResult};
pub use fanout::FanOutCoordinator;
pub use generation::retry::{RetryPolicy, RetryingClient};
pub use generation::scripted::ScriptedClient;
pub use generation::{
    ChatMessage, ChatRole, GenerationClient, GenerationError, SharedGenerationClient, TextStream,
};
pub use market::{MarketData, SharedMarketData, SymbolTrend, TrendWindow};
pub use model::{Agent, AgentId, Discussion, DiscussionId, DiscussionStatus, Message, MessageKind};
pub use multiplex::{EventMultiplexer, RoundKind};
pub use orchestrator::{Deliberation, DeliberationReport, FlowRequest};
pub use state::{DeliberationPhase, DeliberationSession, Flow};
pub use store::file::JsonFileStore;
pub use store::memory::MemoryStore;
pub use store::{AgentRoster, MessageLog, StoreError};
