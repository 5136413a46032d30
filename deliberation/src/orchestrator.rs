//! Deliberation orchestrator: drives a panel through its flows.
//!
//! ```text
//! start      Opening ──► Debating(1..N) ──► Summarizing ──► Completed
//! debate     Debating(1..N) ──► Finished
//! enhance    DataEnhancement ──► Finished
//! summarize  Summarizing ──► Completed
//! continue   Conversing (agents one after another) ──► Finished
//! ask        Conversing (one agent) ──► Finished
//! ```
//!
//! Every flow validates its inputs before the first frame is sent, reads
//! history afresh for each round, and persists every settled turn before
//! the next round builds its contexts.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DeliberationConfig;
use crate::context::{
    data_context_prompt, summary_prompt, ContextBuilder, HistorySnapshot, RoundPrompt,
};
use crate::error::{DeliberationError, DeliberationResult};
use crate::events::{Frame, FrameSink};
use crate::fallback::FallbackExecutor;
use crate::fanout::FanOutCoordinator;
use crate::generation::{ChatMessage, GenerationError, SharedGenerationClient};
use crate::market::SharedMarketData;
use crate::model::{Agent, AgentId, Discussion, DiscussionId, DiscussionStatus, MessageKind};
use crate::multiplex::{EventMultiplexer, RoundKind};
use crate::state::{DeliberationPhase, DeliberationSession, Flow, RoundRecord};
use crate::store::{AgentRoster, MessageLog, SharedAgentRoster, SharedMessageLog};

/// One invocation of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum FlowRequest {
    Start {
        discussion_id: DiscussionId,
    },
    Debate {
        discussion_id: DiscussionId,
        rounds: u32,
    },
    Enhance {
        discussion_id: DiscussionId,
        symbols: Vec<String>,
    },
    Summarize {
        discussion_id: DiscussionId,
    },
    Continue {
        discussion_id: DiscussionId,
        content: String,
    },
    Ask {
        discussion_id: DiscussionId,
        agent_id: AgentId,
        content: String,
    },
}

impl FlowRequest {
    pub fn discussion_id(&self) -> DiscussionId {
        match self {
            Self::Start { discussion_id }
            | Self::Debate { discussion_id, .. }
            | Self::Enhance { discussion_id, .. }
            | Self::Summarize { discussion_id }
            | Self::Continue { discussion_id, .. }
            | Self::Ask { discussion_id, .. } => *discussion_id,
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            Self::Start { .. } => Flow::Start,
            Self::Debate { .. } => Flow::Debate,
            Self::Enhance { .. } => Flow::Enhance,
            Self::Summarize { .. } => Flow::Summarize,
            Self::Continue { .. } => Flow::Continue,
            Self::Ask { .. } => Flow::Ask,
        }
    }
}

/// What a finished invocation reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationReport {
    pub session: DeliberationSession,
    pub frames_emitted: u64,
    /// Summary text, when the flow produced one.
    pub summary: Option<String>,
}

impl DeliberationReport {
    pub fn terminal_phase(&self) -> DeliberationPhase {
        self.session.phase
    }

    /// Compact summary line.
    pub fn summary_line(&self) -> String {
        format!(
            "{} | {} frames{}",
            self.session.status_line(),
            self.frames_emitted,
            if self.summary.is_some() {
                " | summarized"
            } else {
                ""
            }
        )
    }
}

/// Mutable state of one invocation.
struct Run<'a> {
    session: DeliberationSession,
    sink: &'a FrameSink,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn enter(&mut self, phase: DeliberationPhase, reason: &str) -> DeliberationResult<()> {
        let from = self.session.phase;
        self.session.transition(phase, reason)?;
        info!(from = %from, to = %phase, reason, "phase transition");
        Ok(())
    }

    fn emit(&self, frame: Frame) -> DeliberationResult<()> {
        self.sink.emit(frame)?;
        Ok(())
    }

    fn check_cancelled(&self) -> DeliberationResult<()> {
        if self.cancel.is_cancelled() || self.sink.is_closed() {
            return Err(DeliberationError::Cancelled);
        }
        Ok(())
    }
}

/// Drives panels of agents through deliberation flows.
pub struct Deliberation {
    config: DeliberationConfig,
    log: SharedMessageLog,
    roster: SharedAgentRoster,
    client: SharedGenerationClient,
    market: Option<SharedMarketData>,
    fanout: FanOutCoordinator,
    mux: EventMultiplexer,
}

impl Deliberation {
    pub fn new(
        config: DeliberationConfig,
        log: SharedMessageLog,
        roster: SharedAgentRoster,
        client: SharedGenerationClient,
    ) -> DeliberationResult<Self> {
        config.validate().map_err(DeliberationError::Configuration)?;
        let executor = FallbackExecutor::new(
            client.clone(),
            log.clone(),
            config.secondary_model.as_str(),
            config.baseline_model.as_str(),
        )
        .with_candidate_timeout(config.candidate_timeout())
        .with_turn_timeout(config.turn_timeout());
        let fanout =
            FanOutCoordinator::new(Arc::new(executor)).with_max_parallel(config.max_parallel_agents);
        let mux = EventMultiplexer::new(config.chunk_size);
        Ok(Self {
            config,
            log,
            roster,
            client,
            market: None,
            fanout,
            mux,
        })
    }

    /// Build from one store that is both message log and roster.
    pub fn from_store<S>(
        config: DeliberationConfig,
        store: Arc<S>,
        client: SharedGenerationClient,
    ) -> DeliberationResult<Self>
    where
        S: MessageLog + AgentRoster + 'static,
    {
        Self::new(config, store.clone(), store, client)
    }

    pub fn with_market_data(mut self, market: SharedMarketData) -> Self {
        self.market = Some(market);
        self
    }

    pub fn config(&self) -> &DeliberationConfig {
        &self.config
    }

    /// Create a shared reference to this orchestrator
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Run `request` on a new task. Frames arrive on the returned receiver;
    /// dropping it cancels the run.
    pub fn spawn(
        self: &Arc<Self>,
        request: FlowRequest,
    ) -> (
        JoinHandle<DeliberationResult<DeliberationReport>>,
        mpsc::UnboundedReceiver<Frame>,
        CancellationToken,
    ) {
        let (sink, rx) = FrameSink::channel();
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let watcher = {
                let sink = sink.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = sink.closed() => {
                            warn!("client disconnected, cancelling run");
                            token.cancel();
                        }
                        _ = token.cancelled() => {}
                    }
                })
            };
            let result = this.run(request, &sink, &token).await;
            watcher.abort();
            result
        });
        (handle, rx, cancel)
    }

    pub async fn start(
        &self,
        discussion_id: DiscussionId,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        self.run(FlowRequest::Start { discussion_id }, sink, cancel)
            .await
    }

    pub async fn debate(
        &self,
        discussion_id: DiscussionId,
        rounds: u32,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        self.run(
            FlowRequest::Debate {
                discussion_id,
                rounds,
            },
            sink,
            cancel,
        )
        .await
    }

    pub async fn enhance_with_data(
        &self,
        discussion_id: DiscussionId,
        symbols: Vec<String>,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        self.run(
            FlowRequest::Enhance {
                discussion_id,
                symbols,
            },
            sink,
            cancel,
        )
        .await
    }

    pub async fn summarize(
        &self,
        discussion_id: DiscussionId,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        self.run(FlowRequest::Summarize { discussion_id }, sink, cancel)
            .await
    }

    pub async fn continue_discussion(
        &self,
        discussion_id: DiscussionId,
        content: &str,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        self.run(
            FlowRequest::Continue {
                discussion_id,
                content: content.to_string(),
            },
            sink,
            cancel,
        )
        .await
    }

    pub async fn ask_agent(
        &self,
        discussion_id: DiscussionId,
        agent_id: AgentId,
        content: &str,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        self.run(
            FlowRequest::Ask {
                discussion_id,
                agent_id,
                content: content.to_string(),
            },
            sink,
            cancel,
        )
        .await
    }

    /// Execute one flow to completion, cancellation or fatal error.
    pub async fn run(
        &self,
        request: FlowRequest,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> DeliberationResult<DeliberationReport> {
        let run_id = Uuid::new_v4().to_string();
        let discussion_id = request.discussion_id();
        let flow = request.flow();
        let span = info_span!("deliberation", run_id = %run_id, discussion_id, flow = %flow);

        async move {
            let mut run = Run {
                session: DeliberationSession::new(&run_id, discussion_id, flow),
                sink,
                cancel,
            };
            let result = match request {
                FlowRequest::Start { .. } => self.drive_start(&mut run).await,
                FlowRequest::Debate { rounds, .. } => self.drive_debate(&mut run, rounds).await,
                FlowRequest::Enhance { symbols, .. } => {
                    self.drive_enhance(&mut run, &symbols).await
                }
                FlowRequest::Summarize { .. } => self.drive_summarize(&mut run).await,
                FlowRequest::Continue { content, .. } => {
                    self.drive_continue(&mut run, &content).await
                }
                FlowRequest::Ask {
                    agent_id, content, ..
                } => self.drive_ask(&mut run, agent_id, &content).await,
            };

            match result {
                Ok(summary) => {
                    info!(status = %run.session.status_line(), "run finished");
                    Ok(DeliberationReport {
                        session: run.session,
                        frames_emitted: sink.sent(),
                        summary,
                    })
                }
                Err(e) => {
                    run.session.abort(&e.to_string());
                    match &e {
                        DeliberationError::Cancelled => {
                            warn!(phase = %run.session.phase, "run cancelled")
                        }
                        DeliberationError::NotFound { .. }
                        | DeliberationError::NoAgents
                        | DeliberationError::NothingToSummarize(_) => {
                            warn!(error = %e, "request rejected")
                        }
                        _ => error!(error = %e, "run failed"),
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn load_discussion(
        &self,
        discussion_id: DiscussionId,
    ) -> DeliberationResult<(Discussion, Vec<Agent>)> {
        let discussion = self.log.get_discussion(discussion_id).await?;
        let agents = self.roster.list_agents().await?;
        if agents.is_empty() {
            return Err(DeliberationError::NoAgents);
        }
        Ok((discussion, agents))
    }

    async fn snapshot(
        &self,
        discussion_id: DiscussionId,
        agents: &[Agent],
    ) -> DeliberationResult<HistorySnapshot> {
        let messages = self.log.list_messages(discussion_id).await?;
        Ok(HistorySnapshot::new(messages, agents))
    }

    async fn drive_start(&self, run: &mut Run<'_>) -> DeliberationResult<Option<String>> {
        let (discussion, agents) = self.load_discussion(run.session.discussion_id).await?;

        run.enter(DeliberationPhase::Opening, "opening statements")?;
        self.settle_round(run, &discussion, &agents, RoundPrompt::Opening, RoundKind::Opening)
            .await?;

        run.emit(Frame::DebateStarting)?;
        self.debate_rounds(run, &discussion, &agents, self.config.debate_rounds)
            .await?;

        if self.config.summarize_after_debate {
            run.enter(DeliberationPhase::Summarizing, "debate finished")?;
            let summary = self.summarize_history(run, &discussion, &agents).await?;
            return Ok(Some(summary));
        }
        let rounds = self.config.debate_rounds;
        let reason = if rounds == 0 { "opening finished" } else { "debate finished" };
        run.enter(DeliberationPhase::Finished, reason)?;
        Ok(None)
    }

    async fn drive_debate(
        &self,
        run: &mut Run<'_>,
        rounds: u32,
    ) -> DeliberationResult<Option<String>> {
        if rounds == 0 {
            return Err(DeliberationError::Configuration(
                "debate needs at least one round".to_string(),
            ));
        }
        let (discussion, agents) = self.load_discussion(run.session.discussion_id).await?;
        self.debate_rounds(run, &discussion, &agents, rounds).await?;
        run.enter(DeliberationPhase::Finished, "debate finished")?;
        Ok(None)
    }

    /// Rounds 1..=rounds followed by `debate_done`.
    async fn debate_rounds(
        &self,
        run: &mut Run<'_>,
        discussion: &Discussion,
        agents: &[Agent],
        rounds: u32,
    ) -> DeliberationResult<()> {
        for round in 1..=rounds {
            run.check_cancelled()?;
            run.enter(DeliberationPhase::Debating, &format!("round {}", round))?;
            run.emit(Frame::RoundStart { round })?;
            self.settle_round(
                run,
                discussion,
                agents,
                RoundPrompt::Debate(round),
                RoundKind::Debate(round),
            )
            .await?;
        }
        run.emit(Frame::DebateDone)
    }

    async fn drive_enhance(
        &self,
        run: &mut Run<'_>,
        symbols: &[String],
    ) -> DeliberationResult<Option<String>> {
        let market = self.market.clone().ok_or_else(|| {
            DeliberationError::Configuration("no market data source configured".to_string())
        })?;
        let (discussion, agents) = self.load_discussion(run.session.discussion_id).await?;

        let trends = market.get_trends(symbols).await;
        let found: Vec<String> = trends.iter().map(|t| t.symbol.clone()).collect();
        info!(requested = symbols.len(), found = found.len(), "market data loaded");
        run.emit(Frame::DataLoaded { symbols: found })?;

        run.enter(DeliberationPhase::DataEnhancement, "market data loaded")?;
        self.settle_round(
            run,
            &discussion,
            &agents,
            RoundPrompt::DataContext(data_context_prompt(&trends)),
            RoundKind::Enhancement,
        )
        .await?;
        run.emit(Frame::EnhanceDone)?;
        run.enter(DeliberationPhase::Finished, "enhancement finished")?;
        Ok(None)
    }

    async fn drive_summarize(&self, run: &mut Run<'_>) -> DeliberationResult<Option<String>> {
        let discussion_id = run.session.discussion_id;
        let discussion = self.log.get_discussion(discussion_id).await?;
        let agents = self.roster.list_agents().await?;
        let snapshot = self.snapshot(discussion_id, &agents).await?;
        if snapshot.agent_turns().next().is_none() {
            return Err(DeliberationError::NothingToSummarize(discussion_id));
        }

        run.enter(DeliberationPhase::Summarizing, "summary requested")?;
        let summary = self.summarize_history(run, &discussion, &agents).await?;
        Ok(Some(summary))
    }

    async fn drive_continue(
        &self,
        run: &mut Run<'_>,
        content: &str,
    ) -> DeliberationResult<Option<String>> {
        let (discussion, agents) = self.load_discussion(run.session.discussion_id).await?;
        self.log
            .append_message(discussion.id, None, content, MessageKind::User)
            .await?;

        run.enter(DeliberationPhase::Conversing, "user follow-up")?;
        let started_at = Utc::now();
        let started = Instant::now();
        let mut successes = 0;
        for agent in &agents {
            let ok = self
                .sequential_turn(
                    run,
                    &discussion,
                    agent,
                    &agents,
                    self.config.continue_window,
                    RoundPrompt::None,
                    false,
                )
                .await?;
            successes += u32::from(ok);
        }
        run.session.record_round(RoundRecord {
            phase: DeliberationPhase::Conversing,
            round: None,
            successes,
            failures: agents.len() as u32 - successes,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
        });
        run.emit(Frame::AllDone)?;
        run.enter(DeliberationPhase::Finished, "all agents answered")?;
        Ok(None)
    }

    async fn drive_ask(
        &self,
        run: &mut Run<'_>,
        agent_id: AgentId,
        content: &str,
    ) -> DeliberationResult<Option<String>> {
        let (discussion, agents) = self.load_discussion(run.session.discussion_id).await?;
        let agent = agents
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
            .ok_or_else(|| DeliberationError::agent(agent_id))?;
        self.log
            .append_message(
                discussion.id,
                None,
                &format!("@{} {}", agent.name, content),
                MessageKind::User,
            )
            .await?;

        run.enter(DeliberationPhase::Conversing, "direct question")?;
        let started_at = Utc::now();
        let started = Instant::now();
        let ok = self
            .sequential_turn(
                run,
                &discussion,
                &agent,
                &agents,
                self.config.debate_window,
                RoundPrompt::Question(content.to_string()),
                true,
            )
            .await?;
        run.session.record_round(RoundRecord {
            phase: DeliberationPhase::Conversing,
            round: None,
            successes: u32::from(ok),
            failures: u32::from(!ok),
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
        });
        run.emit(Frame::AllDone)?;
        run.enter(DeliberationPhase::Finished, "agent answered")?;
        Ok(None)
    }

    /// Snapshot, fan out, persist, then emit the round's frames in roster
    /// order.
    async fn settle_round(
        &self,
        run: &mut Run<'_>,
        discussion: &Discussion,
        agents: &[Agent],
        prompt: RoundPrompt,
        kind: RoundKind,
    ) -> DeliberationResult<()> {
        run.check_cancelled()?;
        let started_at = Utc::now();
        let started = Instant::now();

        let snapshot = self.snapshot(discussion.id, agents).await?;
        let builder = ContextBuilder::new(discussion, &snapshot, self.config.debate_window);
        let turns = agents
            .iter()
            .map(|agent| (agent.clone(), builder.build(agent, &prompt)))
            .collect();
        debug!(
            history = snapshot.len(),
            window = self.config.debate_window,
            "contexts built"
        );

        let outcomes = self
            .fanout
            .run_round(discussion.id, turns, run.cancel)
            .await?;

        let failures = outcomes.iter().filter(|o| !o.result.is_success()).count() as u32;
        let successes = outcomes.len() as u32 - failures;
        let duration_ms = started.elapsed().as_millis() as u64;
        run.session.record_round(RoundRecord {
            phase: run.session.phase,
            round: kind.round(),
            successes,
            failures,
            duration_ms,
            started_at,
        });
        info!(
            phase = %run.session.phase,
            round = ?kind.round(),
            successes,
            failures,
            elapsed_ms = duration_ms,
            "round settled"
        );

        let frames = self.mux.emit_round(run.sink, &outcomes, kind)?;
        debug!(frames, "round frames emitted");
        Ok(())
    }

    /// One agent answering live: fragments are forwarded as they arrive.
    /// Returns whether the agent produced an answer.
    #[allow(clippy::too_many_arguments)]
    async fn sequential_turn(
        &self,
        run: &mut Run<'_>,
        discussion: &Discussion,
        agent: &Agent,
        agents: &[Agent],
        window: usize,
        prompt: RoundPrompt,
        persist_errors: bool,
    ) -> DeliberationResult<bool> {
        run.check_cancelled()?;
        run.emit(Frame::AgentStart {
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            agent_role: agent.role.clone(),
            round: None,
        })?;

        let snapshot = self.snapshot(discussion.id, agents).await?;
        let context = ContextBuilder::new(discussion, &snapshot, window).build(agent, &prompt);

        let (content, ok) = match self
            .stream_to_sink(run, context.messages(), &agent.model)
            .await
        {
            Ok(text) => (Some(text), true),
            Err(DeliberationError::Generation(e)) => {
                warn!(agent_id = agent.id, model = %agent.model, error = %e, "live turn failed");
                run.emit(Frame::error(e.to_string()))?;
                (persist_errors.then(|| format!("Error: {}", e)), false)
            }
            Err(e) => return Err(e),
        };

        if let Some(content) = content.filter(|c| !c.trim().is_empty()) {
            self.log
                .append_message(discussion.id, Some(agent.id), &content, MessageKind::Agent)
                .await?;
        }

        run.emit(Frame::AgentEnd {
            agent_id: agent.id,
            round: None,
        })?;
        Ok(ok)
    }

    /// Summarize every agent turn, stream it, store it and complete the
    /// discussion.
    async fn summarize_history(
        &self,
        run: &mut Run<'_>,
        discussion: &Discussion,
        agents: &[Agent],
    ) -> DeliberationResult<String> {
        let snapshot = self.snapshot(discussion.id, agents).await?;
        if snapshot.agent_turns().next().is_none() {
            return Err(DeliberationError::NothingToSummarize(discussion.id));
        }
        let prompt = summary_prompt(&discussion.topic, &snapshot);

        let summary = match self
            .stream_to_sink(run, &prompt, self.config.summary_model())
            .await
        {
            Ok(text) => text,
            Err(DeliberationError::Generation(e)) => {
                run.emit(Frame::error(e.to_string()))?;
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };

        self.log.set_summary(discussion.id, &summary).await?;
        self.log
            .append_message(discussion.id, None, &summary, MessageKind::Summary)
            .await?;
        self.log
            .set_status(discussion.id, DiscussionStatus::Completed)
            .await?;
        run.enter(DeliberationPhase::Completed, "summary stored")?;
        run.emit(Frame::Done)?;
        Ok(summary)
    }

    /// Stream a generation straight to the client, returning the full text.
    async fn stream_to_sink(
        &self,
        run: &Run<'_>,
        messages: &[ChatMessage],
        model: &str,
    ) -> DeliberationResult<String> {
        let timeout = self.config.turn_timeout();
        let deadline = Instant::now() + timeout;

        let opened = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(DeliberationError::Cancelled),
            opened = tokio::time::timeout_at(deadline, self.client.stream_complete(messages, model)) => opened,
        };
        let mut stream = opened.map_err(|_| GenerationError::Timeout(timeout))??;

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(DeliberationError::Cancelled),
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            match next.map_err(|_| GenerationError::Timeout(timeout))? {
                Some(fragment) => {
                    let fragment = fragment?;
                    if fragment.is_empty() {
                        continue;
                    }
                    text.push_str(&fragment);
                    run.emit(Frame::content(fragment))?;
                }
                None => break,
            }
        }

        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse.into());
        }
        Ok(text)
    }
}
