//! Scripted deliberation integration test: drives every flow end to end
//! against the in-memory store and the scripted generation client (no
//! network, virtual time).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deliberation::context::SUMMARY_SYSTEM_PROMPT;
use deliberation::generation::scripted::{ScriptKey, ScriptStep};
use deliberation::market::StaticMarketData;
use deliberation::store::StoreResult;
use deliberation::{
    Agent, AgentId, ChatRole, Deliberation, DeliberationConfig, DeliberationError,
    DeliberationPhase, DeliberationReport, DeliberationResult, Discussion, DiscussionId,
    DiscussionStatus, FlowRequest, Frame, FrameSink, MemoryStore, Message, MessageKind,
    MessageLog, RetryPolicy, RetryingClient, ScriptedClient, StoreError, SymbolTrend,
    TrendWindow,
};
use tokio_util::sync::CancellationToken;

// ── Helpers ────────────────────────────────────────────────────────

fn config() -> DeliberationConfig {
    DeliberationConfig {
        secondary_model: "secondary".to_string(),
        baseline_model: "baseline".to_string(),
        ..Default::default()
    }
}

fn system_of(name: &str) -> String {
    format!("sys-{}", name)
}

async fn panel(topic: &str, names: &[&str]) -> (Arc<MemoryStore>, Vec<Agent>, Discussion) {
    let store = Arc::new(MemoryStore::new());
    let mut agents = Vec::new();
    for name in names {
        let agent = store
            .create_agent(name, "analyst", &system_of(name), "preferred")
            .await;
        agents.push(agent);
    }
    let discussion = store.create_discussion(topic).await;
    (store, agents, discussion)
}

fn orchestrator(
    store: &Arc<MemoryStore>,
    client: &Arc<ScriptedClient>,
    config: DeliberationConfig,
) -> Deliberation {
    Deliberation::from_store(config, store.clone(), client.clone()).unwrap()
}

async fn run_flow(
    orch: &Deliberation,
    request: FlowRequest,
) -> (DeliberationResult<DeliberationReport>, Vec<Frame>) {
    let (sink, mut rx) = FrameSink::channel();
    let result = orch.run(request, &sink, &CancellationToken::new()).await;
    drop(sink);
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    (result, frames)
}

fn kinds(frames: &[Frame]) -> Vec<&'static str> {
    frames.iter().map(Frame::kind).collect()
}

fn contents(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Content { content } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

// ── Canonical ordering ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_agent_frames_follow_roster_order_under_latency() {
    let (store, agents, discussion) = panel("rates", &["A", "B", "C"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("view"));
    client.set_latency(ScriptKey::system("sys-A"), Duration::from_millis(900));
    client.set_latency(ScriptKey::system("sys-B"), Duration::from_millis(10));
    client.set_latency(ScriptKey::system("sys-C"), Duration::from_millis(400));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 1,
        },
    )
    .await;
    result.unwrap();

    let roster: Vec<u64> = agents.iter().map(|a| a.id).collect();
    let starts: Vec<u64> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::AgentStart { agent_id, .. } => Some(*agent_id),
            _ => None,
        })
        .collect();
    let ends: Vec<u64> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::AgentEnd { agent_id, .. } => Some(*agent_id),
            _ => None,
        })
        .collect();
    assert_eq!(starts, roster);
    assert_eq!(ends, roster);
}

// ── Fallback ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_empty_candidates_fall_back_to_baseline() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.push(ScriptKey::model("preferred"), ScriptStep::Empty);
    client.push(ScriptKey::model("secondary"), ScriptStep::Empty);
    client.push(ScriptKey::model("baseline"), ScriptStep::reply("T"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 1,
        },
    )
    .await;
    result.unwrap();

    assert_eq!(contents(&frames), vec!["T"]);
    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "T");
    let models: Vec<String> = client.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec!["preferred", "secondary", "baseline"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_agent_fails_alone() {
    let (store, agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::system("sys-A"), ScriptStep::fail("503 upstream"));
    client.always(ScriptKey::system("sys-B"), ScriptStep::reply("B holds"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 1,
        },
    )
    .await;
    let report = result.unwrap();
    assert_eq!(report.session.total_failures(), 1);

    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let failure = messages.iter().find(|m| m.is_turn_of(agents[0].id)).unwrap();
    assert!(failure.content.starts_with("Error: "));
    assert!(failure.content.contains("tried 3 models"));
    let success = messages.iter().find(|m| m.is_turn_of(agents[1].id)).unwrap();
    assert_eq!(success.content, "B holds");

    // A's block: start, error, content(reason), end.
    assert_eq!(frames[0], Frame::RoundStart { round: 1 });
    let a_block: Vec<&'static str> = kinds(&frames[1..5]);
    assert_eq!(a_block, vec!["agent_start", "error", "content", "agent_end"]);
    assert_eq!(frames[2], Frame::error(failure.content.clone()));
    assert_eq!(frames[3], Frame::content(failure.content.clone()));
}

// ── Context windowing ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_window_of_15_over_40_messages() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    for i in 1..=40 {
        store
            .append_message(discussion.id, None, &format!("m{}", i), MessageKind::User)
            .await
            .unwrap();
    }
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("ok"));
    let orch = orchestrator(&store, &client, config());

    let (result, _frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 1,
        },
    )
    .await;
    result.unwrap();

    let call = &client.calls()[0];
    assert_eq!(call.messages.len(), 15 + 3);
    assert_eq!(call.messages[0].role, ChatRole::System);
    assert_eq!(call.messages[1].content, "Discussion topic: rates");
    let history: Vec<&str> = call.messages[2..17]
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    let expected: Vec<String> = (26..=40).map(|i| format!("m{}", i)).collect();
    assert_eq!(history, expected);
}

// ── Chunking ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_settled_turn_is_chunked_by_50() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let text: String = (0..137).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply(text.clone()));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 1,
        },
    )
    .await;
    result.unwrap();

    let chunks = contents(&frames);
    let lens: Vec<usize> = chunks.iter().map(|c| c.chars().count()).collect();
    assert_eq!(lens, vec![50, 50, 37]);
    assert_eq!(chunks.concat(), text);
}

// ── History between rounds ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_round_one_turns_visible_in_round_two() {
    let (store, _agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.push(ScriptKey::system("sys-A"), ScriptStep::reply("A1"));
    client.push(ScriptKey::system("sys-A"), ScriptStep::reply("A2"));
    client.push(ScriptKey::system("sys-B"), ScriptStep::reply("B1"));
    client.push(ScriptKey::system("sys-B"), ScriptStep::reply("B2"));
    let orch = orchestrator(&store, &client, config());

    let (result, _frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 2,
        },
    )
    .await;
    result.unwrap();

    let assistant_turns = |system: &str| -> Vec<String> {
        let calls = client.calls_for(system);
        assert_eq!(calls.len(), 2);
        calls[1]
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::Assistant)
            .map(|m| m.content.clone())
            .collect()
    };

    let a_view = assistant_turns("sys-A");
    assert_eq!(a_view, vec!["[Your previous view] A1", "[B's view] B1"]);
    let b_view = assistant_turns("sys-B");
    assert_eq!(b_view, vec!["[A's view] A1", "[Your previous view] B1"]);

    let sys_a_calls = client.calls_for("sys-A");
    let round_two_prompt = &sys_a_calls[1].messages.last().unwrap().content;
    assert!(round_two_prompt.starts_with("This is debate round 2."));
}

// ── Golden start flow ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_start_flow_golden_sequence() {
    let (store, agents, discussion) = panel("EV market outlook", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::system("sys-A"), ScriptStep::reply("A view"));
    client.always(ScriptKey::system("sys-B"), ScriptStep::reply("B view"));
    client.always(
        ScriptKey::system(SUMMARY_SYSTEM_PROMPT),
        ScriptStep::reply("Summary."),
    );
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Start {
            discussion_id: discussion.id,
        },
    )
    .await;
    let report = result.unwrap();

    let turn = ["agent_start", "content", "agent_end"];
    let mut expected: Vec<&str> = Vec::new();
    expected.extend(turn);
    expected.extend(turn);
    expected.push("all_done");
    expected.push("debate_starting");
    for _ in 1..=2 {
        expected.push("round_start");
        expected.extend(turn);
        expected.extend(turn);
        expected.push("round_end");
    }
    expected.push("debate_done");
    expected.push("content");
    expected.push("done");
    assert_eq!(kinds(&frames), expected);

    assert_eq!(kinds(&frames).iter().filter(|k| **k == "all_done").count(), 1);
    let debate_done = frames.iter().position(|f| *f == Frame::DebateDone).unwrap();
    assert_eq!(frames[debate_done - 1], Frame::RoundEnd { round: 2 });
    assert_eq!(
        frames[0],
        Frame::AgentStart {
            agent_id: agents[0].id,
            agent_name: "A".to_string(),
            agent_role: "analyst".to_string(),
            round: None,
        }
    );
    assert_eq!(
        frames[9],
        Frame::AgentStart {
            agent_id: agents[0].id,
            agent_name: "A".to_string(),
            agent_role: "analyst".to_string(),
            round: Some(1),
        }
    );

    assert_eq!(report.terminal_phase(), DeliberationPhase::Completed);
    assert_eq!(report.session.rounds.len(), 3);
    assert_eq!(report.summary.as_deref(), Some("Summary."));
    assert_eq!(report.frames_emitted, frames.len() as u64);

    let stored = store.get_discussion(discussion.id).await.unwrap();
    assert_eq!(stored.status, DiscussionStatus::Completed);
    assert_eq!(stored.summary.as_deref(), Some("Summary."));

    // 2 opening + 2 × 2 debate turns + the summary.
    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 7);
    assert_eq!(messages[6].kind, MessageKind::Summary);

    // The summarizer saw every agent turn.
    let summary_call = client.calls_for(SUMMARY_SYSTEM_PROMPT).pop().unwrap();
    assert_eq!(summary_call.model, "baseline");
    assert_eq!(summary_call.messages[1].content.matches("[A]: A view").count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_start_without_summary_finishes() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("ok"));
    let config = DeliberationConfig {
        debate_rounds: 1,
        summarize_after_debate: false,
        ..config()
    };
    let orch = orchestrator(&store, &client, config);

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Start {
            discussion_id: discussion.id,
        },
    )
    .await;
    let report = result.unwrap();
    assert_eq!(report.terminal_phase(), DeliberationPhase::Finished);
    assert_eq!(frames.last(), Some(&Frame::DebateDone));
    let stored = store.get_discussion(discussion.id).await.unwrap();
    assert_eq!(stored.status, DiscussionStatus::InProgress);
}

// ── Rejections ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_discussion_rejected_before_any_frame() {
    let (store, _agents, _discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::echo());
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(&orch, FlowRequest::Start { discussion_id: 999 }).await;
    assert!(result.unwrap_err().is_not_found());
    assert!(frames.is_empty());
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_empty_roster_rejected() {
    let (store, _agents, discussion) = panel("rates", &[]).await;
    let client = Arc::new(ScriptedClient::echo());
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Continue {
            discussion_id: discussion.id,
            content: "anyone?".to_string(),
        },
    )
    .await;
    assert!(matches!(result, Err(DeliberationError::NoAgents)));
    assert!(frames.is_empty());
    assert!(store.list_messages(discussion.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_summarize_without_agent_turns_rejected() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    store
        .append_message(discussion.id, None, "only a question", MessageKind::User)
        .await
        .unwrap();
    let client = Arc::new(ScriptedClient::echo());
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Summarize {
            discussion_id: discussion.id,
        },
    )
    .await;
    assert!(matches!(
        result,
        Err(DeliberationError::NothingToSummarize(_))
    ));
    assert!(frames.is_empty());
}

#[tokio::test]
async fn test_ask_unknown_agent_rejected() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::echo());
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Ask {
            discussion_id: discussion.id,
            agent_id: 42,
            content: "hello?".to_string(),
        },
    )
    .await;
    assert!(result.unwrap_err().is_not_found());
    assert!(frames.is_empty());
}

// ── Sequential flows ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_continue_streams_each_agent_in_turn() {
    let (store, agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new().with_fragment_chars(4));
    client.always(ScriptKey::system("sys-A"), ScriptStep::reply("rates stay high"));
    client.always(ScriptKey::system("sys-B"), ScriptStep::reply("cuts by June"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Continue {
            discussion_id: discussion.id,
            content: "what about rates?".to_string(),
        },
    )
    .await;
    result.unwrap();

    // Native fragments, not 50-char chunks.
    assert_eq!(frames[1], Frame::content("rate"));
    assert_eq!(frames.last(), Some(&Frame::AllDone));
    assert_eq!(kinds(&frames).iter().filter(|k| **k == "agent_end").count(), 2);

    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].kind, MessageKind::User);
    assert_eq!(messages[0].content, "what about rates?");
    assert!(messages[1].is_turn_of(agents[0].id));
    assert_eq!(messages[2].content, "cuts by June");

    // A's context ends with the follow-up; B also sees A's fresh answer.
    let a_call = &client.calls_for("sys-A")[0];
    assert_eq!(a_call.messages.last().unwrap().content, "what about rates?");
    assert_eq!(a_call.model, "preferred");
    let b_call = &client.calls_for("sys-B")[0];
    assert_eq!(
        b_call.messages.last().unwrap().content,
        "[A's view] rates stay high"
    );
}

#[tokio::test(start_paused = true)]
async fn test_continue_error_becomes_error_frame() {
    let (store, _agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::system("sys-A"), ScriptStep::fail("timeout"));
    client.always(ScriptKey::system("sys-B"), ScriptStep::reply("fine"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Continue {
            discussion_id: discussion.id,
            content: "go on".to_string(),
        },
    )
    .await;
    result.unwrap();

    assert_eq!(
        kinds(&frames)[..3],
        ["agent_start", "error", "agent_end"]
    );
    // Only the user message and B's answer are stored.
    assert_eq!(store.list_messages(discussion.id).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ask_agent_persists_mention_and_answer() {
    let (store, agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::system("sys-B"), ScriptStep::reply("B answers"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Ask {
            discussion_id: discussion.id,
            agent_id: agents[1].id,
            content: "how risky is this?".to_string(),
        },
    )
    .await;
    result.unwrap();

    assert_eq!(
        kinds(&frames),
        vec!["agent_start", "content", "agent_end", "all_done"]
    );
    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages[0].content, "@B how risky is this?");
    assert_eq!(messages[1].content, "B answers");

    let call = &client.calls_for("sys-B")[0];
    let n = call.messages.len();
    assert_eq!(call.messages[n - 2].content, "@B how risky is this?");
    assert_eq!(call.messages[n - 1].content, "how risky is this?");
    assert!(client.calls_for("sys-A").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ask_agent_failure_text_is_persisted() {
    let (store, agents, discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::fail("connection refused"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Ask {
            discussion_id: discussion.id,
            agent_id: agents[0].id,
            content: "still there?".to_string(),
        },
    )
    .await;
    result.unwrap();

    assert_eq!(
        kinds(&frames),
        vec!["agent_start", "error", "agent_end", "all_done"]
    );
    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].content.starts_with("Error: "));
    assert!(messages[1].content.contains("connection refused"));
}

// ── Data enhancement ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_enhance_with_data() {
    let (store, _agents, discussion) = panel("EV market outlook", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("adjusted"));
    let market = Arc::new(StaticMarketData::new(vec![SymbolTrend {
        symbol: "TSLA".to_string(),
        current_price: 210.0,
        windows: vec![TrendWindow::between("1w", 200.0, 210.0)],
        rsi: Some(55.0),
        volume: Some(1_000),
    }]));
    let orch = orchestrator(&store, &client, config()).with_market_data(market);

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Enhance {
            discussion_id: discussion.id,
            symbols: vec!["TSLA".to_string(), "ZZZZ".to_string()],
        },
    )
    .await;
    let report = result.unwrap();

    assert_eq!(
        frames[0],
        Frame::DataLoaded {
            symbols: vec!["TSLA".to_string()]
        }
    );
    assert_eq!(frames.last(), Some(&Frame::EnhanceDone));
    assert!(frames.iter().all(|f| !matches!(
        f,
        Frame::AgentStart { round: Some(_), .. } | Frame::RoundEnd { .. }
    )));
    assert_eq!(report.terminal_phase(), DeliberationPhase::Finished);

    let call = &client.calls()[0];
    let prompt = &call.messages.last().unwrap().content;
    assert!(prompt.contains("**TSLA**:"));
    assert!(prompt.contains("+5.00%"));
    assert_eq!(store.list_messages(discussion.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_enhance_without_market_source_is_configuration_error() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::echo());
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Enhance {
            discussion_id: discussion.id,
            symbols: vec!["TSLA".to_string()],
        },
    )
    .await;
    assert!(matches!(result, Err(DeliberationError::Configuration(_))));
    assert!(frames.is_empty());
}

// ── Summary ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_summary_failure_emits_error_and_keeps_status() {
    let (store, agents, discussion) = panel("rates", &["A"]).await;
    store
        .append_message(discussion.id, Some(agents[0].id), "hold", MessageKind::Agent)
        .await
        .unwrap();
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::fail("overloaded"));
    let orch = orchestrator(&store, &client, config());

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Summarize {
            discussion_id: discussion.id,
        },
    )
    .await;
    assert!(matches!(result, Err(DeliberationError::Generation(_))));
    assert_eq!(kinds(&frames), vec!["error"]);
    let stored = store.get_discussion(discussion.id).await.unwrap();
    assert_eq!(stored.status, DiscussionStatus::InProgress);
    assert!(stored.summary.is_none());
}

// ── Cancellation ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_dropping_receiver_cancels_run() {
    let (store, _agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("slow"));
    client.set_latency(ScriptKey::any(), Duration::from_secs(30));
    let orch = orchestrator(&store, &client, config()).shared();

    let (handle, rx, _cancel) = orch.spawn(FlowRequest::Start {
        discussion_id: discussion.id,
    });
    drop(rx);

    let started = tokio::time::Instant::now();
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DeliberationError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(30));
    // Nothing settled, so nothing was persisted.
    assert!(store.list_messages(discussion.id).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_spawned_run_streams_frames() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let client = Arc::new(ScriptedClient::echo());
    let config = DeliberationConfig {
        debate_rounds: 1,
        summarize_after_debate: false,
        ..config()
    };
    let orch = orchestrator(&store, &client, config).shared();

    let (handle, mut rx, _cancel) = orch.spawn(FlowRequest::Start {
        discussion_id: discussion.id,
    });
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.frames_emitted, frames.len() as u64);
    assert_eq!(frames.last(), Some(&Frame::DebateDone));
    assert!(frames[0].to_sse().unwrap().starts_with("data: {\"type\":\"agent_start\""));
}

#[tokio::test(start_paused = true)]
async fn test_client_gone_mid_round_keeps_settled_turns() {
    let (store, agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("view"));
    client.set_latency(ScriptKey::system("sys-A"), Duration::from_secs(1));
    client.set_latency(ScriptKey::system("sys-B"), Duration::from_secs(60));
    let orch = orchestrator(&store, &client, config()).shared();

    let (handle, rx, _cancel) = orch.spawn(FlowRequest::Debate {
        discussion_id: discussion.id,
        rounds: 1,
    });
    // A settles at 1s; B is still generating when the client leaves.
    tokio::time::sleep(Duration::from_secs(5)).await;
    drop(rx);

    let started = tokio::time::Instant::now();
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DeliberationError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(60));

    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].agent_id, Some(agents[0].id));
    assert_eq!(messages[0].content, "view");
}

// ── Persistence failures ───────────────────────────────────────────

/// Message log that accepts a fixed number of agent turns, then fails
/// every further agent write.
struct FailingAfter {
    inner: Arc<MemoryStore>,
    agent_writes_left: AtomicUsize,
}

#[async_trait]
impl MessageLog for FailingAfter {
    async fn append_message(
        &self,
        discussion_id: DiscussionId,
        agent_id: Option<AgentId>,
        content: &str,
        kind: MessageKind,
    ) -> StoreResult<Message> {
        if kind == MessageKind::Agent {
            let left = self.agent_writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.agent_writes_left.store(left - 1, Ordering::SeqCst);
        }
        self.inner
            .append_message(discussion_id, agent_id, content, kind)
            .await
    }

    async fn list_messages(&self, discussion_id: DiscussionId) -> StoreResult<Vec<Message>> {
        self.inner.list_messages(discussion_id).await
    }

    async fn get_discussion(&self, id: DiscussionId) -> StoreResult<Discussion> {
        self.inner.get_discussion(id).await
    }

    async fn set_status(&self, id: DiscussionId, status: DiscussionStatus) -> StoreResult<()> {
        self.inner.set_status(id, status).await
    }

    async fn set_summary(&self, id: DiscussionId, summary: &str) -> StoreResult<()> {
        self.inner.set_summary(id, summary).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_unpersisted_round_stops_the_run() {
    let (store, _agents, discussion) = panel("rates", &["A", "B"]).await;
    let client = Arc::new(ScriptedClient::new());
    client.always(ScriptKey::any(), ScriptStep::reply("view"));
    let log = Arc::new(FailingAfter {
        inner: store.clone(),
        // The opening round goes through, debate round 1 does not.
        agent_writes_left: AtomicUsize::new(2),
    });
    let config = DeliberationConfig {
        debate_rounds: 2,
        summarize_after_debate: false,
        ..config()
    };
    let orch = Deliberation::new(config, log, store.clone(), client.clone()).unwrap();

    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Start {
            discussion_id: discussion.id,
        },
    )
    .await;
    assert!(
        matches!(result, Err(DeliberationError::Store(StoreError::Io(_)))),
        "{:?}",
        result.err()
    );

    // Round 1 never settled: no agent frames for it, no round 2, no debate_done.
    assert_eq!(frames.last(), Some(&Frame::RoundStart { round: 1 }));
    assert!(!frames
        .iter()
        .any(|f| matches!(f, Frame::AgentStart { round: Some(_), .. })));
    assert!(!frames.contains(&Frame::RoundStart { round: 2 }));
    assert!(!frames.contains(&Frame::DebateDone));

    // Only the opening turns are stored, and no round-2 context was built.
    assert_eq!(store.list_messages(discussion.id).await.unwrap().len(), 2);
    assert!(!client.calls().iter().any(|call| call
        .messages
        .iter()
        .any(|m| m.content.starts_with("This is debate round 2."))));
}

// ── Retry under fallback ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_transport_retries_exhaust_before_falling_back() {
    let (store, _agents, discussion) = panel("rates", &["A"]).await;
    let scripted = ScriptedClient::new();
    scripted.always(ScriptKey::model("preferred"), ScriptStep::fail("503"));
    scripted.always(ScriptKey::model("secondary"), ScriptStep::reply("recovered"));
    let client = Arc::new(RetryingClient::new(scripted, RetryPolicy::default()));
    let orch = Deliberation::from_store(config(), store.clone(), client.clone()).unwrap();

    let started = tokio::time::Instant::now();
    let (result, frames) = run_flow(
        &orch,
        FlowRequest::Debate {
            discussion_id: discussion.id,
            rounds: 1,
        },
    )
    .await;
    result.unwrap();

    let models: Vec<String> = client
        .inner()
        .calls()
        .into_iter()
        .map(|c| c.model)
        .collect();
    assert_eq!(models, vec!["preferred", "preferred", "preferred", "secondary"]);
    // Backoff of 1s then 2s between the three attempts on the preferred model.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(contents(&frames), vec!["recovered"]);
    assert!(!kinds(&frames).contains(&"error"));

    let messages = store.list_messages(discussion.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "recovered");
}
