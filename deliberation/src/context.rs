//! Context Builder: turns shared discussion history into the private,
//! role-tagged message sequence each agent sees for one round.
//!
//! Layout of every context:
//!
//! ```text
//! system     <agent system instruction>
//! user       Discussion topic: <topic>
//! ...        windowed history, oldest first
//!            user messages verbatim
//!            agent messages as assistant turns, tagged self or peer
//! user       <round prompt>            (omitted for RoundPrompt::None)
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::generation::ChatMessage;
use crate::market::SymbolTrend;
use crate::model::{Agent, AgentId, Discussion, Message, MessageKind};

/// Tag prefixed to an agent's own earlier turns.
pub const SELF_TAG: &str = "[Your previous view]";

/// Tag prefixed to another agent's turn.
pub fn peer_tag(name: &str) -> String {
    format!("[{}'s view]", name)
}

/// Immutable view of a discussion's history, read once per round and shared
/// by every agent task of that round.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    /// Conversational messages (user and agent kinds) in creation order.
    messages: Vec<Message>,
    names: HashMap<AgentId, String>,
}

impl HistorySnapshot {
    pub fn new(messages: Vec<Message>, agents: &[Agent]) -> Self {
        let mut messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.kind != MessageKind::Summary)
            .collect();
        messages.sort_by_key(|m| m.seq);
        let names = agents.iter().map(|a| (a.id, a.name.clone())).collect();
        Self { messages, names }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn name_of(&self, agent_id: AgentId) -> Option<&str> {
        self.names.get(&agent_id).map(String::as_str)
    }

    /// The most recent `bound` messages.
    pub fn window(&self, bound: usize) -> ConversationWindow<'_> {
        let start = self.messages.len().saturating_sub(bound);
        ConversationWindow {
            messages: &self.messages[start..],
            bound,
        }
    }

    /// Agent turns of known authors, oldest first.
    pub fn agent_turns(&self) -> impl Iterator<Item = (&str, &Message)> + '_ {
        self.messages
            .iter()
            .filter(|m| m.kind == MessageKind::Agent)
            .filter_map(|m| Some((self.name_of(m.agent_id?)?, m)))
    }
}

/// The last `bound` messages of a snapshot, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct ConversationWindow<'a> {
    messages: &'a [Message],
    bound: usize,
}

impl<'a> ConversationWindow<'a> {
    pub fn messages(&self) -> &'a [Message] {
        self.messages
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Trailing instruction appended after the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundPrompt {
    Opening,
    /// Debate round, 1-indexed.
    Debate(u32),
    /// Rendered market metrics, see [`data_context_prompt`].
    DataContext(String),
    /// A direct question from the user.
    Question(String),
    /// No trailing turn; the history already ends with the user's message.
    None,
}

impl RoundPrompt {
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Opening => Some(
                "Share your initial analysis of this topic from your own professional \
                 perspective, taking the discussion so far into account."
                    .to_string(),
            ),
            Self::Debate(1) => Some(
                "Respond to the other analysts' views: you may agree and build on them, \
                 rebut them with reasons, or raise new questions."
                    .to_string(),
            ),
            Self::Debate(n) => Some(format!(
                "This is debate round {}. Keep deepening the discussion: answer \
                 rebuttals, add to your views or raise new questions.",
                n
            )),
            Self::DataContext(text) | Self::Question(text) => Some(text.clone()),
            Self::None => None,
        }
    }
}

/// Per-agent, per-round context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub agent_id: AgentId,
    turns: Vec<ChatMessage>,
}

impl AgentContext {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.turns
    }
}

/// Builds [`AgentContext`]s from a [`HistorySnapshot`].
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder<'a> {
    discussion: &'a Discussion,
    snapshot: &'a HistorySnapshot,
    window: usize,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(discussion: &'a Discussion, snapshot: &'a HistorySnapshot, window: usize) -> Self {
        Self {
            discussion,
            snapshot,
            window,
        }
    }

    pub fn build(&self, agent: &Agent, prompt: &RoundPrompt) -> AgentContext {
        let window = self.snapshot.window(self.window);
        let mut turns = Vec::with_capacity(window.len() + 3);
        turns.push(ChatMessage::system(&agent.system_prompt));
        turns.push(ChatMessage::user(format!(
            "Discussion topic: {}",
            self.discussion.topic
        )));

        for message in window.messages() {
            match message.kind {
                MessageKind::User => turns.push(ChatMessage::user(&message.content)),
                MessageKind::Agent => {
                    let Some(author) = message.agent_id else {
                        continue;
                    };
                    let tag = if author == agent.id {
                        SELF_TAG.to_string()
                    } else if let Some(name) = self.snapshot.name_of(author) {
                        peer_tag(name)
                    } else {
                        // Author no longer on the roster.
                        continue;
                    };
                    turns.push(ChatMessage::assistant(format!(
                        "{} {}",
                        tag, message.content
                    )));
                }
                MessageKind::Summary => {}
            }
        }

        if let Some(text) = prompt.text() {
            turns.push(ChatMessage::user(text));
        }

        AgentContext {
            agent_id: agent.id,
            turns,
        }
    }
}

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a professional discussion summarizer, \
     skilled at extracting key information and points of consensus.";

/// Single-shot summarization context over every agent turn of the snapshot.
pub fn summary_prompt(topic: &str, snapshot: &HistorySnapshot) -> Vec<ChatMessage> {
    let mut content = format!(
        "Summarize the following discussion about \"{}\", extracting the key points, \
         the consensus and the disagreements:\n\n",
        topic
    );
    for (name, message) in snapshot.agent_turns() {
        let _ = write!(content, "[{}]: {}\n\n", name, message.content);
    }
    vec![
        ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
        ChatMessage::user(content),
    ]
}

/// Render market trends as the trailing instruction of a data-enhancement
/// round.
pub fn data_context_prompt(trends: &[SymbolTrend]) -> String {
    let mut out = String::from(
        "Below is live stock trend data. Use it to validate and adjust your \
         recommendations:\n\n",
    );
    for trend in trends {
        let _ = writeln!(out, "**{}**:", trend.symbol);
        let _ = writeln!(out, "- Current price: ${:.2}", trend.current_price);
        for window in &trend.windows {
            let _ = writeln!(
                out,
                "- {} trend: {:+.2}% (${:.2} -> ${:.2})",
                window.label, window.change_percent, window.old_price, window.current_price
            );
        }
        if let Some(rsi) = trend.rsi {
            let _ = writeln!(out, "- RSI: {:.2}", rsi);
        }
        out.push('\n');
    }
    out.push_str(
        "Based on the trend data above, validate and adjust your previous \
         recommendations. Focus on the trends (1w/1mo/3mo), not just today's price.",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ChatRole;
    use crate::market::TrendWindow;
    use crate::model::DiscussionStatus;
    use chrono::Utc;

    fn agent(id: AgentId, name: &str) -> Agent {
        Agent {
            id,
            name: name.to_string(),
            role: "analyst".to_string(),
            system_prompt: format!("You are {}", name),
            model: "m".to_string(),
            created_at: Utc::now(),
        }
    }

    fn discussion() -> Discussion {
        Discussion {
            id: 1,
            topic: "EV market outlook".to_string(),
            status: DiscussionStatus::InProgress,
            summary: None,
            created_at: Utc::now(),
        }
    }

    fn message(seq: u64, agent_id: Option<AgentId>, content: &str) -> Message {
        Message {
            id: seq,
            discussion_id: 1,
            agent_id,
            kind: if agent_id.is_some() {
                MessageKind::Agent
            } else {
                MessageKind::User
            },
            content: content.to_string(),
            seq,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_layout_and_tags() {
        let a = agent(1, "Macro");
        let b = agent(2, "Quant");
        let snapshot = HistorySnapshot::new(
            vec![
                message(1, None, "what about lithium?"),
                message(2, Some(1), "supply is tight"),
                message(3, Some(2), "momentum is fading"),
            ],
            &[a.clone(), b.clone()],
        );
        let d = discussion();
        let ctx = ContextBuilder::new(&d, &snapshot, 15).build(&a, &RoundPrompt::Debate(1));
        let turns = ctx.messages();

        assert_eq!(turns.len(), 6);
        assert_eq!(turns[0], ChatMessage::system("You are Macro"));
        assert_eq!(turns[1].content, "Discussion topic: EV market outlook");
        assert_eq!(turns[2], ChatMessage::user("what about lithium?"));
        assert_eq!(turns[3].role, ChatRole::Assistant);
        assert_eq!(turns[3].content, "[Your previous view] supply is tight");
        assert_eq!(turns[4].content, "[Quant's view] momentum is fading");
        assert_eq!(turns[5].role, ChatRole::User);
        assert!(turns[5].content.starts_with("Respond to the other analysts"));
    }

    #[test]
    fn test_window_keeps_newest_in_order() {
        let a = agent(1, "Macro");
        let messages = (1..=40).map(|i| message(i, None, &format!("m{}", i))).collect();
        let snapshot = HistorySnapshot::new(messages, &[a.clone()]);
        let d = discussion();
        let ctx = ContextBuilder::new(&d, &snapshot, 15).build(&a, &RoundPrompt::Opening);

        let history: Vec<&str> = ctx.messages()[2..ctx.messages().len() - 1]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        let expected: Vec<String> = (26..=40).map(|i| format!("m{}", i)).collect();
        assert_eq!(history, expected);
        assert_eq!(snapshot.window(15).len(), 15);
        assert_eq!(snapshot.window(100).len(), 40);
    }

    #[test]
    fn test_unknown_author_is_skipped() {
        let a = agent(1, "Macro");
        let snapshot = HistorySnapshot::new(vec![message(1, Some(99), "ghost")], &[a.clone()]);
        let d = discussion();
        let ctx = ContextBuilder::new(&d, &snapshot, 15).build(&a, &RoundPrompt::None);
        assert_eq!(ctx.messages().len(), 2);
    }

    #[test]
    fn test_later_debate_round_prompt() {
        let text = RoundPrompt::Debate(3).text().unwrap();
        assert!(text.starts_with("This is debate round 3."));
        assert_eq!(RoundPrompt::None.text(), None);
    }

    #[test]
    fn test_summary_prompt_lists_agent_turns_only() {
        let a = agent(1, "Macro");
        let snapshot = HistorySnapshot::new(
            vec![message(1, None, "question"), message(2, Some(1), "answer")],
            &[a],
        );
        let prompt = summary_prompt("EV market outlook", &snapshot);
        assert_eq!(prompt[0].content, SUMMARY_SYSTEM_PROMPT);
        assert!(prompt[1].content.contains("[Macro]: answer"));
        assert!(!prompt[1].content.contains("question"));
    }

    #[test]
    fn test_data_context_prompt_renders_signed_percent() {
        let trend = SymbolTrend {
            symbol: "TSLA".to_string(),
            current_price: 210.0,
            windows: vec![
                TrendWindow::between("1w", 200.0, 210.0),
                TrendWindow::between("1mo", 250.0, 210.0),
            ],
            rsi: Some(61.234),
            volume: None,
        };
        let text = data_context_prompt(&[trend]);
        assert!(text.contains("**TSLA**:"));
        assert!(text.contains("- 1w trend: +5.00% ($200.00 -> $210.00)"));
        assert!(text.contains("- 1mo trend: -16.00%"));
        assert!(text.contains("- RSI: 61.23"));
        assert!(text.ends_with("not just today's price."));
    }
}
