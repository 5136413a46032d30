//! `panel`: run analyst panel deliberations from the command line.
//!
//! Frames stream to stdout as SSE lines; logs go to stderr.
//!
//! ```bash
//! panel agents init
//! panel agents set-model Qwen/Qwen2.5-72B-Instruct --agent 8
//! panel new "EV market outlook"
//! panel start 1
//! panel ask 1 8 "Would you buy at today's price?"
//! panel enhance 1 TSLA NIO
//! RUST_LOG=deliberation=debug panel --offline debate 1 --rounds 3
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deliberation::{
    AgentId, AgentRoster, DiscussionId, DiscussionStatus, FlowRequest, MessageKind, MessageLog,
};
use panel_agents::market_data::extract_symbols;
use panel_agents::{seed_default_roster, Panel, PanelConfig};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "panel", author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store file (overrides PANEL_STORE_PATH and the config file)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Answer with a local echo client instead of the provider
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the analyst roster
    Agents {
        #[command(subcommand)]
        action: AgentsCommand,
    },
    /// Create a discussion
    New { topic: String },
    /// List discussions, newest first
    List,
    /// Print a discussion with its messages
    Show { discussion: DiscussionId },
    /// Delete a discussion and its messages
    Delete { discussion: DiscussionId },
    /// Opening round, debate rounds, then summary
    Start {
        discussion: DiscussionId,
        /// Debate rounds after the opening round
        #[arg(long)]
        rounds: Option<u32>,
        /// Stop after the debate without summarizing
        #[arg(long, default_value_t = false)]
        no_summary: bool,
    },
    /// Run debate rounds on top of the existing history
    Debate {
        discussion: DiscussionId,
        #[arg(long, default_value_t = 2)]
        rounds: u32,
    },
    /// Ask one agent a direct question
    Ask {
        discussion: DiscussionId,
        agent: AgentId,
        text: String,
    },
    /// Post a follow-up every agent answers in turn
    Continue { discussion: DiscussionId, text: String },
    /// Re-evaluate against market data; symbols default to those mentioned
    Enhance {
        discussion: DiscussionId,
        symbols: Vec<String>,
    },
    /// Summarize all agent turns and complete the discussion
    Summarize { discussion: DiscussionId },
    /// Mark a discussion paused
    Pause { discussion: DiscussionId },
    /// Mark a paused discussion in progress again
    Resume { discussion: DiscussionId },
    /// Single-shot completion to check provider connectivity
    Ping {
        /// Model to ping (defaults to the baseline model)
        #[arg(long)]
        model: Option<String>,
        #[arg(default_value = "Reply with OK.")]
        prompt: String,
    },
}

#[derive(Subcommand, Debug)]
enum AgentsCommand {
    /// Seed the default eight-analyst roster
    Init,
    /// List agents in speaking order
    List,
    /// Add a custom agent
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = panel_agents::roster::DEFAULT_AGENT_MODEL)]
        model: String,
    },
    /// Change the preferred model of one agent, or of every agent
    SetModel {
        model: String,
        /// Only this agent; all agents when omitted
        #[arg(long)]
        agent: Option<AgentId>,
    },
}

impl Command {
    /// Whether the command talks to the generation backend.
    fn needs_backend(&self) -> bool {
        matches!(
            self,
            Self::Start { .. }
                | Self::Debate { .. }
                | Self::Ask { .. }
                | Self::Continue { .. }
                | Self::Enhance { .. }
                | Self::Summarize { .. }
                | Self::Ping { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = PanelConfig::load(args.config.as_deref())?;
    if let Some(store) = args.store {
        config.store_path = store;
    }
    if let Command::Start {
        rounds, no_summary, ..
    } = &args.command
    {
        if let Some(rounds) = rounds {
            config.deliberation.debate_rounds = *rounds;
        }
        if *no_summary {
            config.deliberation.summarize_after_debate = false;
        }
    }

    // Store-only commands never need an API key.
    let offline = args.offline || !args.command.needs_backend();
    let panel = Panel::open(config, offline).await?;
    let store = panel.store().clone();

    let request = match args.command {
        Command::Agents { action } => {
            match action {
                AgentsCommand::Init => {
                    let agents = seed_default_roster(&store).await?;
                    for agent in agents {
                        println!("{:>3}  {}  ({})", agent.id, agent.name, agent.role);
                    }
                }
                AgentsCommand::List => {
                    for agent in store.list_agents().await? {
                        println!(
                            "{:>3}  {}  ({})  model={}",
                            agent.id, agent.name, agent.role, agent.model
                        );
                    }
                }
                AgentsCommand::Add {
                    name,
                    role,
                    prompt,
                    model,
                } => {
                    let agent = store.create_agent(&name, &role, &prompt, &model).await?;
                    println!("{}", agent.id);
                }
                AgentsCommand::SetModel { model, agent } => {
                    let model = model.trim();
                    if model.is_empty() {
                        bail!("model must not be empty");
                    }
                    let updated = store.set_agent_model(agent, model).await?;
                    for agent in &updated {
                        println!("{:>3}  {}  model={}", agent.id, agent.name, agent.model);
                    }
                    info!(count = updated.len(), model, "agent models updated");
                }
            }
            return Ok(());
        }
        Command::New { topic } => {
            let discussion = store.create_discussion(&topic).await?;
            println!("{}", discussion.id);
            return Ok(());
        }
        Command::List => {
            for d in store.list_discussions().await {
                println!("{:>3}  [{}]  {}", d.id, d.status, d.topic);
            }
            return Ok(());
        }
        Command::Show { discussion } => {
            show(&panel, discussion).await?;
            return Ok(());
        }
        Command::Delete { discussion } => {
            store.delete_discussion(discussion).await?;
            info!(discussion, "discussion deleted");
            return Ok(());
        }
        Command::Pause { discussion } => {
            store
                .set_status(discussion, DiscussionStatus::Paused)
                .await?;
            println!("{} paused", discussion);
            return Ok(());
        }
        Command::Resume { discussion } => {
            store
                .set_status(discussion, DiscussionStatus::InProgress)
                .await?;
            println!("{} in_progress", discussion);
            return Ok(());
        }
        Command::Ping { model, prompt } => {
            let model =
                model.unwrap_or_else(|| panel.config().deliberation.baseline_model.clone());
            let reply = panel.ping(&model, &prompt).await?;
            println!("{}", reply);
            return Ok(());
        }
        Command::Start { discussion, .. } => FlowRequest::Start {
            discussion_id: discussion,
        },
        Command::Debate { discussion, rounds } => FlowRequest::Debate {
            discussion_id: discussion,
            rounds,
        },
        Command::Ask {
            discussion,
            agent,
            text,
        } => FlowRequest::Ask {
            discussion_id: discussion,
            agent_id: agent,
            content: text,
        },
        Command::Continue { discussion, text } => FlowRequest::Continue {
            discussion_id: discussion,
            content: text,
        },
        Command::Enhance {
            discussion,
            symbols,
        } => {
            let symbols = if symbols.is_empty() {
                mentioned_symbols(&panel, discussion).await?
            } else {
                symbols.iter().map(|s| s.to_uppercase()).collect()
            };
            FlowRequest::Enhance {
                discussion_id: discussion,
                symbols,
            }
        }
        Command::Summarize { discussion } => FlowRequest::Summarize {
            discussion_id: discussion,
        },
    };

    let report = panel.run(request, tokio::io::stdout()).await?;
    info!(status = %report.summary_line(), "done");
    Ok(())
}

async fn show(panel: &Panel, discussion_id: DiscussionId) -> Result<()> {
    let store = panel.store();
    let discussion = store.get_discussion(discussion_id).await?;
    let agents = store.list_agents().await?;
    println!("#{} {} [{}]", discussion.id, discussion.topic, discussion.status);
    for message in store.list_messages(discussion_id).await? {
        let speaker = match (message.kind, message.agent_id) {
            (MessageKind::Summary, _) => "summary".to_string(),
            (_, Some(id)) => agents
                .iter()
                .find(|a| a.id == id)
                .map(|a| a.name.clone())
                .unwrap_or_else(|| format!("agent {}", id)),
            (_, None) => "user".to_string(),
        };
        println!("\n[{}] {}", speaker, message.content);
    }
    if let Some(summary) = discussion.summary {
        println!("\n== Summary ==\n{}", summary);
    }
    Ok(())
}

/// Tickers mentioned in the topic and history.
async fn mentioned_symbols(panel: &Panel, discussion_id: DiscussionId) -> Result<Vec<String>> {
    let store = panel.store();
    let discussion = store
        .get_discussion(discussion_id)
        .await
        .context("Failed to load discussion")?;
    let mut text = discussion.topic;
    for message in store.list_messages(discussion_id).await? {
        text.push('\n');
        text.push_str(&message.content);
    }
    let symbols = extract_symbols(&text);
    if symbols.is_empty() {
        bail!(
            "no ticker symbols found in discussion {}; pass them explicitly",
            discussion_id
        );
    }
    info!(symbols = ?symbols, "symbols extracted from discussion");
    Ok(symbols)
}
