//! Fan-out Coordinator: one fallback invocation per agent, run concurrently,
//! joined with a result per slot.
//!
//! ```text
//! JoinSet::spawn(executor.run(agent_i, context_i)) × N
//!        │ settle in any order
//!        ▼
//! slots[i] = outcome_i        (JoinError → Failure in slot i,
//!        │                     StoreError → whole round fails)
//!        ▼
//! Vec<RoundOutcome> in roster order
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::AgentContext;
use crate::fallback::{FallbackExecutor, RoundOutcome};
use crate::model::{Agent, DiscussionId};
use crate::store::{StoreError, StoreResult};

/// Why a round did not settle.
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    /// Cancelled before every agent settled.
    #[error("round cancelled")]
    Cancelled,

    /// A finished turn could not be persisted.
    #[error("failed to persist turn: {0}")]
    Store(#[from] StoreError),
}

pub struct FanOutCoordinator {
    executor: Arc<FallbackExecutor>,
    /// 0 = one task per agent with no limit.
    max_parallel: usize,
}

impl FanOutCoordinator {
    pub fn new(executor: Arc<FallbackExecutor>) -> Self {
        Self {
            executor,
            max_parallel: 0,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn executor(&self) -> &Arc<FallbackExecutor> {
        &self.executor
    }

    /// Run every agent's turn and return the outcomes in the order of
    /// `turns`. A failing agent never cancels its siblings; cancellation of
    /// the round, or a turn that cannot be persisted, aborts all of them.
    pub async fn run_round(
        &self,
        discussion_id: DiscussionId,
        turns: Vec<(Agent, AgentContext)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RoundOutcome>, RoundError> {
        let count = turns.len();
        let agents: Vec<Agent> = turns.iter().map(|(agent, _)| agent.clone()).collect();
        let limit = if self.max_parallel == 0 {
            count.max(1)
        } else {
            self.max_parallel
        };
        let sem = Arc::new(Semaphore::new(limit));

        let mut join_set: JoinSet<(usize, StoreResult<RoundOutcome>)> = JoinSet::new();
        let mut slot_of = HashMap::with_capacity(count);

        for (index, (agent, context)) in turns.into_iter().enumerate() {
            let executor = self.executor.clone();
            let sem = sem.clone();
            let handle = join_set.spawn(async move {
                // The semaphore lives as long as the round; a closed one only
                // means there is no limit left to honour.
                let _permit = sem.acquire_owned().await.ok();
                let outcome = executor.run(discussion_id, &agent, &context).await;
                (index, outcome)
            });
            slot_of.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<RoundOutcome>> = (0..count).map(|_| None).collect();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = join_set.join_next() => Some(joined),
            };
            let Some(joined) = joined else {
                warn!(
                    discussion_id,
                    pending = join_set.len(),
                    "round cancelled, aborting agent tasks"
                );
                join_set.abort_all();
                return Err(RoundError::Cancelled);
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((_, Err(e))) => {
                    join_set.abort_all();
                    return Err(e.into());
                }
                Ok((index, Ok(outcome))) => {
                    debug!(
                        discussion_id,
                        agent_id = outcome.agent.id,
                        success = outcome.result.is_success(),
                        "agent settled"
                    );
                    slots[index] = Some(outcome);
                }
                Err(e) => {
                    let Some(&index) = slot_of.get(&e.id()) else {
                        continue;
                    };
                    warn!(discussion_id, agent_id = agents[index].id, error = %e, "agent task died");
                    let outcome = self
                        .executor
                        .settle_failure(
                            discussion_id,
                            agents[index].clone(),
                            format!("Error: agent task failed: {}", e),
                        )
                        .await;
                    match outcome {
                        Ok(outcome) => slots[index] = Some(outcome),
                        Err(e) => {
                            join_set.abort_all();
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        Ok(slots
            .into_iter()
            .zip(agents)
            .map(|(slot, agent)| {
                slot.unwrap_or_else(|| RoundOutcome::failed(agent, "Error: agent did not settle"))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBuilder, HistorySnapshot, RoundPrompt};
    use crate::generation::scripted::{ScriptKey, ScriptStep, ScriptedClient};
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    async fn round(
        client: ScriptedClient,
        names: &[&str],
    ) -> (FanOutCoordinator, Vec<(Agent, AgentContext)>, DiscussionId) {
        let store = Arc::new(MemoryStore::new());
        let mut agents = Vec::new();
        for name in names {
            agents.push(store.create_agent(name, "analyst", &format!("sys-{}", name), "m").await);
        }
        let d = store.create_discussion("topic").await;
        let snapshot = HistorySnapshot::new(vec![], &agents);
        let builder = ContextBuilder::new(&d, &snapshot, 15);
        let turns = agents
            .into_iter()
            .map(|a| {
                let ctx = builder.build(&a, &RoundPrompt::Opening);
                (a, ctx)
            })
            .collect();
        let executor = FallbackExecutor::new(Arc::new(client), store, "m2", "m3");
        (FanOutCoordinator::new(Arc::new(executor)), turns, d.id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_follow_roster_order_not_completion_order() {
        let client = ScriptedClient::new();
        client.always(ScriptKey::any(), ScriptStep::reply("ok"));
        client.set_latency(ScriptKey::system("sys-A"), Duration::from_millis(300));
        client.set_latency(ScriptKey::system("sys-B"), Duration::from_millis(100));
        client.set_latency(ScriptKey::system("sys-C"), Duration::from_millis(200));
        let (fanout, turns, id) = round(client, &["A", "B", "C"]).await;

        let outcomes = fanout
            .run_round(id, turns, &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<&str> = outcomes.iter().map(|o| o.agent.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agents_run_concurrently() {
        let client = ScriptedClient::new();
        client.always(ScriptKey::any(), ScriptStep::reply("ok"));
        client.set_latency(ScriptKey::any(), Duration::from_secs(1));
        let (fanout, turns, id) = round(client, &["A", "B", "C", "D"]).await;

        let start = tokio::time::Instant::now();
        fanout
            .run_round(id, turns, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_limit_serializes_batches() {
        let client = ScriptedClient::new();
        client.always(ScriptKey::any(), ScriptStep::reply("ok"));
        client.set_latency(ScriptKey::any(), Duration::from_secs(1));
        let (fanout, turns, id) = round(client, &["A", "B", "C", "D"]).await;
        let fanout = fanout.with_max_parallel(2);

        let start = tokio::time::Instant::now();
        fanout
            .run_round(id, turns, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_affect_siblings() {
        let client = ScriptedClient::new();
        client.always(ScriptKey::any(), ScriptStep::reply("fine"));
        client.always(ScriptKey::system("sys-B"), ScriptStep::fail("boom"));
        let (fanout, turns, id) = round(client, &["A", "B", "C"]).await;

        let outcomes = fanout
            .run_round(id, turns, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcomes[0].result.is_success());
        assert!(!outcomes[1].result.is_success());
        assert!(outcomes[2].result.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_round() {
        let client = ScriptedClient::new();
        client.always(ScriptKey::any(), ScriptStep::reply("slow"));
        client.set_latency(ScriptKey::any(), Duration::from_secs(60));
        let (fanout, turns, id) = round(client, &["A", "B"]).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let start = tokio::time::Instant::now();
        assert!(matches!(
            fanout.run_round(id, turns, &cancel).await.unwrap_err(),
            RoundError::Cancelled
        ));
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
