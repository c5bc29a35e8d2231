//! The heartbeat scheduler ("Heart").
//!
//! Grounded on `holonic_engine/scheduler.py`'s `Heart.tick`/`start`/`stop`:
//! a cooperative loop, one worker, ticks strictly serialized. Concurrency
//! primitives follow the teacher's `flow_manager.rs` style of a long-running
//! `tokio::spawn`ed task gated by an atomic running flag plus a
//! `tokio::sync::Notify` for prompt shutdown instead of polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentTree;
use crate::error::SchedulerError;
use crate::heartbeat::Heartbeat;
use crate::providers::AiTransport;
use crate::telemetry::Telemetry;

/// Standing per-agent token grants applied at the start of every tick,
/// regardless of solvency (the only path back to solvency for an agent
/// whose `token_bank` has gone negative).
#[derive(Debug, Default)]
pub struct TokenAllocations {
    amounts: Mutex<HashMap<Uuid, i64>>,
}

impl TokenAllocations {
    /// An empty allocation table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to the standing allocation for `agent_id` (additive;
    /// call [`set`](Self::set) to replace it outright).
    pub async fn add(&self, agent_id: Uuid, amount: i64) {
        let mut amounts = self.amounts.lock().await;
        *amounts.entry(agent_id).or_insert(0) += amount;
    }

    /// Replace the standing allocation for `agent_id` with exactly `amount`.
    pub async fn set(&self, agent_id: Uuid, amount: i64) {
        self.amounts.lock().await.insert(agent_id, amount);
    }

    /// Remove any standing allocation for `agent_id`.
    pub async fn remove(&self, agent_id: Uuid) {
        self.amounts.lock().await.remove(&agent_id);
    }

    /// Snapshot of all standing allocations, for applying at tick start.
    pub async fn snapshot(&self) -> Vec<(Uuid, i64)> {
        self.amounts.lock().await.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

/// Scheduler configuration.
pub struct SchedulerConfig {
    /// `<vendor>/<model>` spec passed to the AI transport.
    pub model: String,
    /// Wall-clock time between ticks.
    pub interval: std::time::Duration,
    /// Maximum tokens requested per AI call.
    pub max_response_tokens: u32,
    /// Whether to request vendor structured-output mode.
    pub structured_output: bool,
}

/// The periodic tick loop driving heartbeats across an [`AgentTree`].
///
/// Exactly one tick runs at a time: the next tick's `interval` sleep starts
/// only after the previous tick (including its AI call and dispatch) has
/// fully completed, so ticks never overlap even if a call runs long.
pub struct Scheduler {
    tree: Arc<AgentTree>,
    transport: Arc<dyn AiTransport>,
    telemetry: Arc<Telemetry>,
    allocations: Arc<TokenAllocations>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    history: Mutex<Vec<Heartbeat>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler over `tree`, sending prompts through `transport`.
    pub fn new(
        tree: Arc<AgentTree>,
        transport: Arc<dyn AiTransport>,
        telemetry: Arc<Telemetry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tree,
            transport,
            telemetry,
            allocations: Arc::new(TokenAllocations::new()),
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            history: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    /// The standing token-allocation table (add/set/remove before or while
    /// running).
    pub fn allocations(&self) -> &Arc<TokenAllocations> {
        &self.allocations
    }

    /// A snapshot of every heartbeat recorded so far, oldest first.
    pub async fn history(&self) -> Vec<Heartbeat> {
        self.history.lock().await.clone()
    }

    /// Start the tick loop as a background task. A second call while
    /// already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(interval_secs = scheduler.config.interval.as_secs(), "scheduler started");
            loop {
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }

                if let Err(err) = scheduler.tick().await {
                    warn!(error = %err, "heartbeat tick failed; continuing to next interval");
                    scheduler.telemetry.record_error(format!("tick failed: {err}"));
                }

                tokio::select! {
                    () = tokio::time::sleep(scheduler.config.interval) => {}
                    () = scheduler.stop_signal.notified() => break,
                }

                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            info!("scheduler stopped");
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Signal the loop to stop and wait up to `2 * interval` for it to exit.
    /// A tick already in flight is allowed to complete; no further tick
    /// starts afterward.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_waiters();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let timeout = self.config.interval.saturating_mul(2);
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("scheduler did not stop within 2x interval");
            }
        }
    }

    /// Run exactly one tick: allocate standing tokens, select the due and
    /// solvent set, snapshot it into a new [`Heartbeat`], call the AI
    /// transport, dispatch the reply, and record telemetry. Returns
    /// `Ok(None)` if no agent was due this tick (no AI call made).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if the AI transport fails or the tree
    /// cannot be walked; the caller (the background loop) treats this as a
    /// non-fatal, logged tick failure.
    pub async fn tick(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let tick_started = std::time::Instant::now();
        let now = Utc::now();
        let beat_time = floor_to_second(now);
        let boundary = beat_time + ChronoDuration::seconds(1);

        for (agent_id, amount) in self.allocations.snapshot().await {
            if let Some(node) = self.tree.get(agent_id).await {
                node.write().await.allocate_tokens(amount);
                self.telemetry.record_token_allocation(agent_id, amount);
                debug!(%agent_id, amount, "token allocation applied");
            }
        }

        let candidates = self.tree.collect_heartbeat_candidates().await;
        let mut due: Vec<(Uuid, DateTime<Utc>)> = Vec::new();
        for (agent_id, next_heartbeat) in candidates {
            if next_heartbeat >= boundary {
                continue;
            }
            let Some(node) = self.tree.get(agent_id).await else { continue };
            let guard = node.read().await;
            if guard.is_solvent() && guard.active_heartbeat().is_none() {
                due.push((agent_id, next_heartbeat));
            }
        }

        if due.is_empty() {
            return Ok(None);
        }

        let mut heartbeat = Heartbeat::new(beat_time);
        for (agent_id, scheduled_time) in &due {
            heartbeat.add_agent(&self.tree, *agent_id, Some(*scheduled_time)).await;
        }

        self.history.lock().await.push(heartbeat.clone());
        let history_index = self.history.lock().await.len() - 1;

        let execution_time = Utc::now();
        heartbeat.mark_executing(execution_time);
        let prompt = heartbeat.build_prompt().to_owned();

        info!(agents = due.len(), "heartbeat dispatching to AI transport");
        let ai_started = std::time::Instant::now();
        let response = self
            .transport
            .send(&prompt, &self.config.model, self.config.max_response_tokens, self.config.structured_output)
            .await
            .map_err(SchedulerError::Transport)?;
        self.telemetry.record_ai_call(ai_started.elapsed(), prompt.len(), response.len());

        heartbeat.process_response(&response);
        let completion_time = Utc::now();
        heartbeat.dispatch(&self.tree, completion_time).await;

        for record in heartbeat.records() {
            self.telemetry.record_agent_heartbeat(record.agent_id());
            for outcome in record.outcomes() {
                self.telemetry.record_action(record.agent_id(), std::time::Duration::from_millis(0), outcome.result.is_ok());
                if outcome.result.is_err() {
                    self.telemetry.record_error(format!("action '{}' failed for agent {}", outcome.action, record.agent_id()));
                }
            }
        }

        {
            let mut history = self.history.lock().await;
            if let Some(slot) = history.get_mut(history_index) {
                *slot = heartbeat;
            }
        }

        self.telemetry.record_heartbeat(tick_started.elapsed(), due.len());
        Ok(Some(beat_time))
    }
}

fn floor_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    at - ChronoDuration::nanoseconds(i64::from(at.timestamp_subsec_nanos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentTree as Tree;
    use crate::providers::ProviderError;
    use crate::tokens::HeuristicTokenCounter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        calls: AtomicUsize,
        reply: String,
        delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl AiTransport for FakeTransport {
        async fn send(&self, _prompt: &str, _model: &str, _max_tokens: u32, _structured: bool) -> Result<String, ProviderError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            model: "anthropic/claude-3-5-sonnet".into(),
            interval: std::time::Duration::from_millis(10),
            max_response_tokens: 256,
            structured_output: false,
        }
    }

    #[tokio::test]
    async fn tick_with_no_due_agent_skips_ai_call() {
        let tree = Arc::new(Tree::new(Arc::new(HeuristicTokenCounter)));
        let root = tree.root_id();
        tree.get(root).await.unwrap().write().await.set_next_heartbeat(Utc::now() + ChronoDuration::hours(1));

        let transport = Arc::new(FakeTransport { calls: AtomicUsize::new(0), reply: String::new(), delay: None });
        let scheduler = Scheduler::new(tree, transport.clone(), Arc::new(Telemetry::new()), config());

        let result = scheduler.tick().await.unwrap();
        assert!(result.is_none());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tick_allocates_tokens_even_when_insolvent() {
        let tree = Arc::new(Tree::new(Arc::new(HeuristicTokenCounter)));
        let root = tree.root_id();
        tree.get(root).await.unwrap().write().await.allocate_tokens(-10);

        let transport = Arc::new(FakeTransport { calls: AtomicUsize::new(0), reply: String::new(), delay: None });
        let scheduler = Scheduler::new(Arc::clone(&tree), transport, Arc::new(Telemetry::new()), config());
        scheduler.allocations().add(root, 3).await;

        scheduler.tick().await.unwrap();
        assert_eq!(tree.get(root).await.unwrap().read().await.token_bank(), -7);
    }

    #[tokio::test]
    async fn tick_dispatches_due_solvent_agent_and_updates_clocks() {
        let tree = Arc::new(Tree::new(Arc::new(HeuristicTokenCounter)));
        let root = tree.root_id();
        {
            let node = tree.get(root).await.unwrap();
            let mut guard = node.write().await;
            guard.allocate_tokens(100);
            guard.set_next_heartbeat(Utc::now() - ChronoDuration::seconds(5));
        }

        let reply = json!({root.to_string(): {"actions": [{"action": "knowledge_set", "params": {"path": "x", "value": 42}}]}}).to_string();
        let transport = Arc::new(FakeTransport { calls: AtomicUsize::new(0), reply, delay: None });
        let scheduler = Scheduler::new(Arc::clone(&tree), transport.clone(), Arc::new(Telemetry::new()), config());

        let result = scheduler.tick().await.unwrap();
        assert!(result.is_some());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let guard = tree.get(root).await.unwrap();
        let guard = guard.read().await;
        assert_eq!(guard.knowledge_get("x").unwrap(), json!(42));
        assert!(guard.last_heartbeat().is_some());

        let history = scheduler.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].records().len(), 1);
    }

    #[tokio::test]
    async fn second_start_while_running_is_a_noop() {
        let tree = Arc::new(Tree::new(Arc::new(HeuristicTokenCounter)));
        let transport = Arc::new(FakeTransport { calls: AtomicUsize::new(0), reply: String::new(), delay: None });
        let scheduler = Arc::new(Scheduler::new(tree, transport, Arc::new(Telemetry::new()), config()));

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.handle.lock().await.is_some());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_returns_within_two_intervals() {
        let tree = Arc::new(Tree::new(Arc::new(HeuristicTokenCounter)));
        let transport = Arc::new(FakeTransport { calls: AtomicUsize::new(0), reply: String::new(), delay: None });
        let scheduler = Arc::new(Scheduler::new(tree, transport, Arc::new(Telemetry::new()), config()));

        scheduler.start().await;
        let started = std::time::Instant::now();
        scheduler.stop().await;
        assert!(started.elapsed() <= scheduler.config.interval * 4);
    }
}
