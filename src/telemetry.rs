//! In-memory telemetry.
//!
//! Grounded on `holonic_engine/telemetry.py`'s aggregate counters/histograms
//! and on the teacher's `agent/budget.rs` atomics style (lock-free
//! `AtomicU64` counters, a `Mutex`-guarded ring buffer for the handful of
//! operations — error recording, per-agent stat lookup — that need more
//! than a single word). Passed explicitly into the scheduler and the
//! inspection surface rather than held as a global singleton, per the
//! design note on replacing singletons with an explicit runtime context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

const ERROR_RING_CAPACITY: usize = 100;

/// Count, total, min, max of a series of durations (milliseconds).
#[derive(Debug, Default)]
struct Histogram {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Histogram {
    fn record(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |m| Some(if m == 0 { ms } else { m.min(ms) })).ok();
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_ms: self.total_ms.load(Ordering::Relaxed),
            min_ms: self.min_ms.load(Ordering::Relaxed),
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_ms.store(0, Ordering::Relaxed);
        self.min_ms.store(0, Ordering::Relaxed);
        self.max_ms.store(0, Ordering::Relaxed);
    }
}

/// A [`Histogram`]'s point-in-time values.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// Number of observations recorded.
    pub count: u64,
    /// Sum of all recorded durations, in milliseconds.
    pub total_ms: u64,
    /// Smallest recorded duration, in milliseconds.
    pub min_ms: u64,
    /// Largest recorded duration, in milliseconds.
    pub max_ms: u64,
}

/// A monotonically increasing counter with first/last timestamps, from
/// which a rate can be derived.
#[derive(Debug, Default)]
struct RatedCounter {
    count: AtomicU64,
    first_at: Mutex<Option<DateTime<Utc>>>,
    last_at: Mutex<Option<DateTime<Utc>>>,
}

impl RatedCounter {
    fn increment(&self, by: u64) {
        self.count.fetch_add(by, Ordering::Relaxed);
        let now = Utc::now();
        let mut first = self.first_at.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some(now);
        }
        drop(first);
        *self.last_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    fn snapshot(&self) -> RatedCounterSnapshot {
        let first_at = *self.first_at.lock().unwrap_or_else(|e| e.into_inner());
        let last_at = *self.last_at.lock().unwrap_or_else(|e| e.into_inner());
        let count = self.count.load(Ordering::Relaxed);

        let rate_per_sec = match (first_at, last_at) {
            (Some(first), Some(last)) if last > first => {
                let elapsed = (last - first).num_milliseconds().max(1);
                #[allow(clippy::cast_precision_loss)]
                {
                    count as f64 / (elapsed as f64 / 1000.0)
                }
            }
            _ => 0.0,
        };

        RatedCounterSnapshot { count, first_at, last_at, rate_per_sec }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        *self.first_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.last_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// A [`RatedCounter`]'s point-in-time values.
#[derive(Debug, Clone, Serialize)]
pub struct RatedCounterSnapshot {
    /// Total count observed so far.
    pub count: u64,
    /// Timestamp of the first increment, if any.
    pub first_at: Option<DateTime<Utc>>,
    /// Timestamp of the most recent increment, if any.
    pub last_at: Option<DateTime<Utc>>,
    /// Increments per second between `first_at` and `last_at`.
    pub rate_per_sec: f64,
}

/// Per-agent counters accumulated across all heartbeats the agent has
/// participated in.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AgentStats {
    /// Heartbeats this agent has participated in.
    pub heartbeats: u64,
    /// Actions dispatched for this agent.
    pub actions: u64,
    /// Tokens received via allocation.
    pub tokens_received: u64,
    /// Tokens spent (reserved for a future debit path; always zero today
    /// since no action currently debits `token_bank`).
    pub tokens_spent: u64,
    /// Action dispatch failures recorded for this agent.
    pub errors: u64,
}

/// One recorded error, kept in a bounded ring buffer (oldest evicted).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
}

/// All telemetry aggregates for one runtime. Safe to share via `Arc` and
/// update concurrently from the scheduler and the inspection surface.
#[derive(Debug, Default)]
pub struct Telemetry {
    heartbeat_duration: Histogram,
    ai_call_duration: Histogram,
    action_duration: Histogram,

    heartbeats: RatedCounter,
    agents_processed: RatedCounter,
    actions_dispatched: RatedCounter,
    actions_failed: RatedCounter,
    tokens_allocated: RatedCounter,
    ai_calls: RatedCounter,

    prompt_tokens_total: AtomicU64,
    response_tokens_total: AtomicU64,

    per_agent: Mutex<HashMap<Uuid, AgentStats>>,
    errors: Mutex<Vec<ErrorEntry>>,
}

impl Telemetry {
    /// A fresh, empty telemetry context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed heartbeat tick's total duration and agent count.
    pub fn record_heartbeat(&self, duration: Duration, agent_count: usize) {
        self.heartbeat_duration.record(duration);
        self.heartbeats.increment(1);
        self.agents_processed.increment(u64::try_from(agent_count).unwrap_or(u64::MAX));
    }

    /// Record one AI round trip's duration and approximate prompt/response
    /// sizes (character counts, since exact token counts depend on the
    /// vendor's own tokenizer).
    pub fn record_ai_call(&self, duration: Duration, prompt_chars: usize, response_chars: usize) {
        self.ai_call_duration.record(duration);
        self.ai_calls.increment(1);
        self.prompt_tokens_total.fetch_add(u64::try_from(prompt_chars).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.response_tokens_total.fetch_add(u64::try_from(response_chars).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Record a standing token allocation applied to `agent_id`.
    pub fn record_token_allocation(&self, agent_id: Uuid, amount: i64) {
        self.tokens_allocated.increment(1);
        let mut per_agent = self.per_agent.lock().unwrap_or_else(|e| e.into_inner());
        let stats = per_agent.entry(agent_id).or_default();
        if amount > 0 {
            stats.tokens_received = stats.tokens_received.saturating_add(u64::try_from(amount).unwrap_or(0));
        }
    }

    /// Record one action's dispatch outcome against `agent_id`.
    pub fn record_action(&self, agent_id: Uuid, duration: Duration, succeeded: bool) {
        self.action_duration.record(duration);
        if succeeded {
            self.actions_dispatched.increment(1);
        } else {
            self.actions_failed.increment(1);
        }

        let mut per_agent = self.per_agent.lock().unwrap_or_else(|e| e.into_inner());
        let stats = per_agent.entry(agent_id).or_default();
        stats.actions = stats.actions.saturating_add(1);
        if !succeeded {
            stats.errors = stats.errors.saturating_add(1);
        }
    }

    /// Record that `agent_id` participated in one more heartbeat (called
    /// once per record in a completed heartbeat).
    pub fn record_agent_heartbeat(&self, agent_id: Uuid) {
        let mut per_agent = self.per_agent.lock().unwrap_or_else(|e| e.into_inner());
        let stats = per_agent.entry(agent_id).or_default();
        stats.heartbeats = stats.heartbeats.saturating_add(1);
    }

    /// Record an error, evicting the oldest entry once the ring buffer is
    /// full.
    pub fn record_error(&self, message: impl Into<String>) {
        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        if errors.len() >= ERROR_RING_CAPACITY {
            errors.remove(0);
        }
        errors.push(ErrorEntry { at: Utc::now(), message: message.into() });
    }

    /// Stats accumulated for one agent, if it has ever been observed.
    pub fn agent_stats(&self, agent_id: Uuid) -> Option<AgentStats> {
        self.per_agent.lock().unwrap_or_else(|e| e.into_inner()).get(&agent_id).cloned()
    }

    /// A nested snapshot of every aggregate, suitable for observability
    /// consumers (e.g. the inspection surface's `/api/telemetry` route).
    pub fn summary(&self) -> TelemetrySummary {
        TelemetrySummary {
            heartbeat_duration: self.heartbeat_duration.snapshot(),
            ai_call_duration: self.ai_call_duration.snapshot(),
            action_duration: self.action_duration.snapshot(),
            heartbeats: self.heartbeats.snapshot(),
            agents_processed: self.agents_processed.snapshot(),
            actions_dispatched: self.actions_dispatched.snapshot(),
            actions_failed: self.actions_failed.snapshot(),
            tokens_allocated: self.tokens_allocated.snapshot(),
            ai_calls: self.ai_calls.snapshot(),
            prompt_tokens_total: self.prompt_tokens_total.load(Ordering::Relaxed),
            response_tokens_total: self.response_tokens_total.load(Ordering::Relaxed),
            per_agent: self.per_agent.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            recent_errors: self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    /// Clear every aggregate back to its zero value.
    pub fn reset(&self) {
        self.heartbeat_duration.reset();
        self.ai_call_duration.reset();
        self.action_duration.reset();
        self.heartbeats.reset();
        self.agents_processed.reset();
        self.actions_dispatched.reset();
        self.actions_failed.reset();
        self.tokens_allocated.reset();
        self.ai_calls.reset();
        self.prompt_tokens_total.store(0, Ordering::Relaxed);
        self.response_tokens_total.store(0, Ordering::Relaxed);
        self.per_agent.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// A full point-in-time snapshot of a [`Telemetry`] context.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySummary {
    /// Per-tick duration histogram.
    pub heartbeat_duration: HistogramSnapshot,
    /// AI round-trip duration histogram.
    pub ai_call_duration: HistogramSnapshot,
    /// Per-action dispatch duration histogram.
    pub action_duration: HistogramSnapshot,
    /// Completed heartbeat ticks, with rate.
    pub heartbeats: RatedCounterSnapshot,
    /// Total agents processed across all ticks, with rate.
    pub agents_processed: RatedCounterSnapshot,
    /// Successful action dispatches, with rate.
    pub actions_dispatched: RatedCounterSnapshot,
    /// Failed action dispatches, with rate.
    pub actions_failed: RatedCounterSnapshot,
    /// Token allocation events, with rate.
    pub tokens_allocated: RatedCounterSnapshot,
    /// AI calls issued, with rate.
    pub ai_calls: RatedCounterSnapshot,
    /// Approximate total prompt size sent, in characters.
    pub prompt_tokens_total: u64,
    /// Approximate total response size received, in characters.
    pub response_tokens_total: u64,
    /// Per-agent accumulated stats.
    pub per_agent: HashMap<Uuid, AgentStats>,
    /// The most recent errors, oldest first, capped at 100.
    pub recent_errors: Vec<ErrorEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_heartbeat_updates_histogram_and_counter() {
        let telemetry = Telemetry::new();
        telemetry.record_heartbeat(Duration::from_millis(50), 3);
        let summary = telemetry.summary();
        assert_eq!(summary.heartbeats.count, 1);
        assert_eq!(summary.heartbeat_duration.count, 1);
        assert_eq!(summary.agents_processed.count, 3);
    }

    #[test]
    fn record_action_tracks_per_agent_success_and_failure() {
        let telemetry = Telemetry::new();
        let agent = Uuid::new_v4();
        telemetry.record_action(agent, Duration::from_millis(1), true);
        telemetry.record_action(agent, Duration::from_millis(1), false);

        let stats = telemetry.agent_stats(agent).unwrap();
        assert_eq!(stats.actions, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn error_ring_buffer_evicts_oldest_past_capacity() {
        let telemetry = Telemetry::new();
        for i in 0..(ERROR_RING_CAPACITY + 10) {
            telemetry.record_error(format!("error {i}"));
        }
        let summary = telemetry.summary();
        assert_eq!(summary.recent_errors.len(), ERROR_RING_CAPACITY);
        assert_eq!(summary.recent_errors[0].message, "error 10");
    }

    #[test]
    fn reset_clears_all_aggregates() {
        let telemetry = Telemetry::new();
        telemetry.record_heartbeat(Duration::from_millis(10), 1);
        telemetry.record_error("boom");
        telemetry.reset();
        let summary = telemetry.summary();
        assert_eq!(summary.heartbeats.count, 0);
        assert!(summary.recent_errors.is_empty());
    }
}
