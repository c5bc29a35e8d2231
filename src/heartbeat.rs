//! Heartbeat records.
//!
//! Grounded on `holonic_engine/scheduler.py`'s `Heartbeat` class: an
//! immutable-after-dispatch record of one scheduler tick, carrying a deep
//! HUD snapshot per selected agent, the rendered prompt, the raw and parsed
//! AI reply, and the per-agent action-dispatch trace. State moves strictly
//! `Pending` → `Active` (prompt sent) → `Complete` (reply dispatched).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::AgentTree;
use crate::error::AgentError;

/// Lifecycle state of a [`Heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Created, no AI call made yet.
    Pending,
    /// The AI call is in flight (`execution_time` has been set).
    Active,
    /// The reply has been dispatched (`completion_time` has been set).
    Complete,
}

/// One action the AI asked an agent to take, as decoded from its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCall {
    /// The action name.
    pub action: String,
    /// Keyword-style parameters.
    pub params: BTreeMap<String, Value>,
}

/// The outcome of dispatching one [`ActionCall`]: its result, or the error
/// message if dispatch failed (per-action errors are non-fatal).
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// The action that was dispatched.
    pub action: String,
    /// `Ok` result JSON, or `Err` with a human-readable failure reason.
    pub result: Result<Value, String>,
}

/// One agent's participation in a heartbeat: its snapshot at selection
/// time, the actions decoded for it from the reply, and the outcomes once
/// dispatched.
#[derive(Debug, Clone)]
pub struct Record {
    agent_id: Uuid,
    hud_snapshot: Value,
    scheduled_time: DateTime<Utc>,
    actions: Vec<ActionCall>,
    outcomes: Vec<ActionOutcome>,
}

impl Record {
    /// The agent this record is for.
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// The agent's HUD as captured when it was added to the heartbeat —
    /// immutable thereafter, regardless of later mutation to the live agent.
    pub fn hud_snapshot(&self) -> &Value {
        &self.hud_snapshot
    }

    /// The `next_heartbeat` in effect at selection time.
    pub fn scheduled_time(&self) -> DateTime<Utc> {
        self.scheduled_time
    }

    /// Actions decoded for this agent from the AI reply.
    pub fn actions(&self) -> &[ActionCall] {
        &self.actions
    }

    /// Outcomes of dispatching each action, in order. Empty until
    /// [`Heartbeat::dispatch`] runs.
    pub fn outcomes(&self) -> &[ActionOutcome] {
        &self.outcomes
    }
}

/// One scheduler tick's batch: selected agents, the rendered prompt, the
/// raw and parsed reply, and the dispatch trace. Append-only once created;
/// [`Heartbeat::add_agent`] may run multiple times before the AI call, but
/// nothing mutates a record's `hud_snapshot` after it is taken.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    heartbeat_time: DateTime<Utc>,
    execution_time: Option<DateTime<Utc>>,
    completion_time: Option<DateTime<Utc>>,
    records: Vec<Record>,
    full_prompt: Option<String>,
    raw_response: Option<String>,
    parsed_response: Option<Value>,
}

impl Heartbeat {
    /// Start a new, empty heartbeat for tick boundary `heartbeat_time`.
    pub fn new(heartbeat_time: DateTime<Utc>) -> Self {
        Self {
            heartbeat_time,
            execution_time: None,
            completion_time: None,
            records: Vec::new(),
            full_prompt: None,
            raw_response: None,
            parsed_response: None,
        }
    }

    /// The tick boundary this heartbeat was created for.
    pub fn heartbeat_time(&self) -> DateTime<Utc> {
        self.heartbeat_time
    }

    /// When the AI call was issued, if it has been.
    pub fn execution_time(&self) -> Option<DateTime<Utc>> {
        self.execution_time
    }

    /// When the reply was dispatched, if it has been.
    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        self.completion_time
    }

    /// Current lifecycle state.
    pub fn status(&self) -> HeartbeatStatus {
        if self.completion_time.is_some() {
            HeartbeatStatus::Complete
        } else if self.execution_time.is_some() {
            HeartbeatStatus::Active
        } else {
            HeartbeatStatus::Pending
        }
    }

    /// This heartbeat's per-agent records, in add order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The rendered prompt, once [`build_prompt`](Self::build_prompt) has run.
    pub fn full_prompt(&self) -> Option<&str> {
        self.full_prompt.as_deref()
    }

    /// The raw AI reply text, once set.
    pub fn raw_response(&self) -> Option<&str> {
        self.raw_response.as_deref()
    }

    /// Mark the AI call as issued.
    pub fn mark_executing(&mut self, at: DateTime<Utc>) {
        self.execution_time = Some(at);
    }

    /// Deep-copy `agent_id`'s current HUD into this heartbeat and record it
    /// as scheduled at `scheduled_time` (defaulting to the agent's current
    /// `next_heartbeat`). Returns `false` if the agent no longer exists.
    pub async fn add_agent(
        &mut self,
        tree: &AgentTree,
        agent_id: Uuid,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(hud_snapshot) = tree.hud(agent_id).await else {
            return false;
        };
        let Some(node) = tree.get(agent_id).await else {
            return false;
        };
        let scheduled_time = match scheduled_time {
            Some(t) => t,
            None => node.read().await.next_heartbeat(),
        };
        node.write().await.set_active_heartbeat(Some(crate::agent::ActiveHeartbeat { scheduled_time }));

        self.records.push(Record {
            agent_id,
            hud_snapshot,
            scheduled_time,
            actions: Vec::new(),
            outcomes: Vec::new(),
        });
        true
    }

    /// Render the AI-facing prompt for every record added so far.
    ///
    /// Shape per agent: `hud ∪ {_heartbeat_info: {scheduled_time,
    /// active_heartbeat}}`, preceded by fixed instructional prose mandating
    /// the `{agent_id: {actions:[{action, params?}]}}` reply schema.
    pub fn build_prompt(&mut self) -> &str {
        let mut holons = serde_json::Map::new();
        for record in &self.records {
            let mut hud = match record.hud_snapshot.clone() {
                Value::Object(m) => m,
                other => {
                    let mut m = serde_json::Map::new();
                    m.insert("value".into(), other);
                    m
                }
            };
            hud.insert(
                "_heartbeat_info".into(),
                json!({
                    "scheduled_time": record.scheduled_time.to_rfc3339(),
                }),
            );
            holons.insert(record.agent_id.to_string(), Value::Object(hud));
        }

        let body = json!({
            "heartbeat_time": self.heartbeat_time.to_rfc3339(),
            "execution_time": self.execution_time.map(|t| t.to_rfc3339()),
            "holons": holons,
        });

        let instructions = "You are driving a heartbeat tick for one or more holons. \
            For every holon id in `holons`, decide what actions (if any) it should \
            take this tick, choosing only from that holon's own `actions` list. \
            Reply with strict JSON of the exact shape \
            {\"<holon_id>\": {\"actions\": [{\"action\": \"<name>\", \"params\": {...}}]}} \
            for every holon id present in `holons`, with no other text.";

        self.full_prompt = Some(format!("{instructions}\n\n{body}"));
        self.full_prompt.as_deref().expect("just set")
    }

    /// Parse the AI's raw reply text into per-record action lists.
    ///
    /// Accepts a strict per-agent map, falls back to the lenient shapes of
    /// `parse_lenient` on failure, and defaults any record absent from the
    /// reply to an empty action list.
    pub fn process_response(&mut self, text: &str) {
        self.raw_response = Some(text.to_owned());

        let parsed = parse_lenient(text);
        self.parsed_response = parsed.clone();

        let per_agent = parsed
            .as_ref()
            .and_then(|v| extract_per_agent(v, &self.agent_ids()));

        for record in &mut self.records {
            let actions = per_agent
                .as_ref()
                .and_then(|map| map.get(&record.agent_id))
                .cloned()
                .unwrap_or_default();
            record.actions = actions;
        }
    }

    fn agent_ids(&self) -> Vec<Uuid> {
        self.records.iter().map(Record::agent_id).collect()
    }

    /// Dispatch every record's decoded actions against the live tree: set
    /// `last_heartbeat`/`next_heartbeat`, run each action non-fatally
    /// (errors are recorded in `outcomes`, not propagated), then clear the
    /// agent's `active_heartbeat` marker. Sets `completion_time` to `now`.
    pub async fn dispatch(&mut self, tree: &AgentTree, now: DateTime<Utc>) {
        for record in &mut self.records {
            let Some(node) = tree.get(record.agent_id).await else {
                continue;
            };

            {
                let mut guard = node.write().await;
                let heart_rate = guard.heart_rate_secs();
                guard.set_last_heartbeat(self.heartbeat_time);
                guard.set_next_heartbeat(self.heartbeat_time + seconds_duration(heart_rate));
            }

            let mut outcomes = Vec::with_capacity(record.actions.len());
            for call in &record.actions {
                let outcome = match tree.apply_action(record.agent_id, &call.action, &call.params).await {
                    Ok(value) => ActionOutcome {
                        action: call.action.clone(),
                        result: Ok(value),
                    },
                    Err(err) => ActionOutcome {
                        action: call.action.clone(),
                        result: Err(describe_dispatch_error(&err)),
                    },
                };
                outcomes.push(outcome);
            }
            record.outcomes = outcomes;

            node.write().await.set_active_heartbeat(None);
        }

        self.completion_time = Some(now);
    }
}

fn seconds_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn describe_dispatch_error(err: &AgentError) -> String {
    err.to_string()
}

/// Parse `text` leniently: strict JSON first, then code-fence stripping and
/// outermost-balanced-brace extraction, per §4.7.
fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    let stripped = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(stripped.trim()) {
        return Some(value);
    }

    let braced = extract_outermost_braces(stripped)?;
    serde_json::from_str::<Value>(braced).ok()
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    trimmed
}

fn extract_outermost_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a parsed reply `Value` into a per-agent action-call map, honoring
/// the three accepted shapes: a per-agent map keyed by id, a single
/// `{actions:[...]}` (broadcast to every listed agent), or a single
/// `{action, params?}` shorthand (likewise broadcast).
fn extract_per_agent(value: &Value, agent_ids: &[Uuid]) -> Option<BTreeMap<Uuid, Vec<ActionCall>>> {
    let object = value.as_object()?;

    let looks_per_agent = agent_ids.iter().any(|id| object.contains_key(&id.to_string()));
    if looks_per_agent {
        let mut map = BTreeMap::new();
        for id in agent_ids {
            let actions = object
                .get(&id.to_string())
                .map(|entry| decode_actions(entry))
                .unwrap_or_default();
            map.insert(*id, actions);
        }
        return Some(map);
    }

    if object.contains_key("actions") || object.contains_key("action") {
        let actions = decode_actions(value);
        let mut map = BTreeMap::new();
        for id in agent_ids {
            map.insert(*id, actions.clone());
        }
        return Some(map);
    }

    None
}

fn decode_actions(value: &Value) -> Vec<ActionCall> {
    if let Some(list) = value.get("actions").and_then(Value::as_array) {
        return list.iter().filter_map(decode_action_call).collect();
    }
    decode_action_call(value).into_iter().collect()
}

fn decode_action_call(value: &Value) -> Option<ActionCall> {
    let action = value.get("action")?.as_str()?.to_owned();
    let params = match value.get("params") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    };
    Some(ActionCall { action, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;
    use std::sync::Arc;

    fn tree() -> AgentTree {
        AgentTree::new(Arc::new(HeuristicTokenCounter))
    }

    #[tokio::test]
    async fn add_agent_snapshots_hud_immutably() {
        let tree = tree();
        let root = tree.root_id();
        let mut hb = Heartbeat::new(Utc::now());
        assert!(hb.add_agent(&tree, root, None).await);

        let before = hb.records()[0].hud_snapshot().clone();
        tree.get(root).await.unwrap().write().await.knowledge_set("x", json!(1)).unwrap();
        assert_eq!(hb.records()[0].hud_snapshot(), &before);
    }

    #[tokio::test]
    async fn add_agent_for_missing_id_returns_false() {
        let tree = tree();
        let mut hb = Heartbeat::new(Utc::now());
        assert!(!hb.add_agent(&tree, Uuid::new_v4(), None).await);
    }

    #[tokio::test]
    async fn build_prompt_includes_heartbeat_info_per_agent() {
        let tree = tree();
        let root = tree.root_id();
        let mut hb = Heartbeat::new(Utc::now());
        hb.add_agent(&tree, root, None).await;
        let prompt = hb.build_prompt();
        assert!(prompt.contains(&root.to_string()));
        assert!(prompt.contains("_heartbeat_info"));
    }

    #[test]
    fn process_response_decodes_strict_per_agent_map() {
        let agent = Uuid::new_v4();
        let mut hb = Heartbeat::new(Utc::now());
        hb.records.push(Record {
            agent_id: agent,
            hud_snapshot: Value::Null,
            scheduled_time: Utc::now(),
            actions: Vec::new(),
            outcomes: Vec::new(),
        });

        let reply = json!({agent.to_string(): {"actions": [{"action": "sleep", "params": {"seconds": 1}}]}});
        hb.process_response(&reply.to_string());

        assert_eq!(hb.records()[0].actions().len(), 1);
        assert_eq!(hb.records()[0].actions()[0].action, "sleep");
    }

    #[test]
    fn process_response_defaults_missing_agent_to_empty() {
        let agent = Uuid::new_v4();
        let mut hb = Heartbeat::new(Utc::now());
        hb.records.push(Record {
            agent_id: agent,
            hud_snapshot: Value::Null,
            scheduled_time: Utc::now(),
            actions: Vec::new(),
            outcomes: Vec::new(),
        });

        hb.process_response(&json!({"other-agent": {"actions": []}}).to_string());
        assert!(hb.records()[0].actions().is_empty());
    }

    #[test]
    fn process_response_strips_code_fence_and_prose() {
        let agent = Uuid::new_v4();
        let mut hb = Heartbeat::new(Utc::now());
        hb.records.push(Record {
            agent_id: agent,
            hud_snapshot: Value::Null,
            scheduled_time: Utc::now(),
            actions: Vec::new(),
            outcomes: Vec::new(),
        });

        let wrapped = format!(
            "Sure, here you go:\n```json\n{{\"{agent}\": {{\"actions\": [{{\"action\": \"sleep\", \"params\": {{\"seconds\": 2}}}}]}}}}\n```"
        );
        hb.process_response(&wrapped);
        assert_eq!(hb.records()[0].actions().len(), 1);
    }

    #[test]
    fn process_response_on_garbage_yields_empty_actions() {
        let agent = Uuid::new_v4();
        let mut hb = Heartbeat::new(Utc::now());
        hb.records.push(Record {
            agent_id: agent,
            hud_snapshot: Value::Null,
            scheduled_time: Utc::now(),
            actions: Vec::new(),
            outcomes: Vec::new(),
        });

        hb.process_response("not json at all");
        assert!(hb.records()[0].actions().is_empty());
    }

    #[tokio::test]
    async fn dispatch_updates_clocks_and_clears_active_heartbeat() {
        let tree = tree();
        let root = tree.root_id();
        tree.get(root).await.unwrap().write().await.set_heart_rate_secs(5);

        let beat_time = Utc::now();
        let mut hb = Heartbeat::new(beat_time);
        hb.add_agent(&tree, root, None).await;
        hb.process_response(&json!({root.to_string(): {"actions": []}}).to_string());
        hb.dispatch(&tree, Utc::now()).await;

        let guard = tree.get(root).await.unwrap();
        let guard = guard.read().await;
        assert_eq!(guard.last_heartbeat(), Some(beat_time));
        assert_eq!(guard.next_heartbeat(), beat_time + chrono::Duration::seconds(5));
        assert!(guard.active_heartbeat().is_none());
    }

    #[tokio::test]
    async fn dispatch_records_non_fatal_action_errors() {
        let tree = tree();
        let root = tree.root_id();
        let mut hb = Heartbeat::new(Utc::now());
        hb.add_agent(&tree, root, None).await;
        hb.process_response(&json!({root.to_string(): {"actions": [{"action": "no_such_action"}]}}).to_string());
        hb.dispatch(&tree, Utc::now()).await;

        assert_eq!(hb.records()[0].outcomes().len(), 1);
        assert!(hb.records()[0].outcomes()[0].result.is_err());
    }
}
