//! The agent tree.
//!
//! Grounded on `holonic_engine/agent.py`'s `HolonicObject`: identity,
//! parent/child hierarchy, purpose/self bindings, knowledge, token bank,
//! heartbeat clocks, message inbox, and the seven built-in actions. Per
//! the design note on cyclic references (spec §9), this is implemented as
//! an arena keyed by id rather than parent/child object pointers: an
//! [`AgentTree`] owns every [`AgentData`] behind `Arc<tokio::sync::RwLock<_>>`,
//! and agents refer to each other only by [`Uuid`].
//!
//! Built-in actions that mutate tree topology or reach across agents
//! (`create_child`, `child_purpose_set`, `send_message`, …) are dispatched
//! by [`AgentTree::apply_action`] directly against the locked tree rather
//! than through [`ActionRegistry`]'s synchronous callback type — the
//! registry still carries their descriptors so the HUD lists them, but
//! their real implementation needs async, cross-agent access the registry's
//! `Fn(&BTreeMap<String, Value>) -> Result<Value, String>` signature can't
//! express. User-registered actions continue to go through the registry
//! unchanged.

pub mod message;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::action::{Action, ActionParameter, ActionRegistry, ActionSignature};
use crate::binding::Bindings;
use crate::error::AgentError;
use crate::hud;
use crate::path::{self, Path};
use crate::tokens::TokenCounter;

use message::{Message, MessageInbox};

/// The distinguished, non-heartbeating agent id hosting the HTTP
/// inspection surface.
pub const INTERFACE_AGENT_ID: Uuid = Uuid::nil();

/// Marker recorded while an agent's heartbeat is in flight.
#[derive(Debug, Clone, Copy)]
pub struct ActiveHeartbeat {
    /// The `next_heartbeat` value in effect when this agent was selected.
    pub scheduled_time: DateTime<Utc>,
}

/// One agent's data, owned by an [`AgentTree`] behind a per-agent lock.
pub struct AgentData {
    id: Uuid,
    parent: Option<Uuid>,
    children: Vec<Uuid>,
    purpose: Bindings,
    self_bindings: Bindings,
    knowledge: Value,
    actions: ActionRegistry,
    token_bank: i64,
    heart_rate_secs: u64,
    last_heartbeat: Option<DateTime<Utc>>,
    next_heartbeat: DateTime<Utc>,
    active_heartbeat: Option<ActiveHeartbeat>,
    inbox: MessageInbox,
}

impl AgentData {
    /// Construct a fresh agent with the built-in action descriptors
    /// registered. `pub(crate)` so `crate::storage` can rebuild a restored
    /// agent's shell before overwriting its state wholesale.
    pub(crate) fn new(id: Uuid, parent: Option<Uuid>) -> Self {
        let now = Utc::now();
        let mut actions = ActionRegistry::new();
        register_builtin_descriptors(&mut actions);
        Self {
            id,
            parent,
            children: Vec::new(),
            purpose: Bindings::new(),
            self_bindings: Bindings::new(),
            knowledge: json!({}),
            actions,
            token_bank: 0,
            heart_rate_secs: 1,
            last_heartbeat: None,
            next_heartbeat: now,
            active_heartbeat: None,
            inbox: MessageInbox::new(),
        }
    }

    /// This agent's id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// This agent's parent id, if any.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// This agent's children ids, in creation order.
    pub fn children(&self) -> &[Uuid] {
        &self.children
    }

    /// The current token bank. An agent is solvent iff this is `>= 0`.
    pub fn token_bank(&self) -> i64 {
        self.token_bank
    }

    /// True iff `token_bank >= 0`.
    pub fn is_solvent(&self) -> bool {
        self.token_bank >= 0
    }

    /// Add `amount` to the token bank (may be negative).
    pub fn allocate_tokens(&mut self, amount: i64) {
        self.token_bank = self.token_bank.saturating_add(amount);
    }

    /// Cadence between successive heartbeats, in seconds.
    pub fn heart_rate_secs(&self) -> u64 {
        self.heart_rate_secs
    }

    /// Set the heartbeat cadence.
    pub fn set_heart_rate_secs(&mut self, secs: u64) {
        self.heart_rate_secs = secs;
    }

    /// Timestamp of the most recently completed heartbeat.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    /// Timestamp at which this agent becomes due.
    pub fn next_heartbeat(&self) -> DateTime<Utc> {
        self.next_heartbeat
    }

    /// Directly set the next-heartbeat clock (administrative use, bypasses
    /// the AI action path).
    pub fn set_next_heartbeat(&mut self, at: DateTime<Utc>) {
        self.next_heartbeat = at;
    }

    /// Push `next_heartbeat` forward by `seconds`. Negative input is
    /// rejected: the spec requires `sleep` to never subtract (unlike the
    /// unconditional `timedelta` add in the original source, which would
    /// happily move the clock backward given a negative argument).
    pub fn delay_heartbeat(&mut self, seconds: i64) -> Result<(), AgentError> {
        if seconds < 0 {
            return Err(AgentError::NegativeSleep(seconds));
        }
        self.next_heartbeat += chrono::Duration::seconds(seconds);
        Ok(())
    }

    /// Whether a heartbeat is currently in flight for this agent.
    pub fn active_heartbeat(&self) -> Option<ActiveHeartbeat> {
        self.active_heartbeat
    }

    /// Record or clear the in-flight heartbeat marker. Written by
    /// `crate::heartbeat` at selection time and cleared at dispatch time.
    pub fn set_active_heartbeat(&mut self, marker: Option<ActiveHeartbeat>) {
        self.active_heartbeat = marker;
    }

    /// Directly set `last_heartbeat` (written only by the heartbeat
    /// dispatcher, never by an action).
    pub fn set_last_heartbeat(&mut self, at: DateTime<Utc>) {
        self.last_heartbeat = Some(at);
    }

    /// The knowledge tree (pure static JSON).
    pub fn knowledge(&self) -> &Value {
        &self.knowledge
    }

    /// Replace the whole knowledge tree (restore path — bypasses
    /// `knowledge_set`'s dot-path traversal since a restore writes the
    /// entire stored tree at once).
    pub fn set_knowledge(&mut self, value: Value) {
        self.knowledge = value;
    }

    /// Directly set the token bank (restore path).
    pub fn set_token_bank(&mut self, amount: i64) {
        self.token_bank = amount;
    }

    /// Replace the message inbox wholesale (restore path).
    pub fn set_inbox(&mut self, inbox: MessageInbox) {
        self.inbox = inbox;
    }

    /// The purpose bindings container.
    pub fn purpose(&self) -> &Bindings {
        &self.purpose
    }

    /// The purpose bindings container (for registering app-level entries).
    pub fn purpose_mut(&mut self) -> &mut Bindings {
        &mut self.purpose
    }

    /// The self-state bindings container (app-added extension leaves only
    /// — the eight built-in dynamic leaves are computed separately by
    /// [`AgentTree::self_state_json`]).
    pub fn self_bindings(&self) -> &Bindings {
        &self.self_bindings
    }

    /// The self-state bindings container (app-added extension leaves only
    /// — the eight built-in dynamic leaves are computed separately by
    /// [`AgentTree::self_state_json`]).
    pub fn self_bindings_mut(&mut self) -> &mut Bindings {
        &mut self.self_bindings
    }

    /// The action registry (custom actions plus built-in descriptors).
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// The action registry, mutably (for registering custom actions).
    pub fn actions_mut(&mut self) -> &mut ActionRegistry {
        &mut self.actions
    }

    /// This agent's message inbox.
    pub fn inbox(&self) -> &MessageInbox {
        &self.inbox
    }

    // -- knowledge path ops --------------------------------------------

    /// Get a value from knowledge at `path` (empty path returns everything).
    pub fn knowledge_get(&self, path: &str) -> Result<Value, AgentError> {
        let p = Path::parse(path);
        if p.is_root() {
            return Ok(self.knowledge.clone());
        }
        Ok(path::get(&self.knowledge, &p)?.clone())
    }

    /// Set a value in knowledge at `path`.
    pub fn knowledge_set(&mut self, path: &str, value: Value) -> Result<(), AgentError> {
        path::set(&mut self.knowledge, &Path::parse(path), value)?;
        Ok(())
    }

    /// Delete a value from knowledge at `path`.
    pub fn knowledge_delete(&mut self, path: &str) -> Result<(), AgentError> {
        path::delete(&mut self.knowledge, &Path::parse(path))?;
        Ok(())
    }

    /// Move a value within knowledge.
    pub fn knowledge_move(&mut self, from: &str, to: &str) -> Result<(), AgentError> {
        path::move_path(&mut self.knowledge, &Path::parse(from), &Path::parse(to))?;
        Ok(())
    }

    /// Whether `path` exists in knowledge.
    pub fn knowledge_exists(&self, path: &str) -> bool {
        path::exists(&self.knowledge, &Path::parse(path))
    }

    // -- purpose / self-state CRUD --------------------------------------
    //
    // Unlike knowledge, purpose and self state are flat, keyed binding
    // collections rather than nested JSON trees (spec §9: same shape as
    // `Bindings::serialize`), so these operate on binding keys directly
    // instead of through `crate::path`.

    /// Get the purpose binding under `key`.
    pub fn purpose_get(&self, key: &str) -> Option<Value> {
        self.purpose.get_literal(key)
    }

    /// Set (insert or overwrite) the purpose binding under `key`.
    pub fn purpose_set(&mut self, key: &str, value: Value) {
        self.purpose.set_literal(key, value);
    }

    /// Delete the purpose binding under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::NotFound`] if no binding carries `key`.
    pub fn purpose_delete(&mut self, key: &str) -> Result<(), AgentError> {
        if !self.purpose.delete_literal(key) {
            return Err(AgentError::Path(crate::error::PathError::NotFound(key.to_owned())));
        }
        Ok(())
    }

    /// Whether a purpose binding exists under `key`.
    pub fn purpose_exists(&self, key: &str) -> bool {
        self.purpose.exists_literal(key)
    }

    /// Move a purpose binding from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::NotFound`] if no binding carries `from`.
    pub fn purpose_move(&mut self, from: &str, to: &str) -> Result<(), AgentError> {
        let value = self
            .purpose
            .get_literal(from)
            .ok_or_else(|| AgentError::Path(crate::error::PathError::NotFound(from.to_owned())))?;
        self.purpose.set_literal(to, value);
        self.purpose.delete_literal(from);
        Ok(())
    }

    /// Get an app-added self-state extension binding under `key` (the eight
    /// built-in dynamic leaves are not addressable here; see
    /// [`AgentTree::self_state_json`]).
    pub fn self_get(&self, key: &str) -> Option<Value> {
        self.self_bindings.get_literal(key)
    }

    /// Set (insert or overwrite) an app-added self-state binding.
    pub fn self_set(&mut self, key: &str, value: Value) {
        self.self_bindings.set_literal(key, value);
    }

    /// Delete an app-added self-state binding.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::NotFound`] if no binding carries `key`.
    pub fn self_delete(&mut self, key: &str) -> Result<(), AgentError> {
        if !self.self_bindings.delete_literal(key) {
            return Err(AgentError::Path(crate::error::PathError::NotFound(key.to_owned())));
        }
        Ok(())
    }

    /// Whether an app-added self-state binding exists under `key`.
    pub fn self_exists(&self, key: &str) -> bool {
        self.self_bindings.exists_literal(key)
    }

    /// Move an app-added self-state binding from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::NotFound`] if no binding carries `from`.
    pub fn self_move(&mut self, from: &str, to: &str) -> Result<(), AgentError> {
        let value = self
            .self_bindings
            .get_literal(from)
            .ok_or_else(|| AgentError::Path(crate::error::PathError::NotFound(from.to_owned())))?;
        self.self_bindings.set_literal(to, value);
        self.self_bindings.delete_literal(from);
        Ok(())
    }
}

/// Something notified whenever an agent or a message is committed, so the
/// persistence engine can auto-save. `crate::storage` implements this; the
/// dependency runs storage → agent, not the reverse, keeping this module
/// free of any concrete storage type.
#[async_trait]
pub trait AutoSave: Send + Sync {
    /// Persist the full current state of `agent_id`.
    async fn save_agent(&self, tree: &AgentTree, agent_id: Uuid);
    /// Persist a sent message.
    async fn save_message(&self, message: &Message);
}

/// The arena of all agents in one runtime, plus topology bookkeeping.
pub struct AgentTree {
    nodes: Mutex<HashMap<Uuid, Arc<RwLock<AgentData>>>>,
    root_id: Uuid,
    auto_save: RwLock<Option<Arc<dyn AutoSave>>>,
    token_counter: Arc<dyn TokenCounter>,
}

impl AgentTree {
    /// Build a tree with a fresh root agent, using `counter` for HUD token
    /// counts.
    pub fn new(token_counter: Arc<dyn TokenCounter>) -> Self {
        let root_id = Uuid::new_v4();
        let mut nodes = HashMap::new();
        nodes.insert(root_id, Arc::new(RwLock::new(AgentData::new(root_id, None))));
        Self {
            nodes: Mutex::new(nodes),
            root_id,
            auto_save: RwLock::new(None),
            token_counter,
        }
    }

    /// Build an empty tree whose root is an already-reconstructed
    /// [`AgentData`] rather than a freshly generated one. Used by
    /// `crate::storage` when restoring a previously saved tree, so the root
    /// keeps its original id instead of minting a new one.
    pub fn with_root(token_counter: Arc<dyn TokenCounter>, root: AgentData) -> Self {
        let root_id = root.id();
        let mut nodes = HashMap::new();
        nodes.insert(root_id, Arc::new(RwLock::new(root)));
        Self {
            nodes: Mutex::new(nodes),
            root_id,
            auto_save: RwLock::new(None),
            token_counter,
        }
    }

    /// Insert an already-reconstructed agent and link it into its parent's
    /// children list, without generating a new id or triggering auto-save.
    /// Used by `crate::storage` while restoring a tree; panics on neither
    /// missing parent nor duplicate id — the restore caller is responsible
    /// for inserting in parent-before-child order.
    pub async fn insert_restored(&self, data: AgentData) {
        let id = data.id();
        let parent_id = data.parent();
        let mut nodes = self.nodes.lock().await;
        nodes.insert(id, Arc::new(RwLock::new(data)));
        if let Some(parent_id) = parent_id {
            if let Some(parent) = nodes.get(&parent_id) {
                parent.write().await.children.push(id);
            }
        }
    }

    /// The root agent's id.
    pub fn root_id(&self) -> Uuid {
        self.root_id
    }

    /// Attach an auto-save hook; every subsequent mutation notifies it.
    pub async fn bind_storage(&self, hook: Arc<dyn AutoSave>) {
        *self.auto_save.write().await = Some(hook);
    }

    /// Detach the auto-save hook.
    pub async fn unbind_storage(&self) {
        *self.auto_save.write().await = None;
    }

    async fn auto_save_agent(&self, agent_id: Uuid) {
        if let Some(hook) = self.auto_save.read().await.clone() {
            hook.save_agent(self, agent_id).await;
        }
    }

    /// Look up an agent's lock by id.
    pub async fn get(&self, id: Uuid) -> Option<Arc<RwLock<AgentData>>> {
        self.nodes.lock().await.get(&id).cloned()
    }

    /// Snapshot of every agent id currently in the tree.
    pub async fn all_ids(&self) -> Vec<Uuid> {
        self.nodes.lock().await.keys().copied().collect()
    }

    /// Depth-first walk from the root, collecting `(id, next_heartbeat)`
    /// pairs. The interface agent (id all-zeros) is excluded, matching its
    /// never-heartbeats status.
    pub async fn collect_heartbeat_candidates(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        let mut out = Vec::new();
        self.walk_dfs(self.root_id, &mut out).await;
        out
    }

    async fn walk_dfs(&self, id: Uuid, out: &mut Vec<(Uuid, DateTime<Utc>)>) {
        let Some(node) = self.get(id).await else { return };
        let (next, children) = {
            let guard = node.read().await;
            (guard.next_heartbeat(), guard.children().to_vec())
        };
        if id != INTERFACE_AGENT_ID {
            out.push((id, next));
        }
        for child in children {
            Box::pin(self.walk_dfs(child, out)).await;
        }
    }

    /// Create a new child of `parent_id`, optionally deep-copying purpose,
    /// knowledge, and token bank from `template_id` (shallow: the
    /// template's own children are never copied, per the spec's resolved
    /// open question on template copy depth).
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ChildNotFound`] if `parent_id` is absent, or
    /// [`AgentError::TemplateNotFound`] if `template_id` is given but
    /// absent from this tree.
    pub async fn create_child(
        &self,
        parent_id: Uuid,
        template_id: Option<Uuid>,
    ) -> Result<Uuid, AgentError> {
        let mut nodes = self.nodes.lock().await;
        if !nodes.contains_key(&parent_id) {
            return Err(AgentError::ChildNotFound(parent_id.to_string()));
        }

        let child_id = Uuid::new_v4();
        let mut child = AgentData::new(child_id, Some(parent_id));

        if let Some(template_id) = template_id {
            let template = nodes
                .get(&template_id)
                .ok_or_else(|| AgentError::TemplateNotFound(template_id.to_string()))?
                .clone();
            let template = template.read().await;
            child.purpose = template.purpose.clone();
            child.knowledge = template.knowledge.clone();
            child.token_bank = template.token_bank;
        }

        nodes.insert(child_id, Arc::new(RwLock::new(child)));
        if let Some(parent) = nodes.get(&parent_id) {
            parent.write().await.children.push(child_id);
        }
        drop(nodes);

        self.auto_save_agent(parent_id).await;
        self.auto_save_agent(child_id).await;
        Ok(child_id)
    }

    /// Remove `child_id` from the tree, cascading to all descendants.
    ///
    /// Returns `true` if a node was removed.
    pub async fn remove_child(&self, parent_id: Uuid, child_id: Uuid) -> bool {
        let mut nodes = self.nodes.lock().await;

        let Some(parent) = nodes.get(&parent_id).cloned() else {
            return false;
        };
        let removed = {
            let mut guard = parent.write().await;
            if let Some(pos) = guard.children.iter().position(|c| *c == child_id) {
                guard.children.remove(pos);
                true
            } else {
                false
            }
        };
        if !removed {
            return false;
        }

        let mut stack = vec![child_id];
        while let Some(id) = stack.pop() {
            if let Some(node) = nodes.remove(&id) {
                stack.extend(node.read().await.children().to_vec());
            }
        }
        drop(nodes);

        self.auto_save_agent(parent_id).await;
        true
    }

    /// Find an agent anywhere in the tree by id (arena lookup is O(1); kept
    /// as a named helper since the original walks the tree to find peers).
    pub async fn find(&self, id: Uuid) -> Option<Arc<RwLock<AgentData>>> {
        self.get(id).await
    }

    /// Build the HUD for `agent_id`: `{purpose?, self?, actions?, hud_tokens}`.
    pub async fn hud(&self, agent_id: Uuid) -> Option<Value> {
        let node = self.get(agent_id).await?;
        let guard = node.read().await;

        let no_agents = |_: &str| Value::Null;
        let purpose = guard.purpose.serialize(&no_agents);
        let self_state = self.self_state_json(&guard).await;

        Some(hud::build_hud(
            &purpose,
            &self_state,
            guard.actions(),
            self.token_counter.as_ref(),
        ))
    }

    /// Assemble the inspection surface's full-state view of `agent_id`:
    /// resolved purpose, resolved self-state (including the `holon_tree`
    /// parent/children token-bank summary), knowledge, action descriptors,
    /// token bank, and heartbeat clocks. `None` if the agent is absent.
    pub async fn full_state(&self, agent_id: Uuid) -> Option<Value> {
        let node = self.get(agent_id).await?;
        let guard = node.read().await;

        let no_agents = |_: &str| Value::Null;
        let purpose = guard.purpose().serialize(&no_agents);
        let self_state = self.self_state_json(&guard).await;
        let actions = Value::Array(guard.actions().iter().map(hud::action_to_json).collect());

        Some(json!({
            "id": guard.id().to_string(),
            "purpose": purpose,
            "self": self_state,
            "knowledge": guard.knowledge(),
            "actions": actions,
            "token_bank": guard.token_bank(),
            "heart_rate_secs": guard.heart_rate_secs(),
            "last_heartbeat": guard.last_heartbeat().map(|t| t.to_rfc3339()),
            "next_heartbeat": guard.next_heartbeat().to_rfc3339(),
        }))
    }

    /// Build the eight fixed self-state leaves plus any app-added
    /// extension bindings, matching `agent.py`'s `__attrs_post_init__`
    /// `_self_bindings` seed.
    async fn self_state_json(&self, agent: &AgentData) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("current_time".into(), json!(Utc::now().to_rfc3339()));
        map.insert("holon_id".into(), json!(agent.id.to_string()));
        map.insert("holon_tree".into(), self.holon_tree_json(agent).await);
        map.insert("knowledge".into(), agent.knowledge.clone());
        map.insert("token_bank".into(), json!(agent.token_bank));
        map.insert(
            "last_heartbeat".into(),
            agent
                .last_heartbeat
                .map(|t| json!(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        map.insert("next_heartbeat".into(), json!(agent.next_heartbeat.to_rfc3339()));
        map.insert("heart_rate_secs".into(), json!(agent.heart_rate_secs));

        let no_agents = |_: &str| Value::Null;
        if let Value::Object(extra) = agent.self_bindings.serialize(&no_agents) {
            for (k, v) in extra {
                map.insert(k, v);
            }
        }

        Value::Object(map)
    }

    async fn holon_tree_json(&self, agent: &AgentData) -> Value {
        let mut children_json = Vec::new();
        for child_id in agent.children() {
            if let Some(child) = self.get(*child_id).await {
                let guard = child.read().await;
                children_json.push(json!({"id": guard.id().to_string(), "token_bank": guard.token_bank()}));
            }
        }

        let mut map = serde_json::Map::new();
        map.insert("holon_children".into(), Value::Array(children_json));
        if let Some(parent_id) = agent.parent() {
            if let Some(parent) = self.get(parent_id).await {
                let guard = parent.read().await;
                map.insert(
                    "holon_parent".into(),
                    json!({"id": guard.id().to_string(), "token_bank": guard.token_bank()}),
                );
            }
        }
        Value::Object(map)
    }

    /// Send a message from `sender_id` to `recipient_ids`, appending it to
    /// the sender's inbox and to every recipient found in the tree.
    /// Recipients absent from the tree are silently dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ChildNotFound`] if `sender_id` is not in the
    /// tree.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        recipient_ids: Vec<Uuid>,
        content: Value,
        tokens_attached: i64,
    ) -> Result<Message, AgentError> {
        let sender = self
            .get(sender_id)
            .await
            .ok_or_else(|| AgentError::ChildNotFound(sender_id.to_string()))?;

        let message = Message::new(sender_id, recipient_ids.clone(), content, tokens_attached);
        sender.write().await.inbox.add(message.clone());

        for recipient_id in &recipient_ids {
            if *recipient_id == sender_id {
                continue;
            }
            if let Some(recipient) = self.get(*recipient_id).await {
                recipient.write().await.inbox.add(message.clone());
            }
        }

        if let Some(hook) = self.auto_save.read().await.clone() {
            hook.save_message(&message).await;
        }
        self.auto_save_agent(sender_id).await;

        Ok(message)
    }

    /// Apply a single action call against `agent_id`. The seven built-ins
    /// are handled here directly; anything else falls through to the
    /// agent's [`ActionRegistry`].
    ///
    /// # Errors
    ///
    /// Propagates [`AgentError`] for unknown agents/children/templates, bad
    /// parameters, or registry dispatch failures.
    pub async fn apply_action(
        &self,
        agent_id: Uuid,
        action: &str,
        params: &BTreeMap<String, Value>,
    ) -> Result<Value, AgentError> {
        match action {
            "knowledge_set" => {
                let path = param_str(params, "path")?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                let node = self.require(agent_id).await?;
                node.write().await.knowledge_set(&path, value)?;
                self.auto_save_agent(agent_id).await;
                Ok(Value::Null)
            }
            "knowledge_delete" => {
                let path = param_str(params, "path")?;
                let node = self.require(agent_id).await?;
                node.write().await.knowledge_delete(&path)?;
                self.auto_save_agent(agent_id).await;
                Ok(Value::Null)
            }
            "child_purpose_set" => {
                let child_id = param_uuid(params, "child_id")?;
                let path = param_str(params, "path")?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                let child = self
                    .get(child_id)
                    .await
                    .ok_or_else(|| AgentError::ChildNotFound(child_id.to_string()))?;
                child.write().await.purpose_set(&path, value);
                self.auto_save_agent(child_id).await;
                Ok(Value::Null)
            }
            "child_purpose_clear" => {
                let child_id = param_uuid(params, "child_id")?;
                let child = self
                    .get(child_id)
                    .await
                    .ok_or_else(|| AgentError::ChildNotFound(child_id.to_string()))?;
                *child.write().await.purpose_mut() = Bindings::new();
                self.auto_save_agent(child_id).await;
                Ok(Value::Null)
            }
            "create_child" => {
                let template_id = match params.get("template_id") {
                    Some(v) => Some(param_uuid_value(v)?),
                    None => None,
                };
                let child_id = self.create_child(agent_id, template_id).await?;
                Ok(json!({"id": child_id.to_string()}))
            }
            "send_message" => {
                let recipient_ids = params
                    .get("recipient_ids")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()?.parse::<Uuid>().ok()).collect())
                    .unwrap_or_default();
                let content = params.get("content").cloned().unwrap_or(Value::Null);
                let tokens = params.get("tokens").and_then(Value::as_i64).unwrap_or(0);
                let message = self.send_message(agent_id, recipient_ids, content, tokens).await?;
                Ok(json!({"id": message.id.to_string()}))
            }
            "sleep" => {
                let seconds = params.get("seconds").and_then(Value::as_i64).unwrap_or(0);
                let node = self.require(agent_id).await?;
                node.write().await.delay_heartbeat(seconds)?;
                self.auto_save_agent(agent_id).await;
                Ok(Value::Null)
            }
            other => {
                let node = self.require(agent_id).await?;
                let guard = node.read().await;
                guard.actions().dispatch(other, params).map_err(AgentError::from)
            }
        }
    }

    async fn require(&self, id: Uuid) -> Result<Arc<RwLock<AgentData>>, AgentError> {
        self.get(id).await.ok_or_else(|| AgentError::ChildNotFound(id.to_string()))
    }
}

fn param_str(params: &BTreeMap<String, Value>, name: &str) -> Result<String, AgentError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| AgentError::Action(crate::error::ActionError::MissingParameter {
            action: name.to_owned(),
            param: name.to_owned(),
        }))
}

fn param_uuid(params: &BTreeMap<String, Value>, name: &str) -> Result<Uuid, AgentError> {
    let raw = param_str(params, name)?;
    raw.parse().map_err(|_| {
        AgentError::Action(crate::error::ActionError::InvalidParameter {
            action: name.to_owned(),
            param: name.to_owned(),
            reason: "not a valid UUID".to_owned(),
        })
    })
}

fn param_uuid_value(value: &Value) -> Result<Uuid, AgentError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AgentError::TemplateNotFound(value.to_string()))
}

/// Register descriptors for the seven built-in actions so the HUD lists
/// them even though their real dispatch happens in
/// [`AgentTree::apply_action`], not through this registry's callback.
fn register_builtin_descriptors(actions: &mut ActionRegistry) {
    let noop: crate::action::ActionCallback = Arc::new(|_| Ok(Value::Null));

    actions.add(Action::new(
        "knowledge_set",
        Some("Set a value in knowledge at a dot.path".into()),
        ActionSignature::new(vec![
            ActionParameter::required("path", "string"),
            ActionParameter::required("value", "any"),
        ]),
        noop.clone(),
    ));
    actions.add(Action::new(
        "knowledge_delete",
        Some("Delete a value from knowledge at a dot.path".into()),
        ActionSignature::new(vec![ActionParameter::required("path", "string")]),
        noop.clone(),
    ));
    actions.add(Action::new(
        "child_purpose_set",
        Some("Set purpose on a child holon by id".into()),
        ActionSignature::new(vec![
            ActionParameter::required("child_id", "string"),
            ActionParameter::required("path", "string"),
            ActionParameter::required("value", "any"),
        ]),
        noop.clone(),
    ));
    actions.add(Action::new(
        "child_purpose_clear",
        Some("Clear all purpose from a child holon".into()),
        ActionSignature::new(vec![ActionParameter::required("child_id", "string")]),
        noop.clone(),
    ));
    actions.add(Action::new(
        "create_child",
        Some("Create a new child holon, optionally copying from a template id".into()),
        ActionSignature::new(vec![ActionParameter::optional("template_id", "string", Value::Null)]),
        noop.clone(),
    ));
    actions.add(Action::new(
        "send_message",
        Some("Send a message to one or more holons by id".into()),
        ActionSignature::new(vec![
            ActionParameter::required("recipient_ids", "array"),
            ActionParameter::required("content", "any"),
            ActionParameter::optional("tokens", "int", json!(0)),
        ]),
        noop.clone(),
    ));
    actions.add(Action::new(
        "sleep",
        Some("Delay next heartbeat by the specified seconds from its current scheduled time".into()),
        ActionSignature::new(vec![ActionParameter::required("seconds", "int")]),
        noop,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;

    fn tree() -> AgentTree {
        AgentTree::new(Arc::new(HeuristicTokenCounter))
    }

    #[tokio::test]
    async fn create_child_links_parent_and_child() {
        let tree = tree();
        let root = tree.root_id();
        let child_id = tree.create_child(root, None).await.unwrap();

        let root_node = tree.get(root).await.unwrap();
        assert!(root_node.read().await.children().contains(&child_id));

        let child_node = tree.get(child_id).await.unwrap();
        assert_eq!(child_node.read().await.parent(), Some(root));
    }

    #[tokio::test]
    async fn create_child_from_template_copies_state_shallowly() {
        let tree = tree();
        let root = tree.root_id();
        let template_id = tree.create_child(root, None).await.unwrap();

        {
            let template = tree.get(template_id).await.unwrap();
            let mut guard = template.write().await;
            guard.knowledge_set("k", json!(1)).unwrap();
            guard.allocate_tokens(5);
        }

        let copy_id = tree.create_child(root, Some(template_id)).await.unwrap();
        let copy = tree.get(copy_id).await.unwrap();
        let guard = copy.read().await;
        assert_eq!(guard.knowledge_get("k").unwrap(), json!(1));
        assert_eq!(guard.token_bank(), 5);
        assert!(guard.children().is_empty());
        assert_ne!(guard.id(), template_id);
    }

    #[tokio::test]
    async fn create_child_with_missing_template_errors() {
        let tree = tree();
        let root = tree.root_id();
        let bogus = Uuid::new_v4();
        let err = tree.create_child(root, Some(bogus)).await.unwrap_err();
        assert!(matches!(err, AgentError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn remove_child_cascades_to_descendants() {
        let tree = tree();
        let root = tree.root_id();
        let child = tree.create_child(root, None).await.unwrap();
        let grandchild = tree.create_child(child, None).await.unwrap();

        assert!(tree.remove_child(root, child).await);
        assert!(tree.get(child).await.is_none());
        assert!(tree.get(grandchild).await.is_none());
    }

    #[tokio::test]
    async fn send_message_delivers_to_tree_members_and_drops_ghosts() {
        let tree = tree();
        let root = tree.root_id();
        let c1 = tree.create_child(root, None).await.unwrap();
        let c2 = tree.create_child(root, None).await.unwrap();
        let ghost = Uuid::new_v4();

        tree.send_message(root, vec![c1, c2, ghost], json!("hi"), 0)
            .await
            .unwrap();

        assert_eq!(tree.get(root).await.unwrap().read().await.inbox().len(), 1);
        assert_eq!(tree.get(c1).await.unwrap().read().await.inbox().len(), 1);
        assert_eq!(tree.get(c2).await.unwrap().read().await.inbox().len(), 1);
    }

    #[tokio::test]
    async fn sleep_never_subtracts() {
        let tree = tree();
        let root = tree.root_id();
        let node = tree.get(root).await.unwrap();
        let before = node.read().await.next_heartbeat();
        let err = node.write().await.delay_heartbeat(-5);
        assert!(err.is_err());
        assert_eq!(node.read().await.next_heartbeat(), before);
    }

    #[tokio::test]
    async fn interface_agent_excluded_from_heartbeat_candidates() {
        let tree = tree();
        let root = tree.root_id();
        let interface_node = Arc::new(RwLock::new(AgentData::new(INTERFACE_AGENT_ID, Some(root))));
        tree.nodes.lock().await.insert(INTERFACE_AGENT_ID, interface_node);
        tree.get(root).await.unwrap().write().await.children.push(INTERFACE_AGENT_ID);

        let candidates = tree.collect_heartbeat_candidates().await;
        assert!(!candidates.iter().any(|(id, _)| *id == INTERFACE_AGENT_ID));
    }

    #[tokio::test]
    async fn hud_includes_fixed_self_leaves() {
        let tree = tree();
        let root = tree.root_id();
        let hud = tree.hud(root).await.unwrap();
        let self_state = &hud["self"];
        for key in [
            "current_time",
            "holon_id",
            "holon_tree",
            "knowledge",
            "token_bank",
            "last_heartbeat",
            "next_heartbeat",
            "heart_rate_secs",
        ] {
            assert!(self_state.get(key).is_some(), "missing self leaf {key}");
        }
        assert!(hud.get("hud_tokens").is_some());
    }

    #[tokio::test]
    async fn apply_action_knowledge_set_mutates_tree() {
        let tree = tree();
        let root = tree.root_id();
        let mut params = BTreeMap::new();
        params.insert("path".into(), json!("x"));
        params.insert("value".into(), json!(42));
        tree.apply_action(root, "knowledge_set", &params).await.unwrap();

        let node = tree.get(root).await.unwrap();
        assert_eq!(node.read().await.knowledge_get("x").unwrap(), json!(42));
    }
}
