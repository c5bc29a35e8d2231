//! The persistence engine.
//!
//! Grounded on `agent/session_manager.rs`'s `SessionManager` (an
//! `SqlitePool` wrapped in direct `sqlx::query(...).bind(...).execute(...)`
//! calls, `anyhow`-flavored error context) and `tools/flatline.rs`'s
//! `SqliteConnectOptions`/`SqlitePoolOptions` pool-construction pattern. The
//! schema itself mirrors `kernel/journal.rs`'s `CREATE TABLE IF NOT EXISTS`
//! style, run here through `sqlx::migrate!` against `migrations/` instead of
//! an inline string executed ad hoc.
//!
//! Serialization is lossy by design: only literal purpose/self bindings are
//! persisted (`Bindings::to_static_json`) — dynamic callables and agent
//! references are re-registered by `AgentData::new` and the tree's own HUD
//! machinery on restore, never round-tripped through SQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::agent::message::{Message, MessageInbox};
use crate::agent::{AgentData, AgentTree, AutoSave};
use crate::binding::Bindings;
use crate::error::StorageError;
use crate::heartbeat::Heartbeat;
use crate::hud;
use crate::telemetry::Telemetry;
use crate::tokens::TokenCounter;

/// How many of an agent's most recent messages `restore_tree` rehydrates
/// into its inbox.
const RESTORED_MESSAGE_LIMIT: i64 = 1000;

/// Where and how to open a store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the `.hln` SQLite file. Created if absent.
    pub path: std::path::PathBuf,
    /// Optional encryption passphrase, applied via `PRAGMA key` on connect.
    pub passphrase: Option<String>,
}

impl StorageConfig {
    /// An unencrypted store at `path`.
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            passphrase: None,
        }
    }

    /// Attach an encryption passphrase.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

/// The relational store backing one runtime: agent tree, heartbeat history,
/// messages, and telemetry snapshots.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `config.path`,
    /// keying the connection if a passphrase is set, and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the connection or a migration fails.
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);
        if let Some(passphrase) = &config.passphrase {
            options = options.pragma("key", passphrase.clone());
        }

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory store for tests and short-lived tools.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the connection or a migration fails.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().filename(":memory:").create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Persist the full current state of `agent_id`: its definition
    /// (purpose/self/actions) and its instance row (knowledge, token bank,
    /// heartbeat clocks).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the agent is absent from
    /// `tree`, or a database error from either write.
    pub async fn save_full(&self, tree: &AgentTree, agent_id: Uuid) -> Result<(), StorageError> {
        let node = tree
            .get(agent_id)
            .await
            .ok_or_else(|| StorageError::NotFound(agent_id.to_string()))?;
        let guard = node.read().await;
        let now = Utc::now().to_rfc3339();

        let purpose_json = guard.purpose().to_static_json().to_string();
        let self_json = guard.self_bindings().to_static_json().to_string();
        let actions_json = Value::Array(guard.actions().iter().map(hud::action_to_json).collect()).to_string();

        sqlx::query(
            "INSERT INTO holons (id, purpose_json, self_state_json, actions_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                purpose_json = excluded.purpose_json,
                self_state_json = excluded.self_state_json,
                actions_json = excluded.actions_json,
                updated_at = excluded.updated_at",
        )
        .bind(agent_id.to_string())
        .bind(purpose_json)
        .bind(self_json)
        .bind(actions_json)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let parent_id = guard.parent().map(|p| p.to_string());
        let knowledge_json = guard.knowledge().to_string();
        let last_heartbeat = guard.last_heartbeat().map(|t| t.to_rfc3339());
        let next_heartbeat = guard.next_heartbeat().to_rfc3339();
        let token_bank = guard.token_bank();
        let heart_rate = i64::try_from(guard.heart_rate_secs()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO hobjs
                (id, holon_id, parent_id, knowledge_json, token_bank, heart_rate_secs,
                 last_heartbeat, next_heartbeat, created_at, updated_at)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                knowledge_json = excluded.knowledge_json,
                token_bank = excluded.token_bank,
                heart_rate_secs = excluded.heart_rate_secs,
                last_heartbeat = excluded.last_heartbeat,
                next_heartbeat = excluded.next_heartbeat,
                updated_at = excluded.updated_at",
        )
        .bind(agent_id.to_string())
        .bind(parent_id)
        .bind(knowledge_json)
        .bind(token_bank)
        .bind(heart_rate)
        .bind(last_heartbeat)
        .bind(next_heartbeat)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist one sent message.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a database write failure.
    pub async fn store_message(&self, message: &Message) -> Result<(), StorageError> {
        let recipient_ids_json = serde_json::to_string(&message.recipient_ids)
            .map_err(|e| StorageError::CorruptJson { column: "recipient_ids_json".into(), source: e })?;
        let content_text = message.content.to_string();

        sqlx::query(
            "INSERT INTO messages (id, sender_id, recipient_ids_json, content_text, tokens_attached, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(message.id.to_string())
        .bind(message.sender_id.to_string())
        .bind(recipient_ids_json)
        .bind(content_text)
        .bind(message.tokens_attached)
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the heartbeat record, including the per-agent HUD snapshots
    /// and action results it carried.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a database write failure.
    pub async fn save_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StorageError> {
        let id = Uuid::new_v4();
        let duration_ms = match (heartbeat.execution_time(), heartbeat.completion_time()) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        sqlx::query(
            "INSERT INTO heartbeats (id, heartbeat_time, prompt, response, hobj_count, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id.to_string())
        .bind(heartbeat.heartbeat_time().to_rfc3339())
        .bind(heartbeat.full_prompt())
        .bind(heartbeat.raw_response())
        .bind(i64::try_from(heartbeat.records().len()).unwrap_or(i64::MAX))
        .bind(duration_ms)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        for record in heartbeat.records() {
            let actions_result = serde_json::to_string(
                &record
                    .outcomes()
                    .iter()
                    .map(|o| match &o.result {
                        Ok(v) => serde_json::json!({"action": o.action, "ok": v}),
                        Err(e) => serde_json::json!({"action": o.action, "error": e}),
                    })
                    .collect::<Vec<_>>(),
            )
            .map_err(|e| StorageError::CorruptJson { column: "actions_result_json".into(), source: e })?;

            sqlx::query(
                "INSERT INTO heartbeat_hobjs (heartbeat_id, hobj_id, hud_sent_json, actions_result_json)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(id.to_string())
            .bind(record.agent_id().to_string())
            .bind(record.hud_snapshot().to_string())
            .bind(actions_result)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Snapshot telemetry aggregates to the `telemetry_snapshots` table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a database write failure or if the
    /// summary fails to serialize.
    pub async fn save_telemetry_snapshot(&self, telemetry: &Telemetry) -> Result<(), StorageError> {
        let data_json = serde_json::to_string(&telemetry.summary())
            .map_err(|e| StorageError::CorruptJson { column: "data_json".into(), source: e })?;

        sqlx::query("INSERT INTO telemetry_snapshots (snapshot_time, data_json) VALUES (?1, ?2)")
            .bind(Utc::now().to_rfc3339())
            .bind(data_json)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Walk `tree` from `root_id` and save every agent in the subtree.
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError`] encountered; agents already saved
    /// before the failure remain persisted.
    pub async fn save_tree(&self, tree: &AgentTree, root_id: Uuid) -> Result<(), StorageError> {
        self.save_full(tree, root_id).await?;
        let Some(node) = tree.get(root_id).await else {
            return Ok(());
        };
        let children = node.read().await.children().to_vec();
        for child_id in children {
            Box::pin(self.save_tree(tree, child_id)).await?;
        }
        Ok(())
    }

    /// Reconstruct the full subtree rooted at `root_id`: agent instances
    /// with correct parent pointers, static purpose/self leaves, knowledge,
    /// token bank, heartbeat clocks, and the last
    /// [`RESTORED_MESSAGE_LIMIT`] messages into each agent's inbox.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `root_id` has no saved row, or
    /// a database/parse error encountered while walking descendants.
    pub async fn restore_tree(&self, token_counter: Arc<dyn TokenCounter>, root_id: Uuid) -> Result<AgentTree, StorageError> {
        let root_data = self
            .load_agent_data(root_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(root_id.to_string()))?;
        let tree = AgentTree::with_root(token_counter, root_data);
        self.restore_children(&tree, root_id).await?;
        Ok(tree)
    }

    async fn restore_children(&self, tree: &AgentTree, parent_id: Uuid) -> Result<(), StorageError> {
        let rows = sqlx::query("SELECT id FROM hobjs WHERE parent_id = ?1 ORDER BY created_at ASC")
            .bind(parent_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        for row in rows {
            let raw_id: String = row.get("id");
            let child_id = parse_uuid(&raw_id)?;
            let Some(data) = self.load_agent_data(child_id).await? else {
                continue;
            };
            tree.insert_restored(data).await;
            Box::pin(self.restore_children(tree, child_id)).await?;
        }
        Ok(())
    }

    async fn load_agent_data(&self, id: Uuid) -> Result<Option<AgentData>, StorageError> {
        let row = sqlx::query(
            "SELECT h.purpose_json, h.self_state_json, o.parent_id, o.knowledge_json,
                    o.token_bank, o.heart_rate_secs, o.last_heartbeat, o.next_heartbeat
             FROM hobjs o JOIN holons h ON h.id = o.holon_id
             WHERE o.id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let purpose_json: String = row.get("purpose_json");
        let self_json: String = row.get("self_state_json");
        let parent_raw: Option<String> = row.get("parent_id");
        let knowledge_json: String = row.get("knowledge_json");
        let token_bank: i64 = row.get("token_bank");
        let heart_rate_secs: i64 = row.get("heart_rate_secs");
        let last_heartbeat_raw: Option<String> = row.get("last_heartbeat");
        let next_heartbeat_raw: String = row.get("next_heartbeat");

        let parent_id = parent_raw.as_deref().map(parse_uuid).transpose()?;
        let purpose: Value = serde_json::from_str(&purpose_json)
            .map_err(|e| StorageError::CorruptJson { column: "purpose_json".into(), source: e })?;
        let self_state: Value = serde_json::from_str(&self_json)
            .map_err(|e| StorageError::CorruptJson { column: "self_state_json".into(), source: e })?;
        let knowledge: Value = serde_json::from_str(&knowledge_json)
            .map_err(|e| StorageError::CorruptJson { column: "knowledge_json".into(), source: e })?;

        let mut agent = AgentData::new(id, parent_id);
        *agent.purpose_mut() = Bindings::from_static_json(&purpose);
        *agent.self_bindings_mut() = Bindings::from_static_json(&self_state);
        agent.set_knowledge(knowledge);
        agent.set_token_bank(token_bank);
        agent.set_heart_rate_secs(u64::try_from(heart_rate_secs).unwrap_or(1));
        if let Some(raw) = last_heartbeat_raw {
            agent.set_last_heartbeat(parse_timestamp(&raw)?);
        }
        agent.set_next_heartbeat(parse_timestamp(&next_heartbeat_raw)?);

        let messages = self.load_messages_for(id).await?;
        agent.set_inbox(MessageInbox::from_messages(messages));

        Ok(Some(agent))
    }

    async fn load_messages_for(&self, agent_id: Uuid) -> Result<Vec<Message>, StorageError> {
        let needle = format!("%\"{agent_id}\"%");
        let rows = sqlx::query(
            "SELECT id, sender_id, recipient_ids_json, content_text, tokens_attached, timestamp
             FROM messages
             WHERE sender_id = ?1 OR recipient_ids_json LIKE ?2
             ORDER BY timestamp DESC
             LIMIT ?3",
        )
        .bind(agent_id.to_string())
        .bind(needle)
        .bind(RESTORED_MESSAGE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id_raw: String = row.get("id");
            let sender_raw: String = row.get("sender_id");
            let recipients_raw: String = row.get("recipient_ids_json");
            let content_raw: String = row.get("content_text");
            let tokens_attached: i64 = row.get("tokens_attached");
            let timestamp_raw: String = row.get("timestamp");

            let recipient_ids: Vec<Uuid> = serde_json::from_str(&recipients_raw)
                .map_err(|e| StorageError::CorruptJson { column: "recipient_ids_json".into(), source: e })?;
            let content: Value = serde_json::from_str(&content_raw)
                .map_err(|e| StorageError::CorruptJson { column: "content_text".into(), source: e })?;

            messages.push(Message {
                id: parse_uuid(&id_raw)?,
                sender_id: parse_uuid(&sender_raw)?,
                recipient_ids,
                content,
                tokens_attached,
                timestamp: parse_timestamp(&timestamp_raw)?,
            });
        }

        // Rows come back newest-first (for the LIMIT to keep the most
        // recent); the inbox itself is append-ordered oldest-first.
        messages.reverse();
        Ok(messages)
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    raw.parse().map_err(|_| StorageError::CorruptRow(format!("malformed id: {raw}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::CorruptRow(format!("malformed timestamp: {raw}")))
}

/// Wires [`Store`] as the tree's auto-save hook: every public mutation on
/// an agent calls `save_full`; messaging calls `save_message` separately.
/// Both are best-effort — a storage failure here is logged, not propagated,
/// since the tree mutation that triggered it has already committed in
/// memory.
#[async_trait]
impl AutoSave for Store {
    async fn save_agent(&self, tree: &AgentTree, agent_id: Uuid) {
        if let Err(err) = self.save_full(tree, agent_id).await {
            warn!(%agent_id, error = %err, "auto-save of agent failed");
        }
    }

    async fn save_message(&self, message: &Message) {
        if let Err(err) = self.store_message(message).await {
            warn!(message_id = %message.id, error = %err, "auto-save of message failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;
    use serde_json::json;

    fn counter() -> Arc<dyn TokenCounter> {
        Arc::new(HeuristicTokenCounter)
    }

    #[tokio::test]
    async fn save_and_restore_round_trips_agent_state() {
        let store = Store::open_in_memory().await.unwrap();
        let tree = AgentTree::new(counter());
        let root = tree.root_id();

        {
            let node = tree.get(root).await.unwrap();
            let mut guard = node.write().await;
            guard.knowledge_set("x", json!(42)).unwrap();
            guard.allocate_tokens(7);
            guard.set_heart_rate_secs(30);
        }
        let child = tree.create_child(root, None).await.unwrap();

        store.save_tree(&tree, root).await.unwrap();

        let restored = store.restore_tree(counter(), root).await.unwrap();
        let restored_root = restored.get(root).await.unwrap();
        let guard = restored_root.read().await;
        assert_eq!(guard.knowledge_get("x").unwrap(), json!(42));
        assert_eq!(guard.token_bank(), 7);
        assert_eq!(guard.heart_rate_secs(), 30);
        assert!(guard.children().contains(&child));

        let restored_child = restored.get(child).await.unwrap();
        assert_eq!(restored_child.read().await.parent(), Some(root));
    }

    #[tokio::test]
    async fn restore_rehydrates_messages_for_sender_and_recipient() {
        let store = Store::open_in_memory().await.unwrap();
        let tree = AgentTree::new(counter());
        let root = tree.root_id();
        let child = tree.create_child(root, None).await.unwrap();

        let message = tree.send_message(root, vec![child], json!("hi"), 0).await.unwrap();
        store.store_message(&message).await.unwrap();
        store.save_tree(&tree, root).await.unwrap();

        let restored = store.restore_tree(counter(), root).await.unwrap();
        let restored_child = restored.get(child).await.unwrap();
        assert_eq!(restored_child.read().await.inbox().len(), 1);
    }

    #[tokio::test]
    async fn restore_missing_root_errors_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.restore_tree(counter(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_heartbeat_persists_records() {
        let store = Store::open_in_memory().await.unwrap();
        let tree = AgentTree::new(counter());
        let root = tree.root_id();

        let mut heartbeat = Heartbeat::new(Utc::now());
        assert!(heartbeat.add_agent(&tree, root, None).await);
        heartbeat.mark_executing(Utc::now());
        heartbeat.process_response("{}");

        store.save_heartbeat(&heartbeat).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM heartbeats")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
