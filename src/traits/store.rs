use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conversation::{ChatMessage, SessionSummary};

/// Durable per-session metadata. Cheap to load in bulk; the message log is
/// materialized lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub channel: String,
    pub user_id: Option<String>,
    /// Channel-specific data bag (e.g. native chat id).
    #[serde(default)]
    pub channel_data: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Narrow persistence interface for session state.
///
/// The store never truncates the on-disk log; compression only advances the
/// summary's `compressed_count`.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load_all_session_metas(&self) -> anyhow::Result<Vec<SessionMeta>>;
    async fn save_session_meta(&self, meta: &SessionMeta) -> anyhow::Result<()>;
    async fn append_message(&self, session_id: &str, msg: &ChatMessage) -> anyhow::Result<()>;
    async fn load_messages(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>>;
    async fn clear_messages(&self, session_id: &str) -> anyhow::Result<()>;
    async fn load_summary(&self, session_id: &str) -> anyhow::Result<Option<SessionSummary>>;
    async fn save_summary(&self, session_id: &str, summary: &SessionSummary)
        -> anyhow::Result<()>;
    async fn clear_summary(&self, session_id: &str) -> anyhow::Result<()>;
}

/// A cron-driven task that reenters the agent loop as a synthetic message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub session_id: String,
    pub channel: String,
    pub cron_expression: String,
    pub description: String,
    pub task_prompt: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub creator_user_id: Option<String>,
}

/// Narrow persistence interface for scheduled tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>>;
    async fn save_task(&self, task: &ScheduledTask) -> anyhow::Result<()>;
    async fn delete_task(&self, id: &str) -> anyhow::Result<()>;
}

/// A user known to the runtime. One user may own identities on several
/// channels (linked via `/link`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Identity resolution and linking, keyed by (channel, native sender handle).
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Resolve the user bound to a channel identity, creating one on first
    /// contact.
    async fn resolve_or_create(
        &self,
        channel: &str,
        sender: &str,
        display_name: Option<&str>,
    ) -> anyhow::Result<UserRecord>;
    async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>>;
    /// Issue a short-lived code another channel identity can redeem to merge
    /// into this user.
    async fn issue_link_code(&self, user_id: &str) -> anyhow::Result<String>;
    /// Re-point (channel, sender) at the code's user. Returns the canonical
    /// user, or None for an unknown/expired code.
    async fn redeem_link_code(
        &self,
        code: &str,
        channel: &str,
        sender: &str,
    ) -> anyhow::Result<Option<UserRecord>>;
    /// Detach (channel, sender) into a fresh standalone user. Returns the new
    /// user, or None if the identity was unknown.
    async fn unlink_identity(&self, channel: &str, sender: &str)
        -> anyhow::Result<Option<UserRecord>>;
}

/// Append/read interface over a user's long-term memory notes.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn append_memory(&self, user_id: &str, content: &str) -> anyhow::Result<()>;
    async fn recent_memories(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

/// A shared context several users can join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Space membership and lookup.
#[async_trait]
pub trait SpaceStore: Send + Sync {
    async fn create_space(
        &self,
        name: &str,
        description: &str,
        user_id: &str,
    ) -> anyhow::Result<Space>;
    async fn join_space(&self, space_id: &str, user_id: &str) -> anyhow::Result<Option<Space>>;
    async fn leave_space(&self, space_id: &str, user_id: &str) -> anyhow::Result<bool>;
    async fn spaces_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Space>>;
}
