//! Durable conversation state with chain-safe windowing.
//!
//! The store is the only writer to session state. Per-session FIFO in the
//! agent loop guarantees no concurrent turns for one session, so a coarse map
//! lock is enough. The on-disk log is append-only: compression never
//! truncates it, it only advances the summary's `compressed_count`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::traits::{ChatMessage, SessionBackend, SessionMeta, SessionSummary};

struct SessionEntry {
    meta: SessionMeta,
    messages: Vec<ChatMessage>,
    summary: Option<SessionSummary>,
    /// False for sessions known only from their meta index; the log and
    /// summary are loaded on first access.
    materialized: bool,
}

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    memory_window: usize,
    workspace_root: PathBuf,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, memory_window: usize, workspace_root: PathBuf) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
            memory_window,
            workspace_root,
        }
    }

    /// Load all session metas (cheap index) without replaying message logs.
    /// `find_sessions_by_user` works immediately afterwards.
    pub async fn init(&self) -> anyhow::Result<()> {
        let metas = self.backend.load_all_session_metas().await?;
        let mut sessions = self.sessions.write().await;
        let count = metas.len();
        for meta in metas {
            sessions.insert(
                meta.session_id.clone(),
                SessionEntry {
                    meta,
                    messages: Vec::new(),
                    summary: None,
                    materialized: false,
                },
            );
        }
        info!(sessions = count, "Session index loaded");
        Ok(())
    }

    /// Return the session meta, creating one if absent. A session created
    /// before its channel was known ("unknown") is upgraded in place.
    pub async fn get_or_create(&self, session_id: &str, channel: &str) -> SessionMeta {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.meta.channel == "unknown" && channel != "unknown" {
                entry.meta.channel = channel.to_string();
                entry.meta.updated_at = Utc::now();
                if let Err(e) = self.backend.save_session_meta(&entry.meta).await {
                    warn!(session_id, error = %e, "Failed to persist channel upgrade");
                }
            }
            return entry.meta.clone();
        }

        let now = Utc::now();
        let meta = SessionMeta {
            session_id: session_id.to_string(),
            channel: channel.to_string(),
            user_id: None,
            channel_data: HashMap::new(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        };
        if let Err(e) = self.backend.save_session_meta(&meta).await {
            warn!(session_id, error = %e, "Failed to persist new session meta");
        }
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                meta: meta.clone(),
                messages: Vec::new(),
                summary: None,
                materialized: true,
            },
        );
        meta
    }

    /// Append a message, assigning a fresh id when it has none. The durable
    /// append is fatal for the turn on failure; meta updates are best-effort.
    pub async fn add_message(&self, session_id: &str, mut msg: ChatMessage) -> anyhow::Result<ChatMessage> {
        if msg.id.is_empty() {
            msg.id = uuid::Uuid::new_v4().to_string();
        }

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown session: {}", session_id))?;
        self.materialize(entry).await?;

        self.backend.append_message(session_id, &msg).await?;

        entry.messages.push(msg.clone());
        entry.meta.message_count += 1;
        entry.meta.updated_at = Utc::now();
        if let Err(e) = self.backend.save_session_meta(&entry.meta).await {
            warn!(session_id, error = %e, "Failed to persist session meta update");
        }
        Ok(msg)
    }

    /// The prompt-ready view: an optional synthetic system message carrying
    /// the summary, then the most recent messages up to `memory_window` (one
    /// slot reserved for the summary), chain-sanitized.
    pub async fn get_history(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        let mut sessions = self.sessions.write().await;
        let entry = match sessions.get_mut(session_id) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        self.materialize(entry).await?;

        let mut window = self.memory_window;
        if entry.summary.is_some() {
            window = window.saturating_sub(1);
        }
        let start = entry.messages.len().saturating_sub(window);
        let tail = sanitize_chains(&entry.messages[start..]);

        let mut out = Vec::with_capacity(tail.len() + 1);
        if let Some(summary) = &entry.summary {
            out.push(ChatMessage::system(format!(
                "[Conversation summary: {}]",
                summary.content
            )));
        }
        out.extend(tail);
        Ok(out)
    }

    pub async fn get_message_count(&self, session_id: &str) -> anyhow::Result<usize> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                self.materialize(entry).await?;
                Ok(entry.messages.len())
            }
            None => Ok(0),
        }
    }

    pub async fn get_summary(&self, session_id: &str) -> anyhow::Result<Option<SessionSummary>> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                self.materialize(entry).await?;
                Ok(entry.summary.clone())
            }
            None => Ok(None),
        }
    }

    /// The head slice eligible for summarization, keeping at least
    /// `keep_recent` messages. The boundary is walked backward until it does
    /// not split a tool-call chain; None when nothing can be compressed.
    pub async fn get_messages_to_compress(
        &self,
        session_id: &str,
        keep_recent: usize,
    ) -> anyhow::Result<Option<Vec<ChatMessage>>> {
        let mut sessions = self.sessions.write().await;
        let entry = match sessions.get_mut(session_id) {
            Some(e) => e,
            None => return Ok(None),
        };
        self.materialize(entry).await?;

        let boundary = entry.messages.len().saturating_sub(keep_recent);
        let split = safe_split_point(&entry.messages, boundary);
        if split == 0 {
            return Ok(None);
        }
        Ok(Some(entry.messages[..split].to_vec()))
    }

    /// Replace the summary and drop the compressed head from memory. When a
    /// summary already exists, `compressed_count` is a delta accumulated onto
    /// the stored count. Replaying the identical summary is a no-op. The
    /// on-disk log is never truncated.
    pub async fn apply_compression(
        &self,
        session_id: &str,
        new_summary_text: &str,
        compressed_count: usize,
    ) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown session: {}", session_id))?;
        self.materialize(entry).await?;

        if entry
            .summary
            .as_ref()
            .is_some_and(|s| s.content == new_summary_text)
        {
            return Ok(());
        }

        let total = match &entry.summary {
            Some(existing) => existing.compressed_count + compressed_count,
            None => compressed_count,
        };
        let summary = SessionSummary {
            content: new_summary_text.to_string(),
            compressed_count: total,
            last_updated: Utc::now(),
        };
        self.backend.save_summary(session_id, &summary).await?;

        let drop = compressed_count.min(entry.messages.len());
        entry.messages.drain(..drop);
        entry.summary = Some(summary);
        info!(
            session_id,
            compressed = compressed_count,
            total_compressed = total,
            remaining = entry.messages.len(),
            "Session history compressed"
        );
        Ok(())
    }

    /// Drop messages and summary; keep meta and the session workspace.
    pub async fn clear_session(&self, session_id: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = match sessions.get_mut(session_id) {
            Some(e) => e,
            None => return Ok(()),
        };
        entry.messages.clear();
        entry.summary = None;
        entry.materialized = true;
        entry.meta.message_count = 0;
        entry.meta.updated_at = Utc::now();
        self.backend.clear_messages(session_id).await?;
        self.backend.clear_summary(session_id).await?;
        if let Err(e) = self.backend.save_session_meta(&entry.meta).await {
            warn!(session_id, error = %e, "Failed to persist cleared session meta");
        }
        Ok(())
    }

    pub async fn set_session_user(&self, session_id: &str, user_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.meta.user_id.as_deref() == Some(user_id) {
                return;
            }
            entry.meta.user_id = Some(user_id.to_string());
            entry.meta.updated_at = Utc::now();
            if let Err(e) = self.backend.save_session_meta(&entry.meta).await {
                warn!(session_id, error = %e, "Failed to persist session user binding");
            }
        }
    }

    pub async fn set_session_channel_data(&self, session_id: &str, key: &str, value: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry
                .meta
                .channel_data
                .insert(key.to_string(), value.to_string());
            entry.meta.updated_at = Utc::now();
            if let Err(e) = self.backend.save_session_meta(&entry.meta).await {
                warn!(session_id, error = %e, "Failed to persist session channel data");
            }
        }
    }

    /// Re-point every session bound to `from` at `to` (used by `/link`).
    pub async fn migrate_sessions_user(&self, from: &str, to: &str) {
        let mut sessions = self.sessions.write().await;
        for entry in sessions.values_mut() {
            if entry.meta.user_id.as_deref() == Some(from) {
                entry.meta.user_id = Some(to.to_string());
                entry.meta.updated_at = Utc::now();
                if let Err(e) = self.backend.save_session_meta(&entry.meta).await {
                    warn!(
                        session_id = %entry.meta.session_id,
                        error = %e,
                        "Failed to persist migrated session meta"
                    );
                }
            }
        }
    }

    pub async fn find_sessions_by_user(&self, user_id: &str) -> Vec<SessionMeta> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|e| e.meta.user_id.as_deref() == Some(user_id))
            .map(|e| e.meta.clone())
            .collect()
    }

    pub async fn get_meta(&self, session_id: &str) -> Option<SessionMeta> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|e| e.meta.clone())
    }

    /// Scoped filesystem path for this session's tool outputs. Survives
    /// `clear_session`.
    pub fn workspace_dir(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.workspace_root.join(safe)
    }

    /// Replay the persisted log on first access, honouring the summary's
    /// `compressed_count` and re-sanitizing so the in-memory view satisfies
    /// the chain invariant even if the persisted counts are slightly off.
    async fn materialize(&self, entry: &mut SessionEntry) -> anyhow::Result<()> {
        if entry.materialized {
            return Ok(());
        }
        let session_id = entry.meta.session_id.clone();
        let summary = self.backend.load_summary(&session_id).await?;
        let all = self.backend.load_messages(&session_id).await?;
        let skip = summary
            .as_ref()
            .map(|s| s.compressed_count.min(all.len()))
            .unwrap_or(0);
        entry.messages = sanitize_chains(&all[skip..]);
        entry.summary = summary;
        entry.materialized = true;
        Ok(())
    }
}

/// Walk a split boundary backward until the head slice `[0..boundary)` does
/// not cut through a tool-call chain. A boundary landing on a tool message is
/// moved to the chain's assistant head; landing on an
/// assistant-with-tool-calls moves one more step left. The result is a fixed
/// point: re-applying it returns the same index.
pub(crate) fn safe_split_point(messages: &[ChatMessage], boundary: usize) -> usize {
    let mut b = boundary.min(messages.len());
    loop {
        if b == 0 || b >= messages.len() {
            return b;
        }
        let msg = &messages[b];
        if msg.role == "tool" {
            let mut i = b;
            while i > 0 && messages[i].role == "tool" {
                i -= 1;
            }
            // messages[i] is the assistant head (or index 0 for an orphan run)
            b = i.saturating_sub(1);
            continue;
        }
        if msg.role == "assistant" && msg.has_tool_calls() {
            b -= 1;
            continue;
        }
        return b;
    }
}

/// Drop orphan tool messages and incomplete tool-call chains so the result
/// satisfies the chain invariant everywhere. Covers start-sanitisation
/// (leading tool messages, truncated head chains) as well as chains left
/// half-written by a cancelled turn.
pub(crate) fn sanitize_chains(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role == "tool" {
            // Orphan result; its assistant head was truncated away.
            i += 1;
            continue;
        }
        if msg.role == "assistant" && msg.has_tool_calls() {
            let expected: HashSet<&str> = msg
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().map(|c| c.id.as_str()).collect())
                .unwrap_or_default();
            let mut j = i + 1;
            let mut seen: HashSet<&str> = HashSet::new();
            while j < messages.len() && messages[j].role == "tool" {
                if let Some(id) = &messages[j].tool_call_id {
                    seen.insert(id.as_str());
                }
                j += 1;
            }
            if seen == expected {
                out.extend(messages[i..j].iter().cloned());
            }
            i = j;
            continue;
        }
        out.push(msg.clone());
        i += 1;
    }
    out
}
