use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::traits::{ChatMessage, SessionBackend, SessionMeta, SessionSummary, ToolCall};

fn parse_time(s: String) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl SessionBackend for SqliteStore {
    async fn load_all_session_metas(&self) -> anyhow::Result<Vec<SessionMeta>> {
        let rows = sqlx::query(
            "SELECT session_id, channel, user_id, channel_data, created_at, updated_at, message_count
             FROM sessions",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let channel_data: HashMap<String, String> =
                    serde_json::from_str(&r.get::<String, _>("channel_data")).unwrap_or_default();
                SessionMeta {
                    session_id: r.get("session_id"),
                    channel: r.get("channel"),
                    user_id: r.get("user_id"),
                    channel_data,
                    created_at: parse_time(r.get("created_at")),
                    updated_at: parse_time(r.get("updated_at")),
                    message_count: r.get::<i64, _>("message_count") as usize,
                }
            })
            .collect())
    }

    async fn save_session_meta(&self, meta: &SessionMeta) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sessions
             (session_id, channel, user_id, channel_data, created_at, updated_at, message_count)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&meta.session_id)
        .bind(&meta.channel)
        .bind(&meta.user_id)
        .bind(serde_json::to_string(&meta.channel_data)?)
        .bind(meta.created_at.to_rfc3339())
        .bind(meta.updated_at.to_rfc3339())
        .bind(meta.message_count as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn append_message(&self, session_id: &str, msg: &ChatMessage) -> anyhow::Result<()> {
        let tool_calls = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = msg.metadata.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO messages
             (id, session_id, role, content, tool_calls, tool_call_id, tool_name, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(session_id)
        .bind(&msg.role)
        .bind(&msg.content)
        .bind(tool_calls)
        .bind(&msg.tool_call_id)
        .bind(&msg.tool_name)
        .bind(metadata)
        .bind(msg.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, role, content, tool_calls, tool_call_id, tool_name, metadata, created_at
             FROM messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let tool_calls: Option<Vec<ToolCall>> = r
                    .get::<Option<String>, _>("tool_calls")
                    .and_then(|s| serde_json::from_str(&s).ok());
                let metadata: Option<HashMap<String, String>> = r
                    .get::<Option<String>, _>("metadata")
                    .and_then(|s| serde_json::from_str(&s).ok());
                ChatMessage {
                    id: r.get("id"),
                    role: r.get("role"),
                    content: r.get("content"),
                    tool_calls,
                    tool_call_id: r.get("tool_call_id"),
                    tool_name: r.get("tool_name"),
                    metadata,
                    created_at: parse_time(r.get("created_at")),
                }
            })
            .collect())
    }

    async fn clear_messages(&self, session_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn load_summary(&self, session_id: &str) -> anyhow::Result<Option<SessionSummary>> {
        let row = sqlx::query(
            "SELECT content, compressed_count, last_updated FROM summaries WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| SessionSummary {
            content: r.get("content"),
            compressed_count: r.get::<i64, _>("compressed_count") as usize,
            last_updated: parse_time(r.get("last_updated")),
        }))
    }

    async fn save_summary(
        &self,
        session_id: &str,
        summary: &SessionSummary,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO summaries (session_id, content, compressed_count, last_updated)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&summary.content)
        .bind(summary.compressed_count as i64)
        .bind(summary.last_updated.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn clear_summary(&self, session_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM summaries WHERE session_id = ?")
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
