use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::traits::{MemoryStore, UserRecord, UserStore};

/// How long a link code stays redeemable.
const LINK_CODE_TTL_MINUTES: i64 = 10;

fn new_user_id() -> String {
    format!("u{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

impl SqliteStore {
    async fn insert_user(&self, display_name: Option<&str>) -> anyhow::Result<UserRecord> {
        let user = UserRecord {
            user_id: new_user_id(),
            display_name: display_name.map(String::from),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO users (user_id, display_name, created_at) VALUES (?, ?, ?)")
            .bind(&user.user_id)
            .bind(&user.display_name)
            .bind(user.created_at.to_rfc3339())
            .execute(self.pool())
            .await?;
        Ok(user)
    }

    async fn bind_identity(&self, channel: &str, sender: &str, user_id: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO identities (channel, sender, user_id) VALUES (?, ?, ?)")
            .bind(channel)
            .bind(sender)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn resolve_or_create(
        &self,
        channel: &str,
        sender: &str,
        display_name: Option<&str>,
    ) -> anyhow::Result<UserRecord> {
        let bound = sqlx::query("SELECT user_id FROM identities WHERE channel = ? AND sender = ?")
            .bind(channel)
            .bind(sender)
            .fetch_optional(self.pool())
            .await?;

        if let Some(row) = bound {
            let user_id: String = row.get("user_id");
            if let Some(user) = self.get_user(&user_id).await? {
                return Ok(user);
            }
            // Dangling identity row; fall through and rebuild the user.
        }

        let user = self.insert_user(display_name).await?;
        self.bind_identity(channel, sender, &user.user_id).await?;
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT user_id, display_name, created_at FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| UserRecord {
            user_id: r.get("user_id"),
            display_name: r.get("display_name"),
            created_at: r
                .get::<String, _>("created_at")
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn issue_link_code(&self, user_id: &str) -> anyhow::Result<String> {
        let code = uuid::Uuid::new_v4().simple().to_string()[..6].to_uppercase();
        sqlx::query("INSERT INTO link_codes (code, user_id, created_at) VALUES (?, ?, ?)")
            .bind(&code)
            .bind(user_id)
            .bind(Utc::now().to_rfc3339())
            .execute(self.pool())
            .await?;
        Ok(code)
    }

    async fn redeem_link_code(
        &self,
        code: &str,
        channel: &str,
        sender: &str,
    ) -> anyhow::Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT user_id, created_at FROM link_codes WHERE code = ?")
            .bind(code.to_uppercase())
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        // One-shot code, expired or not.
        sqlx::query("DELETE FROM link_codes WHERE code = ?")
            .bind(code.to_uppercase())
            .execute(self.pool())
            .await?;

        let issued = row
            .get::<String, _>("created_at")
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now());
        if Utc::now() - issued > Duration::minutes(LINK_CODE_TTL_MINUTES) {
            return Ok(None);
        }

        let user_id: String = row.get("user_id");
        let Some(user) = self.get_user(&user_id).await? else {
            return Ok(None);
        };
        self.bind_identity(channel, sender, &user.user_id).await?;
        Ok(Some(user))
    }

    async fn unlink_identity(
        &self,
        channel: &str,
        sender: &str,
    ) -> anyhow::Result<Option<UserRecord>> {
        let bound = sqlx::query("SELECT user_id FROM identities WHERE channel = ? AND sender = ?")
            .bind(channel)
            .bind(sender)
            .fetch_optional(self.pool())
            .await?;
        if bound.is_none() {
            return Ok(None);
        }
        let user = self.insert_user(None).await?;
        self.bind_identity(channel, sender, &user.user_id).await?;
        Ok(Some(user))
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn append_memory(&self, user_id: &str, content: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO memories (user_id, content, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(content)
            .bind(Utc::now().to_rfc3339())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn recent_memories(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT content FROM memories WHERE user_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        // Oldest first for prompt injection
        Ok(rows.into_iter().rev().map(|r| r.get("content")).collect())
    }
}
