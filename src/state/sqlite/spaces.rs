use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::traits::{Space, SpaceStore};

fn space_from_row(r: &sqlx::sqlite::SqliteRow) -> Space {
    Space {
        id: r.get("id"),
        name: r.get("name"),
        description: r.get("description"),
        created_by: r.get("created_by"),
        created_at: r
            .get::<String, _>("created_at")
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    }
}

#[async_trait]
impl SpaceStore for SqliteStore {
    async fn create_space(
        &self,
        name: &str,
        description: &str,
        user_id: &str,
    ) -> anyhow::Result<Space> {
        let space = Space {
            id: format!("sp{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            name: name.to_string(),
            description: description.to_string(),
            created_by: user_id.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO spaces (id, name, description, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&space.id)
        .bind(&space.name)
        .bind(&space.description)
        .bind(&space.created_by)
        .bind(space.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        sqlx::query("INSERT INTO space_members (space_id, user_id) VALUES (?, ?)")
            .bind(&space.id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(space)
    }

    async fn join_space(&self, space_id: &str, user_id: &str) -> anyhow::Result<Option<Space>> {
        let row = sqlx::query(
            "SELECT id, name, description, created_by, created_at FROM spaces WHERE id = ?",
        )
        .bind(space_id)
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        sqlx::query("INSERT OR IGNORE INTO space_members (space_id, user_id) VALUES (?, ?)")
            .bind(space_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(Some(space_from_row(&row)))
    }

    async fn leave_space(&self, space_id: &str, user_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM space_members WHERE space_id = ? AND user_id = ?")
            .bind(space_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn spaces_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Space>> {
        let rows = sqlx::query(
            "SELECT s.id, s.name, s.description, s.created_by, s.created_at
             FROM spaces s JOIN space_members m ON m.space_id = s.id
             WHERE m.user_id = ? ORDER BY s.created_at ASC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(space_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    #[tokio::test]
    async fn create_join_leave_cycle() {
        let (store, _dir) = test_store().await;
        let space = store.create_space("ops", "on-call", "u1").await.unwrap();
        assert_eq!(store.spaces_for_user("u1").await.unwrap().len(), 1);

        let joined = store.join_space(&space.id, "u2").await.unwrap().unwrap();
        assert_eq!(joined.name, "ops");
        assert_eq!(store.spaces_for_user("u2").await.unwrap().len(), 1);

        assert!(store.leave_space(&space.id, "u2").await.unwrap());
        assert!(!store.leave_space(&space.id, "u2").await.unwrap());
        assert!(store.spaces_for_user("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_unknown_space_is_none() {
        let (store, _dir) = test_store().await;
        assert!(store.join_space("missing", "u1").await.unwrap().is_none());
    }
}
