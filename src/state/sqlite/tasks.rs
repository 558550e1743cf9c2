use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::traits::{ScheduledTask, TaskStore};

#[async_trait]
impl TaskStore for SqliteStore {
    async fn load_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT id, session_id, channel, cron_expression, description, task_prompt,
                    enabled, created_at, last_run_at, run_count, creator_user_id
             FROM scheduled_tasks",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ScheduledTask {
                id: r.get("id"),
                session_id: r.get("session_id"),
                channel: r.get("channel"),
                cron_expression: r.get("cron_expression"),
                description: r.get("description"),
                task_prompt: r.get("task_prompt"),
                enabled: r.get::<i64, _>("enabled") != 0,
                created_at: r
                    .get::<String, _>("created_at")
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                last_run_at: r
                    .get::<Option<String>, _>("last_run_at")
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                run_count: r.get::<i64, _>("run_count") as u64,
                creator_user_id: r.get("creator_user_id"),
            })
            .collect())
    }

    async fn save_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO scheduled_tasks
             (id, session_id, channel, cron_expression, description, task_prompt,
              enabled, created_at, last_run_at, run_count, creator_user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.session_id)
        .bind(&task.channel)
        .bind(&task.cron_expression)
        .bind(&task.description)
        .bind(&task.task_prompt)
        .bind(task.enabled as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.last_run_at.map(|t| t.to_rfc3339()))
        .bind(task.run_count as i64)
        .bind(&task.creator_user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    fn task(id: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            session_id: "s4".to_string(),
            channel: "telegram".to_string(),
            cron_expression: "0 * * * *".to_string(),
            description: "heartbeat".to_string(),
            task_prompt: "send a heartbeat".to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_run_at: None,
            run_count: 0,
            creator_user_id: Some("u9".to_string()),
        }
    }

    #[tokio::test]
    async fn save_load_delete_round_trip() {
        let (store, _dir) = test_store().await;
        store.save_task(&task("t1")).await.unwrap();
        store.save_task(&task("t2")).await.unwrap();

        let mut updated = task("t1");
        updated.run_count = 5;
        updated.last_run_at = Some(Utc::now());
        updated.enabled = false;
        store.save_task(&updated).await.unwrap();

        let tasks = store.load_all_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        let t1 = tasks.iter().find(|t| t.id == "t1").unwrap();
        assert_eq!(t1.run_count, 5);
        assert!(!t1.enabled);
        assert!(t1.last_run_at.is_some());
        assert_eq!(t1.creator_user_id.as_deref(), Some("u9"));

        store.delete_task("t1").await.unwrap();
        assert_eq!(store.load_all_tasks().await.unwrap().len(), 1);
    }
}
