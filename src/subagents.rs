//! Spawn-and-forget background agents.
//!
//! A subagent shares the provider and a filtered view of the tool registry,
//! runs a reduced loop with its own iteration ceiling and wall-clock timeout,
//! and reports back by publishing a synthetic inbound message to its origin
//! session. Cancelled subagents report nothing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{InboundMessage, MessageBus};
use crate::config::SubagentsConfig;
use crate::error::SubagentError;
use crate::tools::ToolRegistry;
use crate::traits::{ChatOptions, ModelProvider, ToolContext};

const SUBAGENT_SYSTEM_PROMPT: &str = "\
You are a background task agent. Work on exactly the task you are given, \
using tools where they help. Be thorough but do not wander beyond the task. \
When you are done, reply with your findings or result as plain text — the \
text of your final reply is the task's result.";

/// Seconds a finished task stays queryable before it is garbage-collected.
const RETENTION_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubagentStatus::Running => write!(f, "running"),
            SubagentStatus::Completed => write!(f, "completed"),
            SubagentStatus::Failed => write!(f, "failed"),
            SubagentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where a subagent came from; carried in the spawn call, never in globals,
/// so concurrent turns cannot see each other's origin.
#[derive(Debug, Clone)]
pub struct SubagentOrigin {
    pub session_id: String,
    pub channel: String,
    pub workspace_dir: PathBuf,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub id: String,
    pub session_id: String,
    pub channel: String,
    pub label: String,
    pub task_prompt: String,
    pub status: SubagentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct SubagentHandle {
    task: SubagentTask,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

pub struct SubagentManager {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    bus: Arc<MessageBus>,
    config: SubagentsConfig,
    model: String,
    /// Tools a subagent must not see: recursion and user-facing messaging.
    blacklist: Vec<String>,
    tasks: RwLock<HashMap<String, SubagentHandle>>,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        bus: Arc<MessageBus>,
        config: SubagentsConfig,
        model: String,
    ) -> Self {
        Self {
            provider,
            registry,
            bus,
            config,
            model,
            blacklist: vec!["spawn_subagent".to_string(), "send_message".to_string()],
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Kick off a background task and return its id immediately. Fails with
    /// `CapacityExceeded` when the global cap is reached.
    pub async fn spawn(
        self: &Arc<Self>,
        task_prompt: &str,
        origin: SubagentOrigin,
        label: Option<String>,
    ) -> anyhow::Result<String> {
        let mut tasks = self.tasks.write().await;
        let running = tasks
            .values()
            .filter(|h| h.task.status == SubagentStatus::Running)
            .count();
        if running >= self.config.max_concurrent {
            return Err(SubagentError::CapacityExceeded {
                limit: self.config.max_concurrent,
            }
            .into());
        }

        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let label = label.unwrap_or_else(|| truncate_label(task_prompt));
        let task = SubagentTask {
            id: id.clone(),
            session_id: origin.session_id.clone(),
            channel: origin.channel.clone(),
            label: label.clone(),
            task_prompt: task_prompt.to_string(),
            status: SubagentStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
        };
        let cancel = CancellationToken::new();

        info!(task_id = %id, session_id = %origin.session_id, label = %label, "Subagent spawned");

        let manager = Arc::clone(self);
        let token = cancel.clone();
        let prompt = task_prompt.to_string();
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            // Cancellation races the loop so an in-flight provider call is
            // abandoned instead of holding the slot until it returns.
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                res = tokio::time::timeout(
                    Duration::from_secs(manager.config.timeout_secs),
                    manager.run_reduced_loop(&prompt, &origin, &token),
                ) => Some(res),
            };

            let (status, body) = match outcome {
                None => (SubagentStatus::Cancelled, String::new()),
                Some(Ok(Ok(text))) => (SubagentStatus::Completed, text),
                Some(Ok(Err(e))) => (SubagentStatus::Failed, e.to_string()),
                Some(Err(_)) => (
                    SubagentStatus::Failed,
                    format!("Timed out after {}s", manager.config.timeout_secs),
                ),
            };
            manager.finish(&task_id, &origin, status, &body).await;
        });

        tasks.insert(
            id.clone(),
            SubagentHandle {
                task,
                cancel,
                join: Some(join),
            },
        );
        Ok(id)
    }

    /// Record the terminal state and, unless cancelled, announce the result
    /// to the origin session through the bus.
    async fn finish(
        self: &Arc<Self>,
        task_id: &str,
        origin: &SubagentOrigin,
        status: SubagentStatus,
        body: &str,
    ) {
        let announce = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                Some(handle) => {
                    // cancel_by_* already marked it; don't overwrite
                    if handle.task.status == SubagentStatus::Running {
                        handle.task.status = status;
                    }
                    handle.task.completed_at = Some(Utc::now());
                    (handle.task.status != SubagentStatus::Cancelled)
                        .then(|| handle.task.clone())
                }
                None => None,
            }
        };

        if let Some(task) = announce {
            let verdict = if task.status == SubagentStatus::Completed {
                "completed successfully"
            } else {
                "failed"
            };
            let text = format!(
                "[Subagent '{}' {}]\n\nTask: {}\n\nResult:\n{}\n\n\
                 Summarize this naturally for the user. Keep it brief (1-2 sentences).\n\
                 Do not mention technical details like \"subagent\" or task IDs.",
                task.label,
                verdict,
                task.task_prompt,
                truncate_body(body, self.config.max_response_chars),
            );
            self.bus.publish_inbound(
                InboundMessage::new(&origin.channel, &origin.session_id, "system:subagent", &text)
                    .with_metadata("subagent_task_id", &task.id),
            );
            info!(task_id, status = %task.status, "Subagent finished");
        } else {
            info!(task_id, "Subagent cancelled; no announcement");
        }

        // Keep the entry queryable for a grace period, then drop it.
        let manager = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RETENTION_SECS)).await;
            manager.tasks.write().await.remove(&task_id);
        });
    }

    /// The reduced agent loop: fixed system prompt, ephemeral message vector,
    /// filtered tools, lower iteration ceiling. Cancellation is checked
    /// before and after each LLM call and before each tool invocation.
    async fn run_reduced_loop(
        &self,
        task_prompt: &str,
        origin: &SubagentOrigin,
        token: &CancellationToken,
    ) -> anyhow::Result<String> {
        let tool_defs = self.registry.definitions_filtered(&self.blacklist).await;
        let options = ChatOptions {
            system_prompt: SUBAGENT_SYSTEM_PROMPT.to_string(),
            temperature: 0.4,
            max_tokens: 4096,
        };
        let ctx = ToolContext {
            session_id: origin.session_id.clone(),
            workspace_dir: origin.workspace_dir.clone(),
            channel: origin.channel.clone(),
            user_id: origin.user_id.clone(),
        };

        let mut messages: Vec<Value> =
            vec![serde_json::json!({ "role": "user", "content": task_prompt })];

        for _ in 0..self.config.max_iterations {
            if token.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            let resp = self
                .provider
                .chat(&self.model, &messages, &tool_defs, &options)
                .await?;
            if token.is_cancelled() {
                anyhow::bail!("cancelled");
            }

            if resp.tool_calls.is_empty() {
                return Ok(resp.content.unwrap_or_default());
            }

            messages.push(serde_json::json!({
                "role": "assistant",
                "content": resp.content.clone().unwrap_or_default(),
                "tool_calls": resp.tool_calls.iter()
                    .map(|tc| tc.to_provider_value())
                    .collect::<Vec<_>>(),
            }));

            for tc in &resp.tool_calls {
                if token.is_cancelled() {
                    anyhow::bail!("cancelled");
                }
                let result = match self.registry.execute(&tc.name, &tc.arguments, &ctx).await {
                    Ok(text) => text,
                    Err(e) => format!("Error: {}", e),
                };
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tc.id,
                    "name": tc.name,
                    "content": result,
                }));
            }
        }

        anyhow::bail!(
            "Gave up after {} iterations without a final answer",
            self.config.max_iterations
        )
    }

    /// Cancel every running subagent originated from a session. Returns how
    /// many were cancelled.
    pub async fn cancel_by_session(&self, session_id: &str) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut count = 0;
        for handle in tasks.values_mut() {
            if handle.task.session_id == session_id
                && handle.task.status == SubagentStatus::Running
            {
                handle.cancel.cancel();
                handle.task.status = SubagentStatus::Cancelled;
                handle.task.completed_at = Some(Utc::now());
                count += 1;
            }
        }
        count
    }

    pub async fn cancel_by_id(&self, task_id: &str) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write().await;
        let handle = tasks
            .get_mut(task_id)
            .ok_or_else(|| SubagentError::NotFound(task_id.to_string()))?;
        if handle.task.status == SubagentStatus::Running {
            handle.cancel.cancel();
            handle.task.status = SubagentStatus::Cancelled;
            handle.task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Cancel everything and wait for the runners to settle.
    pub async fn stop_all(&self) {
        let joins: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.write().await;
            tasks
                .values_mut()
                .filter_map(|handle| {
                    if handle.task.status == SubagentStatus::Running {
                        handle.cancel.cancel();
                        handle.task.status = SubagentStatus::Cancelled;
                        handle.task.completed_at = Some(Utc::now());
                    }
                    handle.join.take()
                })
                .collect()
        };
        for join in joins {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Subagent runner panicked during shutdown");
                }
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<SubagentTask> {
        self.tasks.read().await.get(task_id).map(|h| h.task.clone())
    }

    pub async fn tasks_for_session(&self, session_id: &str) -> Vec<SubagentTask> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<SubagentTask> = tasks
            .values()
            .filter(|h| h.task.session_id == session_id)
            .map(|h| h.task.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn running_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|h| h.task.status == SubagentStatus::Running)
            .count()
    }
}

fn truncate_label(prompt: &str) -> String {
    let flat = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= 40 {
        flat
    } else {
        let head: String = flat.chars().take(37).collect();
        format!("{}...", head)
    }
}

fn truncate_body(body: &str, max_chars: usize) -> &str {
    if body.len() <= max_chars {
        return body;
    }
    let boundary = body
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_chars)
        .last()
        .unwrap_or(0);
    &body[..boundary]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    fn origin(session: &str) -> SubagentOrigin {
        SubagentOrigin {
            session_id: session.to_string(),
            channel: "test".to_string(),
            workspace_dir: std::env::temp_dir(),
            user_id: Some("u1".to_string()),
        }
    }

    fn manager(provider: MockProvider, max_concurrent: usize) -> (Arc<SubagentManager>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        let config = SubagentsConfig {
            enabled: true,
            max_concurrent,
            max_iterations: 4,
            timeout_secs: 10,
            max_response_chars: 4000,
        };
        let manager = Arc::new(SubagentManager::new(
            Arc::new(provider),
            Arc::new(ToolRegistry::new()),
            bus.clone(),
            config,
            "mock-model".to_string(),
        ));
        (manager, bus)
    }

    #[test]
    fn label_truncation_keeps_short_prompts() {
        assert_eq!(truncate_label("analyse repo X"), "analyse repo X");
        let long = "a".repeat(100);
        assert_eq!(truncate_label(&long).chars().count(), 40);
    }

    #[tokio::test]
    async fn completion_announces_to_origin_session() {
        let provider = MockProvider::with_responses(vec![MockProvider::text_response(
            "Found 3 TODOs",
        )]);
        let (manager, bus) = manager(provider, 2);
        let mut rx = bus.take_inbound().unwrap();

        manager
            .spawn("Analyse repo X", origin("s5"), Some("analyse X".to_string()))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.sender, "system:subagent");
        assert_eq!(msg.session_id, "s5");
        assert!(msg.text.contains("[Subagent 'analyse X' completed successfully]"));
        assert!(msg.text.contains("Task: Analyse repo X"));
        assert!(msg.text.contains("Found 3 TODOs"));
    }

    #[tokio::test]
    async fn failure_announces_failed() {
        let provider = MockProvider::failing("upstream 500");
        let (manager, bus) = manager(provider, 2);
        let mut rx = bus.take_inbound().unwrap();

        manager.spawn("doomed", origin("s5"), None).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.text.contains("failed]"));
        assert!(msg.text.contains("upstream 500"));
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        // A provider that never responds keeps the first task running.
        let provider = MockProvider::stalling();
        let (manager, _bus) = manager(provider, 1);

        manager.spawn("slow", origin("s1"), None).await.unwrap();
        let err = manager.spawn("second", origin("s1"), None).await.unwrap_err();
        assert!(err.to_string().contains("slots"));
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn cancelled_subagent_stays_silent() {
        let provider = MockProvider::stalling();
        let (manager, bus) = manager(provider, 2);
        let mut rx = bus.take_inbound().unwrap();

        manager.spawn("slow", origin("s7"), None).await.unwrap();
        assert_eq!(manager.cancel_by_session("s7").await, 1);
        manager.stop_all().await;

        assert!(rx.try_recv().is_err(), "cancelled task must not announce");
    }

    #[tokio::test]
    async fn cancel_by_id_marks_cancelled() {
        let provider = MockProvider::stalling();
        let (manager, _bus) = manager(provider, 2);
        let id = manager.spawn("slow", origin("s1"), None).await.unwrap();

        assert!(manager.cancel_by_id("nope").await.is_err());
        manager.cancel_by_id(&id).await.unwrap();
        let task = manager.get_task(&id).await.unwrap();
        assert_eq!(task.status, SubagentStatus::Cancelled);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn cancel_by_session_only_touches_that_session() {
        let provider = MockProvider::stalling();
        let (manager, _bus) = manager(provider, 4);
        manager.spawn("a", origin("s1"), None).await.unwrap();
        manager.spawn("b", origin("s2"), None).await.unwrap();

        assert_eq!(manager.cancel_by_session("s1").await, 1);
        assert_eq!(manager.running_count().await, 1);
        manager.stop_all().await;
    }
}
