use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::subagents::{SubagentManager, SubagentOrigin};
use crate::traits::{Tool, ToolContext};

/// Spawn a background subagent. The origin session travels in the execute
/// context — concurrent turns never see each other's origin.
pub struct SpawnSubagentTool {
    subagents: Arc<SubagentManager>,
}

impl SpawnSubagentTool {
    pub fn new(subagents: Arc<SubagentManager>) -> Self {
        Self { subagents }
    }
}

#[derive(Deserialize)]
struct SpawnArgs {
    task: String,
    #[serde(default)]
    label: Option<String>,
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Start a background task that runs independently and reports back \
         when finished. Use for long-running work the user should not wait \
         on. Returns immediately with a task id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the background task should accomplish"
                },
                "label": {
                    "type": "string",
                    "description": "Short label for status messages (optional)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let args: SpawnArgs = serde_json::from_value(args)?;
        let origin = SubagentOrigin {
            session_id: ctx.session_id.clone(),
            channel: ctx.channel.clone(),
            workspace_dir: ctx.workspace_dir.clone(),
            user_id: ctx.user_id.clone(),
        };
        let id = self.subagents.spawn(&args.task, origin, args.label).await?;
        Ok(format!(
            "Background task {} started. Its result will arrive as a message when it finishes.",
            id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::SubagentsConfig;
    use crate::testing::MockProvider;
    use crate::tools::ToolRegistry;

    #[tokio::test]
    async fn spawn_uses_context_origin() {
        let bus = Arc::new(MessageBus::new());
        let mut rx = bus.take_inbound().unwrap();
        let manager = Arc::new(SubagentManager::new(
            Arc::new(MockProvider::with_responses(vec![
                MockProvider::text_response("done"),
            ])),
            Arc::new(ToolRegistry::new()),
            bus,
            SubagentsConfig::default(),
            "mock-model".to_string(),
        ));
        let tool = SpawnSubagentTool::new(manager);

        let ctx = ToolContext {
            session_id: "origin-session".to_string(),
            workspace_dir: std::env::temp_dir(),
            channel: "web".to_string(),
            user_id: None,
        };
        let out = tool.execute(json!({"task": "count stars"}), &ctx).await.unwrap();
        assert!(out.contains("Background task"));

        let announcement = rx.recv().await.unwrap();
        assert_eq!(announcement.session_id, "origin-session");
        assert_eq!(announcement.channel, "web");
    }
}
