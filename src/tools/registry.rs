use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::ToolError;
use crate::traits::{Tool, ToolContext};

/// Name-indexed tool collection shared between the main loop and subagents.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. A duplicate name replaces the existing registration.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let previous = self.tools.write().await.insert(name.clone(), tool);
        if previous.is_some() {
            warn!(name, "Tool replaced by re-registration");
        }
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub async fn list_tools(&self) -> Vec<(String, String)> {
        let tools = self.tools.read().await;
        let mut out: Vec<(String, String)> = tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect();
        out.sort();
        out
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Tool definitions in the function-calling shape providers expect.
    pub async fn tool_definitions(&self) -> Vec<Value> {
        self.definitions_filtered(&[]).await
    }

    /// Definitions with the named tools excluded (subagent view).
    pub async fn definitions_filtered(&self, blacklist: &[String]) -> Vec<Value> {
        let tools = self.tools.read().await;
        let mut names: Vec<&String> = tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter(|n| !blacklist.iter().any(|b| b == *n))
            .map(|n| {
                let t = &tools[n];
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Execute a tool, wrapping anything that is not already a `ToolError`
    /// into `ToolError::Execution` with the name and exact argument map.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let tool = self.get(name).await?;
        tool.execute(args.clone(), ctx)
            .await
            .map_err(|e| match e.downcast::<ToolError>() {
                Ok(tool_err) => tool_err,
                Err(other) => ToolError::execution(name, args, &other),
            })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            anyhow::bail!("broken pipe")
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: "s1".to_string(),
            workspace_dir: std::env::temp_dir(),
            channel: "test".to_string(),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn register_get_execute() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).await;
        assert!(reg.has("echo").await);
        assert_eq!(reg.len().await, 1);

        let out = reg.execute("echo", &json!({"text": "hi"}), &ctx()).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn missing_tool_is_not_found() {
        let reg = ToolRegistry::new();
        let err = reg.execute("nope", &json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn execution_failure_preserves_args() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(FailingTool)).await;
        let err = reg
            .execute("fail", &json!({"why": "test"}), &ctx())
            .await
            .unwrap_err();
        match err {
            ToolError::Execution { tool, args, message } => {
                assert_eq!(tool, "fail");
                assert_eq!(args["why"], "test");
                assert!(message.contains("broken pipe"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn definitions_are_function_shaped_and_filterable() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).await;
        reg.register(Arc::new(FailingTool)).await;

        let defs = reg.tool_definitions().await;
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0]["type"], "function");
        assert!(defs[0]["function"]["parameters"].is_object());

        let filtered = reg.definitions_filtered(&["fail".to_string()]).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["function"]["name"], "echo");
    }

    #[tokio::test]
    async fn unregister_removes() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).await;
        assert!(reg.unregister("echo").await);
        assert!(!reg.unregister("echo").await);
        assert!(!reg.has("echo").await);
    }
}
