use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

/// Per-invocation capability context passed to every tool.
///
/// Tools that need core components (scheduler, subagent manager, bus) receive
/// them at construction; everything turn-scoped travels here. There is no
/// module-level state to read a caller's session from.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    /// Scoped filesystem path for this session's tool outputs.
    pub workspace_dir: PathBuf,
    pub channel: String,
    pub user_id: Option<String>,
}

/// A local capability exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-Schema object describing the parameters (`type`, `properties`,
    /// `required`).
    fn parameters(&self) -> Value;
    /// Execute with parsed arguments. The returned text is fed back to the
    /// model as a tool-role message.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}
