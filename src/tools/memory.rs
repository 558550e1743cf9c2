use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::traits::{MemoryStore, Tool, ToolContext};

/// Append a durable note to the bound user's memory. Notes come back into the
/// system prompt's `<memory>` block on later turns.
pub struct RememberTool {
    memory: Arc<dyn MemoryStore>,
}

impl RememberTool {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }
}

#[derive(Deserialize)]
struct RememberArgs {
    content: String,
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store an important fact about the user for future conversations \
         (preferences, context, commitments). Keep each note short."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact to remember"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let args: RememberArgs = serde_json::from_value(args)?;
        let user_id = ctx
            .user_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No user bound to this session"))?;
        self.memory.append_memory(user_id, &args.content).await?;
        Ok("Noted.".to_string())
    }
}
