use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::bus::{MessageBus, OutboundMessage};
use crate::session::SessionStore;
use crate::traits::{Tool, ToolContext, UserStore};

/// Deliver a short message to another user's most recent session. Blacklisted
/// for subagents — only the main loop may reach other users.
pub struct SendMessageTool {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionStore>,
    users: Arc<dyn UserStore>,
}

impl SendMessageTool {
    pub fn new(bus: Arc<MessageBus>, sessions: Arc<SessionStore>, users: Arc<dyn UserStore>) -> Self {
        Self { bus, sessions, users }
    }
}

#[derive(Deserialize)]
struct SendArgs {
    user_id: String,
    text: String,
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to another user of this assistant, addressed by their \
         user id (as shown by /whoami). Delivered to the channel they last \
         used."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {
                    "type": "string",
                    "description": "Recipient user id"
                },
                "text": {
                    "type": "string",
                    "description": "Message body"
                }
            },
            "required": ["user_id", "text"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let args: SendArgs = serde_json::from_value(args)?;
        let recipient = self
            .users
            .get_user(&args.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("No user '{}'", args.user_id))?;

        let mut sessions = self.sessions.find_sessions_by_user(&recipient.user_id).await;
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let target = sessions
            .first()
            .ok_or_else(|| anyhow::anyhow!("User '{}' has no reachable session", args.user_id))?;

        let from = match &ctx.user_id {
            Some(uid) => match self.users.get_user(uid).await? {
                Some(u) => u.display_name.unwrap_or(u.user_id),
                None => uid.clone(),
            },
            None => "someone".to_string(),
        };

        self.bus
            .publish_outbound(OutboundMessage {
                channel: target.channel.clone(),
                session_id: target.session_id.clone(),
                text: format!("📨 Message from {}: {}", from, args.text),
            })
            .await;
        Ok(format!("Delivered to {}", recipient.user_id))
    }
}
