//! Minimal stdin/stdout transport for running the daemon interactively.
//! Real transports live outside the core; this one exists so the binary is
//! usable out of the box and doubles as a reference implementation of the
//! transport contract.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage, ProgressHandler, ProgressMessage, ProgressStep};

pub const CHANNEL_NAME: &str = "terminal";
const SESSION_ID: &str = "terminal:local";

struct TerminalOutbound;

#[async_trait]
impl crate::bus::OutboundHandler for TerminalOutbound {
    async fn deliver(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        println!("{}", msg.text);
        Ok(())
    }
}

struct TerminalProgress;

#[async_trait]
impl ProgressHandler for TerminalProgress {
    async fn deliver(&self, msg: ProgressMessage) -> anyhow::Result<()> {
        match msg.step {
            ProgressStep::Thinking => eprintln!("  · thinking (step {})", msg.iteration + 1),
            ProgressStep::ToolCall => {
                eprintln!("  · {}(...)", msg.tool_name.as_deref().unwrap_or("tool"))
            }
            ProgressStep::ToolResult if msg.is_error => {
                eprintln!("  · {} failed", msg.tool_name.as_deref().unwrap_or("tool"))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Register handlers and pump stdin lines into the bus until EOF.
pub async fn run(bus: Arc<MessageBus>) {
    bus.register_outbound_handler(CHANNEL_NAME, Arc::new(TerminalOutbound))
        .await;
    bus.register_progress_handler(CHANNEL_NAME, Arc::new(TerminalProgress))
        .await;

    let user = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                bus.publish_inbound(InboundMessage::new(CHANNEL_NAME, SESSION_ID, &user, line));
            }
            Ok(None) => {
                debug!("stdin closed");
                return;
            }
            Err(e) => {
                debug!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}
