//! Post-turn history compaction. Runs off the turn's critical path: when the
//! in-memory log outgrows the window, the head is summarized (provider first,
//! deterministic fallback) and folded into the session summary.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::session::SessionStore;
use crate::traits::{ChatMessage, ChatOptions, ModelProvider};

const SUMMARIZER_PROMPT: &str = "\
You compress chat transcripts. Produce a compact third-person summary of the \
conversation below, preserving names, decisions, open questions, and anything \
the assistant promised to do. Reply with the summary text only.";

pub(super) async fn maybe_compact(
    sessions: Arc<SessionStore>,
    provider: Arc<dyn ModelProvider>,
    model: String,
    memory_window: usize,
    session_id: String,
) {
    let count = match sessions.get_message_count(&session_id).await {
        Ok(c) => c,
        Err(e) => {
            warn!(session_id, error = %e, "Compaction skipped: count failed");
            return;
        }
    };
    if count <= memory_window {
        return;
    }

    let keep_recent = memory_window * 6 / 10;
    let slice = match sessions.get_messages_to_compress(&session_id, keep_recent).await {
        Ok(Some(slice)) => slice,
        Ok(None) => return,
        Err(e) => {
            warn!(session_id, error = %e, "Compaction skipped: split failed");
            return;
        }
    };

    let previous = match sessions.get_summary(&session_id).await {
        Ok(s) => s.map(|s| s.content),
        Err(_) => None,
    };

    let summary = match summarize(&*provider, &model, previous.as_deref(), &slice).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) | Err(_) => {
            info!(session_id, "Provider summary unavailable; using rule-based fallback");
            rule_based_summary(previous.as_deref(), &slice)
        }
    };

    if let Err(e) = sessions
        .apply_compression(&session_id, &summary, slice.len())
        .await
    {
        warn!(session_id, error = %e, "Failed to apply compression");
    }
}

async fn summarize(
    provider: &dyn ModelProvider,
    model: &str,
    previous: Option<&str>,
    messages: &[ChatMessage],
) -> anyhow::Result<String> {
    let mut transcript = String::new();
    if let Some(prev) = previous {
        transcript.push_str("Earlier summary: ");
        transcript.push_str(prev);
        transcript.push_str("\n\n");
    }
    for msg in messages {
        if msg.content.is_empty() {
            continue;
        }
        transcript.push_str(&format!("{}: {}\n", msg.role, msg.content));
    }

    let options = ChatOptions {
        system_prompt: SUMMARIZER_PROMPT.to_string(),
        temperature: 0.1,
        max_tokens: 512,
    };
    let resp = provider
        .chat(
            model,
            &[json!({ "role": "user", "content": transcript })],
            &[],
            &options,
        )
        .await?;
    Ok(resp.content.unwrap_or_default())
}

/// Deterministic fallback: one line per user/assistant message.
fn rule_based_summary(previous: Option<&str>, messages: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    if let Some(prev) = previous {
        lines.push(prev.to_string());
    }
    for msg in messages {
        if msg.role != "user" && msg.role != "assistant" {
            continue;
        }
        if msg.content.is_empty() {
            continue;
        }
        let head: String = msg.content.chars().take(80).collect();
        lines.push(format!("{}: {}", msg.role, head));
    }
    lines.join("\n")
}
