//! Per-turn pipeline: identity binding, command dispatch, LLM-tool iteration.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{InboundMessage, ProgressMessage, ProgressStep};
use crate::providers::ProviderError;
use crate::skills;
use crate::traits::{ChatMessage, ChatOptions, ProviderResponse, ToolContext};

use super::{system_prompt, AgentLoop};

pub(super) enum TurnOutcome {
    Reply(String),
    Cancelled,
}

impl AgentLoop {
    pub(super) async fn run_turn(
        &self,
        msg: &InboundMessage,
        token: &CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        let meta = self.sessions.get_or_create(&msg.session_id, &msg.channel).await;
        let user_id = self.bind_identity(msg, meta.user_id.as_deref()).await;

        let text = msg.text.trim();
        if text.starts_with('/') {
            let reply = self.handle_command(msg, user_id.as_deref()).await;
            return Ok(TurnOutcome::Reply(reply));
        }

        // Persist the user message; failures here are fatal for the turn.
        let mut user_msg = ChatMessage::user(&msg.text);
        if msg.sender == "scheduler" {
            user_msg = user_msg.with_metadata("source", "scheduler");
        }
        self.sessions.add_message(&msg.session_id, user_msg).await?;

        let history = self.sessions.get_history(&msg.session_id).await?;
        let mut messages: Vec<Value> = history.iter().map(|m| m.to_provider_value()).collect();

        let options = ChatOptions {
            system_prompt: self.assemble_system_prompt(&msg.text, user_id.as_deref()).await,
            temperature: self.provider_config.temperature,
            max_tokens: self.provider_config.max_tokens,
        };
        let tool_defs = self.registry.tool_definitions().await;

        let workspace_dir = self.sessions.workspace_dir(&msg.session_id);
        if let Err(e) = tokio::fs::create_dir_all(&workspace_dir).await {
            warn!(session_id = %msg.session_id, error = %e, "Could not create session workspace");
        }
        let ctx = ToolContext {
            session_id: msg.session_id.clone(),
            workspace_dir,
            channel: msg.channel.clone(),
            user_id: user_id.clone(),
        };

        for iteration in 0..self.config.max_iterations {
            if token.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
            self.progress(msg, ProgressStep::Thinking, iteration, "", None, false);

            let resp = self.call_llm(&messages, &tool_defs, &options).await?;
            if token.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }

            if resp.tool_calls.is_empty() {
                let reply = resp.content.unwrap_or_default();
                self.sessions
                    .add_message(&msg.session_id, ChatMessage::assistant(&reply))
                    .await?;
                return Ok(TurnOutcome::Reply(reply));
            }

            if let Some(inline) = resp.content.as_deref().filter(|t| !t.trim().is_empty()) {
                self.progress(msg, ProgressStep::LlmResponse, iteration, inline, None, false);
            }

            let assistant = ChatMessage::assistant_with_tool_calls(
                resp.content.clone().unwrap_or_default(),
                resp.tool_calls.clone(),
            );
            messages.push(assistant.to_provider_value());
            self.sessions.add_message(&msg.session_id, assistant).await?;

            for tc in &resp.tool_calls {
                if token.is_cancelled() {
                    return Ok(TurnOutcome::Cancelled);
                }
                self.progress(msg, ProgressStep::ToolCall, iteration, "", Some(&tc.name), false);
                info!(session_id = %msg.session_id, tool = %tc.name, "Executing tool");

                let (result, is_error) =
                    match self.registry.execute(&tc.name, &tc.arguments, &ctx).await {
                        Ok(text) => (text, false),
                        // The model sees tool failures as text and can adjust.
                        Err(e) => (format!("Error: {}", e), true),
                    };
                self.progress(
                    msg,
                    ProgressStep::ToolResult,
                    iteration,
                    &result,
                    Some(&tc.name),
                    is_error,
                );

                let tool_msg = ChatMessage::tool_result(&tc.id, &tc.name, &result);
                messages.push(tool_msg.to_provider_value());
                self.sessions.add_message(&msg.session_id, tool_msg).await?;
            }
        }

        anyhow::bail!(
            "Hit the {}-step limit for one request without reaching an answer. \
             Try breaking the request into smaller pieces.",
            self.config.max_iterations
        )
    }

    /// Bind a user to the session. Scheduler-originated messages restore the
    /// creator identity from metadata; system senders keep whatever binding
    /// exists; everything else resolves through the user store.
    async fn bind_identity(
        &self,
        msg: &InboundMessage,
        existing_user: Option<&str>,
    ) -> Option<String> {
        if msg.sender == "scheduler" {
            if let Some(uid) = msg.metadata.get("creator_user_id") {
                self.sessions.set_session_user(&msg.session_id, uid).await;
                return Some(uid.clone());
            }
            return existing_user.map(String::from);
        }
        if msg.sender.starts_with("system:") {
            return existing_user.map(String::from);
        }

        let display_name = msg.metadata.get("display_name").map(|s| s.as_str());
        match self
            .users
            .resolve_or_create(&msg.channel, &msg.sender, display_name)
            .await
        {
            Ok(user) => {
                self.sessions
                    .set_session_user(&msg.session_id, &user.user_id)
                    .await;
                Some(user.user_id)
            }
            Err(e) => {
                warn!(channel = %msg.channel, sender = %msg.sender, error = %e, "Identity resolution failed");
                existing_user.map(String::from)
            }
        }
    }

    pub(super) async fn assemble_system_prompt(
        &self,
        user_text: &str,
        user_id: Option<&str>,
    ) -> String {
        let memories = match user_id {
            Some(uid) => self.memory.recent_memories(uid, 20).await.unwrap_or_default(),
            None => Vec::new(),
        };
        let spaces = match user_id {
            Some(uid) => self.spaces.spaces_for_user(uid).await.unwrap_or_default(),
            None => Vec::new(),
        };
        let active = skills::match_skills(&self.skills, user_text);
        system_prompt::build_system_prompt(
            &self.config.base_prompt,
            &memories,
            &self.skills,
            &active,
            &spaces,
        )
    }

    /// One retry for transient provider failures; everything else surfaces as
    /// a turn error with the classified user message.
    async fn call_llm(
        &self,
        messages: &[Value],
        tool_defs: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ProviderResponse> {
        let model = &self.provider_config.model;
        match self.provider.chat(model, messages, tool_defs, options).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let provider_err = match e.downcast::<ProviderError>() {
                    Ok(pe) => pe,
                    Err(other) => return Err(other),
                };
                warn!(kind = ?provider_err.kind, "LLM call failed: {}", provider_err);
                if !provider_err.is_retryable() {
                    anyhow::bail!("{}", provider_err.user_message());
                }
                let wait = provider_err.retry_after_secs.unwrap_or(2).min(30);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                match self.provider.chat(model, messages, tool_defs, options).await {
                    Ok(resp) => Ok(resp),
                    Err(_) => anyhow::bail!("{}", provider_err.user_message()),
                }
            }
        }
    }

    fn progress(
        &self,
        msg: &InboundMessage,
        step: ProgressStep,
        iteration: usize,
        text: &str,
        tool_name: Option<&str>,
        is_error: bool,
    ) {
        self.bus.publish_progress(ProgressMessage {
            channel: msg.channel.clone(),
            session_id: msg.session_id.clone(),
            step,
            iteration,
            text: text.to_string(),
            tool_name: tool_name.map(String::from),
            is_error,
        });
    }
}
