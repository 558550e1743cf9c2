//! Test infrastructure: MockProvider, in-memory stores, capturing handlers,
//! and a fully wired harness that runs the real agent loop against mocks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::agent::{AgentComponents, AgentLoop};
use crate::bus::{InboundMessage, MessageBus, OutboundHandler, OutboundMessage, ProgressHandler, ProgressMessage};
use crate::config::{AgentConfig, ProviderConfig, SubagentsConfig};
use crate::providers::{ProviderError, ProviderErrorKind};
use crate::scheduler::Scheduler;
use crate::session::SessionStore;
use crate::subagents::SubagentManager;
use crate::tools::ToolRegistry;
use crate::traits::{
    ChatMessage, ChatOptions, FinishReason, MemoryStore, ModelProvider, ProviderResponse,
    ScheduledTask, SessionBackend, SessionMeta, SessionSummary, Space, SpaceStore, TaskStore,
    TokenUsage, ToolCall, UserRecord, UserStore,
};

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockChatCall {
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    pub system_prompt: String,
}

/// Scripted LLM provider. Responses are a FIFO queue; subagent calls
/// (recognized by their fixed system prompt) draw from a separate queue so
/// interleaving with main-loop calls stays deterministic.
pub struct MockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    subagent_responses: Mutex<Vec<ProviderResponse>>,
    pub call_log: Mutex<Vec<MockChatCall>>,
    delay: Option<Duration>,
    fail_message: Option<String>,
    stall: bool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockProvider {
    /// Always answers "Mock response".
    pub fn new() -> Self {
        Self::with_responses(Vec::new())
    }

    pub fn with_responses(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            subagent_responses: Mutex::new(Vec::new()),
            call_log: Mutex::new(Vec::new()),
            delay: None,
            fail_message: None,
            stall: false,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call fails with a non-retryable provider error.
    pub fn failing(message: &str) -> Self {
        let mut p = Self::new();
        p.fail_message = Some(message.to_string());
        p
    }

    /// Every call hangs until the caller is cancelled.
    pub fn stalling() -> Self {
        let mut p = Self::new();
        p.stall = true;
        p
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue served to subagent calls (recognized by their system prompt).
    pub fn with_subagent_responses(self, responses: Vec<ProviderResponse>) -> Self {
        *self.subagent_responses.lock() = responses;
        self
    }

    pub fn text_response(text: &str) -> ProviderResponse {
        ProviderResponse {
            content: Some(text.to_string()),
            tool_calls: vec![],
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn tool_call_response(call_id: &str, tool_name: &str, args: Value) -> ProviderResponse {
        ProviderResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: call_id.to_string(),
                name: tool_name.to_string(),
                arguments: args,
            }],
            usage: None,
            finish_reason: FinishReason::ToolCalls,
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().len()
    }

    /// Highest number of chat calls that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn chat(
        &self,
        _model: &str,
        messages: &[Value],
        tools: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ProviderResponse> {
        self.call_log.lock().push(MockChatCall {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            system_prompt: options.system_prompt.clone(),
        });

        if self.stall {
            futures::future::pending::<()>().await;
            unreachable!();
        }
        if let Some(message) = &self.fail_message {
            return Err(ProviderError {
                kind: ProviderErrorKind::Unknown,
                status: None,
                message: message.clone(),
                retry_after_secs: None,
            }
            .into());
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let is_subagent = options.system_prompt.starts_with("You are a background task agent");
        if is_subagent {
            let mut queue = self.subagent_responses.lock();
            if !queue.is_empty() {
                return Ok(queue.remove(0));
            }
        }
        let mut queue = self.responses.lock();
        if queue.is_empty() {
            Ok(MockProvider::text_response("Mock response"))
        } else {
            Ok(queue.remove(0))
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend: every narrow store trait in one struct
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBackend {
    metas: Mutex<HashMap<String, SessionMeta>>,
    messages: Mutex<HashMap<String, Vec<ChatMessage>>>,
    summaries: Mutex<HashMap<String, SessionSummary>>,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    users: Mutex<HashMap<String, UserRecord>>,
    identities: Mutex<HashMap<(String, String), String>>,
    link_codes: Mutex<HashMap<String, String>>,
    memories: Mutex<HashMap<String, Vec<String>>>,
    spaces: Mutex<HashMap<String, Space>>,
    members: Mutex<HashSet<(String, String)>>,
    fail_appends: AtomicBool,
    user_seq: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `append_message` calls fail (persistence-failure paths).
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn persisted_messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load_all_session_metas(&self) -> anyhow::Result<Vec<SessionMeta>> {
        Ok(self.metas.lock().values().cloned().collect())
    }

    async fn save_session_meta(&self, meta: &SessionMeta) -> anyhow::Result<()> {
        self.metas.lock().insert(meta.session_id.clone(), meta.clone());
        Ok(())
    }

    async fn append_message(&self, session_id: &str, msg: &ChatMessage) -> anyhow::Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.messages
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(msg.clone());
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(self.persisted_messages(session_id))
    }

    async fn clear_messages(&self, session_id: &str) -> anyhow::Result<()> {
        self.messages.lock().remove(session_id);
        Ok(())
    }

    async fn load_summary(&self, session_id: &str) -> anyhow::Result<Option<SessionSummary>> {
        Ok(self.summaries.lock().get(session_id).cloned())
    }

    async fn save_summary(
        &self,
        session_id: &str,
        summary: &SessionSummary,
    ) -> anyhow::Result<()> {
        self.summaries
            .lock()
            .insert(session_id.to_string(), summary.clone());
        Ok(())
    }

    async fn clear_summary(&self, session_id: &str) -> anyhow::Result<()> {
        self.summaries.lock().remove(session_id);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryBackend {
    async fn load_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        Ok(self.tasks.lock().values().cloned().collect())
    }

    async fn save_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        self.tasks.lock().remove(id);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryBackend {
    async fn resolve_or_create(
        &self,
        channel: &str,
        sender: &str,
        display_name: Option<&str>,
    ) -> anyhow::Result<UserRecord> {
        let key = (channel.to_string(), sender.to_string());
        if let Some(uid) = self.identities.lock().get(&key) {
            if let Some(user) = self.users.lock().get(uid) {
                return Ok(user.clone());
            }
        }
        let user = UserRecord {
            user_id: format!("u{}", self.user_seq.fetch_add(1, Ordering::SeqCst) + 1),
            display_name: display_name.map(String::from),
            created_at: Utc::now(),
        };
        self.users.lock().insert(user.user_id.clone(), user.clone());
        self.identities.lock().insert(key, user.user_id.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        Ok(self.users.lock().get(user_id).cloned())
    }

    async fn issue_link_code(&self, user_id: &str) -> anyhow::Result<String> {
        let code = format!("LK{}", self.user_seq.fetch_add(1, Ordering::SeqCst));
        self.link_codes.lock().insert(code.clone(), user_id.to_string());
        Ok(code)
    }

    async fn redeem_link_code(
        &self,
        code: &str,
        channel: &str,
        sender: &str,
    ) -> anyhow::Result<Option<UserRecord>> {
        let Some(uid) = self.link_codes.lock().remove(code) else {
            return Ok(None);
        };
        let Some(user) = self.users.lock().get(&uid).cloned() else {
            return Ok(None);
        };
        self.identities
            .lock()
            .insert((channel.to_string(), sender.to_string()), uid);
        Ok(Some(user))
    }

    async fn unlink_identity(
        &self,
        channel: &str,
        sender: &str,
    ) -> anyhow::Result<Option<UserRecord>> {
        let key = (channel.to_string(), sender.to_string());
        if !self.identities.lock().contains_key(&key) {
            return Ok(None);
        }
        let user = UserRecord {
            user_id: format!("u{}", self.user_seq.fetch_add(1, Ordering::SeqCst) + 1),
            display_name: None,
            created_at: Utc::now(),
        };
        self.users.lock().insert(user.user_id.clone(), user.clone());
        self.identities.lock().insert(key, user.user_id.clone());
        Ok(Some(user))
    }
}

#[async_trait]
impl MemoryStore for MemoryBackend {
    async fn append_memory(&self, user_id: &str, content: &str) -> anyhow::Result<()> {
        self.memories
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .push(content.to_string());
        Ok(())
    }

    async fn recent_memories(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let all = self.memories.lock().get(user_id).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl SpaceStore for MemoryBackend {
    async fn create_space(
        &self,
        name: &str,
        description: &str,
        user_id: &str,
    ) -> anyhow::Result<Space> {
        let space = Space {
            id: format!("sp{}", self.user_seq.fetch_add(1, Ordering::SeqCst)),
            name: name.to_string(),
            description: description.to_string(),
            created_by: user_id.to_string(),
            created_at: Utc::now(),
        };
        self.spaces.lock().insert(space.id.clone(), space.clone());
        self.members
            .lock()
            .insert((space.id.clone(), user_id.to_string()));
        Ok(space)
    }

    async fn join_space(&self, space_id: &str, user_id: &str) -> anyhow::Result<Option<Space>> {
        let space = self.spaces.lock().get(space_id).cloned();
        if space.is_some() {
            self.members
                .lock()
                .insert((space_id.to_string(), user_id.to_string()));
        }
        Ok(space)
    }

    async fn leave_space(&self, space_id: &str, user_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .members
            .lock()
            .remove(&(space_id.to_string(), user_id.to_string())))
    }

    async fn spaces_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Space>> {
        let members = self.members.lock();
        let spaces = self.spaces.lock();
        Ok(members
            .iter()
            .filter(|(_, uid)| uid == user_id)
            .filter_map(|(sid, _)| spaces.get(sid).cloned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Capturing transport handlers
// ---------------------------------------------------------------------------

pub struct CapturingOutbound {
    messages: tokio::sync::Mutex<Vec<OutboundMessage>>,
}

impl CapturingOutbound {
    pub fn new() -> Self {
        Self {
            messages: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn take(&self) -> Vec<OutboundMessage> {
        self.messages.lock().await.drain(..).collect()
    }

    pub async fn snapshot(&self) -> Vec<OutboundMessage> {
        self.messages.lock().await.clone()
    }

    /// Poll until `count` messages have arrived (5 s deadline).
    pub async fn wait_count(&self, count: usize) -> Vec<OutboundMessage> {
        for _ in 0..500 {
            {
                let messages = self.messages.lock().await;
                if messages.len() >= count {
                    return messages.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {} outbound messages; have {:?}",
            count,
            self.messages.lock().await.len()
        );
    }
}

#[async_trait]
impl OutboundHandler for CapturingOutbound {
    async fn deliver(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        self.messages.lock().await.push(msg);
        Ok(())
    }
}

pub struct CapturingProgress {
    pub events: tokio::sync::Mutex<Vec<ProgressMessage>>,
}

impl CapturingProgress {
    pub fn new() -> Self {
        Self {
            events: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProgressHandler for CapturingProgress {
    async fn deliver(&self, msg: ProgressMessage) -> anyhow::Result<()> {
        self.events.lock().await.push(msg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A fully wired runtime over mocks: real bus, real session store, real
/// scheduler/subagents/loop, scripted provider, capturing transport.
pub struct TestHarness {
    pub bus: Arc<MessageBus>,
    pub backend: Arc<MemoryBackend>,
    pub sessions: Arc<SessionStore>,
    pub provider: Arc<MockProvider>,
    pub registry: Arc<ToolRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub subagents: Arc<SubagentManager>,
    pub outbound: Arc<CapturingOutbound>,
    pub progress: Arc<CapturingProgress>,
    pub agent: Arc<AgentLoop>,
}

impl TestHarness {
    pub async fn new(provider: MockProvider) -> Self {
        Self::with_config(provider, AgentConfig::default()).await
    }

    pub async fn with_config(provider: MockProvider, agent_config: AgentConfig) -> Self {
        let bus = Arc::new(MessageBus::new());
        let backend = Arc::new(MemoryBackend::new());
        let provider = Arc::new(provider);
        let sessions = Arc::new(SessionStore::new(
            backend.clone(),
            agent_config.memory_window,
            std::env::temp_dir().join("switchboard-harness"),
        ));
        let registry = Arc::new(ToolRegistry::new());
        let scheduler = Arc::new(Scheduler::new(backend.clone(), bus.clone(), 10, 3600));
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            registry.clone(),
            bus.clone(),
            SubagentsConfig::default(),
            "mock-model".to_string(),
        ));
        let outbound = Arc::new(CapturingOutbound::new());
        let progress = Arc::new(CapturingProgress::new());
        bus.register_outbound_handler("test", outbound.clone()).await;
        bus.register_progress_handler("test", progress.clone()).await;

        let provider_config = ProviderConfig {
            api_key: "test".to_string(),
            base_url: "http://localhost".to_string(),
            model: "mock-model".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
        };

        let agent = AgentLoop::new(AgentComponents {
            bus: bus.clone(),
            sessions: sessions.clone(),
            users: backend.clone(),
            memory: backend.clone(),
            spaces: backend.clone(),
            provider: provider.clone(),
            registry: registry.clone(),
            scheduler: scheduler.clone(),
            subagents: subagents.clone(),
            skills: Vec::new(),
            provider_config,
            agent_config,
        });

        let runner = agent.clone();
        tokio::spawn(async move {
            runner.run().await;
        });

        Self {
            bus,
            backend,
            sessions,
            provider,
            registry,
            scheduler,
            subagents,
            outbound,
            progress,
            agent,
        }
    }

    pub fn send(&self, session_id: &str, text: &str) {
        self.bus
            .publish_inbound(InboundMessage::new("test", session_id, "tester", text));
    }

    pub fn send_from(&self, session_id: &str, sender: &str, text: &str) {
        self.bus
            .publish_inbound(InboundMessage::new("test", session_id, sender, text));
    }
}

/// Tool returning a fixed string; used to script tool-call iterations.
pub struct FixedTool {
    name: String,
    result: String,
}

impl FixedTool {
    pub fn new(name: &str, result: &str) -> Self {
        Self {
            name: name.to_string(),
            result: result.to_string(),
        }
    }
}

#[async_trait]
impl crate::traits::Tool for FixedTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _args: Value, _ctx: &crate::traits::ToolContext) -> anyhow::Result<String> {
        Ok(self.result.clone())
    }
}
