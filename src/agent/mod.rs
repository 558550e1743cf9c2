//! The per-turn orchestrator: per-session FIFO, global concurrency cap,
//! LLM-tool iteration, cooperative cancellation, compaction.

mod commands;
mod compaction;
mod system_prompt;
mod turn;

pub use system_prompt::SECURITY_RULES;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::config::{AgentConfig, ProviderConfig};
use crate::scheduler::Scheduler;
use crate::session::SessionStore;
use crate::skills::Skill;
use crate::subagents::SubagentManager;
use crate::tools::ToolRegistry;
use crate::traits::{MemoryStore, ModelProvider, SpaceStore, UserStore};

use turn::TurnOutcome;

/// Queue state for a session with at least one queued or in-flight turn.
/// `tail` is the completion signal of the most recently enqueued turn; the
/// next turn chains behind it. `handles` is the union of cancellation tokens
/// for every queued and in-flight turn.
#[derive(Default)]
struct SessionQueueState {
    tail: Option<oneshot::Receiver<()>>,
    handles: HashMap<u64, CancellationToken>,
    pending: usize,
}

/// Everything the loop needs, wired once at startup.
pub struct AgentComponents {
    pub bus: Arc<MessageBus>,
    pub sessions: Arc<SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub spaces: Arc<dyn SpaceStore>,
    pub provider: Arc<dyn ModelProvider>,
    pub registry: Arc<ToolRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub subagents: Arc<SubagentManager>,
    pub skills: Vec<Skill>,
    pub provider_config: ProviderConfig,
    pub agent_config: AgentConfig,
}

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionStore>,
    users: Arc<dyn UserStore>,
    memory: Arc<dyn MemoryStore>,
    spaces: Arc<dyn SpaceStore>,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    scheduler: Arc<Scheduler>,
    subagents: Arc<SubagentManager>,
    skills: Vec<Skill>,
    provider_config: ProviderConfig,
    config: AgentConfig,
    semaphore: Arc<Semaphore>,
    queues: Arc<Mutex<HashMap<String, SessionQueueState>>>,
    turn_seq: AtomicU64,
}

impl AgentLoop {
    pub fn new(parts: AgentComponents) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(parts.agent_config.max_concurrent_messages));
        Arc::new(Self {
            bus: parts.bus,
            sessions: parts.sessions,
            users: parts.users,
            memory: parts.memory,
            spaces: parts.spaces,
            provider: parts.provider,
            registry: parts.registry,
            scheduler: parts.scheduler,
            subagents: parts.subagents,
            skills: parts.skills,
            provider_config: parts.provider_config,
            config: parts.agent_config,
            semaphore,
            queues: Arc::new(Mutex::new(HashMap::new())),
            turn_seq: AtomicU64::new(1),
        })
    }

    /// Consume the bus until it closes. Installs the cancellation hook, then
    /// dispatches every inbound message through the per-session FIFO.
    pub async fn run(self: &Arc<Self>) {
        let mut inbound = match self.bus.take_inbound() {
            Some(rx) => rx,
            None => {
                error!("Inbound stream already taken; agent loop not started");
                return;
            }
        };

        let queues = Arc::clone(&self.queues);
        self.bus.on_session_cancel(Arc::new(move |session_id: &str| {
            let queues = queues.lock();
            if let Some(state) = queues.get(session_id) {
                info!(session_id, turns = state.handles.len(), "Cancelling session turns");
                for token in state.handles.values() {
                    token.cancel();
                }
            }
        }));

        info!("Agent loop started");
        while let Some(msg) = inbound.recv().await {
            // /stop must not queue behind the turn it is meant to abort.
            if msg.text.trim() == "/stop" {
                self.handle_stop(msg).await;
                continue;
            }
            self.dispatch(msg);
        }
        info!("Inbound stream closed; agent loop exiting");
    }

    /// Install a turn at the session's queue tail. Observing the existing
    /// tail and becoming the new tail happen under one lock with no await, so
    /// near-simultaneous messages for a session are strictly ordered.
    fn dispatch(self: &Arc<Self>, msg: InboundMessage) {
        let turn_id = self.turn_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let predecessor = {
            let mut queues = self.queues.lock();
            let state = queues.entry(msg.session_id.clone()).or_default();
            state.pending += 1;
            state.handles.insert(turn_id, token.clone());
            state.tail.replace(done_rx)
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process_turn(msg, turn_id, token, predecessor, done_tx)
                .await;
        });
    }

    async fn process_turn(
        self: Arc<Self>,
        msg: InboundMessage,
        turn_id: u64,
        token: CancellationToken,
        predecessor: Option<oneshot::Receiver<()>>,
        done_tx: oneshot::Sender<()>,
    ) {
        // Wait for the previous turn in this session to settle. A dropped
        // sender (predecessor panicked) also releases us.
        if let Some(prev) = predecessor {
            let _ = prev.await;
        }

        self.guarded_turn(&msg, &token).await;

        let _ = done_tx.send(());
        self.release_turn(&msg.session_id, turn_id);

        compaction::maybe_compact(
            Arc::clone(&self.sessions),
            Arc::clone(&self.provider),
            self.provider_config.model.clone(),
            self.config.memory_window,
            msg.session_id.clone(),
        )
        .await;
    }

    /// The semaphore-gated part of a turn. Cancellation before the first LLM
    /// call is silent; once the turn is in flight it acknowledges with
    /// `[Session cancelled]`.
    async fn guarded_turn(&self, msg: &InboundMessage, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return, // semaphore closed during shutdown
        };
        if token.is_cancelled() {
            return;
        }

        let reply = match self.run_turn(msg, token).await {
            Ok(TurnOutcome::Reply(text)) => text,
            Ok(TurnOutcome::Cancelled) => {
                info!(session_id = %msg.session_id, "Turn cancelled in flight");
                "[Session cancelled]".to_string()
            }
            Err(e) => {
                warn!(session_id = %msg.session_id, error = %e, "Turn failed");
                format!("\u{274c} {}", e)
            }
        };
        drop(permit);

        self.bus
            .publish_outbound(OutboundMessage {
                channel: msg.channel.clone(),
                session_id: msg.session_id.clone(),
                text: reply,
            })
            .await;
    }

    /// Handle `/stop` without queueing: abort every queued and in-flight turn
    /// for the session plus its subagents, then acknowledge.
    async fn handle_stop(self: &Arc<Self>, msg: InboundMessage) {
        self.bus.cancel_session(&msg.session_id);
        let stopped_subagents = self.subagents.cancel_by_session(&msg.session_id).await;
        info!(
            session_id = %msg.session_id,
            stopped_subagents,
            "Stop requested"
        );
        self.bus
            .publish_outbound(OutboundMessage {
                channel: msg.channel.clone(),
                session_id: msg.session_id.clone(),
                text: "\u{1f6d1} Stopping.".to_string(),
            })
            .await;
    }

    fn release_turn(&self, session_id: &str, turn_id: u64) {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(session_id) {
            state.handles.remove(&turn_id);
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 {
                queues.remove(session_id);
            }
        }
    }

    /// Abort every active turn (shutdown path), then wait for queues to drain.
    pub async fn shutdown(&self) {
        {
            let queues = self.queues.lock();
            for state in queues.values() {
                for token in state.handles.values() {
                    token.cancel();
                }
            }
        }
        // Poll until all chains settle; turns notice cancellation at the next
        // recheck point.
        for _ in 0..200 {
            if self.queues.lock().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        warn!("Shutdown timed out waiting for turns to settle");
    }

    /// Number of sessions with queued or in-flight turns.
    pub fn active_sessions(&self) -> usize {
        self.queues.lock().len()
    }
}
