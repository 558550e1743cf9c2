//! Message bus decoupling transports from the agent loop.
//!
//! Inbound: many producers, one consumer (the loop) over an unbounded queue.
//! Outbound and progress: at most one handler per channel, invoked by the
//! core; handler failures never propagate. Cancellation: a single hook
//! installed by the loop, fanned out from `cancel_session`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// A message arriving from a transport (or synthesized by the scheduler /
/// subagent manager).
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub channel: String,
    /// Stable per end-client; chosen by the transport.
    pub session_id: String,
    pub text: String,
    /// Channel-native user identifier ("scheduler" / "system:subagent" for
    /// synthetic messages).
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(channel: &str, session_id: &str, sender: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            session_id: session_id.to_string(),
            text: text.to_string(),
            sender: sender.to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A terminal reply routed back to the originating transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub session_id: String,
    pub text: String,
}

/// Which stage of a turn a progress event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStep {
    Thinking,
    LlmResponse,
    ToolCall,
    ToolResult,
}

/// Best-effort in-flight status for transports that render it.
#[derive(Debug, Clone)]
pub struct ProgressMessage {
    pub channel: String,
    pub session_id: String,
    pub step: ProgressStep,
    pub iteration: usize,
    pub text: String,
    pub tool_name: Option<String>,
    pub is_error: bool,
}

/// Transport-side sink for terminal replies.
#[async_trait::async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn deliver(&self, msg: OutboundMessage) -> anyhow::Result<()>;
}

/// Transport-side sink for progress events. Delivery is fire-and-forget.
#[async_trait::async_trait]
pub trait ProgressHandler: Send + Sync {
    async fn deliver(&self, msg: ProgressMessage) -> anyhow::Result<()>;
}

type CancelHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct MessageBus {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    outbound: RwLock<HashMap<String, Arc<dyn OutboundHandler>>>,
    progress: Arc<RwLock<HashMap<String, Arc<dyn ProgressHandler>>>>,
    /// Feed of the progress drain task; deliveries stay in publish order
    /// without the publisher ever waiting on a handler.
    progress_tx: Mutex<Option<mpsc::UnboundedSender<ProgressMessage>>>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            outbound: RwLock::new(HashMap::new()),
            progress: Arc::new(RwLock::new(HashMap::new())),
            progress_tx: Mutex::new(None),
            cancel_hook: Mutex::new(None),
        }
    }

    /// Non-blocking enqueue. Messages published after `close()` are dropped
    /// with a warning.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        let tx = self.inbound_tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                // Receiver outlives all senders until close(); send only fails
                // if the consumer half was torn down first.
                if tx.send(msg).is_err() {
                    warn!("Inbound queue consumer gone; message dropped");
                }
            }
            None => warn!("Bus closed; inbound message dropped"),
        }
    }

    /// Hand the inbound stream to its single consumer. Returns None after the
    /// first take.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inbound_rx.lock().take()
    }

    /// Register the channel's outbound sink. Re-registration replaces.
    pub async fn register_outbound_handler(&self, channel: &str, handler: Arc<dyn OutboundHandler>) {
        let previous = self
            .outbound
            .write()
            .await
            .insert(channel.to_string(), handler);
        if previous.is_some() {
            warn!(channel, "Outbound handler replaced");
        }
    }

    pub async fn register_progress_handler(&self, channel: &str, handler: Arc<dyn ProgressHandler>) {
        let previous = self
            .progress
            .write()
            .await
            .insert(channel.to_string(), handler);
        if previous.is_some() {
            warn!(channel, "Progress handler replaced");
        }
        self.ensure_progress_drain();
    }

    /// Start the drain task once, on first handler registration.
    fn ensure_progress_drain(&self) {
        let mut slot = self.progress_tx.lock();
        if slot.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressMessage>();
        *slot = Some(tx);
        let handlers = Arc::clone(&self.progress);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let handler = handlers.read().await.get(&msg.channel).cloned();
                if let Some(h) = handler {
                    let channel = msg.channel.clone();
                    if let Err(e) = h.deliver(msg).await {
                        debug!(channel, error = %e, "Progress handler failed");
                    }
                }
            }
        });
    }

    /// Pending deliveries for the channel are silently discarded.
    pub async fn unregister_channel(&self, channel: &str) {
        self.outbound.write().await.remove(channel);
        self.progress.write().await.remove(channel);
    }

    /// Invoke the channel's outbound handler. A missing handler or a handler
    /// error is logged and swallowed — delivery problems must not crash a turn.
    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        let handler = self.outbound.read().await.get(&msg.channel).cloned();
        match handler {
            Some(h) => {
                let channel = msg.channel.clone();
                let session_id = msg.session_id.clone();
                if let Err(e) = h.deliver(msg).await {
                    warn!(channel, session_id, error = %e, "Outbound handler failed");
                }
            }
            None => warn!(channel = %msg.channel, "No outbound handler for channel"),
        }
    }

    /// Fire-and-forget progress delivery; the publishing turn never waits on
    /// a handler. Dropped silently when no handler was ever registered.
    pub fn publish_progress(&self, msg: ProgressMessage) {
        if let Some(tx) = self.progress_tx.lock().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Install the loop's cancellation hook. At most one; re-set replaces.
    pub fn on_session_cancel(&self, hook: CancelHook) {
        *self.cancel_hook.lock() = Some(hook);
    }

    /// Broadcast a cancel request for a session. Idempotent; a no-op when no
    /// hook is installed.
    pub fn cancel_session(&self, session_id: &str) {
        let hook = self.cancel_hook.lock().clone();
        if let Some(hook) = hook {
            hook(session_id);
        }
    }

    /// Stop accepting inbound messages: later publishes are dropped and the
    /// consumer observes end-of-stream once the queue drains. Handlers and
    /// the cancel hook stay registered so in-flight turns can still reply.
    pub fn close_inbound(&self) {
        self.inbound_tx.lock().take();
    }

    /// Close the inbound stream (consumer observes end-of-stream), clear
    /// handlers, drop the cancel hook.
    pub async fn close(&self) {
        self.inbound_tx.lock().take();
        self.progress_tx.lock().take();
        self.outbound.write().await.clear();
        self.progress.write().await.clear();
        self.cancel_hook.lock().take();
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
