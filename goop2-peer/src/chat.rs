//! Chat manager (C6): direct and broadcast text messages over `chat/1.0`.
//!
//! Every accepted message is stamped with the authenticated sender id —
//! whatever `from` the payload carried is discarded. Broadcast fans out
//! concurrently with a short per-peer write deadline so one unreachable
//! peer never stalls the rest.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use goop2_proto::chat::ChatEnvelope;
use goop2_proto::{GoopError, GoopResult, PeerId};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::script::COMMAND_PREFIX;
use crate::traits::ScriptOps;
use crate::transport::{Protocol, Transport};

const HISTORY_CAPACITY: usize = 200;
const SEND_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub from: PeerId,
    pub text: String,
    pub ts: i64,
    pub broadcast: bool,
}

pub struct ChatManager {
    transport: Arc<Transport>,
    history: Mutex<VecDeque<ChatMessage>>,
    events: broadcast::Sender<ChatMessage>,
    /// The script engine is constructed after the chat manager (it needs a
    /// transport-independent set of dependencies wired up first), so it's
    /// attached here once ready rather than threaded through `new`.
    scripts: Mutex<Option<Arc<dyn ScriptOps>>>,
}

impl ChatManager {
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        let manager = Arc::new(Self { transport, history: Mutex::new(VecDeque::new()), events: tx, scripts: Mutex::new(None) });
        let handler_manager = Arc::clone(&manager);
        manager.transport.register_handler(Protocol::Chat, move |mut stream| {
            let manager = Arc::clone(&handler_manager);
            async move {
                if let Ok(Some(line)) = stream.read_line().await {
                    if let Ok(envelope) = serde_json::from_str::<ChatEnvelope>(&line) {
                        let from = stream.remote_peer_id.clone();
                        let text = envelope.text.clone();
                        manager.record(ChatMessage { from: from.clone(), text: text.clone(), ts: envelope.ts, broadcast: envelope.broadcast });
                        if !envelope.broadcast {
                            manager.maybe_dispatch_command(from, text).await;
                        }
                    }
                }
            }
        });
        manager
    }

    pub fn set_script_engine(&self, scripts: Arc<dyn ScriptOps>) {
        *self.scripts.lock() = Some(scripts);
    }

    /// A direct message beginning with `!` is treated as a chat command:
    /// the first word names the script under the site's script root, the
    /// rest are passed as a whitespace-split `args` array. The command's
    /// return value, if a non-empty string, is sent back to the sender.
    async fn maybe_dispatch_command(&self, from: PeerId, text: String) {
        let Some(rest) = text.strip_prefix(COMMAND_PREFIX) else { return };
        let scripts = self.scripts.lock().clone();
        let Some(scripts) = scripts else { return };
        let mut parts = rest.split_whitespace();
        let Some(command) = parts.next() else { return };
        let args: Vec<&str> = parts.collect();
        let params = serde_json::json!({ "args": args });
        match scripts.call_command(command, from.clone(), params).await {
            Ok(serde_json::Value::String(reply)) if !reply.is_empty() => {
                if let Err(e) = self.send_direct(&from, &reply).await {
                    tracing::debug!(%from, %command, "failed to send chat command reply: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%from, %command, "chat command failed: {e}"),
        }
    }

    fn record(&self, msg: ChatMessage) {
        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(msg.clone());
        drop(history);
        let _ = self.events.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.events.subscribe()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().iter().cloned().collect()
    }

    pub async fn send_direct(&self, target: &PeerId, text: &str) -> GoopResult<()> {
        self.deliver(target, text, false).await
    }

    /// Fan out to every peer in `targets` concurrently; each send has its
    /// own deadline so a single unreachable peer can't stall the others.
    pub async fn send_broadcast(&self, targets: &[PeerId], text: &str) {
        if targets.is_empty() {
            return;
        }
        let mut tasks = Vec::with_capacity(targets.len());
        for target in targets {
            let target = target.clone();
            let text = text.to_string();
            let transport = Arc::clone(&self.transport);
            tasks.push(tokio::spawn(async move {
                let envelope = ChatEnvelope { from: None, text, ts: chrono::Utc::now().timestamp_millis(), broadcast: true };
                let result = tokio::time::timeout(SEND_DEADLINE, async {
                    let mut stream = transport.open_stream(&target, Protocol::Chat).await?;
                    let line = serde_json::to_string(&envelope)?;
                    stream.write_line(&line).await?;
                    stream.finish().await
                })
                .await;
                if let Err(_elapsed) = result {
                    tracing::debug!(%target, "broadcast send deadline exceeded");
                }
            }));
        }
        futures::future::join_all(tasks).await;
    }

    async fn deliver(&self, target: &PeerId, text: &str, broadcast: bool) -> GoopResult<()> {
        let envelope = ChatEnvelope { from: None, text: text.to_string(), ts: chrono::Utc::now().timestamp_millis(), broadcast };
        tokio::time::timeout(SEND_DEADLINE, async {
            let mut stream = self.transport.open_stream(target, Protocol::Chat).await?;
            let line = serde_json::to_string(&envelope)?;
            stream.write_line(&line).await?;
            stream.finish().await
        })
        .await
        .map_err(|_| GoopError::Timeout(format!("chat send to {target} timed out")))?
        .map_err(|e: anyhow::Error| GoopError::Unreachable(e.to_string()))
    }
}
