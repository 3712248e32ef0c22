//! Message bus (C11): the single in-process publish/subscribe that unifies
//! every browser-observable event — presence, chat, group, docs, data — onto
//! one stream the local HTTP surface replays as SSE/WebSocket.
//!
//! Every subscription is a bounded-depth channel; a slow consumer drops the
//! oldest pending message rather than stalling a publisher. Most delivery to
//! remote peers rides the existing per-feature wire protocols (chat/1.0,
//! group/1.0, ...) and only fans out locally here; `send` is the exception —
//! it opens its own `mq/1.0` stream and blocks for a transport-level ack.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use goop2_proto::{GoopError, GoopResult, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::traits::MqPublisher;
use crate::transport::{Protocol, Transport};

const DEFAULT_RING_CAPACITY: usize = 256;
/// How long `send` waits for the remote peer's transport-level ack.
const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqMessage {
    pub id: String,
    pub seq: u64,
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
}

struct MqSubscriber {
    queue: Mutex<VecDeque<MqMessage>>,
    notify: Notify,
    capacity: usize,
}

impl MqSubscriber {
    fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
    }

    fn push(&self, msg: MqMessage) {
        let mut q = self.queue.lock();
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(msg);
        drop(q);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<MqMessage> {
        self.queue.lock().drain(..).collect()
    }
}

/// Trait-object handle for a subscriber, so the HTTP surface can hold it
/// without depending on the concrete ring-buffer type.
pub trait MqSubscriberHandle: Send + Sync {
    fn drain(&self) -> Vec<MqMessage>;
    fn notified(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

impl MqSubscriberHandle for MqSubscriber {
    fn drain(&self) -> Vec<MqMessage> {
        MqSubscriber::drain(self)
    }

    fn notified(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.notify.notified())
    }
}

pub struct Mq {
    seq: AtomicU64,
    subscribers: DashMap<Uuid, Arc<MqSubscriber>>,
    /// Absent only for the bare `Default` instance tests use; every real bus
    /// wired up in `server.rs` carries a transport and registers a handler.
    transport: Option<Arc<Transport>>,
}

impl Mq {
    /// Registers the `mq/1.0` handler so a remote peer's `send` can reach
    /// this bus and receive its ack.
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        let mq = Arc::new(Self { seq: AtomicU64::new(0), subscribers: DashMap::new(), transport: Some(Arc::clone(&transport)) });
        let handler_mq = Arc::clone(&mq);
        transport.register_handler(Protocol::Mq, move |stream| {
            let mq = Arc::clone(&handler_mq);
            async move { mq.handle_inbound_send(stream).await }
        });
        mq
    }

    pub fn subscribe(&self) -> (Uuid, Arc<dyn MqSubscriberHandle>) {
        let id = Uuid::new_v4();
        let sub = Arc::new(MqSubscriber::new(DEFAULT_RING_CAPACITY));
        self.subscribers.insert(id, Arc::clone(&sub));
        (id, sub as Arc<dyn MqSubscriberHandle>)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers.remove(id);
    }

    fn next_message(&self, topic: String, payload: serde_json::Value, from: Option<PeerId>) -> MqMessage {
        MqMessage {
            id: goop2_proto::msgid::generate(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            topic,
            payload,
            from,
        }
    }

    /// Publish a local-only event (no `from`, never crossed the network).
    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) {
        let msg = self.next_message(topic.into(), payload, None);
        self.fan_out(msg);
    }

    /// Publish an event that was relayed from the network.
    pub fn publish_from(&self, topic: impl Into<String>, payload: serde_json::Value, from: PeerId) {
        let msg = self.next_message(topic.into(), payload, Some(from));
        self.fan_out(msg);
    }

    fn fan_out(&self, msg: MqMessage) {
        for entry in self.subscribers.iter() {
            entry.value().push(msg.clone());
        }
    }

    /// Best-effort application-level acknowledgement: a consumer calls this
    /// once it has processed a message. Unlike `send`'s transport-level ack,
    /// this never blocks or talks to the network — it just republishes onto
    /// `mq.ack` for any other local listener to observe.
    pub fn ack(&self, msg_id: impl Into<String>) {
        self.publish("mq.ack", serde_json::json!({ "id": msg_id.into() }));
    }

    /// Send `payload` to `peer_id` on `topic` and block up to 30 s for a
    /// transport-level acknowledgement that the peer's own bus received it.
    /// Distinct from `ack`: this is the sender waiting on the wire, not a
    /// consumer's best-effort local round trip.
    pub async fn send(&self, peer_id: &PeerId, topic: impl Into<String>, payload: serde_json::Value) -> GoopResult<String> {
        let transport = self.transport.as_ref().ok_or_else(|| GoopError::Internal("message bus has no transport".to_string()))?;
        let topic = topic.into();
        let id = goop2_proto::msgid::generate();
        let mut stream = transport.open_stream(peer_id, Protocol::Mq).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;
        let wire = serde_json::json!({ "id": id, "topic": topic, "payload": payload });
        stream.write_line(&wire.to_string()).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;

        let ack_line = tokio::time::timeout(SEND_ACK_TIMEOUT, stream.read_line())
            .await
            .map_err(|_| GoopError::Timeout(format!("no ack for message {id} within 30s")))?
            .map_err(|e| GoopError::Unreachable(e.to_string()))?;
        match ack_line {
            Some(line) => {
                let ack: serde_json::Value = serde_json::from_str(&line)?;
                if ack.get("ack").and_then(|v| v.as_str()) == Some(id.as_str()) {
                    Ok(id)
                } else {
                    Err(GoopError::Unreachable("peer sent an unexpected reply instead of an ack".to_string()))
                }
            }
            None => Err(GoopError::Unreachable("peer closed the stream without acknowledging".to_string())),
        }
    }

    /// Host side of `send`: receive one message, fan it out locally with the
    /// sender's peer id stamped, then write back its ack.
    async fn handle_inbound_send(&self, mut stream: crate::transport::Stream) {
        let Ok(Some(line)) = stream.read_line().await else { return };
        let Ok(wire) = serde_json::from_str::<serde_json::Value>(&line) else { return };
        let Some(id) = wire.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()) else { return };
        let topic = wire.get("topic").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let payload = wire.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        let from = stream.remote_peer_id.clone();

        let msg = MqMessage { id: id.clone(), seq: self.seq.fetch_add(1, Ordering::SeqCst), topic, payload, from: Some(from) };
        self.fan_out(msg);

        let ack = serde_json::json!({ "ack": id }).to_string();
        let _ = stream.write_line(&ack).await;
    }
}

impl MqPublisher for Mq {
    fn publish_local(&self, topic: String, payload: serde_json::Value) {
        self.publish(topic, payload);
    }

    fn publish_from(&self, topic: String, payload: serde_json::Value, from: PeerId) {
        Mq::publish_from(self, topic, payload, from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mq() -> Mq {
        Mq { seq: AtomicU64::new(0), subscribers: DashMap::new(), transport: None }
    }

    #[test]
    fn drop_oldest_when_subscriber_is_slow() {
        let mq = test_mq();
        let (_id, sub) = mq.subscribe();
        for i in 0..(DEFAULT_RING_CAPACITY + 10) {
            mq.publish("test.topic", serde_json::json!({ "i": i }));
        }
        let drained = sub.drain();
        assert_eq!(drained.len(), DEFAULT_RING_CAPACITY);
        assert_eq!(drained.first().unwrap().payload["i"], 10);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let mq = test_mq();
        let (id, sub) = mq.subscribe();
        mq.publish("a", serde_json::json!(1));
        mq.unsubscribe(&id);
        mq.publish("b", serde_json::json!(2));
        assert_eq!(sub.drain().len(), 1);
    }
}
