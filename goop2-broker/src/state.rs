//! Peer table and SSE subscriber fan-out.
//!
//! One slow subscriber must never block any other subscriber, and must
//! never block a publisher. Each subscriber owns a bounded ring of pending
//! events; overflow drops the oldest. Delivery never awaits consumer
//! progress — `publish()` only takes a short lock per subscriber.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use goop2_proto::presence::{PresenceEvent, PresenceRecord};
use goop2_proto::PeerId;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::mirror::Mirror;

/// One SSE connection's mailbox.
pub struct Subscriber {
    pub queue: Mutex<VecDeque<PresenceEvent>>,
    pub notify: Notify,
    pub capacity: usize,
}

impl Subscriber {
    fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
    }

    /// Non-blocking push; drops the oldest pending event on overflow.
    pub fn push(&self, event: PresenceEvent) {
        let mut q = self.queue.lock();
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(event);
        drop(q);
        self.notify.notify_one();
    }

    /// Drain all pending events without blocking.
    pub fn drain(&self) -> Vec<PresenceEvent> {
        let mut q = self.queue.lock();
        q.drain(..).collect()
    }
}

pub struct BrokerState {
    pub config: BrokerConfig,
    pub peers: DashMap<PeerId, PresenceRecord>,
    pub subscribers: DashMap<Uuid, Arc<Subscriber>>,
    pub mirror: Option<Arc<Mirror>>,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> anyhow::Result<Self> {
        let mirror = match &config.mirror_path {
            Some(path) => Some(Arc::new(Mirror::open(path)?)),
            None => None,
        };
        let peers = DashMap::new();
        if let Some(m) = &mirror {
            for rec in m.load_all()? {
                peers.insert(rec.peer_id.clone(), rec);
            }
        }
        Ok(Self { config, peers, subscribers: DashMap::new(), mirror })
    }

    pub fn subscribe(&self) -> (Uuid, Arc<Subscriber>) {
        let id = Uuid::new_v4();
        let sub = Arc::new(Subscriber::new(self.config.subscriber_ring));
        self.subscribers.insert(id, Arc::clone(&sub));
        (id, sub)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers.remove(id);
    }

    /// Fan out an event to every live subscriber. Never blocks on any one
    /// of them — each push only takes that subscriber's own lock.
    pub fn fan_out(&self, event: PresenceEvent) {
        for entry in self.subscribers.iter() {
            entry.value().push(event.clone());
        }
    }

    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Upsert a presence record (online/update). Returns true if this was a
    /// new peer (for logging/metrics purposes only).
    pub fn upsert(&self, record: PresenceRecord) -> bool {
        let is_new = !self.peers.contains_key(&record.peer_id);
        if let Some(mirror) = &self.mirror {
            let _ = mirror.upsert(&record);
        }
        self.peers.insert(record.peer_id.clone(), record);
        is_new
    }

    /// Remove a peer (explicit offline or TTL eviction).
    pub fn remove(&self, peer_id: &PeerId) -> Option<PresenceRecord> {
        if let Some(mirror) = &self.mirror {
            let _ = mirror.remove(peer_id);
        }
        self.peers.remove(peer_id).map(|(_, v)| v)
    }

    /// Sweep peers whose last heartbeat is older than the configured TTL.
    /// Evicted peers get an `offline` event fanned out to every subscriber.
    pub fn evict_stale(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|e| e.value().is_stale(now_ms, self.config.ttl_ms))
            .map(|e| e.key().clone())
            .collect();
        for peer_id in stale {
            if self.remove(&peer_id).is_some() {
                tracing::debug!(%peer_id, "evicted stale peer");
                self.fan_out(PresenceEvent::Offline { peer_id });
            }
        }
    }
}
