//! Presence client (C5): heartbeat loop, LAN multicast discovery, WAN SSE
//! subscription, merged into one local peer table.
//!
//! Sources are unioned by `peer_id`; the most recent `timestamp` wins on
//! conflict. TTL eviction runs the same sweep the broker runs.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use goop2_proto::presence::{PresenceEvent, PresenceEventType, PresenceRecord, PublishBody};
use goop2_proto::PeerId;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// LAN multicast group used for discovery.
const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 19, 88, 1);
const MULTICAST_PORT: u16 = 19881;

pub struct PresenceClient {
    self_peer_id: PeerId,
    self_record: Mutex<PresenceRecord>,
    table: DashMap<PeerId, PresenceRecord>,
    events: broadcast::Sender<PresenceEvent>,
    http: reqwest::Client,
    wan_brokers: Vec<String>,
    lan_tag: String,
    ttl_ms: i64,
    heartbeat: Duration,
}

impl PresenceClient {
    pub fn new(
        self_peer_id: PeerId,
        label: String,
        email: Option<String>,
        avatar_hash: Option<String>,
        wan_brokers: Vec<String>,
        lan_tag: String,
        ttl_seconds: u64,
        heartbeat_seconds: u64,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        let self_record = PresenceRecord {
            peer_id: self_peer_id.clone(),
            label,
            email,
            avatar_hash,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        Arc::new(Self {
            self_peer_id,
            self_record: Mutex::new(self_record),
            table: DashMap::new(),
            events: tx,
            http: reqwest::Client::new(),
            wan_brokers,
            lan_tag,
            ttl_ms: (ttl_seconds * 1000) as i64,
            heartbeat: Duration::from_secs(heartbeat_seconds.max(1)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.table.iter().map(|e| e.value().clone()).collect()
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<PresenceRecord> {
        self.table.get(peer_id).map(|e| e.value().clone())
    }

    fn emit(&self, event: PresenceEvent) {
        let _ = self.events.send(event);
    }

    /// Union a record from any source into the local table. Most recent
    /// `timestamp` wins; never merges a record for the local self id.
    fn merge(&self, record: PresenceRecord) {
        if record.peer_id == self.self_peer_id {
            return;
        }
        let is_new = !self.table.contains_key(&record.peer_id);
        let should_update = self
            .table
            .get(&record.peer_id)
            .map(|existing| existing.timestamp <= record.timestamp)
            .unwrap_or(true);
        if should_update {
            self.table.insert(record.peer_id.clone(), record.clone());
            self.emit(if is_new { PresenceEvent::Online { peer: record } } else { PresenceEvent::Update { peer: record } });
        }
    }

    fn evict_stale(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let stale: Vec<PeerId> = self
            .table
            .iter()
            .filter(|e| e.value().is_stale(now_ms, self.ttl_ms))
            .map(|e| e.key().clone())
            .collect();
        for peer_id in stale {
            if self.table.remove(&peer_id).is_some() {
                self.emit(PresenceEvent::Offline { peer_id });
            }
        }
    }

    /// Start every background task: heartbeat + WAN subscriptions + LAN
    /// multicast + eviction sweep. Each runs as its own lightweight task.
    pub fn start(self: &Arc<Self>) {
        let evict = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                evict.evict_stale();
            }
        });

        for broker in self.wan_brokers.clone() {
            let heartbeat = Arc::clone(self);
            tokio::spawn(async move { heartbeat.heartbeat_loop(broker).await });
        }

        let lan = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = lan.multicast_loop().await {
                tracing::warn!("LAN multicast discovery stopped: {e}");
            }
        });
    }

    fn publish_body(&self, kind: PresenceEventType) -> PublishBody {
        let record = self.self_record.lock().clone();
        PublishBody {
            kind,
            peer_id: record.peer_id.to_string(),
            content: record.label,
            email: record.email,
            avatar_hash: record.avatar_hash,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Per-WAN-broker task: post presence every heartbeat interval and hold
    /// an SSE connection; exponential-backoff reconnect capped at ~5s.
    async fn heartbeat_loop(self: Arc<Self>, broker_url: String) {
        let publish_url = format!("{}/publish", broker_url.trim_end_matches('/'));
        let events_url = format!("{}/events", broker_url.trim_end_matches('/'));

        let publisher = Arc::clone(&self);
        let publish_target = publish_url.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(publisher.heartbeat);
            loop {
                tick.tick().await;
                let body = publisher.publish_body(PresenceEventType::Online);
                if let Err(e) = publisher.http.post(&publish_target).json(&body).send().await {
                    tracing::debug!("heartbeat publish to {publish_target} failed: {e}");
                }
            }
        });

        let mut backoff = Duration::from_millis(250);
        loop {
            match self.subscribe_sse(&events_url).await {
                Ok(()) => backoff = Duration::from_millis(250),
                Err(e) => tracing::debug!("SSE subscription to {events_url} ended: {e}"),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    /// Reads one SSE connection to completion, merging every event it carries.
    async fn subscribe_sse(&self, url: &str) -> anyhow::Result<()> {
        use futures_util::StreamExt;
        let resp = self.http.get(url).send().await?;
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find("\n\n") {
                let block: String = buf.drain(..pos + 2).collect();
                self.handle_sse_block(&block);
            }
        }
        Ok(())
    }

    fn handle_sse_block(&self, block: &str) {
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.trim_start());
            }
        }
        if data.is_empty() {
            return;
        }
        match serde_json::from_str::<PresenceEvent>(&data) {
            Ok(PresenceEvent::Snapshot { peers }) => {
                for p in peers {
                    self.merge(p);
                }
            }
            Ok(PresenceEvent::Online { peer }) | Ok(PresenceEvent::Update { peer }) => self.merge(peer),
            Ok(PresenceEvent::Offline { peer_id }) => {
                if self.table.remove(&peer_id).is_some() {
                    self.emit(PresenceEvent::Offline { peer_id });
                }
            }
            Err(e) => tracing::debug!("bad SSE presence event: {e}"),
        }
    }

    /// LAN discovery: periodically broadcasts self presence to a multicast
    /// group tagged with `lan_tag`, and merges anything else heard on it.
    async fn multicast_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let socket = make_multicast_socket()?;
        let socket = Arc::new(socket);

        let sender = Arc::clone(&self);
        let send_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sender.heartbeat);
            let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT));
            loop {
                tick.tick().await;
                let envelope = LanEnvelope { tag: sender.lan_tag.clone(), record: sender.self_record.lock().clone() };
                if let Ok(bytes) = serde_json::to_vec(&envelope) {
                    let _ = send_socket.send_to(&bytes, dest).await;
                }
            }
        });

        let mut buf = vec![0u8; 8192];
        loop {
            let (n, _from) = socket.recv_from(&mut buf).await?;
            if let Ok(envelope) = serde_json::from_slice::<LanEnvelope>(&buf[..n]) {
                if envelope.tag == self.lan_tag {
                    self.merge(envelope.record);
                }
            }
        }
    }
}

impl crate::traits::PeerResolver for PresenceClient {
    fn resolve(&self, peer_id: &PeerId) -> Option<PresenceRecord> {
        self.lookup(peer_id)
    }

    fn is_presence_visible(&self, peer_id: &PeerId) -> bool {
        self.table.contains_key(peer_id)
    }

    fn online_peer_ids(&self) -> Vec<PeerId> {
        self.table.iter().map(|e| e.key().clone()).collect()
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LanEnvelope {
    tag: String,
    record: PresenceRecord,
}

fn make_multicast_socket() -> anyhow::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).into())?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    Ok(UdpSocket::from_std(socket.into())?)
}
