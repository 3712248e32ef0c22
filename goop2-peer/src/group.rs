//! Group manager (C7) — host-relayed N-party channels over `group/1.0`.
//!
//! A group exists on exactly one peer, its host. Every other member holds a
//! bidirectional stream open to the host; the host relays `msg` frames
//! between members (stamping the real sender, never trusting the payload's
//! `from`), tracks live membership, and drives a heartbeat so dead members
//! are reaped instead of lingering. Clients reconnect with capped backoff as
//! long as a local subscription row exists and the host is presence-visible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use goop2_proto::group::{
    GroupEnvelope, GroupMeta, GroupMsgType, GroupRole, GroupSubscription, MemberInfo, MembersPayload, WelcomePayload,
};
use goop2_proto::{GoopError, GoopResult, PeerId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;

use crate::traits::{GroupMembershipOracle, Identity, MqPublisher, PeerResolver};
use crate::transport::{Protocol, Stream, Transport};

/// How often a host pings its members.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Two missed heartbeats before a member is considered dead.
const HEARTBEAT_MISS_LIMIT: u32 = 2;
/// Per-member write deadline for a relay fan-out.
const RELAY_WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Cap on client reconnect backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Events the local HTTP surface cares about; published onto the bus.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GroupEvent {
    Msg { group: String, from: PeerId, payload: serde_json::Value },
    Members { group: String, members: Vec<MemberInfo> },
    Closed { group: String },
}

/// Live state for a group this peer hosts.
struct HostedGroup {
    meta: GroupMeta,
    members: Mutex<HashMap<PeerId, i64>>,
    /// Send half for each connected member, so the relay can write from any
    /// task without owning that member's recv loop.
    senders: DashMap<PeerId, Arc<tokio::sync::Mutex<crate::transport::SendHalf>>>,
    missed_pings: DashMap<PeerId, u32>,
    state: Mutex<Option<serde_json::Value>>,
}

/// Write one line onto a shared send half, locking only for the duration of
/// the write. Used wherever an `Arc<Mutex<SendHalf>>` is written from a task
/// that doesn't own the stream outright (host relay fan-out, client replies).
async fn write_line_locked(send: &Arc<tokio::sync::Mutex<crate::transport::SendHalf>>, line: &str) -> std::io::Result<()> {
    let mut guard = send.lock().await;
    tokio::io::AsyncWriteExt::write_all(&mut *guard, line.as_bytes()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut *guard, b"\n").await
}

impl HostedGroup {
    fn member_list(&self) -> Vec<MemberInfo> {
        self.members.lock().iter().map(|(peer_id, joined_at)| MemberInfo { peer_id: peer_id.to_string(), joined_at: *joined_at }).collect()
    }
}

pub struct GroupManager {
    transport: Arc<Transport>,
    storage: Arc<Mutex<Connection>>,
    self_id: PeerId,
    hosted: DashMap<String, Arc<HostedGroup>>,
    /// Client-side: groups this peer has joined but does not host.
    joined: DashMap<String, broadcast::Sender<GroupEvent>>,
    /// Client-side: the send half of the persistent stream currently open to
    /// a joined group's host, keyed by group id. `send_msg` writes onto this
    /// instead of opening a second stream (which the host would mistake for
    /// a fresh join).
    client_senders: DashMap<String, Arc<tokio::sync::Mutex<crate::transport::SendHalf>>>,
    mq: Arc<dyn MqPublisher>,
    peers: Arc<dyn PeerResolver>,
}

impl GroupManager {
    pub fn new(transport: Arc<Transport>, db_path: &std::path::Path, self_id: PeerId, mq: Arc<dyn MqPublisher>, peers: Arc<dyn PeerResolver>) -> GoopResult<Arc<Self>> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS group_meta (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                app_type TEXT NOT NULL,
                max_members INTEGER NOT NULL,
                volatile INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS group_subscription (
                host_peer_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                app_type TEXT NOT NULL,
                role TEXT NOT NULL,
                subscribed_at INTEGER NOT NULL,
                PRIMARY KEY (host_peer_id, group_id)
            );",
        )?;

        let manager = Arc::new(Self {
            transport: Arc::clone(&transport),
            storage: Arc::new(Mutex::new(conn)),
            self_id,
            hosted: DashMap::new(),
            joined: DashMap::new(),
            client_senders: DashMap::new(),
            mq,
            peers,
        });

        let handler_manager = Arc::clone(&manager);
        transport.register_handler(Protocol::Group, move |stream| {
            let manager = Arc::clone(&handler_manager);
            async move { manager.handle_inbound_stream(stream).await }
        });

        manager.restore_hosted_groups()?;
        Ok(manager)
    }

    fn restore_hosted_groups(&self) -> GoopResult<()> {
        let conn = self.storage.lock();
        let mut stmt = conn.prepare("SELECT id, name, app_type, max_members, volatile, created_at FROM group_meta")?;
        let rows = stmt.query_map([], |row| {
            Ok(GroupMeta {
                id: row.get(0)?,
                name: row.get(1)?,
                app_type: row.get(2)?,
                max_members: row.get::<_, i64>(3)? as u32,
                volatile: row.get::<_, i64>(4)? != 0,
                created_at: row.get(5)?,
            })
        })?;
        let metas: Vec<GroupMeta> = rows.collect::<Result<_, _>>()?;
        drop(conn);
        for meta in metas {
            self.hosted.insert(
                meta.id.clone(),
                Arc::new(HostedGroup {
                    meta,
                    members: Mutex::new(HashMap::new()),
                    senders: DashMap::new(),
                    missed_pings: DashMap::new(),
                    state: Mutex::new(None),
                }),
            );
        }
        Ok(())
    }

    /// Create and host a new group; persists metadata immediately.
    pub fn create(self: &Arc<Self>, name: &str, app_type: &str, max_members: u32, volatile: bool) -> GoopResult<GroupMeta> {
        let meta = GroupMeta {
            id: goop2_proto::msgid::generate(),
            name: name.to_string(),
            app_type: app_type.to_string(),
            max_members,
            volatile,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.storage.lock().execute(
            "INSERT INTO group_meta (id, name, app_type, max_members, volatile, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![meta.id, meta.name, meta.app_type, meta.max_members as i64, meta.volatile as i64, meta.created_at],
        )?;
        let hosted = Arc::new(HostedGroup {
            meta: meta.clone(),
            members: Mutex::new(HashMap::new()),
            senders: DashMap::new(),
            missed_pings: DashMap::new(),
            state: Mutex::new(None),
        });
        self.hosted.insert(meta.id.clone(), Arc::clone(&hosted));
        self.spawn_heartbeat(hosted);
        Ok(meta)
    }

    /// Close a hosted group: notify every member and drop all host state.
    pub async fn close(&self, group_id: &str) -> GoopResult<()> {
        let Some((_, hosted)) = self.hosted.remove(group_id) else {
            return Err(GoopError::NotFound(format!("group {group_id} not found")));
        };
        self.storage.lock().execute("DELETE FROM group_meta WHERE id = ?1", params![group_id])?;
        let envelope = GroupEnvelope::new(GroupMsgType::Close, group_id);
        self.relay_to_all(&hosted, &envelope).await;
        self.mq.publish_local("group.closed".to_string(), serde_json::json!({ "group": group_id }));
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>, hosted: Arc<HostedGroup>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tick.tick().await;
                if !manager.hosted.contains_key(&hosted.meta.id) {
                    return;
                }
                manager.ping_members(&hosted).await;
            }
        });
    }

    async fn ping_members(&self, hosted: &Arc<HostedGroup>) {
        let ping = GroupEnvelope::new(GroupMsgType::Ping, &hosted.meta.id);
        let targets: Vec<PeerId> = hosted.members.lock().keys().cloned().collect();
        let mut dead = Vec::new();
        for peer_id in &targets {
            let missed = hosted.missed_pings.entry(peer_id.clone()).or_insert(0);
            if *missed >= HEARTBEAT_MISS_LIMIT {
                dead.push(peer_id.clone());
                continue;
            }
            *missed += 1;
        }
        for peer_id in &dead {
            self.drop_member(hosted, peer_id).await;
        }
        self.relay_to_all(hosted, &ping).await;
    }

    /// Write `envelope` to every connected member concurrently, each bounded
    /// by its own deadline so one stalled peer never blocks the rest.
    async fn relay_to_all(&self, hosted: &Arc<HostedGroup>, envelope: &GroupEnvelope) {
        let line = match serde_json::to_string(envelope) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("failed to encode group envelope: {e}");
                return;
            }
        };
        let senders: Vec<(PeerId, Arc<tokio::sync::Mutex<crate::transport::SendHalf>>)> =
            hosted.senders.iter().map(|e| (e.key().clone(), Arc::clone(e.value()))).collect();
        let mut tasks = Vec::with_capacity(senders.len());
        for (peer_id, send) in senders {
            let line = line.clone();
            tasks.push(async move {
                let result = tokio::time::timeout(RELAY_WRITE_DEADLINE, async {
                    let mut guard = send.lock().await;
                    tokio::io::AsyncWriteExt::write_all(&mut *guard, line.as_bytes()).await?;
                    tokio::io::AsyncWriteExt::write_all(&mut *guard, b"\n").await?;
                    Ok::<(), std::io::Error>(())
                })
                .await;
                (peer_id, result)
            });
        }
        let results = futures::future::join_all(tasks).await;
        for (peer_id, result) in results {
            if matches!(result, Err(_) | Ok(Err(_))) {
                tracing::debug!(%peer_id, "relay write deadline exceeded or failed");
            }
        }
    }

    async fn drop_member(&self, hosted: &Arc<HostedGroup>, peer_id: &PeerId) {
        hosted.members.lock().remove(peer_id);
        hosted.senders.remove(peer_id);
        hosted.missed_pings.remove(peer_id);
        let members = hosted.member_list();
        self.relay_to_all(hosted, &GroupEnvelope::new(GroupMsgType::Members, &hosted.meta.id).with_payload(serde_json::to_value(MembersPayload { members: members.clone() }).unwrap_or_default())).await;
        self.mq
            .publish_local("group.members".to_string(), serde_json::json!({ "group": hosted.meta.id, "members": members }));

        if hosted.meta.volatile && hosted.members.lock().is_empty() {
            self.hosted.remove(&hosted.meta.id);
            self.storage.lock().execute("DELETE FROM group_meta WHERE id = ?1", params![hosted.meta.id]).ok();
            self.mq.publish_local("group.closed".to_string(), serde_json::json!({ "group": hosted.meta.id }));
        }
    }

    /// Host side: accept an inbound `group/1.0` stream from a member.
    async fn handle_inbound_stream(self: Arc<Self>, mut stream: Stream) {
        let Ok(Some(line)) = stream.read_line().await else { return };
        let Ok(envelope) = serde_json::from_str::<GroupEnvelope>(&line) else { return };
        if envelope.kind != GroupMsgType::Join {
            return;
        }
        let Some(hosted) = self.hosted.get(&envelope.group).map(|e| Arc::clone(e.value())) else {
            let err = GroupEnvelope::new(GroupMsgType::Error, &envelope.group).with_payload(serde_json::json!({ "message": "no such group" }));
            let _ = stream.write_line(&serde_json::to_string(&err).unwrap_or_default()).await;
            return;
        };

        let remote = stream.remote_peer_id.clone();
        {
            let members = hosted.members.lock();
            if hosted.meta.max_members > 0 && members.len() as u32 >= hosted.meta.max_members && !members.contains_key(&remote) {
                drop(members);
                let err = GroupEnvelope::new(GroupMsgType::Error, &envelope.group).with_payload(serde_json::json!({ "message": "group is full" }));
                let _ = stream.write_line(&serde_json::to_string(&err).unwrap_or_default()).await;
                return;
            }
        }

        let joined_at = chrono::Utc::now().timestamp_millis();
        hosted.members.lock().insert(remote.clone(), joined_at);
        hosted.missed_pings.insert(remote.clone(), 0);

        let members = hosted.member_list();
        let state = hosted.state.lock().clone();
        let welcome = GroupEnvelope::new(GroupMsgType::Welcome, &hosted.meta.id)
            .with_payload(serde_json::to_value(WelcomePayload { members: members.clone(), state }).unwrap_or_default());
        if stream.write_line(&serde_json::to_string(&welcome).unwrap_or_default()).await.is_err() {
            hosted.members.lock().remove(&remote);
            return;
        }

        let Stream { recv, send, .. } = stream;
        hosted.senders.insert(remote.clone(), Arc::new(tokio::sync::Mutex::new(send)));

        self.relay_to_all(&hosted, &GroupEnvelope::new(GroupMsgType::Members, &hosted.meta.id).with_payload(serde_json::to_value(MembersPayload { members }).unwrap_or_default())).await;

        self.host_member_read_loop(hosted, remote, recv).await;
    }

    async fn host_member_read_loop(self: Arc<Self>, hosted: Arc<HostedGroup>, member: PeerId, mut recv: tokio::io::BufReader<crate::transport::RecvHalf>) {
        loop {
            let mut line = String::new();
            let n = match tokio::io::AsyncBufReadExt::read_line(&mut recv, &mut line).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            let Ok(envelope) = serde_json::from_str::<GroupEnvelope>(line.trim_end()) else { continue };
            match envelope.kind {
                GroupMsgType::Msg => {
                    hosted.missed_pings.insert(member.clone(), 0);
                    let stamped = GroupEnvelope::new(GroupMsgType::Msg, &hosted.meta.id)
                        .with_from(member.to_string())
                        .with_payload(envelope.payload.clone().unwrap_or(serde_json::Value::Null));
                    self.relay_to_all(&hosted, &stamped).await;
                    self.mq.publish_from(
                        "group.msg".to_string(),
                        serde_json::json!({ "group": hosted.meta.id, "payload": envelope.payload }),
                        member.clone(),
                    );
                }
                GroupMsgType::Pong => {
                    hosted.missed_pings.insert(member.clone(), 0);
                }
                GroupMsgType::Leave => break,
                _ => {}
            }
        }
        self.drop_member(&hosted, &member).await;
    }

    /// Client side: join a remote group, persisting the subscription so a
    /// reconnect loop can resume it after this process restarts.
    pub async fn join(self: &Arc<Self>, host_peer_id: PeerId, group_id: String, app_type: String, role: GroupRole) -> GoopResult<broadcast::Receiver<GroupEvent>> {
        self.storage.lock().execute(
            "INSERT OR REPLACE INTO group_subscription (host_peer_id, group_id, app_type, role, subscribed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![host_peer_id.to_string(), group_id, app_type, if role == GroupRole::Admin { "admin" } else { "member" }, chrono::Utc::now().timestamp_millis()],
        )?;

        let (tx, rx) = broadcast::channel(256);
        self.joined.insert(group_id.clone(), tx.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.client_connection_loop(host_peer_id, group_id, tx).await;
        });

        Ok(rx)
    }

    async fn client_connection_loop(self: Arc<Self>, host: PeerId, group_id: String, events: broadcast::Sender<GroupEvent>) {
        let mut backoff = Duration::from_millis(250);
        loop {
            if !self.subscription_exists(&host, &group_id) {
                return;
            }
            if !self.peers.is_presence_visible(&host) {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                continue;
            }
            match self.run_client_session(&host, &group_id, &events).await {
                Ok(()) => backoff = Duration::from_millis(250),
                Err(e) => tracing::debug!(%group_id, "group session with {host} ended: {e}"),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
    }

    fn subscription_exists(&self, host: &PeerId, group_id: &str) -> bool {
        self.storage
            .lock()
            .query_row(
                "SELECT 1 FROM group_subscription WHERE host_peer_id = ?1 AND group_id = ?2",
                params![host.to_string(), group_id],
                |_| Ok(()),
            )
            .optional()
            .unwrap_or(None)
            .is_some()
    }

    /// Open the persistent stream to `host` for `group_id`, send `join`, and
    /// register the send half so `send_msg` can write onto this same stream
    /// later instead of opening a second one.
    async fn run_client_session(&self, host: &PeerId, group_id: &str, events: &broadcast::Sender<GroupEvent>) -> GoopResult<()> {
        let stream = self
            .transport
            .open_stream(host, Protocol::Group)
            .await
            .map_err(|e| GoopError::Unreachable(e.to_string()))?;
        let Stream { mut recv, send, .. } = stream;
        let send = Arc::new(tokio::sync::Mutex::new(send));

        let join = GroupEnvelope::new(GroupMsgType::Join, group_id);
        write_line_locked(&send, &serde_json::to_string(&join)?).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;

        self.client_senders.insert(group_id.to_string(), Arc::clone(&send));
        let result = self.client_read_loop(host, group_id, &send, &mut recv, events).await;
        self.client_senders.remove(group_id);
        result
    }

    async fn client_read_loop(
        &self,
        host: &PeerId,
        group_id: &str,
        send: &Arc<tokio::sync::Mutex<crate::transport::SendHalf>>,
        recv: &mut tokio::io::BufReader<crate::transport::RecvHalf>,
        events: &broadcast::Sender<GroupEvent>,
    ) -> GoopResult<()> {
        loop {
            let mut line = String::new();
            let n = tokio::io::AsyncBufReadExt::read_line(recv, &mut line)
                .await
                .map_err(|e| GoopError::Unreachable(e.to_string()))?;
            if n == 0 {
                return Ok(());
            }
            let Ok(envelope) = serde_json::from_str::<GroupEnvelope>(line.trim_end()) else { continue };
            match envelope.kind {
                GroupMsgType::Welcome => {
                    if let Some(payload) = envelope.payload {
                        if let Ok(welcome) = serde_json::from_value::<WelcomePayload>(payload) {
                            let _ = events.send(GroupEvent::Members { group: group_id.to_string(), members: welcome.members });
                        }
                    }
                }
                GroupMsgType::Members => {
                    if let Some(payload) = envelope.payload {
                        if let Ok(members) = serde_json::from_value::<MembersPayload>(payload) {
                            let _ = events.send(GroupEvent::Members { group: group_id.to_string(), members: members.members });
                        }
                    }
                }
                GroupMsgType::Msg => {
                    let from = envelope.from.map(PeerId::new).unwrap_or_else(|| host.clone());
                    let _ = events.send(GroupEvent::Msg { group: group_id.to_string(), from, payload: envelope.payload.unwrap_or(serde_json::Value::Null) });
                }
                GroupMsgType::Ping => {
                    let pong = GroupEnvelope::new(GroupMsgType::Pong, group_id);
                    write_line_locked(send, &serde_json::to_string(&pong)?).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;
                }
                GroupMsgType::Close => {
                    let _ = events.send(GroupEvent::Closed { group: group_id.to_string() });
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Send a `msg` frame as a client into an already-joined group, writing
    /// onto the persistent stream `run_client_session` keeps open rather
    /// than opening a new one (which the host would treat as a fresh join).
    pub async fn send_msg(&self, _host: &PeerId, group_id: &str, payload: serde_json::Value) -> GoopResult<()> {
        let send = self
            .client_senders
            .get(group_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| GoopError::Unreachable(format!("not connected to group {group_id}")))?;
        let msg = GroupEnvelope::new(GroupMsgType::Msg, group_id).with_payload(payload);
        write_line_locked(&send, &serde_json::to_string(&msg)?).await.map_err(|e| GoopError::Unreachable(e.to_string()))
    }

    pub fn list_subscriptions(&self) -> GoopResult<Vec<GroupSubscription>> {
        let conn = self.storage.lock();
        let mut stmt = conn.prepare("SELECT host_peer_id, group_id, app_type, role, subscribed_at FROM group_subscription")?;
        let rows = stmt.query_map([], |row| {
            let role: String = row.get(3)?;
            Ok(GroupSubscription {
                host_peer_id: row.get(0)?,
                group_id: row.get(1)?,
                app_type: row.get(2)?,
                role: if role == "admin" { GroupRole::Admin } else { GroupRole::Member },
                subscribed_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn hosted_groups(&self) -> Vec<GroupMeta> {
        self.hosted.iter().map(|e| e.value().meta.clone()).collect()
    }

    pub fn members_of(&self, group_id: &str) -> Vec<PeerId> {
        self.hosted.get(group_id).map(|g| g.members.lock().keys().cloned().collect()).unwrap_or_default()
    }
}

impl Identity for GroupManager {
    fn self_id(&self) -> PeerId {
        self.self_id.clone()
    }

    fn self_label(&self) -> String {
        self.self_id.to_string()
    }
}

impl GroupMembershipOracle for GroupManager {
    fn is_member(&self, group_id: &str, peer_id: &PeerId) -> bool {
        self.hosted.get(group_id).map(|g| g.members.lock().contains_key(peer_id)).unwrap_or(false)
    }

    fn shares_a_group_with_self(&self, peer_id: &PeerId) -> bool {
        self.hosted.iter().any(|g| g.members.lock().contains_key(peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_meta_round_trips_through_storage() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE group_meta (id TEXT PRIMARY KEY, name TEXT NOT NULL, app_type TEXT NOT NULL, max_members INTEGER NOT NULL, volatile INTEGER NOT NULL, created_at INTEGER NOT NULL);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO group_meta (id, name, app_type, max_members, volatile, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params!["g1", "My Group", "chat", 10_i64, 1_i64, 0_i64],
        )
        .unwrap();
        let row: (String, i64) = conn
            .query_row("SELECT name, max_members FROM group_meta WHERE id = 'g1'", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(row, ("My Group".to_string(), 10));
    }
}
