//! Optional durable mirror of the broker's peer table.
//!
//! A single-writer SQLite database with WAL enabled. Two broker instances
//! pointed at the same file converge within one sync cycle: each periodically
//! reloads rows it didn't write itself and re-publishes them locally. This is
//! presented as optional HA, not a consensus cluster — see DESIGN.md.

use std::sync::Arc;

use goop2_proto::identity::PeerId;
use goop2_proto::presence::{PresenceEvent, PresenceRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::state::BrokerState;

pub struct Mirror {
    conn: Mutex<Connection>,
}

impl Mirror {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS presence (
                peer_id     TEXT PRIMARY KEY,
                label       TEXT NOT NULL,
                email       TEXT,
                avatar_hash TEXT,
                timestamp   INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn upsert(&self, record: &PresenceRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO presence (peer_id, label, email, avatar_hash, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(peer_id) DO UPDATE SET
                label=excluded.label, email=excluded.email,
                avatar_hash=excluded.avatar_hash, timestamp=excluded.timestamp
             WHERE excluded.timestamp >= presence.timestamp",
            params![record.peer_id.as_str(), record.label, record.email, record.avatar_hash, record.timestamp],
        )?;
        Ok(())
    }

    pub fn remove(&self, peer_id: &PeerId) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM presence WHERE peer_id = ?1", params![peer_id.as_str()])?;
        Ok(())
    }

    pub fn load_all(&self) -> anyhow::Result<Vec<PresenceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT peer_id, label, email, avatar_hash, timestamp FROM presence")?;
        let rows = stmt.query_map([], |row| {
            Ok(PresenceRecord {
                peer_id: PeerId::new(row.get::<_, String>(0)?),
                label: row.get(1)?,
                email: row.get(2)?,
                avatar_hash: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Background loop: periodically reconcile the in-memory peer table with
/// whatever the mirror file holds (rows written by any other sharing
/// instance), fanning out events for anything new or changed.
pub async fn sync_loop(mirror: Arc<Mirror>, state: Arc<BrokerState>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(state.config.mirror_sync_secs));
    loop {
        tick.tick().await;
        let rows = match mirror.load_all() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("mirror sync read failed: {e}");
                continue;
            }
        };
        for record in rows {
            let changed = state
                .peers
                .get(&record.peer_id)
                .map(|existing| existing.timestamp < record.timestamp)
                .unwrap_or(true);
            if changed {
                state.peers.insert(record.peer_id.clone(), record.clone());
                state.fan_out(PresenceEvent::Update { peer: record });
            }
        }
    }
}
