//! Docs store (C8): a per-group file area under `shared/<group_id>/`, served
//! over `docs/1.0` with the same path-safety rules as the site content
//! store, plus a host-fan-out aggregation for "ask every live member".
//!
//! Wire framing per request: one JSON line (`DocsRequest`), then either
//! `OK <content-type> <size>\n` followed by `<size>` raw bytes, or
//! `ERR <message>\n`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use goop2_proto::docs::{DocInfo, DocsListResponse, DocsRequest, MAX_FILE_BYTES};
use goop2_proto::{GoopError, GoopResult, PeerId};
use sha2::{Digest, Sha256};

use crate::content::ContentStore;
use crate::traits::GroupMembershipOracle;
use crate::transport::{Protocol, Stream, Transport};

const AGGREGATE_PEER_DEADLINE: Duration = Duration::from_secs(8);

pub struct DocsStore {
    shared_root: std::path::PathBuf,
    stores: DashMap<String, Arc<ContentStore>>,
}

impl DocsStore {
    pub fn new(shared_root: impl Into<std::path::PathBuf>) -> GoopResult<Self> {
        let shared_root = shared_root.into();
        std::fs::create_dir_all(&shared_root)?;
        Ok(Self { shared_root, stores: DashMap::new() })
    }

    fn store_for(&self, group_id: &str) -> GoopResult<Arc<ContentStore>> {
        if let Some(existing) = self.stores.get(group_id) {
            return Ok(Arc::clone(existing.value()));
        }
        if group_id.is_empty() || group_id.contains('/') || group_id.contains("..") {
            return Err(GoopError::BadRequest(format!("invalid group id: {group_id}")));
        }
        let store = Arc::new(ContentStore::new(self.shared_root.join(group_id))?);
        self.stores.insert(group_id.to_string(), Arc::clone(&store));
        Ok(store)
    }

    pub fn list(&self, group_id: &str) -> GoopResult<DocsListResponse> {
        let store = self.store_for(group_id)?;
        let entries = store.list_tree()?;
        let files = entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| {
                let bytes = store.read(&e.path).map(|item| item.bytes).unwrap_or_default();
                DocInfo { name: e.path, size: e.size, hash: hex::encode(Sha256::digest(&bytes)) }
            })
            .collect();
        Ok(DocsListResponse { ok: true, files, error: None })
    }

    pub fn get(&self, group_id: &str, file: &str) -> GoopResult<(Vec<u8>, &'static str)> {
        let store = self.store_for(group_id)?;
        let item = store.read(file)?;
        if item.bytes.len() as u64 > MAX_FILE_BYTES {
            return Err(GoopError::ResourceExceeded(format!("{file} exceeds the 50 MiB per-file cap")));
        }
        Ok((item.bytes, content_type_of(file)))
    }
}

fn content_type_of(name: &str) -> &'static str {
    match name.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Aggregated entry for "list the shared docs of every peer I currently
/// share a live group with".
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregatedDocs {
    pub peer_id: PeerId,
    pub files: Vec<DocInfo>,
    pub error: Option<String>,
}

/// Registers the `docs/1.0` handler and exposes an aggregation helper used
/// by the local HTTP surface.
pub struct DocsService {
    transport: Arc<Transport>,
    store: Arc<DocsStore>,
    membership: Arc<dyn GroupMembershipOracle>,
}

impl DocsService {
    pub fn store(&self) -> &DocsStore {
        &self.store
    }

    pub fn new(transport: Arc<Transport>, store: Arc<DocsStore>, membership: Arc<dyn GroupMembershipOracle>) -> Arc<Self> {
        let service = Arc::new(Self { transport: Arc::clone(&transport), store, membership });
        let handler_service = Arc::clone(&service);
        transport.register_handler(Protocol::Docs, move |stream| {
            let service = Arc::clone(&handler_service);
            async move { service.handle_stream(stream).await }
        });
        service
    }

    async fn handle_stream(&self, mut stream: Stream) {
        let Ok(Some(line)) = stream.read_line().await else { return };
        let Ok(request) = serde_json::from_str::<DocsRequest>(&line) else {
            let _ = stream.write_line("ERR malformed request").await;
            return;
        };

        let group_id = match &request {
            DocsRequest::List { group_id } => group_id,
            DocsRequest::Get { group_id, .. } => group_id,
        };
        if !self.membership.is_member(group_id, &stream.remote_peer_id) {
            match &request {
                DocsRequest::List { .. } => {
                    let resp = DocsListResponse { ok: false, files: vec![], error: Some("access denied".to_string()) };
                    let body = serde_json::to_vec(&resp).unwrap_or_default();
                    let _ = stream.write_line(&format!("OK application/json {}", body.len())).await;
                    let _ = stream.write_all(&body).await;
                }
                DocsRequest::Get { .. } => {
                    let _ = stream.write_line("ERR not a member of this group").await;
                }
            }
            return;
        }

        match request {
            DocsRequest::List { group_id } => match self.store.list(&group_id) {
                Ok(resp) => {
                    let body = serde_json::to_vec(&resp).unwrap_or_default();
                    let _ = stream.write_line(&format!("OK application/json {}", body.len())).await;
                    let _ = stream.write_all(&body).await;
                }
                Err(e) => {
                    let _ = stream.write_line(&format!("ERR {}", e.message())).await;
                }
            },
            DocsRequest::Get { group_id, file } => match self.store.get(&group_id, &file) {
                Ok((bytes, content_type)) => {
                    let _ = stream.write_line(&format!("OK {content_type} {}", bytes.len())).await;
                    let _ = stream.write_all(&bytes).await;
                }
                Err(e) => {
                    let _ = stream.write_line(&format!("ERR {}", e.message())).await;
                }
            },
        }
    }

    /// Fan out a `list` request to every given peer concurrently, each
    /// bounded by its own deadline, and collect whatever answers in time.
    pub async fn aggregate_list(&self, group_id: &str, peers: &[PeerId]) -> Vec<AggregatedDocs> {
        let tasks: Vec<_> = peers
            .iter()
            .cloned()
            .map(|peer_id| {
                let transport = Arc::clone(&self.transport);
                let group_id = group_id.to_string();
                async move {
                    let result = tokio::time::timeout(AGGREGATE_PEER_DEADLINE, fetch_list(&transport, &peer_id, &group_id)).await;
                    match result {
                        Ok(Ok(files)) => AggregatedDocs { peer_id, files, error: None },
                        Ok(Err(e)) => AggregatedDocs { peer_id, files: vec![], error: Some(e.message()) },
                        Err(_) => AggregatedDocs { peer_id, files: vec![], error: Some("timed out".to_string()) },
                    }
                }
            })
            .collect();
        futures::future::join_all(tasks).await
    }
}

async fn fetch_list(transport: &Transport, peer_id: &PeerId, group_id: &str) -> GoopResult<Vec<DocInfo>> {
    let mut stream = transport.open_stream(peer_id, Protocol::Docs).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;
    let request = DocsRequest::List { group_id: group_id.to_string() };
    stream.write_line(&serde_json::to_string(&request)?).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;
    let header = stream.read_line().await.map_err(|e| GoopError::Unreachable(e.to_string()))?.ok_or_else(|| GoopError::Unreachable("connection closed".to_string()))?;
    let mut parts = header.splitn(3, ' ');
    match parts.next() {
        Some("OK") => {
            let _content_type = parts.next().unwrap_or("application/json");
            let size: usize = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| GoopError::Internal("bad docs response header".to_string()))?;
            let mut buf = vec![0u8; size];
            stream.read_exact(&mut buf).await.map_err(|e| GoopError::Unreachable(e.to_string()))?;
            let resp: DocsListResponse = serde_json::from_slice(&buf)?;
            if resp.ok {
                Ok(resp.files)
            } else {
                Err(GoopError::Forbidden(resp.error.unwrap_or_else(|| "access denied".to_string())))
            }
        }
        _ => Err(GoopError::Internal(header)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DocsStore {
        let dir = std::env::temp_dir().join(format!("goop2-docs-test-{}", goop2_proto::msgid::generate()));
        DocsStore::new(dir).unwrap()
    }

    #[test]
    fn list_and_get_round_trip() {
        let store = store();
        let group_store = store.store_for("g1").unwrap();
        group_store.write("index.html", b"<h1>hi</h1>", "none").unwrap();

        let listed = store.list("g1").unwrap();
        assert_eq!(listed.files.len(), 1);
        assert_eq!(listed.files[0].name, "index.html");

        let (bytes, content_type) = store.get("g1", "index.html").unwrap();
        assert_eq!(bytes, b"<h1>hi</h1>");
        assert_eq!(content_type, "text/html");
    }

    #[test]
    fn forbidden_subtree_is_rejected() {
        let store = store();
        let group_store = store.store_for("g1").unwrap();
        group_store.write("safe.txt", b"ok", "none").unwrap();
        let err = store.get("g1", "lua/secret.lua").unwrap_err();
        assert!(matches!(err, GoopError::Forbidden(_)));
    }
}
