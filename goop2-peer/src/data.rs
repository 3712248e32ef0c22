//! Data proxy (C9): exposes the storage layer and the script engine's Lua
//! functions over `data/1.0`. Schema-mutating ops (`create-table`,
//! `add-column`, `drop-column`, `set-policy`, `rename-table`,
//! `delete-table`) are host-only: a remote caller is always rejected.

use std::sync::Arc;

use goop2_proto::data::{DataRequest, DataResponse};
use goop2_proto::{GoopError, GoopResult, PeerId};

use crate::storage::{SelectOptions, Storage};
use crate::traits::{GroupMembershipOracle, Identity, PeerResolver, ScriptOps};
use crate::transport::{Protocol, Stream, Transport};

pub struct DataProxy {
    storage: Arc<Storage>,
    identity: Arc<dyn Identity>,
    group_membership: Arc<dyn GroupMembershipOracle>,
    peers: Arc<dyn PeerResolver>,
    scripts: parking_lot::Mutex<Option<Arc<dyn ScriptOps>>>,
}

impl DataProxy {
    pub fn new(
        transport: Arc<Transport>,
        storage: Arc<Storage>,
        identity: Arc<dyn Identity>,
        group_membership: Arc<dyn GroupMembershipOracle>,
        peers: Arc<dyn PeerResolver>,
    ) -> Arc<Self> {
        let proxy = Arc::new(Self { storage, identity, group_membership, peers, scripts: parking_lot::Mutex::new(None) });
        let handler_proxy = Arc::clone(&proxy);
        transport.register_handler(Protocol::Data, move |stream| {
            let proxy = Arc::clone(&handler_proxy);
            async move { proxy.handle_stream(stream).await }
        });
        proxy
    }

    /// The script engine is constructed after the data proxy (it needs a
    /// handle to storage), so it is wired in once it exists.
    pub fn set_script_engine(&self, scripts: Arc<dyn ScriptOps>) {
        *self.scripts.lock() = Some(scripts);
    }

    async fn handle_stream(&self, mut stream: Stream) {
        let Ok(Some(line)) = stream.read_line().await else { return };
        let caller_id = stream.remote_peer_id.clone();
        let response = match serde_json::from_str::<DataRequest>(&line) {
            Ok(request) => self.dispatch(request, &caller_id, false).await,
            Err(e) => DataResponse::err(format!("malformed request: {e}")),
        };
        let body = serde_json::to_string(&response).unwrap_or_else(|_| r#"{"ok":false,"error":"internal"}"#.to_string());
        let _ = stream.write_line(&body).await;
    }

    /// `is_self` is true when the call originates from the local peer's own
    /// HTTP surface rather than a remote `data/1.0` stream; local calls may
    /// perform schema mutations and bypass ownership checks.
    pub async fn dispatch(&self, request: DataRequest, caller_id: &PeerId, is_self: bool) -> DataResponse {
        match self.handle(request, caller_id, is_self).await {
            Ok(value) => DataResponse::ok(value),
            Err(e) => DataResponse::err(e.message()),
        }
    }

    async fn handle(&self, request: DataRequest, caller_id: &PeerId, is_self: bool) -> GoopResult<serde_json::Value> {
        match request {
            DataRequest::Tables => {
                let tables = self.storage.tables()?;
                Ok(serde_json::to_value(tables)?)
            }
            DataRequest::Describe { table } => Ok(serde_json::to_value(self.storage.describe(&table)?)?),
            DataRequest::CreateTable { name, columns } => {
                self.require_host(is_self)?;
                self.storage.create_table(&name, &columns)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::Insert { table, data } => {
                let values = crate::storage::values_as_map(&data)?;
                let caller_email = self.peers.resolve(caller_id).and_then(|r| r.email);
                let group_id_hint = data.get("_group").and_then(|v| v.as_str()).map(|s| s.to_string());
                let membership = Arc::clone(&self.group_membership);
                let caller_for_group = caller_id.clone();
                let id = self.storage.insert(
                    &table,
                    caller_id.as_str(),
                    caller_email.as_deref(),
                    || group_id_hint.map(|g| membership.is_member(&g, &caller_for_group)).unwrap_or(false),
                    is_self,
                    &[],
                    &values,
                )?;
                Ok(serde_json::json!({ "id": id }))
            }
            DataRequest::Query { table, columns, r#where, args, limit, offset } => {
                let rows = self.storage.select(&table, &SelectOptions { columns, where_clause: r#where, args, limit, offset })?;
                Ok(serde_json::Value::Array(rows.into_iter().map(serde_json::Value::Object).collect()))
            }
            DataRequest::Update { table, id, data } => {
                let values = crate::storage::values_as_map(&data)?;
                self.storage.update(&table, id, caller_id.as_str(), is_self, &values)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::Delete { table, id } => {
                self.storage.delete(&table, id, caller_id.as_str(), is_self)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::AddColumn { table, column } => {
                self.require_host(is_self)?;
                self.storage.add_column(&table, &column)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::DropColumn { table, column } => {
                self.require_host(is_self)?;
                self.storage.drop_column(&table, &column)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::SetPolicy { table, policy } => {
                self.require_host(is_self)?;
                let policy = goop2_proto::data::InsertPolicy::parse(&policy).ok_or_else(|| GoopError::BadRequest(format!("unknown policy: {policy}")))?;
                self.storage.set_policy(&table, policy)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::RenameTable { table, new_name } => {
                self.require_host(is_self)?;
                self.storage.rename_table(&table, &new_name)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::DeleteTable { table } => {
                self.require_host(is_self)?;
                self.storage.delete_table(&table)?;
                Ok(serde_json::Value::Null)
            }
            DataRequest::LuaList => {
                let scripts = self.scripts.lock().clone();
                match scripts {
                    Some(s) => Ok(serde_json::to_value(s.list_functions())?),
                    None => Ok(serde_json::Value::Array(vec![])),
                }
            }
            DataRequest::LuaCall { function, params } => {
                let scripts = self.scripts.lock().clone();
                match scripts {
                    Some(s) => s.call(&function, caller_id.clone(), params).await,
                    None => Err(GoopError::NotFound(format!("no such function: {function}"))),
                }
            }
        }
    }

    fn require_host(&self, is_self: bool) -> GoopResult<()> {
        if !is_self {
            return Err(GoopError::Forbidden("schema mutations are host-only".to_string()));
        }
        Ok(())
    }

    pub fn self_id(&self) -> PeerId {
        self.identity.self_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    struct AllowAll;
    impl GroupMembershipOracle for AllowAll {
        fn is_member(&self, _group_id: &str, _peer_id: &PeerId) -> bool {
            true
        }
        fn shares_a_group_with_self(&self, _peer_id: &PeerId) -> bool {
            true
        }
    }

    struct NoOne;
    impl PeerResolver for NoOne {
        fn resolve(&self, _peer_id: &PeerId) -> Option<goop2_proto::presence::PresenceRecord> {
            None
        }
        fn is_presence_visible(&self, _peer_id: &PeerId) -> bool {
            false
        }
        fn online_peer_ids(&self) -> Vec<PeerId> {
            vec![]
        }
    }

    struct FixedIdentity(PeerId);
    impl Identity for FixedIdentity {
        fn self_id(&self) -> PeerId {
            self.0.clone()
        }
        fn self_label(&self) -> String {
            "self".to_string()
        }
    }

    #[tokio::test]
    async fn remote_caller_cannot_create_table() {
        let storage = Arc::new(Storage::open_memory().unwrap());
        let identity: Arc<dyn Identity> = Arc::new(FixedIdentity(PeerId::new("self-peer")));
        let membership: Arc<dyn GroupMembershipOracle> = Arc::new(AllowAll);
        let peers: Arc<dyn PeerResolver> = Arc::new(NoOne);
        let proxy = DataProxy {
            storage,
            identity,
            group_membership: membership,
            peers,
            scripts: parking_lot::Mutex::new(None),
        };
        let remote = PeerId::new("remote-peer");
        let err = proxy
            .handle(DataRequest::CreateTable { name: "posts".to_string(), columns: vec!["title".to_string()] }, &remote, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GoopError::Forbidden(_)));

        proxy
            .handle(DataRequest::CreateTable { name: "posts".to_string(), columns: vec!["title".to_string()] }, &remote, true)
            .await
            .unwrap();
    }
}
