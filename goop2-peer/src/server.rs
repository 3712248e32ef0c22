//! Top-level orchestrator: wires transport, storage, content, presence,
//! chat, groups, docs, data, scripting, the message bus, and the local HTTP
//! surface into one running peer.

use std::sync::Arc;
use std::time::Duration;

use goop2_proto::PeerId;

use crate::config::PeerConfig;
use crate::content::ContentStore;
use crate::data::DataProxy;
use crate::docs::{DocsService, DocsStore};
use crate::group::GroupManager;
use crate::mq::Mq;
use crate::presence::PresenceClient;
use crate::script::{ScriptConfig, ScriptEngine};
use crate::storage::Storage;
use crate::traits::PeerResolver;
use crate::transport::Transport;
use crate::web::AppState;

pub struct Peer {
    pub config: PeerConfig,
    pub transport: Arc<Transport>,
    pub content: Arc<ContentStore>,
    pub storage: Arc<Storage>,
    pub presence: Arc<PresenceClient>,
    pub chat: Arc<crate::chat::ChatManager>,
    pub groups: Arc<GroupManager>,
    pub docs: Arc<DocsService>,
    pub data: Arc<DataProxy>,
    pub scripts: Arc<ScriptEngine>,
    pub mq: Arc<Mq>,
}

impl Peer {
    pub async fn start(config: PeerConfig) -> anyhow::Result<Arc<Self>> {
        let transport = Transport::listen(&config.iroh_key_path(), Some(config.p2p.listen_port).filter(|p| *p != 0)).await?;
        let self_id = transport.id();
        tracing::info!(%self_id, "peer identity established");

        let content = Arc::new(ContentStore::new(config.site_dir())?);
        let storage = Arc::new(Storage::open(&config.db_path())?);
        std::fs::create_dir_all(config.shared_dir())?;
        std::fs::create_dir_all(config.avatars_dir())?;

        let mq = Mq::new(Arc::clone(&transport));

        let mut wan_brokers = config.presence.rendezvous_wan.clone();
        if config.presence.rendezvous_host {
            let bind: std::net::SocketAddr = format!("{}:{}", config.presence.rendezvous_bind, config.presence.rendezvous_port.unwrap_or(7420)).parse()?;
            let broker_config = goop2_broker::config::BrokerConfig {
                bind: bind.to_string(),
                ttl_ms: (config.presence.ttl_seconds * 1000) as i64,
                subscriber_ring: 64,
                mirror_path: config.presence.peer_db_path.clone(),
                mirror_sync_secs: 3,
            };
            tokio::spawn(async move {
                if let Err(e) = goop2_broker::run(broker_config).await {
                    tracing::error!("embedded broker exited: {e}");
                }
            });
            wan_brokers.push(format!("http://{bind}"));
        }

        let presence = PresenceClient::new(
            self_id.clone(),
            config.profile.label.clone(),
            config.profile.email.clone(),
            config.profile.avatar_hash.clone(),
            wan_brokers,
            config.p2p.tag.clone(),
            config.presence.ttl_seconds,
            config.presence.heartbeat_seconds,
        );
        presence.start();

        let chat = crate::chat::ChatManager::new(Arc::clone(&transport));

        let peer_resolver: Arc<dyn PeerResolver> = Arc::clone(&presence) as Arc<dyn PeerResolver>;
        let groups = GroupManager::new(
            Arc::clone(&transport),
            &config.peer_dir.join("groups.db"),
            self_id.clone(),
            Arc::clone(&mq) as Arc<dyn crate::traits::MqPublisher>,
            Arc::clone(&peer_resolver),
        )?;

        let docs_store = Arc::new(DocsStore::new(config.shared_dir())?);
        let docs = DocsService::new(Arc::clone(&transport), docs_store, Arc::clone(&groups) as Arc<dyn crate::traits::GroupMembershipOracle>);

        let data = DataProxy::new(
            Arc::clone(&transport),
            Arc::clone(&storage),
            Arc::clone(&groups) as Arc<dyn crate::traits::Identity>,
            Arc::clone(&groups) as Arc<dyn crate::traits::GroupMembershipOracle>,
            Arc::clone(&peer_resolver),
        );

        let scripts = if config.lua.enabled {
            let script_config = ScriptConfig {
                script_dir: config.script_dir(),
                timeout: Duration::from_secs(config.lua.timeout_seconds),
                max_memory_bytes: (config.lua.max_memory_mb * 1024 * 1024) as usize,
                rate_limit_per_peer: config.lua.rate_limit_per_peer,
                rate_limit_global: config.lua.rate_limit_global,
                http_enabled: config.lua.http_enabled,
                kv_enabled: config.lua.kv_enabled,
            };
            let engine = ScriptEngine::new(
                script_config,
                Arc::clone(&storage),
                Arc::clone(&peer_resolver),
                Arc::clone(&groups) as Arc<dyn crate::traits::GroupMembershipOracle>,
                Arc::clone(&groups) as Arc<dyn crate::traits::Identity>,
            )?;
            data.set_script_engine(Arc::clone(&engine) as Arc<dyn crate::traits::ScriptOps>);
            chat.set_script_engine(Arc::clone(&engine) as Arc<dyn crate::traits::ScriptOps>);
            engine
        } else {
            ScriptEngine::new(
                ScriptConfig {
                    script_dir: config.script_dir(),
                    timeout: Duration::from_secs(config.lua.timeout_seconds),
                    max_memory_bytes: (config.lua.max_memory_mb * 1024 * 1024) as usize,
                    rate_limit_per_peer: config.lua.rate_limit_per_peer,
                    rate_limit_global: config.lua.rate_limit_global,
                    http_enabled: false,
                    kv_enabled: false,
                },
                Arc::clone(&storage),
                Arc::clone(&peer_resolver),
                Arc::clone(&groups) as Arc<dyn crate::traits::GroupMembershipOracle>,
                Arc::clone(&groups) as Arc<dyn crate::traits::Identity>,
            )?
        };

        Ok(Arc::new(Self { config, transport, content, storage, presence, chat, groups, docs, data, scripts, mq }))
    }

    pub fn self_id(&self) -> PeerId {
        self.transport.id()
    }

    pub async fn serve_web(self: &Arc<Self>) -> anyhow::Result<()> {
        let addr: std::net::SocketAddr = self.config.viewer.addr.parse()?;
        let state = Arc::new(AppState {
            self_id: self.self_id(),
            csrf_token: AppState::new_csrf_token(),
            content: Arc::clone(&self.content),
            presence: Arc::clone(&self.presence),
            chat: Arc::clone(&self.chat),
            groups: Arc::clone(&self.groups),
            docs: Arc::clone(&self.docs),
            data: Arc::clone(&self.data),
            mq: Arc::clone(&self.mq),
        });
        tracing::info!(token = %state.csrf_token, "local HTTP surface CSRF token minted for this process");
        crate::web::serve(state, addr).await
    }
}
