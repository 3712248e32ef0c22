//! Peer configuration: `goop.json` in the peer directory, overridable by CLI
//! flags and environment variables.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// CLI entry point. `goop2-peer run [--peer-dir DIR] [overrides...]`.
#[derive(Debug, Clone, Parser)]
#[command(name = "goop2-peer", about = "goop2 peer runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
    /// Run as a full peer (transport + storage + HTTP surface).
    Run {
        #[arg(long, env = "GOOP2_PEER_DIR", default_value = ".")]
        peer_dir: PathBuf,
        #[arg(long)]
        listen_port: Option<u16>,
        #[arg(long)]
        web_addr: Option<String>,
    },
    /// Run only the rendezvous broker (no peer identity, no storage).
    Broker {
        #[arg(long, env = "GOOP2_BROKER_BIND", default_value = "127.0.0.1:7420")]
        bind: String,
        #[arg(long)]
        mirror_path: Option<String>,
    },
    /// Export the peer's `site/` content tree as a tar-less bundle directory.
    ExportSite {
        #[arg(long, env = "GOOP2_PEER_DIR", default_value = ".")]
        peer_dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Import a previously exported site bundle into a peer directory.
    ImportSite {
        #[arg(long, env = "GOOP2_PEER_DIR", default_value = ".")]
        peer_dir: PathBuf,
        #[arg(long)]
        bundle: PathBuf,
    },
}

/// Per-table insert policy default used by `goop.json`'s profile section —
/// kept distinct from `goop2_proto::data::InsertPolicy` only by location;
/// re-exported for convenience.
pub use goop2_proto::data::InsertPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub label: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub verification_token: Option<String>,
    #[serde(default)]
    pub avatar_hash: Option<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self { label: "anonymous".to_string(), email: None, verification_token: None, avatar_hash: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// 0 = random ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    "goop2".to_string()
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self { listen_port: 0, tag: default_tag() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_seconds: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_seconds: u64,
    #[serde(default)]
    pub rendezvous_host: bool,
    #[serde(default)]
    pub rendezvous_port: Option<u16>,
    #[serde(default = "default_rendezvous_bind")]
    pub rendezvous_bind: String,
    #[serde(default)]
    pub rendezvous_wan: Vec<String>,
    #[serde(default)]
    pub rendezvous_only: bool,
    #[serde(default)]
    pub peer_db_path: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
}

fn default_ttl_secs() -> u64 {
    20
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_rendezvous_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_secs(),
            heartbeat_seconds: default_heartbeat_secs(),
            rendezvous_host: false,
            rendezvous_port: None,
            rendezvous_bind: default_rendezvous_bind(),
            rendezvous_wan: Vec::new(),
            rendezvous_only: false,
            peer_db_path: None,
            admin_password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default = "default_web_addr")]
    pub addr: String,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub active_template: Option<String>,
}

fn default_web_addr() -> String {
    "127.0.0.1:8420".to_string()
}
fn default_theme() -> String {
    "default".to_string()
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self { addr: default_web_addr(), theme: default_theme(), active_template: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_script_dir")]
    pub script_dir: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_rate_limit_per_peer")]
    pub rate_limit_per_peer: u32,
    #[serde(default = "default_rate_limit_global")]
    pub rate_limit_global: u32,
    #[serde(default = "default_true")]
    pub http_enabled: bool,
    #[serde(default = "default_true")]
    pub kv_enabled: bool,
}

fn default_true() -> bool {
    true
}
fn default_script_dir() -> String {
    "site/lua".to_string()
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_max_memory_mb() -> u64 {
    10
}
fn default_rate_limit_per_peer() -> u32 {
    30
}
fn default_rate_limit_global() -> u32 {
    120
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            script_dir: default_script_dir(),
            timeout_seconds: default_timeout_secs(),
            max_memory_mb: default_max_memory_mb(),
            rate_limit_per_peer: default_rate_limit_per_peer(),
            rate_limit_global: default_rate_limit_global(),
            http_enabled: true,
            kv_enabled: true,
        }
    }
}

/// The full contents of `goop.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerConfig {
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub lua: ScriptConfig,

    /// Directory this config was loaded from / will be saved to. Not
    /// serialized; populated by `load`.
    #[serde(skip)]
    pub peer_dir: PathBuf,
}

impl PeerConfig {
    pub fn path_in(peer_dir: &Path) -> PathBuf {
        peer_dir.join("goop.json")
    }

    /// Load `goop.json` from the peer directory, creating it with defaults
    /// if absent.
    pub fn load(peer_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(peer_dir)?;
        let path = Self::path_in(peer_dir);
        let mut config: Self = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Self::default()
        };
        config.peer_dir = peer_dir.to_path_buf();
        if !path.exists() {
            config.save()?;
        }
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::path_in(&self.peer_dir);
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn site_dir(&self) -> PathBuf {
        self.peer_dir.join("site")
    }

    pub fn db_path(&self) -> PathBuf {
        self.peer_dir.join("data.db")
    }

    pub fn script_dir(&self) -> PathBuf {
        self.peer_dir.join(&self.lua.script_dir)
    }

    pub fn functions_dir(&self) -> PathBuf {
        self.script_dir().join("functions")
    }

    pub fn kv_state_dir(&self) -> PathBuf {
        self.script_dir().join(".state")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.peer_dir.join("shared")
    }

    pub fn avatars_dir(&self) -> PathBuf {
        self.peer_dir.join("avatars")
    }

    pub fn iroh_key_path(&self) -> PathBuf {
        self.peer_dir.join("iroh-key.secret")
    }
}
