//! Script engine (C10): sandboxed Lua functions backing `data/1.0`'s
//! `lua-list`/`lua-call` ops and chat commands dispatched by `chat.rs`.
//!
//! Every invocation gets a fresh VM — no state survives between calls except
//! what a script explicitly persists through `goop.kv`. A small source cache
//! sits in front of that: hot reload (via `notify`) re-reads a changed file,
//! tries to compile it in a throwaway VM, and only replaces the cached
//! source on success, so a bad edit never displaces a previously working
//! script. `invoke`/`invoke_command` load a fresh VM from whatever source is
//! currently cached rather than reading disk on every call.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use goop2_proto::{GoopError, GoopResult, PeerId};
use mlua::{Lua, LuaSerdeExt, MultiValue, VmState};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::Value;

use crate::traits::{GroupMembershipOracle, Identity, PeerResolver, ScriptOps};

const MAX_KV_KEYS: usize = 1000;
const MAX_KV_BYTES: usize = 64 * 1024;
const MAX_HTTP_REQUESTS_PER_CALL: u32 = 3;
const MAX_HTTP_RESPONSE_BYTES: usize = 1024 * 1024;
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// A direct chat message starting with this is dispatched to a command
/// script instead of just recorded as plain text.
pub const COMMAND_PREFIX: char = '!';

pub struct ScriptConfig {
    pub script_dir: PathBuf,
    pub timeout: Duration,
    pub max_memory_bytes: usize,
    pub rate_limit_per_peer: u32,
    pub rate_limit_global: u32,
    pub http_enabled: bool,
    pub kv_enabled: bool,
}

/// Distinguishes a data function (`functions/<name>.lua`, gets `goop.db`)
/// from a chat command (`<name>.lua` directly under the script root, does
/// not).
#[derive(Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Function,
    Command,
}

pub struct ScriptEngine {
    functions_dir: PathBuf,
    commands_dir: PathBuf,
    kv_dir: PathBuf,
    config: ScriptConfig,
    storage: Arc<crate::storage::Storage>,
    peers: Arc<dyn PeerResolver>,
    group_membership: Arc<dyn GroupMembershipOracle>,
    identity: Arc<dyn Identity>,
    peer_rate: DashMap<String, Mutex<VecDeque<Instant>>>,
    global_rate: Mutex<VecDeque<Instant>>,
    /// Last known-good source text per script path. Populated lazily by
    /// `invoke`/`invoke_command` on first use and kept current by the
    /// hot-reload watcher, which never overwrites an entry with source that
    /// fails to compile.
    source_cache: DashMap<PathBuf, String>,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ScriptEngine {
    pub fn new(
        config: ScriptConfig,
        storage: Arc<crate::storage::Storage>,
        peers: Arc<dyn PeerResolver>,
        group_membership: Arc<dyn GroupMembershipOracle>,
        identity: Arc<dyn Identity>,
    ) -> GoopResult<Arc<Self>> {
        let functions_dir = config.script_dir.join("functions");
        let commands_dir = config.script_dir.clone();
        let kv_dir = config.script_dir.join(".state");
        std::fs::create_dir_all(&functions_dir)?;
        std::fs::create_dir_all(&kv_dir)?;

        let engine = Arc::new(Self {
            functions_dir,
            commands_dir,
            kv_dir,
            config,
            storage,
            peers,
            group_membership,
            identity,
            peer_rate: DashMap::new(),
            global_rate: Mutex::new(VecDeque::new()),
            source_cache: DashMap::new(),
            _watcher: Mutex::new(None),
        });

        engine.start_watcher()?;
        Ok(engine)
    }

    /// Watches the whole script root recursively (covers both chat commands
    /// and `functions/`) and revalidates any `.lua` file that changes. A
    /// file that no longer compiles is logged and its last good cache entry
    /// is left in place; a deleted file drops its cache entry so `invoke`
    /// reports it as missing again.
    fn start_watcher(self: &Arc<Self>) -> GoopResult<()> {
        let dir = self.commands_dir.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| GoopError::Internal(format!("failed to start script watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| GoopError::Internal(format!("failed to watch {}: {e}", dir.display())))?;
        *self._watcher.lock() = Some(watcher);

        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            for event in rx {
                match event {
                    Ok(event) => engine.handle_watch_event(event),
                    Err(e) => tracing::warn!("script watcher error: {e}"),
                }
            }
        });
        Ok(())
    }

    fn handle_watch_event(&self, event: notify::Event) {
        for path in &event.paths {
            if path.extension().and_then(|e| e.to_str()) != Some("lua") {
                continue;
            }
            match std::fs::read_to_string(path) {
                Ok(source) => {
                    let chunk_name = format!("@{}", path.display());
                    match try_compile(&source, &chunk_name) {
                        Ok(()) => {
                            self.source_cache.insert(path.clone(), source);
                            tracing::info!(path = %path.display(), "script reloaded");
                        }
                        Err(e) => tracing::warn!(path = %path.display(), "script failed to compile, keeping previous version active: {e}"),
                    }
                }
                Err(_) => {
                    self.source_cache.remove(path);
                }
            }
        }
    }

    /// Returns the cached source for `path`, populating the cache from disk
    /// on first use. A script that has never compiled has no cache entry
    /// and no prior version to fall back to, so that case is a hard error.
    fn cached_source(&self, path: &Path) -> GoopResult<String> {
        if let Some(src) = self.source_cache.get(path) {
            return Ok(src.clone());
        }
        let source = std::fs::read_to_string(path).map_err(|_| GoopError::NotFound(format!("no such script: {}", path.display())))?;
        let chunk_name = format!("@{}", path.display());
        try_compile(&source, &chunk_name).map_err(|e| GoopError::BadRequest(format!("script does not compile: {e}")))?;
        self.source_cache.insert(path.to_path_buf(), source.clone());
        Ok(source)
    }

    pub fn list_functions_sync(&self) -> Vec<String> {
        list_lua_stems(&self.functions_dir)
    }

    /// Chat-command names: `.lua` files directly under the script root,
    /// excluding the `functions/` and `.state/` subdirectories (`read_dir`
    /// already only yields files here, since both of those are themselves
    /// directories).
    pub fn list_commands_sync(&self) -> Vec<String> {
        list_lua_stems(&self.commands_dir)
    }

    fn check_rate_limit(&self, caller_id: &PeerId) -> GoopResult<()> {
        let now = Instant::now();
        {
            let mut global = self.global_rate.lock();
            while global.front().map(|t| now.duration_since(*t) > RATE_WINDOW).unwrap_or(false) {
                global.pop_front();
            }
            if global.len() as u32 >= self.config.rate_limit_global {
                return Err(GoopError::ResourceExceeded("global script call rate limit exceeded".to_string()));
            }
            global.push_back(now);
        }
        let entry = self.peer_rate.entry(caller_id.to_string()).or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = entry.lock();
        while window.front().map(|t| now.duration_since(*t) > RATE_WINDOW).unwrap_or(false) {
            window.pop_front();
        }
        if window.len() as u32 >= self.config.rate_limit_per_peer {
            return Err(GoopError::ResourceExceeded(format!("rate limit exceeded for {caller_id}")));
        }
        window.push_back(now);
        Ok(())
    }

    /// Invokes a data function under `functions/` with `goop.db` available.
    pub async fn invoke(&self, function: &str, caller_id: PeerId, params: Value) -> GoopResult<Value> {
        let path = self.functions_dir.join(format!("{function}.lua"));
        self.invoke_path(&path, function, ScriptKind::Function, caller_id, params).await
    }

    /// Invokes a chat command directly under the script root. `goop.db` is
    /// not installed for commands.
    pub async fn invoke_command(&self, command: &str, caller_id: PeerId, args: Value) -> GoopResult<Value> {
        let path = self.commands_dir.join(format!("{command}.lua"));
        self.invoke_path(&path, command, ScriptKind::Command, caller_id, args).await
    }

    async fn invoke_path(&self, path: &Path, name: &str, kind: ScriptKind, caller_id: PeerId, params: Value) -> GoopResult<Value> {
        self.check_rate_limit(&caller_id)?;

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(GoopError::BadRequest(format!("invalid script name: {name}")));
        }
        let source = self.cached_source(path)?;

        let lua = Lua::new();
        lua.set_memory_limit(self.config.max_memory_bytes).map_err(|e| GoopError::Internal(e.to_string()))?;

        let deadline = Instant::now() + self.config.timeout;
        lua.set_interrupt(move |_lua| {
            if Instant::now() > deadline {
                Err(mlua::Error::runtime("script execution timed out"))
            } else {
                Ok(VmState::Continue)
            }
        });

        self.install_globals(&lua, name, kind, caller_id.clone())?;

        let params_value: mlua::Value = lua.to_value(&params).map_err(|e| GoopError::BadRequest(format!("bad params: {e}")))?;
        let chunk_name = format!("@{name}.lua");
        let run = async {
            let chunk = lua.load(&source).set_name(&chunk_name);
            let func: mlua::Function = chunk.eval_async().await.map_err(|e| GoopError::BadRequest(format!("script error: {e}")))?;
            let result: MultiValue = func.call_async(params_value).await.map_err(|e| GoopError::Internal(format!("script error: {e}")))?;
            let first = result.into_iter().next().unwrap_or(mlua::Value::Nil);
            lua.from_value::<Value>(first).map_err(|e| GoopError::Internal(format!("bad return value: {e}")))
        };

        tokio::time::timeout(self.config.timeout, run)
            .await
            .map_err(|_| GoopError::Timeout(format!("script {name} exceeded its time budget")))?
    }

    fn install_globals(&self, lua: &Lua, function: &str, kind: ScriptKind, caller_id: PeerId) -> GoopResult<()> {
        let goop = lua.create_table().map_err(|e| GoopError::Internal(e.to_string()))?;

        goop.set("peer", caller_id.to_string()).ok();
        goop.set("self", self.identity.self_id().to_string()).ok();

        let log_table = lua.create_function(|_, msg: String| {
            tracing::info!(target: "goop2::script", "{msg}");
            Ok(())
        }).map_err(|e| GoopError::Internal(e.to_string()))?;
        goop.set("log", log_table).ok();

        let command_names = self.list_commands_sync();
        let commands = lua.create_function(move |lua, ()| lua.to_value(&command_names)).map_err(|e| GoopError::Internal(e.to_string()))?;
        goop.set("commands", commands).ok();

        if self.config.kv_enabled {
            self.install_kv(lua, &goop, function)?;
        }

        if self.config.http_enabled {
            self.install_http(lua, &goop)?;
        }

        if kind == ScriptKind::Function {
            self.install_db(lua, &goop, caller_id)?;
        }

        lua.globals().set("goop", goop).map_err(|e| GoopError::Internal(e.to_string()))
    }

    fn install_kv(&self, lua: &Lua, goop: &mlua::Table, function: &str) -> GoopResult<()> {
        let kv_path = self.kv_dir.join(format!("{function}.json"));
        let kv = lua.create_table().map_err(|e| GoopError::Internal(e.to_string()))?;

        let get_path = kv_path.clone();
        let get = lua
            .create_function(move |lua, key: String| {
                let map = read_kv(&get_path);
                match map.get(&key) {
                    Some(v) => lua.to_value(v),
                    None => Ok(mlua::Value::Nil),
                }
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        kv.set("get", get).ok();

        let set_path = kv_path.clone();
        let set = lua
            .create_function(move |lua, (key, value): (String, mlua::Value)| {
                let mut map = read_kv(&set_path);
                let json_value: Value = lua.from_value(value)?;
                map.insert(key, json_value);
                if map.len() > MAX_KV_KEYS {
                    return Err(mlua::Error::runtime("kv store exceeds 1000 key limit"));
                }
                let bytes = serde_json::to_vec(&map).unwrap_or_default();
                if bytes.len() > MAX_KV_BYTES {
                    return Err(mlua::Error::runtime("kv store exceeds 64 KiB limit"));
                }
                std::fs::write(&set_path, &bytes).map_err(|e| mlua::Error::runtime(e.to_string()))?;
                Ok(())
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        kv.set("set", set).ok();

        goop.set("kv", kv).ok();
        Ok(())
    }

    fn install_http(&self, lua: &Lua, goop: &mlua::Table) -> GoopResult<()> {
        let http = lua.create_table().map_err(|e| GoopError::Internal(e.to_string()))?;
        let request_count = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let get_count = Arc::clone(&request_count);
        let get = lua
            .create_async_function(move |lua, url: String| {
                let count = Arc::clone(&get_count);
                async move { fetch_url(lua, &count, &url, None).await }
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        http.set("get", get).ok();

        let post_count = request_count;
        let post = lua
            .create_async_function(move |lua, (url, body): (String, String)| {
                let count = Arc::clone(&post_count);
                async move { fetch_url(lua, &count, &url, Some(body)).await }
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        http.set("post", post).ok();

        goop.set("http", http).ok();
        Ok(())
    }

    /// `goop.db.query`/`scalar`/`exec`/`insert` — bind parameters (the
    /// `args` table) are the only way a script can pass a value into a
    /// where clause; the clause text itself goes through the same
    /// identifier-only grammar `storage::select` enforces for remote
    /// `data/1.0` requests.
    fn install_db(&self, lua: &Lua, goop: &mlua::Table, caller_id: PeerId) -> GoopResult<()> {
        let db = lua.create_table().map_err(|e| GoopError::Internal(e.to_string()))?;
        let storage = Arc::clone(&self.storage);
        let membership = Arc::clone(&self.group_membership);

        let query_storage = Arc::clone(&storage);
        let query = lua
            .create_function(move |lua, (table, where_clause, args): (String, Option<String>, Option<Vec<mlua::Value>>)| {
                let bind = lua_values_to_json(lua, args)?;
                let opts = crate::storage::SelectOptions { columns: vec![], where_clause, args: bind, limit: None, offset: None };
                let rows = query_storage.select(&table, &opts).map_err(|e| mlua::Error::runtime(e.message()))?;
                lua.to_value(&rows)
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        db.set("query", query).ok();

        let scalar_storage = Arc::clone(&storage);
        let scalar = lua
            .create_function(move |lua, (table, column, where_clause, args): (String, String, Option<String>, Option<Vec<mlua::Value>>)| {
                let bind = lua_values_to_json(lua, args)?;
                let opts = crate::storage::SelectOptions { columns: vec![column.clone()], where_clause, args: bind, limit: Some(1), offset: None };
                let rows = scalar_storage.select(&table, &opts).map_err(|e| mlua::Error::runtime(e.message()))?;
                match rows.into_iter().next().and_then(|mut row| row.remove(&column)) {
                    Some(v) => lua.to_value(&v),
                    None => Ok(mlua::Value::Nil),
                }
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        db.set("scalar", scalar).ok();

        let exec_storage = Arc::clone(&storage);
        let exec_caller = caller_id.clone();
        let is_self = caller_id == self.identity.self_id();
        let exec = lua
            .create_function(move |lua, (table, id, data): (String, i64, mlua::Value)| {
                let values: Value = lua.from_value(data)?;
                let map = crate::storage::values_as_map(&values).map_err(|e| mlua::Error::runtime(e.message()))?;
                exec_storage.update(&table, id, exec_caller.as_str(), is_self, &map).map_err(|e| mlua::Error::runtime(e.message()))?;
                Ok(())
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        db.set("exec", exec).ok();

        let insert_storage = Arc::clone(&storage);
        let insert_caller = caller_id.clone();
        let insert = lua
            .create_function(move |lua, (table, data): (String, mlua::Value)| {
                let values: Value = lua.from_value(data)?;
                let map = crate::storage::values_as_map(&values).map_err(|e| mlua::Error::runtime(e.message()))?;
                let member_check_table = table.clone();
                let membership = Arc::clone(&membership);
                let caller = insert_caller.clone();
                let id = insert_storage
                    .insert(&table, caller.as_str(), None, || membership.is_member(&member_check_table, &caller), false, &[], &map)
                    .map_err(|e| mlua::Error::runtime(e.message()))?;
                Ok(id)
            })
            .map_err(|e| GoopError::Internal(e.to_string()))?;
        db.set("insert", insert).ok();

        goop.set("db", db).ok();
        Ok(())
    }
}

/// Converts an optional Lua array of bind values into the JSON values
/// `storage::select` binds positionally (`?1`, `?2`, ...).
fn lua_values_to_json(lua: &Lua, args: Option<Vec<mlua::Value>>) -> mlua::Result<Vec<Value>> {
    args.unwrap_or_default().into_iter().map(|v| lua.from_value(v)).collect()
}

fn read_kv(path: &Path) -> HashMap<String, Value> {
    std::fs::read(path).ok().and_then(|b| serde_json::from_slice(&b).ok()).unwrap_or_default()
}

fn list_lua_stems(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(rd) = std::fs::read_dir(dir) else { return out };
    for entry in rd.flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("lua") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
    }
    out.sort();
    out
}

/// Syntax-checks `source` in a throwaway VM. Used both to populate the
/// source cache on first use and by the hot-reload watcher to decide
/// whether a changed file should replace what's cached.
fn try_compile(source: &str, chunk_name: &str) -> Result<(), String> {
    let lua = Lua::new();
    lua.load(source).set_name(chunk_name).into_function().map(|_| ()).map_err(|e| e.to_string())
}

async fn fetch_url(
    lua: &Lua,
    count: &std::sync::atomic::AtomicU32,
    url: &str,
    body: Option<String>,
) -> mlua::Result<mlua::Value> {
    if count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= MAX_HTTP_REQUESTS_PER_CALL {
        return Err(mlua::Error::runtime("script exceeded the 3-request HTTP budget"));
    }
    let pinned_client = pin_to_safe_address(url).await.map_err(mlua::Error::runtime)?;

    let resp = if let Some(body) = body {
        pinned_client.post(url).body(body).send().await
    } else {
        pinned_client.get(url).send().await
    }
    .map_err(|e| mlua::Error::runtime(e.to_string()))?;

    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(|e| mlua::Error::runtime(e.to_string()))?;
    if bytes.len() > MAX_HTTP_RESPONSE_BYTES {
        return Err(mlua::Error::runtime("response exceeds 1 MiB cap"));
    }
    let text = String::from_utf8_lossy(&bytes).to_string();
    lua.to_value(&serde_json::json!({ "status": status, "body": text }))
}

/// Resolves `url`'s host once, rejects anything but plain `http`/`https` to
/// a publicly routable address, and returns a client whose resolver is
/// pinned to exactly the address that was checked — so the request this
/// client makes cannot land on a different address than the one validated
/// (a DNS rebind between check and connect would otherwise bypass the
/// guard entirely, since a generic client re-resolves on its own).
async fn pin_to_safe_address(url: &str) -> Result<reqwest::Client, String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid url: {e}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(format!("scheme not allowed: {}", parsed.scheme()));
    }
    let host = parsed.host_str().ok_or_else(|| "url has no host".to_string())?;
    let port = parsed.port_or_known_default().unwrap_or(80);
    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| format!("dns lookup failed: {e}"))?;
    let resolved = addrs.next().ok_or_else(|| "host resolved to no addresses".to_string())?;
    if !is_publicly_routable(resolved.ip()) {
        return Err(format!("destination address is not publicly routable: {}", resolved.ip()));
    }
    reqwest::Client::builder()
        .resolve(host, resolved)
        .build()
        .map_err(|e| format!("failed to build pinned http client: {e}"))
}

fn is_publicly_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_multicast() || v4.is_unspecified() || v4.is_broadcast()),
        IpAddr::V6(v6) => {
            let is_unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || is_unique_local)
        }
    }
}

impl ScriptOps for ScriptEngine {
    fn list_functions(&self) -> Vec<String> {
        self.list_functions_sync()
    }

    fn call<'a>(
        &'a self,
        function: &'a str,
        caller_id: PeerId,
        params: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = GoopResult<Value>> + Send + 'a>> {
        Box::pin(async move { self.invoke(function, caller_id, params).await })
    }

    fn list_commands(&self) -> Vec<String> {
        self.list_commands_sync()
    }

    fn call_command<'a>(
        &'a self,
        command: &'a str,
        caller_id: PeerId,
        args: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = GoopResult<Value>> + Send + 'a>> {
        Box::pin(async move { self.invoke_command(command, caller_id, args).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_private_addresses_are_rejected() {
        assert!(!is_publicly_routable("127.0.0.1".parse().unwrap()));
        assert!(!is_publicly_routable("10.0.0.5".parse().unwrap()));
        assert!(!is_publicly_routable("169.254.1.1".parse().unwrap()));
        assert!(!is_publicly_routable("::1".parse().unwrap()));
        assert!(is_publicly_routable("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn list_functions_reads_lua_files() {
        let dir = std::env::temp_dir().join(format!("goop2-script-test-{}", goop2_proto::msgid::generate()));
        std::fs::create_dir_all(dir.join("functions")).unwrap();
        std::fs::write(dir.join("functions").join("greet.lua"), "return function(p) return p end").unwrap();
        let config = ScriptConfig {
            script_dir: dir,
            timeout: Duration::from_secs(5),
            max_memory_bytes: 10 * 1024 * 1024,
            rate_limit_per_peer: 30,
            rate_limit_global: 120,
            http_enabled: true,
            kv_enabled: true,
        };
        let storage = Arc::new(crate::storage::Storage::open_memory().unwrap());
        struct NoGroups;
        impl GroupMembershipOracle for NoGroups {
            fn is_member(&self, _g: &str, _p: &PeerId) -> bool { false }
            fn shares_a_group_with_self(&self, _p: &PeerId) -> bool { false }
        }
        struct NoPeers;
        impl PeerResolver for NoPeers {
            fn resolve(&self, _p: &PeerId) -> Option<goop2_proto::presence::PresenceRecord> { None }
            fn is_presence_visible(&self, _p: &PeerId) -> bool { false }
            fn online_peer_ids(&self) -> Vec<PeerId> { vec![] }
        }
        struct FixedIdentity;
        impl Identity for FixedIdentity {
            fn self_id(&self) -> PeerId { PeerId::new("self") }
            fn self_label(&self) -> String { "self".to_string() }
        }
        let engine = ScriptEngine::new(config, storage, Arc::new(NoPeers), Arc::new(NoGroups), Arc::new(FixedIdentity)).unwrap();
        assert_eq!(engine.list_functions(), vec!["greet".to_string()]);
    }
}
