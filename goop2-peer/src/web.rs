//! Local HTTP surface (C12): a loopback-only REST + SSE shell over every
//! other component. Every mutating endpoint requires both a same-origin
//! loopback request and a CSRF token minted at process start — there is no
//! user login, so these two checks are the entire trust boundary between
//! "a script running in the peer's own UI" and "any other process on the
//! machine that can reach the bound port".

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use goop2_proto::data::DataRequest;
use goop2_proto::group::GroupRole;
use goop2_proto::{GoopError, PeerId};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::chat::ChatManager;
use crate::content::ContentStore;
use crate::data::DataProxy;
use crate::docs::DocsService;
use crate::group::GroupManager;
use crate::mq::Mq;
use crate::presence::PresenceClient;

pub struct AppState {
    pub self_id: PeerId,
    pub csrf_token: String,
    pub content: Arc<ContentStore>,
    pub presence: Arc<PresenceClient>,
    pub chat: Arc<ChatManager>,
    pub groups: Arc<GroupManager>,
    pub docs: Arc<DocsService>,
    pub data: Arc<DataProxy>,
    pub mq: Arc<Mq>,
}

impl AppState {
    pub fn new_csrf_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let mutating = Router::new()
        .route("/api/chat/send", post(send_chat))
        .route("/api/groups", post(create_group))
        .route("/api/groups/:id/close", post(close_group))
        .route("/api/groups/:id/join", post(join_group))
        .route("/api/groups/:id/send", post(send_group_msg))
        .route("/api/data", post(run_data_request))
        .route("/api/mq/send", post(mq_send))
        .route("/api/mq/ack", post(mq_ack))
        .route("/api/content/*path", put(write_content))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_trusted_origin));

    let readonly = Router::new()
        .route("/api/presence", get(presence_snapshot))
        .route("/api/presence/events", get(presence_events))
        .route("/api/chat/history", get(chat_history))
        .route("/api/groups", get(list_groups))
        .route("/api/docs/:group_id", get(list_docs))
        .route("/api/docs/:group_id/aggregate", get(aggregate_docs))
        .route("/api/docs/:group_id/*file", get(get_doc))
        .route("/api/content/*path", get(read_content))
        .route("/api/mq/events", get(mq_events))
        .route("/healthz", get(healthz));

    Router::new().merge(readonly).merge(mutating).layer(CorsLayer::permissive()).with_state(state)
}

async fn require_trusted_origin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    let token_ok = headers.get("x-goop2-csrf").and_then(|v| v.to_str().ok()).map(|t| t == state.csrf_token).unwrap_or(false);
    if !token_ok {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "missing or invalid csrf token"}))).into_response();
    }
    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !origin_is_loopback(origin) {
            return (StatusCode::FORBIDDEN, Json(json!({"error": "origin is not loopback"}))).into_response();
        }
    }
    next.run(request).await
}

fn origin_is_loopback(origin: &str) -> bool {
    origin
        .parse::<url::Url>()
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .map(|host| host == "localhost" || host == "127.0.0.1" || host == "::1")
        .unwrap_or(false)
}

fn error_response(e: GoopError) -> axum::response::Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"ok": false, "error": e.message(), "kind": e.kind()}))).into_response()
}

async fn presence_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.presence.snapshot())
}

async fn presence_events(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.presence.subscribe();
    let initial = state.presence.snapshot();
    let inner = stream::unfold((Some(initial), rx), move |(initial, mut rx)| async move {
        if let Some(peers) = initial {
            let event = goop2_proto::presence::PresenceEvent::Snapshot { peers };
            return Some((Ok(to_sse(&event, "presence")), (None, rx)));
        }
        match rx.recv().await {
            Ok(event) => Some((Ok(to_sse(&event, "presence")), (None, rx))),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => Some((Ok(SseEvent::default().comment("lagged")), (None, rx))),
            Err(tokio::sync::broadcast::error::RecvError::Closed) => None,
        }
    });
    Sse::new(inner).keep_alive(KeepAlive::new().interval(Duration::from_secs(25)))
}

fn to_sse<T: serde::Serialize>(value: &T, name: &str) -> SseEvent {
    SseEvent::default().event(name).json_data(value).unwrap_or_else(|_| SseEvent::default())
}

#[derive(Deserialize)]
struct SendChatRequest {
    target: String,
    text: String,
}

async fn send_chat(State(state): State<Arc<AppState>>, Json(req): Json<SendChatRequest>) -> impl IntoResponse {
    match state.chat.send_direct(&PeerId::new(req.target), &req.text).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn chat_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let history: Vec<_> = state
        .chat
        .history()
        .into_iter()
        .map(|m| json!({"from": m.from.to_string(), "text": m.text, "ts": m.ts, "broadcast": m.broadcast}))
        .collect();
    Json(history)
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    app_type: String,
    #[serde(default)]
    max_members: u32,
    #[serde(default)]
    volatile: bool,
}

async fn create_group(State(state): State<Arc<AppState>>, Json(req): Json<CreateGroupRequest>) -> impl IntoResponse {
    match state.groups.create(&req.name, &req.app_type, req.max_members, req.volatile) {
        Ok(meta) => Json(meta).into_response(),
        Err(e) => error_response(e),
    }
}

async fn close_group(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    match state.groups.close(&id).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hosted = state.groups.hosted_groups();
    let subscriptions = state.groups.list_subscriptions().unwrap_or_default();
    Json(json!({"hosted": hosted, "subscriptions": subscriptions}))
}

#[derive(Deserialize)]
struct JoinGroupRequest {
    host_peer_id: String,
    app_type: String,
    #[serde(default)]
    admin: bool,
}

async fn join_group(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>, Json(req): Json<JoinGroupRequest>) -> impl IntoResponse {
    let role = if req.admin { GroupRole::Admin } else { GroupRole::Member };
    match state.groups.join(PeerId::new(req.host_peer_id), id, req.app_type, role).await {
        Ok(_rx) => Json(json!({"ok": true})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct SendGroupMsgRequest {
    host_peer_id: String,
    payload: serde_json::Value,
}

async fn send_group_msg(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>, Json(req): Json<SendGroupMsgRequest>) -> impl IntoResponse {
    match state.groups.send_msg(&PeerId::new(req.host_peer_id), &id, req.payload).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_docs(State(state): State<Arc<AppState>>, AxumPath(group_id): AxumPath<String>) -> impl IntoResponse {
    match state.docs_list(&group_id) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(e),
    }
}

async fn aggregate_docs(State(state): State<Arc<AppState>>, AxumPath(group_id): AxumPath<String>) -> impl IntoResponse {
    let members = state.groups.members_of(&group_id);
    let results = state.docs.aggregate_list(&group_id, &members).await;
    Json(results)
}

async fn get_doc(State(state): State<Arc<AppState>>, AxumPath((group_id, file)): AxumPath<(String, String)>) -> impl IntoResponse {
    match state.docs_get(&group_id, &file) {
        Ok((bytes, content_type)) => ([(axum::http::header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(e) => error_response(e),
    }
}

impl AppState {
    fn docs_list(&self, group_id: &str) -> Result<goop2_proto::docs::DocsListResponse, GoopError> {
        // Local requests are the host's own store, addressed by its own
        // group id directly, rather than going over `docs/1.0`.
        self.docs_local_store().list(group_id)
    }

    fn docs_get(&self, group_id: &str, file: &str) -> Result<(Vec<u8>, &'static str), GoopError> {
        self.docs_local_store().get(group_id, file)
    }

    fn docs_local_store(&self) -> &crate::docs::DocsStore {
        self.docs.store()
    }
}

#[derive(Deserialize)]
struct ContentQuery {
    #[serde(default)]
    dir: bool,
}

async fn read_content(State(state): State<Arc<AppState>>, AxumPath(path): AxumPath<String>, Query(q): Query<ContentQuery>) -> impl IntoResponse {
    if q.dir {
        return match state.content.list(&path) {
            Ok(entries) => Json(entries.into_iter().map(|e| json!({"path": e.path, "isDir": e.is_dir, "size": e.size, "modifiedMs": e.modified_ms})).collect::<Vec<_>>()).into_response(),
            Err(e) => error_response(e),
        };
    }
    match state.content.read(&path) {
        Ok(item) => ([("etag", item.etag.as_str())], item.bytes).into_response(),
        Err(e) => error_response(e),
    }
}

async fn write_content(State(state): State<Arc<AppState>>, AxumPath(path): AxumPath<String>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    let if_match = headers.get("if-match").and_then(|v| v.to_str().ok()).unwrap_or("none");
    match state.content.write(&path, &body, if_match) {
        Ok(etag) => Json(json!({"ok": true, "etag": etag})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn run_data_request(State(state): State<Arc<AppState>>, Json(req): Json<DataRequest>) -> impl IntoResponse {
    let response = state.data.dispatch(req, &state.self_id, true).await;
    Json(response)
}

#[derive(Deserialize)]
struct MqSendRequest {
    peer_id: String,
    topic: String,
    payload: serde_json::Value,
}

async fn mq_send(State(state): State<Arc<AppState>>, Json(req): Json<MqSendRequest>) -> impl IntoResponse {
    match state.mq.send(&PeerId::new(req.peer_id), req.topic, req.payload).await {
        Ok(msg_id) => Json(json!({"ok": true, "msg_id": msg_id})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct MqAckRequest {
    id: String,
}

async fn mq_ack(State(state): State<Arc<AppState>>, Json(req): Json<MqAckRequest>) -> impl IntoResponse {
    state.mq.ack(req.id);
    Json(json!({"ok": true}))
}

async fn mq_events(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (sub_id, sub) = state.mq.subscribe();
    let mq = Arc::clone(&state.mq);
    let inner = stream::unfold(Vec::new(), move |mut buffer: Vec<crate::mq::MqMessage>| {
        let sub = Arc::clone(&sub);
        async move {
            loop {
                if let Some(msg) = buffer.pop() {
                    return Some((Ok(to_sse(&msg, "mq")), buffer));
                }
                match tokio::time::timeout(Duration::from_secs(25), sub.notified()).await {
                    Ok(()) => {
                        buffer = sub.drain();
                        buffer.reverse();
                        continue;
                    }
                    Err(_elapsed) => return Some((Ok(SseEvent::default().comment("keepalive")), buffer)),
                }
            }
        }
    });
    let wrapped = UnsubscribeOnDrop { inner, mq, sub_id };
    Sse::new(wrapped).keep_alive(KeepAlive::default())
}

pin_project_lite::pin_project! {
    struct UnsubscribeOnDrop<S> {
        #[pin]
        inner: S,
        mq: Arc<Mq>,
        sub_id: uuid::Uuid,
    }
}

impl<S> Stream for UnsubscribeOnDrop<S>
where
    S: Stream<Item = Result<SseEvent, Infallible>>,
{
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        let this = self.project();
        this.inner.poll_next(cx)
    }
}

impl<S> Drop for UnsubscribeOnDrop<S> {
    fn drop(&mut self) {
        self.mq.unsubscribe(&self.sub_id);
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "self_id": state.self_id.to_string(),
        "known_peers": state.presence.snapshot().len(),
    }))
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "local HTTP surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}
