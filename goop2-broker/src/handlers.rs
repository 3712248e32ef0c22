//! HTTP handlers: `/publish`, `/events`, `/peers.json`, `/healthz`.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{http::StatusCode, Json};
use futures_util::stream::{self, Stream};
use goop2_proto::presence::{validate_publish, PresenceEvent, PresenceEventType, PresenceRecord, PublishBody, MAX_PUBLISH_BODY_BYTES};
use pin_project_lite::pin_project;
use serde_json::json;

use crate::state::BrokerState;

/// `POST /publish` — upsert or remove a presence record, fan out the event.
pub async fn publish(State(state): State<Arc<BrokerState>>, body: axum::body::Bytes) -> impl IntoResponse {
    if body.len() > MAX_PUBLISH_BODY_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({"error": "body too large"}))).into_response();
    }
    let parsed: PublishBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({"error": format!("bad json: {e}")}))).into_response(),
    };
    if let Err(e) = validate_publish(&parsed) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": e.message()}))).into_response();
    }

    match parsed.kind {
        PresenceEventType::Offline => {
            let peer_id = goop2_proto::PeerId::new(parsed.peer_id.clone());
            state.remove(&peer_id);
            state.fan_out(PresenceEvent::Offline { peer_id });
        }
        PresenceEventType::Online => {
            let record = PresenceRecord::from_publish(&parsed);
            let is_new = state.upsert(record.clone());
            let event = if is_new { PresenceEvent::Online { peer: record } } else { PresenceEvent::Update { peer: record } };
            state.fan_out(event);
        }
        PresenceEventType::Update => {
            let record = PresenceRecord::from_publish(&parsed);
            state.upsert(record.clone());
            state.fan_out(PresenceEvent::Update { peer: record });
        }
    }

    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

struct UnfoldState {
    subscriber: Arc<crate::state::Subscriber>,
    buffer: VecDeque<PresenceEvent>,
}

pin_project! {
    /// Wraps the SSE event stream so the subscriber's table entry is
    /// removed the moment the client disconnects and axum drops the
    /// stream — a broker subscriber never outlives its connection.
    struct UnsubscribeOnDrop<S> {
        #[pin]
        inner: S,
        broker: Arc<BrokerState>,
        sub_id: uuid::Uuid,
    }
}

impl<S> Stream for UnsubscribeOnDrop<S>
where
    S: Stream<Item = Result<SseEvent, Infallible>>,
{
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        this.inner.poll_next(cx)
    }
}

impl<S> Drop for UnsubscribeOnDrop<S> {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.sub_id);
    }
}

/// `GET /events` — SSE stream: a `snapshot` first, then live events.
///
/// One slow subscriber can never delay another: each subscriber drains its
/// own bounded ring on its own task, and publishers only ever push (never
/// await a reader).
pub async fn events(State(state): State<Arc<BrokerState>>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (sub_id, subscriber) = state.subscribe();
    let snapshot = state.snapshot();

    let init = UnfoldState {
        subscriber,
        buffer: VecDeque::from([PresenceEvent::Snapshot { peers: snapshot }]),
    };

    let inner = stream::unfold(init, |mut st| async move {
        loop {
            if let Some(event) = st.buffer.pop_front() {
                let sse = to_sse_event(&event);
                return Some((Ok(sse), st));
            }

            match tokio::time::timeout(Duration::from_secs(25), st.subscriber.notify.notified()).await {
                Ok(()) => {
                    st.buffer.extend(st.subscriber.drain());
                    continue;
                }
                Err(_elapsed) => {
                    return Some((Ok(SseEvent::default().comment("keepalive")), st));
                }
            }
        }
    });

    let wrapped = UnsubscribeOnDrop { inner, broker: state, sub_id };
    Sse::new(wrapped).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &PresenceEvent) -> SseEvent {
    let name = match event {
        PresenceEvent::Snapshot { .. } => "snapshot",
        PresenceEvent::Online { .. } => "online",
        PresenceEvent::Update { .. } => "update",
        PresenceEvent::Offline { .. } => "offline",
    };
    SseEvent::default().event(name).json_data(event).unwrap_or_else(|_| SseEvent::default())
}

/// `GET /peers.json` — a point-in-time snapshot of the peer table.
pub async fn peers_json(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

/// `GET /healthz` — liveness plus light metrics.
pub async fn healthz(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "peer_count": state.peers.len(),
        "sse_clients": state.subscribers.len(),
    }))
}
