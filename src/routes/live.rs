//! Live push over WebSocket, plus operator notices.
//!
//! A connection subscribes to exactly one site. It first receives a SYSTEM
//! welcome frame, then every DATA, ALARM, STAT and SYSTEM envelope for that
//! site (and system-wide broadcasts) as JSON text frames. Inbound frames are
//! ignored except for close.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::AppState;
use crate::{Envelope, PushHub, SiteId};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/ws/realtime/{site_id}", get(realtime))
        .route("/notices", post(notice))
}

async fn realtime(
    State(state): State<AppState>,
    Path(site_id): Path<SiteId>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // ---
    let push = state.pipeline.push().clone();
    ws.on_upgrade(move |socket| serve_socket(socket, push, site_id))
}

async fn serve_socket(socket: WebSocket, push: PushHub, site_id: SiteId) {
    // ---
    let mut subscription = push.subscribe(site_id);
    let id = subscription.id();
    info!(site_id, subscriber = id, "live subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    let welcome = Envelope::system(&format!("subscribed to site {site_id}"), Some(site_id));
    if !send_envelope(&mut sender, &welcome).await {
        return;
    }

    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                // None: the hub dropped us as a slow consumer.
                let Some(envelope) = envelope else {
                    warn!(site_id, subscriber = id, "subscriber evicted");
                    break;
                };
                if !send_envelope(&mut sender, &envelope).await {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    info!(site_id, subscriber = id, "live subscriber disconnected");
}

/// Returns `false` once the socket is gone.
async fn send_envelope(sender: &mut SplitSink<WebSocket, Message>, envelope: &Envelope) -> bool {
    // ---
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode envelope: {e}");
            return true;
        }
    };
    match sender.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!("socket closed while sending: {e}");
            false
        }
    }
}

#[derive(Debug, Deserialize)]
struct NoticeRequest {
    message: String,
    #[serde(default)]
    site_id: Option<SiteId>,
}

/// `POST /notices`: SYSTEM envelope to one site, or to everyone.
async fn notice(
    State(state): State<AppState>,
    Json(request): Json<NoticeRequest>,
) -> impl IntoResponse {
    // ---
    let envelope = Envelope::system(&request.message, request.site_id);
    let push = state.pipeline.push();
    let delivery = match request.site_id {
        Some(site_id) => push.publish(site_id, envelope),
        None => push.broadcast(envelope),
    };
    info!(
        site_id = ?request.site_id,
        delivered = delivery.delivered,
        "notice published"
    );
    (StatusCode::ACCEPTED, Json(delivery))
}
