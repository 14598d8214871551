//! WebSocket endpoints.
//!
//! `/ws/notifications/` delivers per-user notifications (plus pharmacy-wide
//! summaries for staff) and tracks which thread the user is looking at.
//! `/ws/messages/<thread>/` is the live chat of one thread.

use std::convert::Infallible;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Body, Request, Response};
use hyper::upgrade::Upgraded;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tracing::{debug, info, warn};

use crate::accounts::Principal;
use crate::effects::Group;
use crate::hub::ConnId;
use crate::messaging::{self, NewMessage};
use crate::state::AppState;
use crate::store::Database;


/// Frames queued per connection before new ones are dropped.
const OUTGOING_BUFFER: usize = 64;

static MESSAGES_PATH_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(
    "^/ws/messages/(?P<thread>[0-9]+)/?$"
).expect("failed to compile regex"));


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Channel {
    Notifications,
    Messages(u64),
}

pub(crate) fn channel_for_path(path: &str) -> Option<Channel> {
    if path == "/ws/notifications/" || path == "/ws/notifications" {
        return Some(Channel::Notifications);
    }
    let caps = MESSAGES_PATH_REGEX.captures(path)?;
    caps.name("thread")?
        .as_str()
        .parse()
        .ok()
        .map(Channel::Messages)
}

/// The groups a connection joins.
pub(crate) fn groups_for(db: &Database, principal: &Principal, channel: Channel) -> Vec<Group> {
    match channel {
        Channel::Notifications => {
            let mut groups = vec![Group::User(principal.account_id)];
            if let Some(pharmacy_id) = db.pharmacy_of(principal.account_id) {
                groups.push(Group::Pharmacy(pharmacy_id));
            }
            groups
        },
        Channel::Messages(thread_id) => vec![Group::Thread(thread_id)],
    }
}


#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NotificationFrame {
    SetCurrentThread {
        #[serde(default)]
        thread_id: Option<u64>,
    },
}

#[derive(Debug, Deserialize, PartialEq)]
struct ChatFrame {
    content: String,
}


fn respond_ws_400(message: &'static str) -> Result<Response<Body>, Infallible> {
    let resp = Response::builder()
        .status(400)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Body::from(format!("400 Bad Request: {}", message)))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    Ok(resp)
}

/// Answers the handshake and hands the upgraded connection to a consumer task.
pub(crate) async fn upgrade(
    state: Arc<AppState>,
    request: Request<Body>,
    principal: Principal,
    channel: Channel,
) -> Result<Response<Body>, Infallible> {
    let is_websocket = request.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let accept_key = match request.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) if is_websocket => derive_accept_key(key.as_bytes()),
        _ => return respond_ws_400("expected a WebSocket handshake"),
    };

    if let Channel::Messages(thread_id) = channel {
        let db = state.db.read().await;
        if messaging::ensure_participant(&db, principal.account_id, thread_id).is_err() {
            return crate::respond_403();
        }
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(upgraded, WsRole::Server, None).await;
                serve(state, principal, channel, socket).await;
            },
            Err(e) => warn!("WebSocket upgrade failed: {}", e),
        }
    });

    let resp = Response::builder()
        .status(101)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Body::empty());
    match resp {
        Ok(r) => Ok(r),
        Err(e) => {
            warn!("failed to assemble 101 response: {}", e);
            crate::respond_500()
        },
    }
}

async fn serve(state: Arc<AppState>, principal: Principal, channel: Channel, socket: WebSocketStream<Upgraded>) {
    let user_id = principal.account_id;
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTGOING_BUFFER);

    let groups = {
        let db = state.db.read().await;
        groups_for(&db, &principal, channel)
    };
    let conn = state.hub.register(user_id, groups, tx);
    info!(user_id, conn, ?channel, connections = state.hub.connection_count(), "socket connected");

    let sender = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if let Channel::Messages(thread_id) = channel {
        state.hub.set_viewing(user_id, conn, Some(thread_id));
        open_thread(&state, user_id, thread_id).await;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, user_id, conn, channel, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {},
            Err(e) => {
                debug!(user_id, conn, "socket error: {}", e);
                break;
            },
        }
    }

    // the hub held the only senders; dropping them ends the writer task
    state.hub.unregister(user_id, conn);
    let _ = sender.await;
    info!(user_id, conn, "socket disconnected");
}

async fn open_thread(state: &Arc<AppState>, user_id: u64, thread_id: u64) {
    let outcome = state.mutate(|db| {
        let effects = messaging::mark_thread_read(db, user_id, thread_id)?;
        Ok(((), effects))
    }).await;
    if let Err(e) = outcome {
        debug!(user_id, thread_id, "could not mark thread read: {}", e);
    }
}

async fn handle_text(state: &Arc<AppState>, user_id: u64, conn: ConnId, channel: Channel, text: &str) {
    match channel {
        Channel::Notifications => {
            let frame: NotificationFrame = match serde_json::from_str(text) {
                Ok(f) => f,
                Err(e) => {
                    debug!(user_id, "ignoring notification frame: {}", e);
                    return;
                },
            };
            match frame {
                NotificationFrame::SetCurrentThread { thread_id } => {
                    state.hub.set_viewing(user_id, conn, thread_id);
                    if let Some(thread_id) = thread_id {
                        open_thread(state, user_id, thread_id).await;
                    }
                },
            }
        },
        Channel::Messages(thread_id) => {
            let frame: ChatFrame = match serde_json::from_str(text) {
                Ok(f) => f,
                Err(e) => {
                    debug!(user_id, "ignoring chat frame: {}", e);
                    return;
                },
            };
            let outcome = state.mutate(|db| {
                messaging::post_message(db, &state.hub, user_id, thread_id, NewMessage::text(frame.content), Utc::now())
            }).await;
            match outcome {
                Ok(message_id) => debug!(user_id, thread_id, message_id, "message posted"),
                Err(e) => debug!(user_id, thread_id, "message rejected: {}", e),
            }
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::testutil::Fixture;

    #[test]
    fn paths_map_to_channels() {
        assert_eq!(channel_for_path("/ws/notifications/"), Some(Channel::Notifications));
        assert_eq!(channel_for_path("/ws/messages/12/"), Some(Channel::Messages(12)));
        assert_eq!(channel_for_path("/ws/messages/12"), Some(Channel::Messages(12)));
        assert_eq!(channel_for_path("/ws/messages/abc/"), None);
        assert_eq!(channel_for_path("/ws/other/"), None);
    }

    #[test]
    fn staff_join_their_pharmacy_group() {
        let fx = Fixture::new();
        let staff = Principal { account_id: fx.pharmacist_user, role: Role::Pharmacist };
        let patient = Principal { account_id: fx.patient_user, role: Role::Patient };

        assert_eq!(
            groups_for(&fx.db, &staff, Channel::Notifications),
            vec![Group::User(fx.pharmacist_user), Group::Pharmacy(fx.pharmacy)],
        );
        assert_eq!(groups_for(&fx.db, &patient, Channel::Notifications), vec![Group::User(fx.patient_user)]);
        assert_eq!(groups_for(&fx.db, &patient, Channel::Messages(3)), vec![Group::Thread(3)]);
    }

    #[test]
    fn incoming_frames_parse() {
        let frame: NotificationFrame = serde_json::from_str(r#"{"type":"set_current_thread","thread_id":4}"#).unwrap();
        assert_eq!(frame, NotificationFrame::SetCurrentThread { thread_id: Some(4) });
        let frame: NotificationFrame = serde_json::from_str(r#"{"type":"set_current_thread","thread_id":null}"#).unwrap();
        assert_eq!(frame, NotificationFrame::SetCurrentThread { thread_id: None });
        assert!(serde_json::from_str::<NotificationFrame>(r#"{"type":"dance"}"#).is_err());

        let chat: ChatFrame = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(chat.content, "hello");
    }
}
