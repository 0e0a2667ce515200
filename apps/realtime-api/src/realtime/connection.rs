//! One WebSocket peer: outbound queue, joined channels, claims, and the
//! per-event message handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use selfbase_common::id::prefix;
use selfbase_common::PrefixedId;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::jwt::{Claims, JwtVerifier};
use crate::rls::AuthContext;

use super::channel::ChannelSub;
use super::events::{
    broadcast_payload, reply_error, reply_ok, AccessTokenPayload, BroadcastPayload, ClientEvent,
    EventName, JoinPayload, PresencePayload, ReplyReason, PHOENIX_TOPIC,
};
use super::hub::{Hub, JoinError};
use super::presence::{diff_payload, single_key, state_payload, PresenceMap};
use super::protocol::{encode, Message};

/// State for a single WebSocket connection.
pub struct Connection {
    /// Process-unique ID (`conn_` prefixed ULID).
    id: String,
    sender: mpsc::Sender<String>,
    /// Joined channels by topic.
    subs: Mutex<HashMap<String, Arc<ChannelSub>>>,
    claims: RwLock<Option<Claims>>,
    closed: AtomicBool,
}

impl PrefixedId for Connection {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl Connection {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            id: Self::generate(),
            sender,
            subs: Mutex::new(HashMap::new()),
            claims: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue `msg` for the write loop without waiting.
    ///
    /// A full queue drops the message. Returns whether it was queued.
    pub fn send(&self, msg: &Message) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.sender.try_send(encode(msg)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = %self.id,
                    topic = %msg.topic,
                    event = %msg.event,
                    "send queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(conn_id = %self.id, "send queue closed");
                false
            }
        }
    }

    pub fn claims(&self) -> Option<Claims> {
        self.claims.read().clone()
    }

    pub fn set_claims(&self, claims: Claims) {
        *self.claims.write() = Some(claims);
    }

    /// The RLS context for this connection; anonymous until a token is
    /// supplied.
    pub fn auth_context(&self) -> AuthContext {
        self.claims
            .read()
            .as_ref()
            .map(AuthContext::from_claims)
            .unwrap_or_else(AuthContext::anonymous)
    }

    pub fn subscription(&self, topic: &str) -> Option<Arc<ChannelSub>> {
        self.subs.lock().get(topic).cloned()
    }

    pub(crate) fn insert_subscription(&self, sub: Arc<ChannelSub>) {
        self.subs.lock().insert(sub.topic.clone(), sub);
    }

    pub(crate) fn remove_subscription(&self, topic: &str) -> Option<Arc<ChannelSub>> {
        self.subs.lock().remove(topic)
    }

    pub(crate) fn take_subscriptions(&self) -> HashMap<String, Arc<ChannelSub>> {
        std::mem::take(&mut *self.subs.lock())
    }

    /// Mark the connection closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Dispatch one decoded inbound message.
///
/// Errors are answered on the offending topic and never end the connection.
pub fn handle_message(hub: &Hub, verifier: &JwtVerifier, conn: &Arc<Connection>, msg: Message) {
    let event = match ClientEvent::parse(&msg) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(conn_id = %conn.id(), topic = %msg.topic, event = %msg.event, error = %e, "invalid payload");
            conn.send(&reply_error(&msg, ReplyReason::INVALID_PAYLOAD));
            return;
        }
    };

    match event {
        ClientEvent::Heartbeat => {
            let mut reply = reply_ok(&msg, json!({}));
            reply.topic = PHOENIX_TOPIC.to_string();
            conn.send(&reply);
        }
        ClientEvent::Join(payload) => handle_join(hub, verifier, conn, &msg, payload),
        ClientEvent::Leave => handle_leave(hub, conn, &msg),
        ClientEvent::Broadcast(payload) => handle_broadcast(hub, conn, &msg, payload),
        ClientEvent::Presence(payload) => handle_presence(hub, conn, &msg, payload),
        ClientEvent::AccessToken(payload) => handle_access_token(verifier, conn, payload),
        ClientEvent::Other(event) => {
            tracing::debug!(conn_id = %conn.id(), topic = %msg.topic, %event, "ignoring unknown event");
        }
    }
}

fn handle_join(
    hub: &Hub,
    verifier: &JwtVerifier,
    conn: &Arc<Connection>,
    msg: &Message,
    payload: JoinPayload,
) {
    if let Some(token) = payload.access_token.as_deref().filter(|t| !t.is_empty()) {
        match verifier.parse(token) {
            Ok(claims) => conn.set_claims(claims),
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), topic = %msg.topic, error = %e, "join token rejected");
                conn.send(&reply_error(msg, ReplyReason::INVALID_TOKEN));
                return;
            }
        }
    }

    let postgres_changes = payload.postgres_change_subs();
    let presence_key = payload.presence_key().map(str::to_string);
    let sub = ChannelSub {
        conn: conn.clone(),
        topic: msg.topic.clone(),
        join_ref: msg.join_ref.clone(),
        broadcast: payload.config.broadcast.unwrap_or_default(),
        presence_key,
        postgres_changes: postgres_changes.clone(),
    };

    let joined = match hub.subscribe(sub, payload.config.private, conn.claims().is_some()) {
        Ok(joined) => joined,
        Err(JoinError::Unauthorized) => {
            conn.send(&reply_error(msg, ReplyReason::UNAUTHORIZED));
            return;
        }
        // Torn down while the join was in flight.
        Err(JoinError::Closed) => return,
    };

    conn.send(&reply_ok(msg, json!({ "postgres_changes": postgres_changes })));

    if joined.presence_was_enabled {
        if let Some(presence) = joined.channel.presence() {
            let snapshot = Message::new(
                msg.topic.clone(),
                EventName::PRESENCE_STATE,
                state_payload(&presence.get_state()),
            )
            .with_join_ref(msg.join_ref.clone());
            conn.send(&snapshot);
        }
    }

    tracing::debug!(
        conn_id = %conn.id(),
        topic = %msg.topic,
        private = joined.channel.is_private(),
        "joined channel"
    );
}

fn handle_leave(hub: &Hub, conn: &Arc<Connection>, msg: &Message) {
    match hub.unsubscribe(conn, &msg.topic) {
        Ok(()) => {
            conn.send(&reply_ok(msg, json!({})));
            tracing::debug!(conn_id = %conn.id(), topic = %msg.topic, "left channel");
        }
        Err(_) => {
            conn.send(&reply_error(msg, ReplyReason::NOT_JOINED));
        }
    }
}

fn handle_broadcast(hub: &Hub, conn: &Arc<Connection>, msg: &Message, payload: BroadcastPayload) {
    let Some(sender_sub) = conn.subscription(&msg.topic) else {
        return;
    };
    let Some(channel) = hub.channel(&msg.topic) else {
        return;
    };

    let out = Message::new(
        msg.topic.clone(),
        EventName::BROADCAST,
        broadcast_payload(&payload.event, &payload.payload),
    );
    for sub in channel.subscribers() {
        if sub.conn_id() == conn.id() && !sub.broadcast.echo_self {
            continue;
        }
        sub.conn.send(&out);
    }

    if sender_sub.broadcast.ack {
        conn.send(&reply_ok(msg, json!({})));
    }
}

fn handle_presence(hub: &Hub, conn: &Arc<Connection>, msg: &Message, payload: PresencePayload) {
    let Some(sub) = conn.subscription(&msg.topic) else {
        return;
    };
    let Some(key) = sub.presence_key.as_deref() else {
        return;
    };
    let Some(channel) = hub.channel(&msg.topic) else {
        return;
    };
    let Some(presence) = channel.presence() else {
        return;
    };

    let diff = match payload.event.as_str() {
        "track" => {
            let meta = presence.track(key, conn.id(), object_or_empty(payload.payload));
            diff_payload(&single_key(key, vec![meta]), &PresenceMap::new())
        }
        "untrack" => {
            let gone = presence.untrack(key, conn.id());
            if gone.is_empty() {
                conn.send(&reply_ok(msg, json!({})));
                return;
            }
            diff_payload(&PresenceMap::new(), &single_key(key, gone))
        }
        other => {
            tracing::debug!(conn_id = %conn.id(), topic = %msg.topic, event = %other, "unknown presence event");
            return;
        }
    };

    channel.send_to_all(
        &Message::new(msg.topic.clone(), EventName::PRESENCE_DIFF, diff),
        None,
    );
    conn.send(&reply_ok(msg, json!({})));
}

fn handle_access_token(verifier: &JwtVerifier, conn: &Connection, payload: AccessTokenPayload) {
    match verifier.parse(&payload.access_token) {
        Ok(claims) => {
            conn.set_claims(claims);
            tracing::debug!(conn_id = %conn.id(), "access token refreshed");
        }
        Err(e) => {
            tracing::warn!(conn_id = %conn.id(), error = %e, "access token refresh rejected, keeping previous claims");
        }
    }
}

fn object_or_empty(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
