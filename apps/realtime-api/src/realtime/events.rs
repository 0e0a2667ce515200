//! Event names and typed payload variants carried inside [`Message`]s.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::filter::matches_filter;
use super::protocol::Message;

/// A database row image.
pub type Row = Map<String, Value>;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub struct EventName;

impl EventName {
    pub const JOIN: &'static str = "phx_join";
    pub const LEAVE: &'static str = "phx_leave";
    pub const REPLY: &'static str = "phx_reply";
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const ACCESS_TOKEN: &'static str = "access_token";
    pub const PRESENCE: &'static str = "presence";
    pub const BROADCAST: &'static str = "broadcast";
    pub const PRESENCE_STATE: &'static str = "presence_state";
    pub const PRESENCE_DIFF: &'static str = "presence_diff";
    pub const POSTGRES_CHANGES: &'static str = "postgres_changes";
}

/// Events that keep their name when they arrive in a binary frame.
pub const CONTROL_EVENTS: [&str; 5] = [
    EventName::JOIN,
    EventName::LEAVE,
    EventName::HEARTBEAT,
    EventName::ACCESS_TOKEN,
    EventName::PRESENCE,
];

/// Topic used for connection-level traffic such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Reasons carried in error replies.
pub struct ReplyReason;

impl ReplyReason {
    pub const INVALID_TOKEN: &'static str = "invalid_token";
    pub const UNAUTHORIZED: &'static str = "unauthorized";
    pub const NOT_JOINED: &'static str = "not_joined";
    pub const INVALID_PAYLOAD: &'static str = "invalid_payload";
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// `phx_reply` with status `ok`, echoing the request's topic and refs.
pub fn reply_ok(request: &Message, response: Value) -> Message {
    reply(request, "ok", response)
}

/// `phx_reply` with status `error` and `{"reason": reason}`.
pub fn reply_error(request: &Message, reason: &str) -> Message {
    reply(request, "error", json!({ "reason": reason }))
}

fn reply(request: &Message, status: &str, response: Value) -> Message {
    Message::new(
        request.topic.clone(),
        EventName::REPLY,
        json!({ "status": status, "response": response }),
    )
    .with_ref(request.msg_ref.clone())
    .with_join_ref(request.join_ref.clone())
}

// ---------------------------------------------------------------------------
// Client → server payloads
// ---------------------------------------------------------------------------

/// Options controlling how a subscriber takes part in broadcasts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BroadcastOptions {
    /// Reply `ok` to the sender after relaying its broadcast.
    #[serde(default)]
    pub ack: bool,
    /// Deliver the sender's own broadcasts back to it.
    #[serde(default, rename = "self")]
    pub echo_self: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresenceOptions {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventFilter {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT", alias = "insert")]
    Insert,
    #[serde(rename = "UPDATE", alias = "update")]
    Update,
    #[serde(rename = "DELETE", alias = "delete")]
    Delete,
}

impl ChangeEventFilter {
    pub fn accepts(self, event_type: ChangeEventType) -> bool {
        match self {
            ChangeEventFilter::All => true,
            ChangeEventFilter::Insert => event_type == ChangeEventType::Insert,
            ChangeEventFilter::Update => event_type == ChangeEventType::Update,
            ChangeEventFilter::Delete => event_type == ChangeEventType::Delete,
        }
    }
}

fn wildcard() -> String {
    "*".to_string()
}

fn public_schema() -> String {
    "public".to_string()
}

fn all_events() -> ChangeEventFilter {
    ChangeEventFilter::All
}

/// One `postgres_changes` entry of a join request, before an ID is assigned.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresChangeRequest {
    #[serde(default = "all_events")]
    pub event: ChangeEventFilter,
    #[serde(default = "public_schema")]
    pub schema: String,
    #[serde(default = "wildcard")]
    pub table: String,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinConfig {
    #[serde(default)]
    pub broadcast: Option<BroadcastOptions>,
    #[serde(default)]
    pub presence: Option<PresenceOptions>,
    #[serde(default)]
    pub postgres_changes: Option<Vec<PostgresChangeRequest>>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinPayload {
    #[serde(default)]
    pub config: JoinConfig,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl JoinPayload {
    /// The presence key, if the joiner asked for presence.
    pub fn presence_key(&self) -> Option<&str> {
        self.config
            .presence
            .as_ref()
            .map(|p| p.key.as_str())
            .filter(|k| !k.is_empty())
    }

    /// Assign 1-based IDs to the requested postgres-change subscriptions, in
    /// request order.
    pub fn postgres_change_subs(&self) -> Vec<PostgresChangeSub> {
        self.config
            .postgres_changes
            .iter()
            .flatten()
            .zip(1u32..)
            .map(|(req, id)| PostgresChangeSub {
                id,
                event: req.event,
                schema: req.schema.clone(),
                table: req.table.clone(),
                filter: req.filter.clone().filter(|f| !f.is_empty()),
            })
            .collect()
    }
}

/// `{"type":"broadcast","event":..,"payload":..}` as sent by clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcastPayload {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// `{"type":"presence","event":"track"|"untrack","payload":..}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresencePayload {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessTokenPayload {
    #[serde(default)]
    pub access_token: String,
}

/// An inbound message decoded into the variant matching its event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Heartbeat,
    Join(JoinPayload),
    Leave,
    Broadcast(BroadcastPayload),
    Presence(PresencePayload),
    AccessToken(AccessTokenPayload),
    /// Anything else; kept for forward compatibility.
    Other(String),
}

impl ClientEvent {
    pub fn parse(msg: &Message) -> Result<Self, serde_json::Error> {
        Ok(match msg.event.as_str() {
            EventName::HEARTBEAT => ClientEvent::Heartbeat,
            EventName::JOIN => ClientEvent::Join(typed_payload(msg)?),
            EventName::LEAVE => ClientEvent::Leave,
            EventName::BROADCAST => ClientEvent::Broadcast(typed_payload(msg)?),
            EventName::PRESENCE => ClientEvent::Presence(typed_payload(msg)?),
            EventName::ACCESS_TOKEN => ClientEvent::AccessToken(typed_payload(msg)?),
            other => ClientEvent::Other(other.to_string()),
        })
    }
}

fn typed_payload<T: DeserializeOwned + Default>(msg: &Message) -> Result<T, serde_json::Error> {
    if msg.payload.is_null() {
        return Ok(T::default());
    }
    T::deserialize(&msg.payload)
}

// ---------------------------------------------------------------------------
// Server → client payloads
// ---------------------------------------------------------------------------

/// `{"type":"broadcast","event":..,"payload":..}` relayed to subscribers.
pub fn broadcast_payload(event: &str, payload: &Value) -> Value {
    json!({ "type": "broadcast", "event": event, "payload": payload })
}

// ---------------------------------------------------------------------------
// Postgres changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventType {
    #[serde(rename = "INSERT", alias = "insert")]
    Insert,
    #[serde(rename = "UPDATE", alias = "update")]
    Update,
    #[serde(rename = "DELETE", alias = "delete")]
    Delete,
}

/// A join-time subscription to row changes, with its server-assigned ID.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostgresChangeSub {
    pub id: u32,
    pub event: ChangeEventFilter,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangeSub {
    /// Event, schema and table match (`*` is a wildcard) and the filter, if
    /// any, holds.
    pub fn matches(&self, change: &ChangeEvent) -> bool {
        self.event.accepts(change.event_type)
            && (self.schema == "*" || self.schema == change.schema)
            && (self.table == "*" || self.table == change.table)
            && self.filter.as_deref().map_or(true, |f| {
                matches_filter(f, change.record.as_ref(), change.old_record.as_ref())
            })
    }
}

/// A committed row mutation reported by the data layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub event_type: ChangeEventType,
    /// Post-image; `None` for deletes.
    pub record: Option<Row>,
    /// Pre-image; `None` for inserts.
    pub old_record: Option<Row>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        event_type: ChangeEventType,
        old_record: Option<Row>,
        record: Option<Row>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event_type,
            record,
            old_record,
            commit_timestamp: Utc::now(),
        }
    }

    /// The row a subscriber must be allowed to see: the post-image for
    /// inserts and updates, the pre-image for deletes.
    pub fn visible_row(&self) -> Option<&Row> {
        match self.event_type {
            ChangeEventType::Insert | ChangeEventType::Update => self.record.as_ref(),
            ChangeEventType::Delete => self.old_record.as_ref(),
        }
    }

    /// The `postgres_changes` payload for the given matched subscription IDs.
    pub fn to_payload(&self, ids: &[u32]) -> Value {
        #[derive(Serialize)]
        struct Data<'a> {
            schema: &'a str,
            table: &'a str,
            commit_timestamp: DateTime<Utc>,
            #[serde(rename = "type")]
            event_type: ChangeEventType,
            #[serde(skip_serializing_if = "Option::is_none")]
            record: Option<&'a Row>,
            #[serde(skip_serializing_if = "Option::is_none")]
            old_record: Option<&'a Row>,
            errors: Option<Vec<String>>,
        }

        json!({
            "ids": ids,
            "data": Data {
                schema: &self.schema,
                table: &self.table,
                commit_timestamp: self.commit_timestamp,
                event_type: self.event_type,
                record: self.record.as_ref(),
                old_record: self.old_record.as_ref(),
                errors: None,
            },
        })
    }
}
