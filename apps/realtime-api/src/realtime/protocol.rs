//! Wire codec: three inbound encodings, one canonical [`Message`].
//!
//! Inbound frames arrive as a JSON array `[join_ref, ref, topic, event, payload]`,
//! a JSON object with the same five keys, or a length-prefixed binary frame.
//! Outbound frames are always the JSON array form.

use serde_json::{json, Map, Value};

use super::events::{EventName, CONTROL_EVENTS};

/// The canonical in-memory wire unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Empty unless the message is scoped to a channel join.
    pub join_ref: String,
    /// Client correlation reference, opaque to the server.
    pub msg_ref: String,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Message {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: String::new(),
            msg_ref: String::new(),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = msg_ref.into();
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = join_ref.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("binary frame header too short ({0} bytes)")]
    ShortHeader(usize),
    #[error("binary frame truncated before {0}")]
    Truncated(&'static str),
    #[error("binary frame has no JSON payload")]
    MissingPayload,
    #[error("binary frame field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("array frame must have 5 elements, got {0}")]
    ArrayLength(usize),
    #[error("frame field {0} has the wrong type")]
    FieldType(&'static str),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which inbound encoding a frame uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Array,
    Object,
    Binary,
}

/// Largest first byte that marks a binary frame.
pub const MAX_BINARY_KIND: u8 = 10;

/// Kind byte plus two big-endian u16 lengths (topic, event).
pub const BINARY_HEADER_LEN: usize = 5;

/// Pick the decoding strategy for a frame.
///
/// Leading whitespace is only skipped when looking for the array form. Any
/// other frame starting with a byte `<= 10` is binary, including TAB and LF.
pub fn detect(bytes: &[u8]) -> Result<Encoding, DecodeError> {
    let first = *bytes.first().ok_or(DecodeError::Empty)?;
    if bytes.trim_ascii_start().first() == Some(&b'[') {
        return Ok(Encoding::Array);
    }
    if first <= MAX_BINARY_KIND {
        return Ok(Encoding::Binary);
    }
    Ok(Encoding::Object)
}

/// Decode one inbound frame.
///
/// Binary frames are normalized afterwards so user-defined events arrive as
/// `broadcast`, the same as they would in the JSON encodings.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    match detect(bytes)? {
        Encoding::Array => decode_array(bytes),
        Encoding::Object => decode_object(bytes),
        Encoding::Binary => decode_binary(bytes).map(normalize_binary),
    }
}

/// Encode an outbound message as `[join_ref, ref, topic, event, payload]`.
/// Empty references are written as `null`.
pub fn encode(msg: &Message) -> String {
    json!([
        ref_or_null(&msg.join_ref),
        ref_or_null(&msg.msg_ref),
        msg.topic,
        msg.event,
        msg.payload,
    ])
    .to_string()
}

fn ref_or_null(r: &str) -> Value {
    if r.is_empty() {
        Value::Null
    } else {
        Value::String(r.to_string())
    }
}

/// `null` and missing references become empty strings; numeric references
/// are accepted as their decimal text.
fn ref_string(value: Option<Value>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(DecodeError::FieldType(field)),
    }
}

fn required_string(value: Option<Value>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(DecodeError::FieldType(field)),
    }
}

// ---------------------------------------------------------------------------
// JSON array form
// ---------------------------------------------------------------------------

pub fn decode_array(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Array(items) = value else {
        return Err(DecodeError::FieldType("frame"));
    };
    if items.len() != 5 {
        return Err(DecodeError::ArrayLength(items.len()));
    }

    let mut items = items.into_iter();
    let join_ref = ref_string(items.next(), "join_ref")?;
    let msg_ref = ref_string(items.next(), "ref")?;
    let topic = required_string(items.next(), "topic")?;
    let event = required_string(items.next(), "event")?;
    let payload = items.next().unwrap_or(Value::Null);

    Ok(Message {
        join_ref,
        msg_ref,
        topic,
        event,
        payload,
    })
}

// ---------------------------------------------------------------------------
// JSON object form
// ---------------------------------------------------------------------------

pub fn decode_object(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::FieldType("frame"));
    };

    Ok(Message {
        join_ref: ref_string(map.remove("join_ref"), "join_ref")?,
        msg_ref: ref_string(map.remove("ref"), "ref")?,
        topic: required_string(map.remove("topic"), "topic")?,
        event: required_string(map.remove("event"), "event")?,
        payload: map.remove("payload").unwrap_or(Value::Null),
    })
}

// ---------------------------------------------------------------------------
// Length-prefixed binary form
// ---------------------------------------------------------------------------
//
// byte 0        kind (<= 10)
// bytes 1..3    topic length (u16, big-endian)
// bytes 3..5    event length (u16, big-endian)
// then          join_ref_len (u8), join_ref, ref_len (u8), ref, topic, event
// then          JSON object payload, starting at the first `{`

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::Truncated(field))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_str(&mut self, len: usize, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.take(len, field)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8(field))
    }

    fn take_prefixed_str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.take(1, field)?[0] as usize;
        self.take_str(len, field)
    }
}

/// Parse a binary frame without reclassifying its event.
pub fn decode_binary(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < BINARY_HEADER_LEN {
        return Err(DecodeError::ShortHeader(bytes.len()));
    }
    let topic_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    let event_len = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;

    let mut cursor = Cursor {
        bytes,
        pos: BINARY_HEADER_LEN,
    };
    let join_ref = cursor.take_prefixed_str("join_ref")?;
    let msg_ref = cursor.take_prefixed_str("ref")?;
    let topic = cursor.take_str(topic_len, "topic")?;
    let event = cursor.take_str(event_len, "event")?;

    let rest = &bytes[cursor.pos..];
    let start = rest
        .iter()
        .position(|b| *b == b'{')
        .ok_or(DecodeError::MissingPayload)?;
    let payload: Map<String, Value> = serde_json::from_slice(&rest[start..])?;

    Ok(Message {
        join_ref,
        msg_ref,
        topic,
        event,
        payload: Value::Object(payload),
    })
}

/// Re-wrap user-defined binary events as broadcasts:
/// `{type: "broadcast", event: <event>, payload: <payload>}` under event `broadcast`.
pub fn normalize_binary(mut msg: Message) -> Message {
    if CONTROL_EVENTS.contains(&msg.event.as_str()) {
        return msg;
    }
    let original_event = std::mem::replace(&mut msg.event, EventName::BROADCAST.to_string());
    let original_payload = std::mem::take(&mut msg.payload);
    msg.payload = json!({
        "type": "broadcast",
        "event": original_event,
        "payload": original_payload,
    });
    msg
}

/// Encode a message in the binary form. Used by clients and tests; the server
/// itself only writes the array form.
pub fn encode_binary(kind: u8, msg: &Message) -> Result<Vec<u8>, DecodeError> {
    let topic_len =
        u16::try_from(msg.topic.len()).map_err(|_| DecodeError::FieldType("topic"))?;
    let event_len =
        u16::try_from(msg.event.len()).map_err(|_| DecodeError::FieldType("event"))?;
    let join_ref_len =
        u8::try_from(msg.join_ref.len()).map_err(|_| DecodeError::FieldType("join_ref"))?;
    let ref_len = u8::try_from(msg.msg_ref.len()).map_err(|_| DecodeError::FieldType("ref"))?;
    if !msg.payload.is_object() {
        return Err(DecodeError::FieldType("payload"));
    }

    let payload = serde_json::to_vec(&msg.payload)?;
    let mut out = Vec::with_capacity(
        BINARY_HEADER_LEN + 2 + msg.join_ref.len() + msg.msg_ref.len() + msg.topic.len()
            + msg.event.len()
            + payload.len(),
    );
    out.push(kind);
    out.extend_from_slice(&topic_len.to_be_bytes());
    out.extend_from_slice(&event_len.to_be_bytes());
    out.push(join_ref_len);
    out.extend_from_slice(msg.join_ref.as_bytes());
    out.push(ref_len);
    out.extend_from_slice(msg.msg_ref.as_bytes());
    out.extend_from_slice(msg.topic.as_bytes());
    out.extend_from_slice(msg.event.as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}
