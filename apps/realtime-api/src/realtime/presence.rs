//! Per-channel presence: which connections are tracking which key.
//!
//! A key maps to one meta per tracking connection. Re-tracking the same
//! (key, connection) pair replaces that meta and mints a fresh `phx_ref`;
//! keys with no metas left are dropped.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

/// One connection's tracked state under a key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceMeta {
    pub phx_ref: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(skip)]
    pub conn_id: String,
}

/// Key → metas, as returned by [`PresenceState::get_state`] and carried in diffs.
pub type PresenceMap = HashMap<String, Vec<PresenceMeta>>;

/// Thread-safe presence map for one channel.
#[derive(Default)]
pub struct PresenceState {
    entries: Mutex<PresenceMap>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `payload` for (`key`, `conn_id`), replacing any existing meta
    /// for that pair. Returns the meta now stored.
    pub fn track(&self, key: &str, conn_id: &str, mut payload: Map<String, Value>) -> PresenceMeta {
        payload.remove("phx_ref");
        let meta = PresenceMeta {
            phx_ref: selfbase_common::id::opaque_ref(),
            payload,
            conn_id: conn_id.to_string(),
        };

        let mut entries = self.entries.lock();
        let metas = entries.entry(key.to_string()).or_default();
        match metas.iter_mut().find(|m| m.conn_id == conn_id) {
            Some(existing) => *existing = meta.clone(),
            None => metas.push(meta.clone()),
        }
        meta
    }

    /// Remove the meta for (`key`, `conn_id`). Returns what was removed
    /// (zero or one metas).
    pub fn untrack(&self, key: &str, conn_id: &str) -> Vec<PresenceMeta> {
        let mut entries = self.entries.lock();
        let Some(metas) = entries.get_mut(key) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        metas.retain(|m| {
            if m.conn_id == conn_id {
                removed.push(m.clone());
                false
            } else {
                true
            }
        });
        if metas.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Remove every meta owned by `conn_id`, across all keys.
    pub fn untrack_conn(&self, conn_id: &str) -> PresenceMap {
        let mut entries = self.entries.lock();
        let mut removed = PresenceMap::new();

        entries.retain(|key, metas| {
            let before = metas.len();
            let mut gone = Vec::new();
            metas.retain(|m| {
                if m.conn_id == conn_id {
                    gone.push(m.clone());
                    false
                } else {
                    true
                }
            });
            if metas.len() != before {
                removed.insert(key.clone(), gone);
            }
            !metas.is_empty()
        });

        removed
    }

    /// A deep copy of the current state.
    pub fn get_state(&self) -> PresenceMap {
        self.entries.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Metas<'a> {
    metas: &'a [PresenceMeta],
}

fn to_wire(map: &PresenceMap) -> HashMap<&str, Metas<'_>> {
    map.iter()
        .map(|(key, metas)| (key.as_str(), Metas { metas }))
        .collect()
}

/// The `presence_state` payload: `{<key>: {"metas": [...]}}`.
pub fn state_payload(state: &PresenceMap) -> Value {
    serde_json::to_value(to_wire(state)).unwrap_or_default()
}

/// The `presence_diff` payload: `{"joins": {...}, "leaves": {...}}`.
pub fn diff_payload(joins: &PresenceMap, leaves: &PresenceMap) -> Value {
    #[derive(Serialize)]
    struct Diff<'a> {
        joins: HashMap<&'a str, Metas<'a>>,
        leaves: HashMap<&'a str, Metas<'a>>,
    }

    serde_json::to_value(Diff {
        joins: to_wire(joins),
        leaves: to_wire(leaves),
    })
    .unwrap_or_default()
}

/// A diff with a single key on one side.
pub fn single_key(key: &str, metas: Vec<PresenceMeta>) -> PresenceMap {
    let mut map = PresenceMap::new();
    if !metas.is_empty() {
        map.insert(key.to_string(), metas);
    }
    map
}
