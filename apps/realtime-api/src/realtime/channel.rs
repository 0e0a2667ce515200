//! A named topic: its subscribers and optional presence state.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::connection::Connection;
use super::events::{BroadcastOptions, PostgresChangeSub};
use super::presence::PresenceState;
use super::protocol::Message;

/// One connection's subscription to one channel, fixed at join time.
pub struct ChannelSub {
    pub conn: Arc<Connection>,
    pub topic: String,
    pub join_ref: String,
    pub broadcast: BroadcastOptions,
    /// Set when the joiner asked for presence.
    pub presence_key: Option<String>,
    pub postgres_changes: Vec<PostgresChangeSub>,
}

impl ChannelSub {
    pub fn conn_id(&self) -> &str {
        self.conn.id()
    }
}

pub struct Channel {
    topic: String,
    private: bool,
    subscribers: RwLock<HashMap<String, Arc<ChannelSub>>>,
    presence: OnceLock<PresenceState>,
}

impl Channel {
    pub fn new(topic: impl Into<String>, private: bool) -> Self {
        Self {
            topic: topic.into(),
            private,
            subscribers: RwLock::new(HashMap::new()),
            presence: OnceLock::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Insert `sub`, returning the subscription it replaced for the same
    /// connection, if any.
    pub fn add(&self, sub: Arc<ChannelSub>) -> Option<Arc<ChannelSub>> {
        self.subscribers
            .write()
            .insert(sub.conn_id().to_string(), sub)
    }

    pub fn remove(&self, conn_id: &str) -> Option<Arc<ChannelSub>> {
        self.subscribers.write().remove(conn_id)
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<ChannelSub>> {
        self.subscribers.read().get(conn_id).cloned()
    }

    pub fn subscribers(&self) -> Vec<Arc<ChannelSub>> {
        self.subscribers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Enable presence for this channel. Idempotent: an existing state is
    /// kept. Returns whether presence was already enabled.
    pub fn enable_presence(&self) -> bool {
        let mut created = false;
        self.presence.get_or_init(|| {
            created = true;
            PresenceState::new()
        });
        !created
    }

    pub fn presence(&self) -> Option<&PresenceState> {
        self.presence.get()
    }

    /// Queue `msg` for every subscriber except `skip_conn`.
    pub fn send_to_all(&self, msg: &Message, skip_conn: Option<&str>) {
        for sub in self.subscribers() {
            if skip_conn == Some(sub.conn_id()) {
                continue;
            }
            sub.conn.send(msg);
        }
    }
}
