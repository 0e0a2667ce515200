//! Process-wide registry of connections and channels, and the row-authorized
//! change broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use utoipa::ToSchema;

use crate::rls::{authorize_row, RlsService};

use super::channel::{Channel, ChannelSub};
use super::connection::Connection;
use super::events::{ChangeEvent, EventName};
use super::presence::{diff_payload, single_key, PresenceMap};
use super::protocol::Message;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaveError {
    #[error("connection is not joined to this topic")]
    NotJoined,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("private channel requires a valid access token")]
    Unauthorized,
    #[error("connection is no longer registered")]
    Closed,
}

/// Result of a successful [`Hub::subscribe`].
pub struct Joined {
    pub channel: Arc<Channel>,
    /// Presence was enabled on the channel before this join.
    pub presence_was_enabled: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChannelStats {
    pub topic: String,
    pub subscribers: usize,
    pub presence_enabled: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
    pub channel_details: Vec<ChannelStats>,
}

type ChannelMap = HashMap<String, Arc<Channel>>;

/// Lock order: `channels`, then a channel's subscribers, then its presence.
/// A connection's own subscription map is only taken briefly and never held
/// while acquiring another lock.
pub struct Hub {
    conns: DashMap<String, Arc<Connection>>,
    channels: RwLock<ChannelMap>,
    rls: Arc<dyn RlsService>,
}

impl Hub {
    pub fn new(rls: Arc<dyn RlsService>) -> Self {
        Self {
            conns: DashMap::new(),
            channels: RwLock::new(HashMap::new()),
            rls,
        }
    }

    pub fn register_conn(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id().to_string(), conn);
    }

    /// The only teardown path for a connection. Leaves every joined channel
    /// (with presence leave diffs to the remaining subscribers) and drops
    /// emptied channels. Safe to call more than once.
    pub fn unregister_conn(&self, conn_id: &str) {
        let mut channels = self.channels.write();
        let Some((_, conn)) = self.conns.remove(conn_id) else {
            return;
        };

        for (topic, _sub) in conn.take_subscriptions() {
            if let Some(channel) = channels.get(&topic).cloned() {
                Self::detach(&mut channels, &channel, conn_id, None);
            }
        }
    }

    pub fn get_or_create_channel(&self, topic: &str, private: bool) -> Arc<Channel> {
        let mut channels = self.channels.write();
        Self::channel_entry(&mut channels, topic, private)
    }

    pub fn channel(&self, topic: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(topic).cloned()
    }

    /// Drop the channel for `topic` if it has no subscribers. Returns whether
    /// it was removed.
    pub fn remove_channel_if_empty(&self, topic: &str) -> bool {
        let mut channels = self.channels.write();
        Self::remove_if_empty(&mut channels, topic)
    }

    /// Register `sub` on its topic, creating the channel if needed and
    /// enabling presence when the subscriber asked for it. An existing
    /// subscription of the same connection to the same topic is left first.
    ///
    /// A private join, or any join to an existing private channel, needs
    /// `has_claims`. The check and the insert happen under one write lock.
    pub fn subscribe(
        &self,
        sub: ChannelSub,
        private: bool,
        has_claims: bool,
    ) -> Result<Joined, JoinError> {
        let mut channels = self.channels.write();
        if !self.conns.contains_key(sub.conn_id()) {
            return Err(JoinError::Closed);
        }
        let private = private || channels.get(&sub.topic).is_some_and(|c| c.is_private());
        if private && !has_claims {
            return Err(JoinError::Unauthorized);
        }

        if let Some(previous) = sub.conn.remove_subscription(&sub.topic) {
            if let Some(channel) = channels.get(&previous.topic).cloned() {
                Self::detach(
                    &mut channels,
                    &channel,
                    previous.conn_id(),
                    previous.presence_key.as_deref(),
                );
            }
        }

        let channel = Self::channel_entry(&mut channels, &sub.topic, private);
        let presence_was_enabled = if sub.presence_key.is_some() {
            channel.enable_presence()
        } else {
            channel.presence().is_some()
        };

        let sub = Arc::new(sub);
        channel.add(sub.clone());
        sub.conn.clone().insert_subscription(sub);

        Ok(Joined {
            channel,
            presence_was_enabled,
        })
    }

    /// Leave `topic`: untrack presence (leave diff to the remaining
    /// subscribers), remove the subscriber and drop the channel if emptied.
    pub fn unsubscribe(&self, conn: &Connection, topic: &str) -> Result<(), LeaveError> {
        let mut channels = self.channels.write();
        let sub = conn
            .remove_subscription(topic)
            .ok_or(LeaveError::NotJoined)?;

        if let Some(channel) = channels.get(topic).cloned() {
            Self::detach(
                &mut channels,
                &channel,
                conn.id(),
                sub.presence_key.as_deref(),
            );
        }
        Ok(())
    }

    /// Deliver `change` to every subscriber with a matching postgres-change
    /// subscription that may see the affected row. Returns the number of
    /// messages queued.
    pub async fn broadcast_change(&self, change: &ChangeEvent) -> usize {
        let candidates: Vec<(Arc<ChannelSub>, Vec<u32>)> = {
            let channels = self.channels.read();
            channels
                .values()
                .flat_map(|channel| channel.subscribers())
                .filter_map(|sub| {
                    let ids: Vec<u32> = sub
                        .postgres_changes
                        .iter()
                        .filter(|p| p.matches(change))
                        .map(|p| p.id)
                        .collect();
                    (!ids.is_empty()).then_some((sub, ids))
                })
                .collect()
        };

        let row = change.visible_row();
        let mut delivered = 0;
        for (sub, ids) in candidates {
            let ctx = sub.conn.auth_context();
            if !authorize_row(self.rls.as_ref(), &ctx, &change.table, row).await {
                tracing::debug!(
                    conn_id = %sub.conn_id(),
                    topic = %sub.topic,
                    table = %change.table,
                    "change withheld by row-level security"
                );
                continue;
            }

            let msg = Message::new(
                sub.topic.clone(),
                EventName::POSTGRES_CHANGES,
                change.to_payload(&ids),
            )
            .with_join_ref(sub.join_ref.clone());
            if sub.conn.send(&msg) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn stats(&self) -> HubStats {
        let channels = self.channels.read();
        let mut channel_details: Vec<ChannelStats> = channels
            .values()
            .map(|c| ChannelStats {
                topic: c.topic().to_string(),
                subscribers: c.len(),
                presence_enabled: c.presence().is_some(),
            })
            .collect();
        channel_details.sort_by(|a, b| a.topic.cmp(&b.topic));

        HubStats {
            connections: self.conns.len(),
            channels: channels.len(),
            channel_details,
        }
    }

    fn channel_entry(channels: &mut ChannelMap, topic: &str, private: bool) -> Arc<Channel> {
        channels
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Channel::new(topic, private)))
            .clone()
    }

    fn remove_if_empty(channels: &mut ChannelMap, topic: &str) -> bool {
        let empty = channels.get(topic).is_some_and(|c| c.is_empty());
        if empty {
            channels.remove(topic);
            tracing::debug!(%topic, "channel removed");
        }
        empty
    }

    /// Remove `conn_id` from `channel`. With `presence_key` only that key is
    /// untracked; without it every meta the connection holds is dropped.
    fn detach(
        channels: &mut ChannelMap,
        channel: &Channel,
        conn_id: &str,
        presence_key: Option<&str>,
    ) {
        channel.remove(conn_id);

        if let Some(presence) = channel.presence() {
            let leaves = match presence_key {
                Some(key) => single_key(key, presence.untrack(key, conn_id)),
                None => presence.untrack_conn(conn_id),
            };
            if !leaves.is_empty() {
                let diff = Message::new(
                    channel.topic(),
                    EventName::PRESENCE_DIFF,
                    diff_payload(&PresenceMap::new(), &leaves),
                );
                channel.send_to_all(&diff, None);
            }
        }

        Self::remove_if_empty(channels, channel.topic());
    }
}
