//! Multicast pools of live connections.

use crate::connection::ConnectionChannel;
use crate::packet::Packet;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// A broadcast group. Membership is keyed by connection id; closing a
/// connection detaches it from the group it was registered with.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    members: DashMap<Uuid, ConnectionChannel>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: ConnectionChannel) {
        self.members.insert(channel.id(), channel);
    }

    pub fn remove(&self, channel: &ConnectionChannel) {
        self.members.remove(&channel.id());
    }

    pub fn contains(&self, channel: &ConnectionChannel) -> bool {
        self.members.contains_key(&channel.id())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Send to every member. Best-effort: members whose transport refuses
    /// the packet are dropped from the pool, everyone else still receives.
    pub async fn broadcast(&self, packet: &Packet) {
        // Snapshot membership so no shard lock is held across an await.
        let members: Vec<ConnectionChannel> =
            self.members.iter().map(|m| m.value().clone()).collect();

        for member in members {
            if member.send(packet).await.is_err() {
                debug!("dropping unreachable member {} from group", member.id());
                self.members.remove(&member.id());
            }
        }
    }
}
