//! Relay rooms and the directory that owns them.
//!
//! A room is one hosted game: the host (admin) connection, the participant
//! table keyed by 1-based site, the moderation state and the per-room ban
//! table. Participant traffic is wrapped and forwarded to the host; host
//! traffic addressed to a site is unwrapped and delivered to that
//! participant. The first join into an empty room becomes host.

use crate::ban::{BanTable, BAN_GRACE_SECS};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use waypoint_net::proto;
use waypoint_net::{ConnectionChannel, GroupRegistry, Packet};

/// Immutable identity a participant registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerProfile {
    pub uuid: String,
    pub name: String,
    /// 1-based position inside the room.
    pub site: u32,
}

#[derive(Debug, Clone)]
pub struct RelayParticipant {
    pub channel: ConnectionChannel,
    pub profile: PlayerProfile,
}

/// Result of an admission-checked join.
#[derive(Debug)]
pub enum JoinOutcome {
    Admitted { profile: PlayerProfile, is_host: bool },
    Refused,
}

pub struct RelayRoom {
    id: String,
    sessions: DashMap<u32, RelayParticipant>,
    group: GroupRegistry,
    admin: RwLock<Option<ConnectionChannel>>,
    allmute: AtomicBool,
    started: AtomicBool,
    start_time: AtomicI64,
    next_site: AtomicU32,
    bans: BanTable,
}

impl RelayRoom {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sessions: DashMap::new(),
            group: GroupRegistry::new(),
            admin: RwLock::new(None),
            allmute: AtomicBool::new(false),
            started: AtomicBool::new(false),
            start_time: AtomicI64::new(0),
            // Site 0 is never handed out; positions read naturally in chat.
            next_site: AtomicU32::new(1),
            bans: BanTable::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &GroupRegistry {
        &self.group
    }

    pub fn bans(&self) -> &BanTable {
        &self.bans
    }

    /// Admit `channel` into the room. The ban table is consulted before any
    /// state changes; a refused join leaves the room untouched.
    pub async fn join(
        &self,
        channel: &ConnectionChannel,
        name: &str,
        uuid: &str,
        now: i64,
    ) -> JoinOutcome {
        if !self.bans.admits(uuid, &channel.ip().to_string(), now) {
            debug!("room {}: refused {} ({})", self.id, name, channel.ip());
            return JoinOutcome::Refused;
        }

        let site = self.next_site.fetch_add(1, Ordering::AcqRel);
        let profile = PlayerProfile {
            uuid: uuid.to_string(),
            name: name.to_string(),
            site,
        };
        self.sessions.insert(
            site,
            RelayParticipant {
                channel: channel.clone(),
                profile: profile.clone(),
            },
        );
        self.group.add(channel.clone());

        let mut admin = self.admin.write().await;
        let is_host = admin.is_none();
        if is_host {
            *admin = Some(channel.clone());
        }
        drop(admin);

        info!(
            "room {}: {} joined at site {}{}",
            self.id,
            name,
            site,
            if is_host { " as host" } else { "" }
        );
        JoinOutcome::Admitted { profile, is_host }
    }

    /// True when `channel` is the recorded admin, compared by identity.
    pub async fn is_admin(&self, channel: &ConnectionChannel) -> bool {
        self.admin.read().await.as_ref() == Some(channel)
    }

    pub async fn admin_channel(&self) -> Option<ConnectionChannel> {
        self.admin.read().await.clone()
    }

    pub fn participant(&self, site: u32) -> Option<RelayParticipant> {
        self.sessions.get(&site).map(|entry| entry.value().clone())
    }

    pub fn participants(&self) -> Vec<RelayParticipant> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Case-insensitive substring search over participant names.
    pub fn find_by_name(&self, needle: &str) -> Vec<RelayParticipant> {
        let needle = needle.to_lowercase();
        self.sessions
            .iter()
            .filter(|entry| entry.value().profile.name.to_lowercase().contains(&needle))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Unregister whatever participant owns `channel`.
    pub fn remove_participant(&self, channel: &ConnectionChannel) -> Option<RelayParticipant> {
        let site = self
            .sessions
            .iter()
            .find(|entry| entry.value().channel == *channel)
            .map(|entry| *entry.key())?;
        self.group.remove(channel);
        self.sessions.remove(&site).map(|(_, participant)| participant)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Record the game start. Only the first call sets the clock.
    pub fn mark_started(&self, now: i64) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.start_time.store(now, Ordering::Release);
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Bans are allowed before the game starts and for a grace window after.
    pub fn can_ban_at(&self, now: i64) -> bool {
        if !self.is_started() {
            return true;
        }
        now - self.start_time.load(Ordering::Acquire) <= BAN_GRACE_SECS
    }

    /// Flip the room-wide mute and return the new state.
    pub fn toggle_allmute(&self) -> bool {
        !self.allmute.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_allmute(&self) -> bool {
        self.allmute.load(Ordering::Acquire)
    }

    pub async fn broadcast(&self, packet: &Packet) {
        self.group.broadcast(packet).await;
    }

    /// Push one participant out: kick packet, close, unregister. Absorbs
    /// send failures; the close is what matters.
    pub async fn kick(&self, participant: &RelayParticipant, reason: &str) {
        let _ = participant.channel.send(&proto::kick_reason(reason)).await;
        participant.channel.close(Some(&self.group)).await;
        self.sessions.remove(&participant.profile.site);
        info!(
            "room {}: kicked {} (site {})",
            self.id, participant.profile.name, participant.profile.site
        );
    }

    /// Wrap one frame from `site` and deliver it to the host. Dropped when
    /// the room has no host.
    pub async fn forward_to_host(&self, site: u32, frame: &[u8]) {
        let Some(host) = self.admin_channel().await else {
            debug!("room {}: no host, dropping frame from site {}", self.id, site);
            return;
        };
        if host.send(&proto::forward_to_host(site, frame)).await.is_err() {
            host.close(Some(&self.group)).await;
        }
    }

    /// Deliver a packet the host addressed to one participant.
    pub async fn send_to_site(&self, site: u32, packet: &Packet) {
        let Some(participant) = self.participant(site) else {
            debug!("room {}: no participant at site {}", self.id, site);
            return;
        };
        if participant.channel.send(packet).await.is_err() {
            participant.channel.close(Some(&self.group)).await;
        }
    }

    /// Tear the room down: every remaining participant is kicked with
    /// `notice` and the admin slot is cleared.
    pub async fn dissolve(&self, notice: &str) {
        let participants = self.participants();
        for participant in &participants {
            self.kick(participant, notice).await;
        }
        self.sessions.clear();
        *self.admin.write().await = None;
        info!("room {}: dissolved ({} kicked)", self.id, participants.len());
    }
}

impl std::fmt::Debug for RelayRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRoom")
            .field("id", &self.id)
            .field("participants", &self.sessions.len())
            .field("started", &self.is_started())
            .field("allmute", &self.is_allmute())
            .finish()
    }
}

/// All live rooms, keyed by room id.
#[derive(Debug, Default)]
pub struct RelayDirectory {
    rooms: DashMap<String, Arc<RelayRoom>>,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &str) -> Arc<RelayRoom> {
        self.rooms
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RelayRoom::new(id)))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<RelayRoom>> {
        self.rooms.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<RelayRoom>> {
        self.rooms.remove(id).map(|(_, room)| room)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
