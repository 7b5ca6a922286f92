//! The relay game-protocol session.
//!
//! One [`RelayConnect`] drives one accepted game connection, whatever its
//! transport. Until the client registers, only heartbeats and the join
//! packet are honored; after admission the session carries chat, command
//! dispatch and the forwarding paths between participants and their host.

use crate::ban::epoch_secs;
use crate::commands::{CommandRegistry, RelaySender};
use crate::i18n::MessageBundle;
use crate::room::{JoinOutcome, PlayerProfile, RelayDirectory, RelayRoom};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use waypoint_net::codec::{decode_frame, encode_packet, DEFAULT_MAX_PAYLOAD};
use waypoint_net::proto;
use waypoint_net::{ConnectionChannel, NetConnect, NetError, Packet, PacketKind, SessionState};

/// Unregistered connections get this many stray packets before the door.
const MAX_PREJOIN_RETRIES: u32 = 5;

pub struct RelayConnect {
    channel: ConnectionChannel,
    session: SessionState,
    directory: Arc<RelayDirectory>,
    commands: Arc<CommandRegistry>,
    bundle: Arc<MessageBundle>,
    room: RwLock<Option<Arc<RelayRoom>>>,
    profile: RwLock<Option<PlayerProfile>>,
}

impl RelayConnect {
    pub fn new(
        channel: ConnectionChannel,
        directory: Arc<RelayDirectory>,
        commands: Arc<CommandRegistry>,
        bundle: Arc<MessageBundle>,
    ) -> Self {
        Self {
            channel,
            session: SessionState::new(),
            directory,
            commands,
            bundle,
            room: RwLock::new(None),
            profile: RwLock::new(None),
        }
    }

    pub async fn room_id(&self) -> Option<String> {
        self.room
            .read()
            .await
            .as_ref()
            .map(|room| room.id().to_string())
    }

    async fn current_room(&self) -> Option<Arc<RelayRoom>> {
        self.room.read().await.clone()
    }

    async fn current_profile(&self) -> Option<PlayerProfile> {
        self.profile.read().await.clone()
    }

    async fn handle_register(&self, packet: &Packet) -> Result<(), NetError> {
        if self.current_room().await.is_some() {
            // Already registered; a duplicate join is client noise.
            return Ok(());
        }
        let (room_id, name, uuid) = proto::parse_register_join(&packet.payload)?;
        let room = self.directory.get_or_create(&room_id);

        match room.join(&self.channel, &name, &uuid, epoch_secs()).await {
            JoinOutcome::Refused => {
                let reason = self.bundle.get("relay.banned");
                let _ = self.channel.send(&proto::kick_reason(&reason)).await;
                self.channel.close(None).await;
                Ok(())
            }
            JoinOutcome::Admitted { profile, is_host } => {
                let site = profile.site;
                *self.room.write().await = Some(room);
                *self.profile.write().await = Some(profile);
                self.session.set_awaiting_password(false);
                self.session.reset_retries();
                self.channel.send(&proto::join_accept(is_host, site)).await
            }
        }
    }

    async fn handle_chat(&self, packet: &Packet) -> Result<(), NetError> {
        let text = proto::parse_chat_send(&packet.payload)?;
        let (Some(room), Some(profile)) =
            (self.current_room().await, self.current_profile().await)
        else {
            return Ok(());
        };

        let sender = RelaySender::new(self.channel.clone(), room.clone(), self.bundle.clone());
        if self.commands.handle(&text, &sender).await {
            return Ok(());
        }

        // Plain chat. Allmute silences everyone but the admin.
        if room.is_allmute() && !room.is_admin(&self.channel).await {
            return Ok(());
        }
        room.broadcast(&proto::chat_message(&text, &profile.name, 0))
            .await;
        Ok(())
    }

    /// Host traffic addressed to one site: unwrap and deliver.
    async fn handle_host_forward(&self, packet: &Packet) -> Result<(), NetError> {
        let Some(room) = self.current_room().await else {
            return Ok(());
        };
        if !room.is_admin(&self.channel).await {
            debug!("non-host {} tried to forward", self.channel.id());
            return Ok(());
        }
        let (site, frame) = proto::parse_forward(&packet.payload)?;
        let inner = decode_frame(&frame, DEFAULT_MAX_PAYLOAD)?;
        room.send_to_site(site, &inner).await;
        Ok(())
    }

    async fn handle_start(&self) -> Result<(), NetError> {
        let Some(room) = self.current_room().await else {
            return Ok(());
        };
        if !room.is_admin(&self.channel).await {
            return Ok(());
        }
        room.mark_started(epoch_secs());
        info!("room {}: game started", room.id());
        room.broadcast(&Packet::empty(PacketKind::StartGame)).await;
        Ok(())
    }

    /// Anything not handled above is game traffic: participants wrap it to
    /// the host, the host fans it out to the room.
    async fn handle_game_traffic(&self, packet: Packet) -> Result<(), NetError> {
        let Some(room) = self.current_room().await else {
            return Ok(());
        };
        if room.is_admin(&self.channel).await {
            room.broadcast(&packet).await;
            return Ok(());
        }
        let Some(profile) = self.current_profile().await else {
            return Ok(());
        };
        room.forward_to_host(profile.site, &encode_packet(&packet))
            .await;
        Ok(())
    }
}

#[async_trait]
impl NetConnect for RelayConnect {
    fn version(&self) -> &'static str {
        "relay/1"
    }

    fn channel(&self) -> &ConnectionChannel {
        &self.channel
    }

    fn session(&self) -> &SessionState {
        &self.session
    }

    async fn receive_packet(&self, packet: Packet) -> Result<(), NetError> {
        self.session.touch();
        match packet.kind {
            PacketKind::Heartbeat => {
                self.channel
                    .send(&Packet::empty(PacketKind::HeartbeatResponse))
                    .await
            }
            PacketKind::RegisterJoin => self.handle_register(&packet).await,
            PacketKind::Disconnect => {
                self.disconnect().await;
                Ok(())
            }
            _ if self.session.awaiting_password() => {
                // Not registered yet; stray traffic gets a short leash.
                if self.session.bump_retries() > MAX_PREJOIN_RETRIES {
                    debug!("{} never registered, dropping", self.channel.id());
                    self.disconnect().await;
                }
                Ok(())
            }
            PacketKind::ChatSend => self.handle_chat(&packet).await,
            PacketKind::ForwardToClient => self.handle_host_forward(&packet).await,
            PacketKind::StartGame => self.handle_start().await,
            _ => self.handle_game_traffic(packet).await,
        }
    }

    async fn disconnect(&self) {
        if !self.session.begin_disconnect() {
            return;
        }
        let room = self.room.write().await.take();
        match room {
            Some(room) => {
                if room.is_admin(&self.channel).await {
                    // Host gone: the room cannot continue.
                    room.dissolve(&self.bundle.get("relay.roomClosed")).await;
                    self.directory.remove(room.id());
                } else {
                    room.remove_participant(&self.channel);
                }
                self.channel.close(Some(room.group())).await;
            }
            None => self.channel.close(None).await,
        }
        debug!("{} connection {} closed", self.version(), self.channel.id());
    }
}

impl std::fmt::Debug for RelayConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnect")
            .field("channel", &self.channel.id())
            .field("disconnecting", &self.session.is_disconnecting())
            .finish()
    }
}
