//! Packet type and the numeric type-code registry.

use serde::{Deserialize, Serialize};

/// One protocol message: a type code plus an opaque payload.
///
/// Packets are immutable once constructed; the payload length always fits a
/// `u32` because the framing cap is enforced long before this size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// A packet with no payload, for pure signals like heartbeats.
    pub fn empty(kind: PacketKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The wire type-code registry.
///
/// Codes are fixed protocol constants; [`PacketKind::Other`] carries any code
/// this build does not interpret so the relay can forward gameplay traffic
/// untouched. `from_code` and `code` round-trip for every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Periodic tick traffic from the game simulation.
    Tick,
    /// An in-game command blob.
    GameCommand,
    /// Server metadata sent during the join handshake.
    ServerInfo,
    /// Client liveness probe.
    Heartbeat,
    /// Server answer to a heartbeat.
    HeartbeatResponse,
    /// Initial join request carrying room id, player name and uuid.
    RegisterJoin,
    /// Join accepted; carries the assigned site.
    JoinAccept,
    /// Orderly disconnect notice.
    Disconnect,
    /// Join refused pending credentials.
    PasswordError,
    /// Host signals the game has started.
    StartGame,
    /// Chat line pushed to a client.
    Chat,
    /// Chat line received from a client.
    ChatSend,
    /// Forced disconnect with a human-readable reason.
    Kick,
    /// Instruction to reconnect to another relay or server.
    RelayJump,
    /// Relay notice: a client entered the room.
    ForwardJoin,
    /// Relay notice: a client left the room.
    ForwardLeave,
    /// Participant traffic wrapped with its origin site, bound for the host.
    ForwardFromClient,
    /// Host traffic addressed to one participant site.
    ForwardToClient,
    /// Any code without a dedicated handler; forwarded verbatim.
    Other(u32),
}

impl PacketKind {
    pub const fn code(self) -> u32 {
        match self {
            PacketKind::Tick => 10,
            PacketKind::GameCommand => 20,
            PacketKind::ServerInfo => 106,
            PacketKind::Heartbeat => 108,
            PacketKind::HeartbeatResponse => 109,
            PacketKind::RegisterJoin => 110,
            PacketKind::JoinAccept => 112,
            PacketKind::Disconnect => 111,
            PacketKind::PasswordError => 113,
            PacketKind::StartGame => 120,
            PacketKind::Chat => 140,
            PacketKind::ChatSend => 141,
            PacketKind::Kick => 150,
            PacketKind::RelayJump => 160,
            PacketKind::ForwardJoin => 172,
            PacketKind::ForwardLeave => 173,
            PacketKind::ForwardFromClient => 174,
            PacketKind::ForwardToClient => 175,
            PacketKind::Other(code) => code,
        }
    }

    pub const fn from_code(code: u32) -> Self {
        match code {
            10 => PacketKind::Tick,
            20 => PacketKind::GameCommand,
            106 => PacketKind::ServerInfo,
            108 => PacketKind::Heartbeat,
            109 => PacketKind::HeartbeatResponse,
            110 => PacketKind::RegisterJoin,
            112 => PacketKind::JoinAccept,
            111 => PacketKind::Disconnect,
            113 => PacketKind::PasswordError,
            120 => PacketKind::StartGame,
            140 => PacketKind::Chat,
            141 => PacketKind::ChatSend,
            150 => PacketKind::Kick,
            160 => PacketKind::RelayJump,
            172 => PacketKind::ForwardJoin,
            173 => PacketKind::ForwardLeave,
            174 => PacketKind::ForwardFromClient,
            175 => PacketKind::ForwardToClient,
            other => PacketKind::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        let kinds = [
            PacketKind::Tick,
            PacketKind::GameCommand,
            PacketKind::ServerInfo,
            PacketKind::Heartbeat,
            PacketKind::HeartbeatResponse,
            PacketKind::RegisterJoin,
            PacketKind::JoinAccept,
            PacketKind::Disconnect,
            PacketKind::PasswordError,
            PacketKind::StartGame,
            PacketKind::Chat,
            PacketKind::ChatSend,
            PacketKind::Kick,
            PacketKind::RelayJump,
            PacketKind::ForwardJoin,
            PacketKind::ForwardLeave,
            PacketKind::ForwardFromClient,
            PacketKind::ForwardToClient,
        ];
        for kind in kinds {
            assert_eq!(PacketKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let kind = PacketKind::from_code(9999);
        assert_eq!(kind, PacketKind::Other(9999));
        assert_eq!(kind.code(), 9999);
    }

    #[test]
    fn empty_packet_has_no_payload() {
        let packet = Packet::empty(PacketKind::Heartbeat);
        assert!(packet.is_empty());
        assert_eq!(packet.len(), 0);
    }
}
