//! Payload encoding helpers and the packet constructors the relay uses.
//!
//! Payload scalars are big-endian; strings and blobs are length-prefixed
//! with a `u32`. The writer is infallible, the reader fails with
//! [`NetError::IncompleteFrame`] when a payload lies about its contents.

use crate::error::NetError;
use crate::packet::{Packet, PacketKind};

/// Name shown as the sender of relay system messages.
pub const SYSTEM_SENDER: &str = "RELAY";

/// Team slot used for relay system chat, outside the playable range.
pub const SYSTEM_TEAM: i32 = 5;

#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_blob(s.as_bytes())
    }

    /// Length-prefixed byte blob.
    pub fn write_blob(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], NetError> {
        if self.buf.len() - self.pos < n {
            return Err(NetError::IncompleteFrame);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, NetError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, NetError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, NetError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, NetError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, NetError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_str(&mut self) -> Result<String, NetError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes).map_err(|_| NetError::IncompleteFrame)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, NetError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Chat line pushed to a client: text, sender name, team slot.
pub fn chat_message(text: &str, sender: &str, team: i32) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_str(text).write_str(sender).write_i32(team);
    Packet::new(PacketKind::Chat, w.finish())
}

/// Relay system chat, shown with the reserved sender name.
pub fn system_message(text: &str) -> Packet {
    chat_message(text, SYSTEM_SENDER, SYSTEM_TEAM)
}

/// Forced-disconnect notice with a human-readable reason.
pub fn kick_reason(reason: &str) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_str(reason);
    Packet::new(PacketKind::Kick, w.finish())
}

/// Instruction for the receiving client to reconnect to `target`.
pub fn relay_jump(target: &str) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_str(target);
    Packet::new(PacketKind::RelayJump, w.finish())
}

/// Join request: room id, player name, player uuid.
pub fn register_join(room_id: &str, name: &str, uuid: &str) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_str(room_id).write_str(name).write_str(uuid);
    Packet::new(PacketKind::RegisterJoin, w.finish())
}

pub fn parse_register_join(payload: &[u8]) -> Result<(String, String, String), NetError> {
    let mut r = PayloadReader::new(payload);
    Ok((r.read_str()?, r.read_str()?, r.read_str()?))
}

/// Join acknowledgement carrying the host flag and the assigned site.
pub fn join_accept(is_host: bool, site: u32) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_bool(is_host).write_u32(site);
    Packet::new(PacketKind::JoinAccept, w.finish())
}

/// Participant traffic wrapped with its origin site, bound for the host.
pub fn forward_to_host(site: u32, frame: &[u8]) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_u32(site).write_blob(frame);
    Packet::new(PacketKind::ForwardFromClient, w.finish())
}

/// Host traffic addressed to one participant site.
pub fn forward_to_site(site: u32, frame: &[u8]) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_u32(site).write_blob(frame);
    Packet::new(PacketKind::ForwardToClient, w.finish())
}

/// Unwrap either direction of forwarded traffic: origin or target site plus
/// the inner frame bytes.
pub fn parse_forward(payload: &[u8]) -> Result<(u32, Vec<u8>), NetError> {
    let mut r = PayloadReader::new(payload);
    Ok((r.read_u32()?, r.read_blob()?))
}

/// Chat line received from a client.
pub fn chat_send(text: &str) -> Packet {
    let mut w = PayloadWriter::new();
    w.write_str(text);
    Packet::new(PacketKind::ChatSend, w.finish())
}

pub fn parse_chat_send(payload: &[u8]) -> Result<String, NetError> {
    PayloadReader::new(payload).read_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_reader_round_trip() {
        let mut w = PayloadWriter::new();
        w.write_u8(7)
            .write_bool(true)
            .write_u32(42)
            .write_i32(-5)
            .write_i64(1_234_567_890_123)
            .write_str("relay")
            .write_blob(&[9, 8, 7]);
        let bytes = w.finish();

        let mut r = PayloadReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_i32().unwrap(), -5);
        assert_eq!(r.read_i64().unwrap(), 1_234_567_890_123);
        assert_eq!(r.read_str().unwrap(), "relay");
        assert_eq!(r.read_blob().unwrap(), vec![9, 8, 7]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn reader_rejects_truncated_payloads() {
        let mut w = PayloadWriter::new();
        w.write_str("a longer string than the buffer will keep");
        let mut bytes = w.finish();
        bytes.truncate(6);

        let mut r = PayloadReader::new(&bytes);
        assert!(matches!(r.read_str(), Err(NetError::IncompleteFrame)));
    }

    #[test]
    fn reader_rejects_lying_length_prefix() {
        // Claims 100 bytes of string but carries 2.
        let mut bytes = 100u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"ab");
        let mut r = PayloadReader::new(&bytes);
        assert!(matches!(r.read_str(), Err(NetError::IncompleteFrame)));
    }

    #[test]
    fn chat_message_payload_parses_back() {
        let packet = chat_message("hello room", "alice", 2);
        assert_eq!(packet.kind, PacketKind::Chat);
        let mut r = PayloadReader::new(&packet.payload);
        assert_eq!(r.read_str().unwrap(), "hello room");
        assert_eq!(r.read_str().unwrap(), "alice");
        assert_eq!(r.read_i32().unwrap(), 2);
    }

    #[test]
    fn system_message_uses_reserved_sender() {
        let packet = system_message("maintenance soon");
        let mut r = PayloadReader::new(&packet.payload);
        r.read_str().unwrap();
        assert_eq!(r.read_str().unwrap(), SYSTEM_SENDER);
        assert_eq!(r.read_i32().unwrap(), SYSTEM_TEAM);
    }

    #[test]
    fn forward_wrapping_round_trips() {
        let inner = crate::codec::encode_packet(&chat_send("gg"));
        let wrapped = forward_to_host(3, &inner);
        assert_eq!(wrapped.kind, PacketKind::ForwardFromClient);

        let (site, frame) = parse_forward(&wrapped.payload).unwrap();
        assert_eq!(site, 3);
        assert_eq!(frame, inner);
    }

    #[test]
    fn register_join_round_trips() {
        let packet = register_join("room-7", "alice", "uuid-1");
        let (room, name, uuid) = parse_register_join(&packet.payload).unwrap();
        assert_eq!(room, "room-7");
        assert_eq!(name, "alice");
        assert_eq!(uuid, "uuid-1");
    }
}
