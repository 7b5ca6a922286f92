//! Wire framing: `[u32 BE payload length][u32 BE type code][payload]`.
//!
//! The same frame layout is used on both transports. Reads enforce the
//! payload cap from the header alone, before any payload allocation, so a
//! hostile length field can never balloon memory.

use crate::error::NetError;
use crate::packet::{Packet, PacketKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default payload cap: 50 MiB, matching the largest legitimate map sync.
pub const DEFAULT_MAX_PAYLOAD: usize = 52_428_800;

/// Frame header size: payload length plus type code.
pub const HEADER_LEN: usize = 8;

/// Encode a packet into a standalone frame.
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + packet.payload.len());
    out.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&packet.kind.code().to_be_bytes());
    out.extend_from_slice(&packet.payload);
    out
}

/// Write one frame and flush it. A frame is atomic on the wire.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_packet(packet)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` on a clean close, which is only legal on a frame
/// boundary. A stream that ends inside the header or the payload yields
/// [`NetError::IncompleteFrame`]; a header that declares more than
/// `max_payload` bytes yields [`NetError::FrameTooLarge`] without reading
/// any of the payload.
pub async fn read_packet<R>(reader: &mut R, max_payload: usize) -> Result<Option<Packet>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];

    // First byte decides between a clean close and a truncated frame.
    let n = reader.read(&mut header[..1]).await?;
    if n == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(map_truncation)?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if length > max_payload {
        return Err(NetError::FrameTooLarge {
            length,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_truncation)?;

    Ok(Some(Packet::new(PacketKind::from_code(code), payload)))
}

/// Decode a frame that arrived as one datagram.
///
/// Used by the reliable-UDP path, where every data datagram carries exactly
/// one complete frame.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<Packet, NetError> {
    if bytes.len() < HEADER_LEN {
        return Err(NetError::IncompleteFrame);
    }
    let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let code = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if length > max_payload {
        return Err(NetError::FrameTooLarge {
            length,
            max: max_payload,
        });
    }
    if bytes.len() - HEADER_LEN < length {
        return Err(NetError::IncompleteFrame);
    }

    Ok(Packet::new(
        PacketKind::from_code(code),
        bytes[HEADER_LEN..HEADER_LEN + length].to_vec(),
    ))
}

fn map_truncation(e: std::io::Error) -> NetError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetError::IncompleteFrame
    } else {
        NetError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_layout_is_length_then_code() {
        let packet = Packet::new(PacketKind::Chat, vec![0xAA, 0xBB, 0xCC]);
        let bytes = encode_packet(&packet);
        assert_eq!(&bytes[..4], &3u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &140u32.to_be_bytes());
        assert_eq!(&bytes[8..], &[0xAA, 0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let packet = Packet::new(PacketKind::GameCommand, b"move 3 4".to_vec());

        write_packet(&mut client, &packet).await.unwrap();
        let got = read_packet(&mut server, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, packet);
    }

    #[tokio::test]
    async fn round_trip_zero_length_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let packet = Packet::empty(PacketKind::Heartbeat);

        write_packet(&mut client, &packet).await.unwrap();
        let got = read_packet(&mut server, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, PacketKind::Heartbeat);
        assert!(got.payload.is_empty());
    }

    #[tokio::test]
    async fn clean_eof_on_frame_boundary_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let got = read_packet(&mut server, DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_incomplete_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0u8, 0, 0])
            .await
            .unwrap();
        drop(client);

        let err = read_packet(&mut server, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::IncompleteFrame));
    }

    #[tokio::test]
    async fn truncated_payload_is_incomplete_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut bytes = encode_packet(&Packet::new(PacketKind::Chat, vec![1, 2, 3, 4, 5]));
        bytes.truncate(bytes.len() - 2);
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes)
            .await
            .unwrap();
        drop(client);

        let err = read_packet(&mut server, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::IncompleteFrame));
    }

    #[tokio::test]
    async fn oversized_header_rejected_before_payload_arrives() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Header only: declares 100 MiB but no payload follows. The reader
        // must fail from the header alone instead of waiting for bytes.
        let mut header = Vec::new();
        header.extend_from_slice(&(100u32 * 1024 * 1024).to_be_bytes());
        header.extend_from_slice(&140u32.to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();

        let err = read_packet(&mut server, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap_err();
        match err {
            NetError::FrameTooLarge { length, max } => {
                assert_eq!(length, 100 * 1024 * 1024);
                assert_eq!(max, DEFAULT_MAX_PAYLOAD);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn decode_frame_round_trips() {
        let packet = Packet::new(PacketKind::ChatSend, b"hello".to_vec());
        let got = decode_frame(&encode_packet(&packet), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(got, packet);
    }

    #[test]
    fn decode_frame_rejects_short_and_oversized() {
        assert!(matches!(
            decode_frame(&[0, 0, 0], DEFAULT_MAX_PAYLOAD),
            Err(NetError::IncompleteFrame)
        ));

        let mut bytes = encode_packet(&Packet::new(PacketKind::Chat, vec![1, 2, 3]));
        bytes.truncate(9);
        assert!(matches!(
            decode_frame(&bytes, DEFAULT_MAX_PAYLOAD),
            Err(NetError::IncompleteFrame)
        ));

        let packet = Packet::new(PacketKind::Chat, vec![0u8; 32]);
        assert!(matches!(
            decode_frame(&encode_packet(&packet), 16),
            Err(NetError::FrameTooLarge { length: 32, max: 16 })
        ));
    }
}
