//! The uniform connection handle over both transports.
//!
//! A [`ConnectionChannel`] hides whether the peer arrived over the TCP
//! stream or the reliable-UDP endpoint. Identity is a generated uuid, never
//! the network address, because the same peer may reconnect with a new
//! socket. Addressing attributes are fixed at construction; only the closed
//! flag ever mutates.
//!
//! # Send Ordering
//!
//! Stream sends are queued onto a single writer task owned by the
//! connection, so concurrent senders are serialized in arrival order.
//! Reliable-UDP sends serialize under the per-peer endpoint lock. Either
//! way, two packets sent on one connection arrive in send order.

use crate::codec::encode_packet;
use crate::error::NetError;
use crate::event::NetEvents;
use crate::geo::{ipv4_prefix24, GeoLookup, NoGeo};
use crate::group::GroupRegistry;
use crate::packet::Packet;
use crate::rudp::RudpPeer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Which transport carries this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Reliable ordered byte stream (TCP).
    Stream,
    /// Application-level reliable UDP.
    Rudp,
    /// In-process capture endpoint for tests and passive observers.
    NoOp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "TCP",
            TransportKind::Rudp => "RUDP",
            TransportKind::NoOp => "TEST",
        }
    }
}

enum ChannelSink {
    Stream(mpsc::UnboundedSender<WriterCmd>),
    Rudp(Arc<RudpPeer>),
    NoOp(Mutex<Vec<Packet>>),
}

enum WriterCmd {
    Frame(Vec<u8>),
    Shutdown,
}

struct ChannelInner {
    id: Uuid,
    kind: TransportKind,
    ip: IpAddr,
    prefix24: String,
    country: String,
    country_all: String,
    local_port: u16,
    closed: AtomicBool,
    sink: ChannelSink,
    events: Arc<NetEvents>,
}

/// Cloneable handle to one connection. Equality and hashing use the
/// generated id only.
#[derive(Clone)]
pub struct ConnectionChannel {
    inner: Arc<ChannelInner>,
}

impl ConnectionChannel {
    /// Wrap the write half of an accepted TCP stream. Spawns the writer
    /// task that owns the socket and preserves FIFO order.
    pub fn stream(
        write_half: OwnedWriteHalf,
        peer: SocketAddr,
        local_port: u16,
        geo: &dyn GeoLookup,
        events: Arc<NetEvents>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_stream_writer(write_half, rx));
        Self::build(
            TransportKind::Stream,
            ChannelSink::Stream(tx),
            peer.ip(),
            local_port,
            geo,
            events,
        )
    }

    /// Wrap a reliable-UDP peer endpoint.
    pub fn rudp(
        peer: Arc<RudpPeer>,
        local_port: u16,
        geo: &dyn GeoLookup,
        events: Arc<NetEvents>,
    ) -> Self {
        let ip = peer.addr().ip();
        Self::build(
            TransportKind::Rudp,
            ChannelSink::Rudp(peer),
            ip,
            local_port,
            geo,
            events,
        )
    }

    /// Capture endpoint: sends are recorded instead of transmitted.
    pub fn noop() -> Self {
        Self::noop_with_events(Arc::new(NetEvents::new()))
    }

    pub fn noop_with_events(events: Arc<NetEvents>) -> Self {
        Self::build(
            TransportKind::NoOp,
            ChannelSink::NoOp(Mutex::new(Vec::new())),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            &NoGeo,
            events,
        )
    }

    fn build(
        kind: TransportKind,
        sink: ChannelSink,
        ip: IpAddr,
        local_port: u16,
        geo: &dyn GeoLookup,
        events: Arc<NetEvents>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: Uuid::new_v4(),
                kind,
                ip,
                prefix24: ipv4_prefix24(ip),
                country: geo.country(ip),
                country_all: geo.country_all(ip),
                local_port,
                closed: AtomicBool::new(false),
                sink,
                events,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.ip
    }

    /// The /24 grouping key derived from the remote address.
    pub fn prefix24(&self) -> &str {
        &self.inner.prefix24
    }

    pub fn country(&self) -> &str {
        &self.inner.country
    }

    pub fn country_all(&self) -> &str {
        &self.inner.country_all
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    /// Send one packet, preserving per-connection FIFO order.
    ///
    /// A failure means the transport could not take the packet; the caller
    /// should treat this connection as suspect and disconnect it.
    pub async fn send(&self, packet: &Packet) -> Result<(), NetError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(NetError::ConnectionClosed);
        }
        match &self.inner.sink {
            ChannelSink::Stream(tx) => tx
                .send(WriterCmd::Frame(encode_packet(packet)))
                .map_err(|_| NetError::SendFailed),
            ChannelSink::Rudp(peer) => peer.send_frame(&encode_packet(packet)).await,
            ChannelSink::NoOp(captured) => {
                if let Ok(mut captured) = captured.lock() {
                    captured.push(packet.clone());
                }
                Ok(())
            }
        }
    }

    /// Whether the send path is still live.
    ///
    /// For streams this reflects the writer task's channel rather than a
    /// separately tracked flag, so a writer that died from a socket error
    /// reports closed even if `close` was never called.
    pub fn is_closed(&self) -> bool {
        match &self.inner.sink {
            ChannelSink::Stream(tx) => tx.is_closed(),
            _ => self.inner.closed.load(Ordering::Acquire),
        }
    }

    /// Close the connection: fire close hooks, detach from the multicast
    /// pool, release the transport. Idempotent; every effect runs exactly
    /// once, and calls on an already-removed connection are absorbed.
    pub async fn close(&self, groups: Option<&GroupRegistry>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.events.fire_close(self);
        if let Some(groups) = groups {
            groups.remove(self);
        }
        match &self.inner.sink {
            ChannelSink::Stream(tx) => {
                let _ = tx.send(WriterCmd::Shutdown);
            }
            ChannelSink::Rudp(peer) => peer.shutdown().await,
            ChannelSink::NoOp(_) => {}
        }
        debug!("connection {} closed ({})", self.inner.id, self.inner.kind.as_str());
    }

    /// Packets recorded by a capture connection, in send order. Empty for
    /// real transports.
    pub fn captured(&self) -> Vec<Packet> {
        match &self.inner.sink {
            ChannelSink::NoOp(captured) => captured
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl PartialEq for ConnectionChannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionChannel {}

impl std::hash::Hash for ConnectionChannel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for ConnectionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionChannel")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("ip", &self.inner.ip)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl std::fmt::Display for ConnectionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.inner.kind.as_str(),
            self.inner.ip,
            self.inner.id
        )
    }
}

async fn run_stream_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("stream writer stopping: {}", e);
                    break;
                }
            }
            WriterCmd::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
    // Dropping the receiver flips the senders to closed.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_packet, DEFAULT_MAX_PAYLOAD};
    use crate::packet::PacketKind;
    use crate::proto;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn identity_is_the_generated_id() {
        let a = ConnectionChannel::noop();
        let b = ConnectionChannel::noop();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[tokio::test]
    async fn capture_connection_records_in_order() {
        let conn = ConnectionChannel::noop();
        conn.send(&proto::system_message("one")).await.unwrap();
        conn.send(&proto::system_message("two")).await.unwrap();

        let captured = conn.captured();
        assert_eq!(captured.len(), 2);
        assert_eq!(
            proto::PayloadReader::new(&captured[0].payload)
                .read_str()
                .unwrap(),
            "one"
        );
        assert_eq!(
            proto::PayloadReader::new(&captured[1].payload)
                .read_str()
                .unwrap(),
            "two"
        );
    }

    #[tokio::test]
    async fn close_fires_hooks_exactly_once() {
        let events = Arc::new(NetEvents::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        events.on_close(move |_conn| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let conn = ConnectionChannel::noop_with_events(events);
        conn.close(None).await;
        conn.close(None).await;
        conn.close(None).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let conn = ConnectionChannel::noop();
        conn.close(None).await;
        let err = conn.send(&Packet::empty(PacketKind::Heartbeat)).await;
        assert!(matches!(err, Err(NetError::ConnectionClosed)));
        assert!(conn.captured().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_sends_arrive_in_fifo_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut got = Vec::new();
            for _ in 0..20 {
                let packet = read_packet(&mut stream, DEFAULT_MAX_PAYLOAD)
                    .await
                    .unwrap()
                    .unwrap();
                got.push(packet);
            }
            got
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let local_port = stream.local_addr().unwrap().port();
        let (_read, write) = stream.into_split();
        let conn = ConnectionChannel::stream(
            write,
            peer,
            local_port,
            &NoGeo,
            Arc::new(NetEvents::new()),
        );

        for i in 0..20u32 {
            let mut w = proto::PayloadWriter::new();
            w.write_u32(i);
            conn.send(&Packet::new(PacketKind::GameCommand, w.finish()))
                .await
                .unwrap();
        }

        let got = client.await.unwrap();
        for (i, packet) in got.iter().enumerate() {
            let mut r = proto::PayloadReader::new(&packet.payload);
            assert_eq!(r.read_u32().unwrap(), i as u32);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_close_shuts_the_socket_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            read_packet(&mut stream, DEFAULT_MAX_PAYLOAD).await.unwrap()
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let (_read, write) = stream.into_split();
        let conn =
            ConnectionChannel::stream(write, peer, 0, &NoGeo, Arc::new(NetEvents::new()));

        conn.close(None).await;

        // The peer observes EOF on a frame boundary.
        assert!(client.await.unwrap().is_none());

        // The writer task exits, so the channel reports closed.
        for _ in 0..50 {
            if conn.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(conn.is_closed());
    }
}
