//! Application-level reliable UDP.
//!
//! One shared socket serves every peer. A demux task routes datagrams to
//! per-peer virtual connections; a datagram from an unknown source address
//! becomes a newly accepted connection. Each data datagram carries exactly
//! one wire frame and is acknowledged; unacked datagrams retransmit on an
//! exponential backoff schedule until a retry cap, after which the peer is
//! declared unreachable and torn down. Receipt is delivered in sequence
//! order, buffering a bounded window of out-of-order arrivals and dropping
//! duplicates.
//!
//! Datagram layout: `[u32 BE sequence][u8 kind][body]`, where kind is
//! data, ack or fin. Acks and fins carry no body.

use crate::error::NetError;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

/// Largest UDP payload we will emit. One frame must fit one datagram.
pub const MAX_DATAGRAM: usize = 65_507;

const DATAGRAM_HEADER: usize = 5;
const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const KIND_FIN: u8 = 2;

const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_TICK: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 8;
/// Out-of-order arrivals buffered ahead of the expected sequence.
const REORDER_WINDOW: u32 = 256;

const ACCEPT_BACKLOG: usize = 64;
const INBOUND_BACKLOG: usize = 256;

fn build_datagram(seq: u32, kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATAGRAM_HEADER + body.len());
    out.extend_from_slice(&seq.to_be_bytes());
    out.push(kind);
    out.extend_from_slice(body);
    out
}

fn parse_datagram(bytes: &[u8]) -> Option<(u32, u8, &[u8])> {
    if bytes.len() < DATAGRAM_HEADER {
        return None;
    }
    let seq = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Some((seq, bytes[4], &bytes[DATAGRAM_HEADER..]))
}

/// Serial-number comparison tolerant of wraparound: true when `a` is
/// logically after `b`.
fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

struct PendingDatagram {
    bytes: Vec<u8>,
    retries: u32,
    next_retry: Instant,
}

struct SendState {
    next_seq: u32,
    pending: HashMap<u32, PendingDatagram>,
}

struct RecvState {
    next_expected: u32,
    buffered: BTreeMap<u32, Vec<u8>>,
}

impl RecvState {
    /// Admit one arrival, returning every frame now deliverable in order.
    fn admit(&mut self, seq: u32, frame: Vec<u8>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if seq == self.next_expected {
            out.push(frame);
            self.next_expected = self.next_expected.wrapping_add(1);
            while let Some(buffered) = self.buffered.remove(&self.next_expected) {
                out.push(buffered);
                self.next_expected = self.next_expected.wrapping_add(1);
            }
        } else if seq_newer(seq, self.next_expected)
            && seq.wrapping_sub(self.next_expected) <= REORDER_WINDOW
        {
            // Ahead of schedule: hold until the gap fills. Duplicates of a
            // buffered frame and anything beyond the window are dropped;
            // the sender keeps retransmitting until we can take it.
            self.buffered.entry(seq).or_insert(frame);
        }
        out
    }
}

/// One virtual connection over the shared socket.
pub struct RudpPeer {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    send_state: Mutex<SendState>,
    recv_state: Mutex<RecvState>,
    inbound: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    closed: AtomicBool,
}

impl RudpPeer {
    fn new(socket: Arc<UdpSocket>, addr: SocketAddr) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
        let peer = Arc::new(Self {
            socket,
            addr,
            send_state: Mutex::new(SendState {
                next_seq: 0,
                pending: HashMap::new(),
            }),
            recv_state: Mutex::new(RecvState {
                next_expected: 0,
                buffered: BTreeMap::new(),
            }),
            inbound: std::sync::Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        (peer, rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one frame reliably. Serialized under the per-peer send lock,
    /// which also hands out the sequence number.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        if frame.len() + DATAGRAM_HEADER > MAX_DATAGRAM {
            return Err(NetError::FrameTooLarge {
                length: frame.len(),
                max: MAX_DATAGRAM - DATAGRAM_HEADER,
            });
        }

        let mut state = self.send_state.lock().await;
        let seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);

        let bytes = build_datagram(seq, KIND_DATA, frame);
        self.socket
            .send_to(&bytes, self.addr)
            .await
            .map_err(|_| NetError::SendFailed)?;
        state.pending.insert(
            seq,
            PendingDatagram {
                bytes,
                retries: 0,
                next_retry: Instant::now() + RETRY_BASE,
            },
        );
        Ok(())
    }

    /// Datagrams awaiting acknowledgement.
    pub async fn pending_count(&self) -> usize {
        self.send_state.lock().await.pending.len()
    }

    /// Close this endpoint: best-effort fin to the peer, pending sends
    /// abandoned, inbound delivery ended. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fin = build_datagram(0, KIND_FIN, &[]);
        let _ = self.socket.send_to(&fin, self.addr).await;
        self.send_state.lock().await.pending.clear();
        self.drop_inbound();
    }

    fn mark_remote_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.drop_inbound();
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.inbound.lock().ok().and_then(|guard| guard.clone())
    }

    fn drop_inbound(&self) {
        if let Ok(mut guard) = self.inbound.lock() {
            guard.take();
        }
    }

    async fn handle_data(&self, seq: u32, body: &[u8]) {
        // Ack everything, including duplicates, so lost acks heal.
        let ack = build_datagram(seq, KIND_ACK, &[]);
        let _ = self.socket.send_to(&ack, self.addr).await;

        let deliverable = {
            let mut state = self.recv_state.lock().await;
            state.admit(seq, body.to_vec())
        };
        if deliverable.is_empty() {
            return;
        }
        let Some(tx) = self.inbound_sender() else {
            return;
        };
        for frame in deliverable {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    }

    async fn handle_ack(&self, seq: u32) {
        self.send_state.lock().await.pending.remove(&seq);
    }

    /// Resend every due datagram. Returns true when the peer exhausted its
    /// retries and has been torn down.
    async fn retransmit_due(&self, now: Instant) -> bool {
        let mut state = self.send_state.lock().await;
        let mut dead = false;
        for pending in state.pending.values_mut() {
            if now < pending.next_retry {
                continue;
            }
            if pending.retries >= MAX_RETRIES
                || self
                    .socket
                    .send_to(&pending.bytes, self.addr)
                    .await
                    .is_err()
            {
                dead = true;
                break;
            }
            pending.retries += 1;
            pending.next_retry = now + RETRY_BASE * 2u32.saturating_pow(pending.retries);
        }
        if dead {
            state.pending.clear();
            drop(state);
            warn!("rudp peer {} unreachable, giving up", self.addr);
            self.mark_remote_closed();
        }
        dead
    }
}

impl std::fmt::Debug for RudpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RudpPeer")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A newly accepted virtual connection and its ordered inbound frames.
pub struct RudpIncoming {
    pub peer: Arc<RudpPeer>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// The reliable-UDP endpoint: one socket, many virtual connections.
pub struct RudpListener {
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<SocketAddr, Arc<RudpPeer>>>,
    accept_rx: Mutex<mpsc::Receiver<RudpIncoming>>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

impl RudpListener {
    /// Bind the socket and start the demux and retransmit tasks.
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>, NetError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (shutdown_tx, _) = broadcast::channel(1);

        let listener = Arc::new(Self {
            socket,
            peers: Arc::new(DashMap::new()),
            accept_rx: Mutex::new(accept_rx),
            shutdown_tx,
            local_addr,
        });
        listener.spawn_demux(accept_tx);
        listener.spawn_retransmit();
        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Wait for the next accepted virtual connection. `None` after
    /// shutdown.
    pub async fn accept(&self) -> Option<RudpIncoming> {
        self.accept_rx.lock().await.recv().await
    }

    /// Open an outbound virtual connection to `addr` over this socket.
    pub fn open(&self, addr: SocketAddr) -> (Arc<RudpPeer>, mpsc::Receiver<Vec<u8>>) {
        let (peer, inbound) = RudpPeer::new(self.socket.clone(), addr);
        self.peers.insert(addr, peer.clone());
        (peer, inbound)
    }

    /// Stop the endpoint: fin every peer, end the accept stream.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let peers: Vec<Arc<RudpPeer>> = self.peers.iter().map(|e| e.value().clone()).collect();
        for peer in peers {
            peer.shutdown().await;
        }
        self.peers.clear();
    }

    fn spawn_demux(self: &Arc<Self>, accept_tx: mpsc::Sender<RudpIncoming>) {
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(v) => v,
                            Err(e) => {
                                debug!("rudp recv error: {}", e);
                                continue;
                            }
                        };
                        let Some((seq, kind, body)) = parse_datagram(&buf[..len]) else {
                            continue;
                        };
                        match kind {
                            KIND_DATA => {
                                let existing = peers.get(&from).map(|p| p.value().clone());
                                let peer = match existing {
                                    Some(peer) => peer,
                                    None => {
                                        let (peer, inbound) =
                                            RudpPeer::new(socket.clone(), from);
                                        peers.insert(from, peer.clone());
                                        debug!("rudp connection accepted from {}", from);
                                        if accept_tx
                                            .send(RudpIncoming { peer: peer.clone(), inbound })
                                            .await
                                            .is_err()
                                        {
                                            peers.remove(&from);
                                            continue;
                                        }
                                        peer
                                    }
                                };
                                peer.handle_data(seq, body).await;
                            }
                            KIND_ACK => {
                                let peer = peers.get(&from).map(|p| p.value().clone());
                                if let Some(peer) = peer {
                                    peer.handle_ack(seq).await;
                                }
                            }
                            KIND_FIN => {
                                if let Some((_, peer)) = peers.remove(&from) {
                                    debug!("rudp peer {} sent fin", from);
                                    peer.mark_remote_closed();
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
    }

    fn spawn_retransmit(self: &Arc<Self>) {
        let peers = self.peers.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRY_TICK);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let snapshot: Vec<(SocketAddr, Arc<RudpPeer>)> =
                            peers.iter().map(|e| (*e.key(), e.value().clone())).collect();
                        for (addr, peer) in snapshot {
                            if peer.is_closed() || peer.retransmit_due(now).await {
                                peers.remove(&addr);
                            }
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for RudpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RudpListener")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn datagram_layout_round_trips() {
        let bytes = build_datagram(7, KIND_DATA, b"frame");
        let (seq, kind, body) = parse_datagram(&bytes).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(kind, KIND_DATA);
        assert_eq!(body, b"frame");

        assert!(parse_datagram(&[1, 2, 3]).is_none());
    }

    #[test]
    fn serial_comparison_survives_wraparound() {
        assert!(seq_newer(1, 0));
        assert!(!seq_newer(0, 1));
        assert!(!seq_newer(5, 5));
        assert!(seq_newer(2, u32::MAX));
        assert!(!seq_newer(u32::MAX, 2));
    }

    #[test]
    fn out_of_order_arrivals_deliver_in_order() {
        let mut state = RecvState {
            next_expected: 0,
            buffered: BTreeMap::new(),
        };

        assert!(state.admit(2, vec![2]).is_empty());
        assert!(state.admit(1, vec![1]).is_empty());
        let delivered = state.admit(0, vec![0]);
        assert_eq!(delivered, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(state.next_expected, 3);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut state = RecvState {
            next_expected: 0,
            buffered: BTreeMap::new(),
        };
        assert_eq!(state.admit(0, vec![0]).len(), 1);
        assert!(state.admit(0, vec![0]).is_empty());
        assert_eq!(state.admit(1, vec![1]).len(), 1);
    }

    #[test]
    fn arrivals_beyond_the_window_are_dropped() {
        let mut state = RecvState {
            next_expected: 0,
            buffered: BTreeMap::new(),
        };
        assert!(state.admit(REORDER_WINDOW + 1, vec![9]).is_empty());
        assert!(state.buffered.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frames_cross_between_two_endpoints() {
        let a = RudpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b = RudpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let (peer, _inbound) = a.open(b.local_addr());
        peer.send_frame(b"hello rudp").await.unwrap();

        let mut incoming = timeout(Duration::from_secs(5), b.accept())
            .await
            .unwrap()
            .unwrap();
        let frame = timeout(Duration::from_secs(5), incoming.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"hello rudp");

        // The ack drains the pending queue.
        for _ in 0..50 {
            if peer.pending_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(peer.pending_count().await, 0);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn many_frames_arrive_in_send_order() {
        let a = RudpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b = RudpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let (peer, _inbound) = a.open(b.local_addr());
        for i in 0..32u32 {
            peer.send_frame(&i.to_be_bytes()).await.unwrap();
        }

        let mut incoming = timeout(Duration::from_secs(5), b.accept())
            .await
            .unwrap()
            .unwrap();
        for i in 0..32u32 {
            let frame = timeout(Duration::from_secs(5), incoming.inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame, i.to_be_bytes());
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fin_ends_inbound_delivery() {
        let a = RudpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b = RudpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let (peer, _inbound) = a.open(b.local_addr());
        peer.send_frame(b"bye").await.unwrap();

        let mut incoming = timeout(Duration::from_secs(5), b.accept())
            .await
            .unwrap()
            .unwrap();
        let frame = timeout(Duration::from_secs(5), incoming.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"bye");

        peer.shutdown().await;
        let end = timeout(Duration::from_secs(5), incoming.inbound.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(peer.is_closed());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[test]
    fn oversized_frames_are_refused() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let a = RudpListener::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            let (peer, _inbound) = a.open("127.0.0.1:9".parse().unwrap());
            let frame = vec![0u8; MAX_DATAGRAM + 1];
            assert!(matches!(
                peer.send_frame(&frame).await,
                Err(NetError::FrameTooLarge { .. })
            ));
            a.shutdown().await;
        });
    }
}
