//! Per-connection session state and the protocol trait.

use crate::connection::ConnectionChannel;
use crate::error::NetError;
use crate::packet::Packet;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch.
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Mutable per-connection state shared by the protocol implementation and
/// the idle sweeper. Everything here is atomically updated; the connection
/// identity and addressing live on [`ConnectionChannel`] and never change.
#[derive(Debug)]
pub struct SessionState {
    /// Protocol retries before the peer completed its handshake.
    retries: AtomicU32,
    /// Set while the join handshake is still outstanding.
    awaiting_password: AtomicBool,
    /// Guards the teardown path so it runs once.
    disconnecting: AtomicBool,
    /// Stamp of the last successfully decoded inbound packet, millis.
    last_received: AtomicI64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            retries: AtomicU32::new(0),
            awaiting_password: AtomicBool::new(true),
            disconnecting: AtomicBool::new(false),
            last_received: AtomicI64::new(current_millis()),
        }
    }

    /// Record inbound activity. Called for every decoded packet.
    pub fn touch(&self) {
        self.last_received
            .store(current_millis(), Ordering::Relaxed);
    }

    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::Relaxed)
    }

    /// Milliseconds of inactivity relative to `now`.
    pub fn idle_for(&self, now_millis: i64) -> i64 {
        now_millis - self.last_received()
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn bump_retries(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_retries(&self) {
        self.retries.store(0, Ordering::Relaxed);
    }

    pub fn awaiting_password(&self) -> bool {
        self.awaiting_password.load(Ordering::Acquire)
    }

    pub fn set_awaiting_password(&self, value: bool) {
        self.awaiting_password.store(value, Ordering::Release);
    }

    /// Returns true exactly once; later callers see an ongoing disconnect.
    pub fn begin_disconnect(&self) -> bool {
        !self.disconnecting.swap(true, Ordering::AcqRel)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// A concrete protocol version driving one connection.
///
/// The server feeds decoded packets in; the implementation owns the session
/// and must route its teardown through [`ConnectionChannel::close`] so the
/// close hooks fire.
#[async_trait]
pub trait NetConnect: Send + Sync {
    /// Protocol version tag for logs and version negotiation.
    fn version(&self) -> &'static str;

    fn channel(&self) -> &ConnectionChannel;

    fn session(&self) -> &SessionState;

    /// Handle one inbound packet. Framing has already been validated.
    async fn receive_packet(&self, packet: Packet) -> Result<(), NetError>;

    /// Protocol-specific teardown. Must be idempotent.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_last_received() {
        let session = SessionState::new();
        let before = session.last_received();
        std::thread::sleep(std::time::Duration::from_millis(5));
        session.touch();
        assert!(session.last_received() >= before);
        assert!(session.idle_for(current_millis()) < 1000);
    }

    #[test]
    fn begin_disconnect_fires_once() {
        let session = SessionState::new();
        assert!(session.begin_disconnect());
        assert!(!session.begin_disconnect());
        assert!(session.is_disconnecting());
    }

    #[test]
    fn retries_accumulate_and_reset() {
        let session = SessionState::new();
        assert_eq!(session.bump_retries(), 1);
        assert_eq!(session.bump_retries(), 2);
        session.reset_retries();
        assert_eq!(session.retries(), 0);
    }

    #[test]
    fn handshake_flag_clears() {
        let session = SessionState::new();
        assert!(session.awaiting_password());
        session.set_awaiting_password(false);
        assert!(!session.awaiting_password());
    }
}
