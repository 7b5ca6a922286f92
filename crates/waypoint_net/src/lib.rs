//! # Waypoint Net - Transport and Protocol Foundation
//!
//! Networking core for the Waypoint relay server. This crate terminates two
//! independent transports behind one uniform connection abstraction and owns
//! everything below the relay logic:
//!
//! * **Packet framing** - length-prefixed binary frames, symmetric on both
//!   transports, with hard caps checked before any allocation
//! * **Connection abstraction** - a single handle over TCP streams, the
//!   reliable-UDP endpoint and a no-op capture variant, with FIFO send
//!   ordering guaranteed per connection
//! * **Protocol sniffing** - a one-shot first-bytes classifier that shares a
//!   single listening port between the binary game protocol, plain HTTP and
//!   WebSocket upgrades
//! * **Reliable UDP** - sequence numbers, acks, retransmission and in-order
//!   delivery over one shared socket with per-peer virtual connections
//! * **Session state** - the per-connection mutable state the idle sweeper
//!   and the protocol implementations share
//!
//! ## Ordering Guarantees
//!
//! Every send is routed through a construct that serializes writes per
//! connection: stream connections own a single writer task fed by a channel,
//! reliable-UDP connections serialize under one per-peer lock. Two packets
//! sent on the same connection are always delivered in send order; no
//! ordering exists across connections.
//!
//! ## Error Philosophy
//!
//! Nothing in this crate is fatal to the process. Framing and transport
//! errors disconnect exactly one connection; closing a connection twice is a
//! no-op; send failures surface as [`NetError::SendFailed`] so the caller can
//! treat the connection as suspect and drop it.

pub use codec::{decode_frame, encode_packet, read_packet, write_packet, DEFAULT_MAX_PAYLOAD};
pub use connection::{ConnectionChannel, TransportKind};
pub use error::NetError;
pub use event::NetEvents;
pub use geo::{ipv4_prefix24, GeoLookup, NoGeo};
pub use group::GroupRegistry;
pub use packet::{Packet, PacketKind};
pub use session::{current_millis, NetConnect, SessionState};
pub use sniff::ProtocolKind;
pub use web::WebRoutes;

pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod geo;
pub mod group;
pub mod packet;
pub mod proto;
pub mod rudp;
pub mod session;
pub mod sniff;
pub mod web;
