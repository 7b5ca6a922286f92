//! # Waypoint Server - Relay Infrastructure Host
//!
//! The runnable half of the relay: configuration loading, listener setup
//! and connection lifecycle around the [`waypoint_relay`] session logic.
//!
//! ## Design Philosophy
//!
//! The server core contains **no relay policy** - it only provides
//! infrastructure:
//!
//! * **Single-port protocol sniffing** - Game frames, plain HTTP and
//!   WebSocket upgrades share one TCP listener
//! * **Reliable-UDP endpoint** - The same framed protocol over a
//!   lightweight ack/retransmit layer
//! * **Multi-acceptor networking** - Optional SO_REUSEPORT accept loops,
//!   one per core
//! * **Session bookkeeping** - Idle sweeping and a close hook that tears
//!   down the relay session whichever side drops first
//!
//! All room, command and forwarding behavior lives in [`waypoint_relay`];
//! the wire format and transports live in [`waypoint_net`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use waypoint_server::{AppConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::default();
//!     config.validate()?;
//!     let server = RelayServer::new(config.to_server_config()?);
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub use config::{
    load_or_create, AppConfig, LoggingSettings, ServerConfig, ServerSettings, WebSettings,
};
pub use error::ServerError;
pub use server::RelayServer;

pub mod config;
pub mod error;
pub mod server;
