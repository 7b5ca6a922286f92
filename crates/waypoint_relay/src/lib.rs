//! # Waypoint Relay - Room and Moderation Logic
//!
//! Everything above the transport layer: relay rooms and their directory,
//! the kick/ban table, chat command dispatch, localization and the concrete
//! game-protocol session ([`connect::RelayConnect`]).
//!
//! The relay never plays the game. It admits participants into rooms, hands
//! the first arrival the host role, wraps participant traffic toward the
//! host and unwraps host traffic toward its target site. Moderation -
//! kicking, banning, muting, jumping between relays - is a thin policy
//! layer over that forwarding core, and every policy refusal is an ordinary
//! chat message back to the caller.

pub use ban::{BanTable, BAN_GRACE_SECS, KICK_COOLDOWN_SECS};
pub use commands::{find_player, relay_client_commands, CommandRegistry, RelaySender};
pub use connect::RelayConnect;
pub use i18n::MessageBundle;
pub use room::{JoinOutcome, PlayerProfile, RelayDirectory, RelayParticipant, RelayRoom};

pub mod ban;
pub mod commands;
pub mod connect;
pub mod i18n;
pub mod room;
