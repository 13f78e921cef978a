//! Client-side control plane for remote Lavalink v4 audio nodes.
//!
//! The crate is organized around three layers:
//!
//! - [`node::NodeSession`] owns one node's websocket lifecycle: the
//!   handshake, resume, reconnection, and the fan-out of server frames.
//! - [`player::Player`] is the per-guild playback state machine, bound to
//!   one session for its whole life.
//! - [`manager::Manager`] registers sessions, assigns new players to the
//!   least-loaded ready node, and routes forwarded Discord voice updates.
//!
//! Audio never flows through this crate; the node streams it directly.
//! Callers supply a [`player::SendGatewayPayload`] function so the crate
//! can ask their Discord gateway to join and leave voice channels.

pub mod common;
pub mod config;
pub mod manager;
pub mod node;
pub mod player;
pub mod protocol;
pub mod rest;

pub use common::{Error, GuildId, NodeId, Result, SessionId};
pub use config::{ConnectOptions, ManagerConfig, NodeConfig, PlayerConfig};
pub use manager::Manager;
pub use node::{NodeEvent, NodeSession, NodeState};
pub use player::{LoopMode, Player, PlayerEvent, SendGatewayPayload, VoiceUpdate};
pub use protocol::Filters;
pub use protocol::tracks::{LoadResult, Track, TrackInfo};
