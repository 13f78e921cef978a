use serde::{Deserialize, Serialize};

use crate::common::GuildId;
use crate::protocol::tracks::Track;

/// Guild-scoped events pushed by the node inside `op: event` frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: GuildId, track: Track },

    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: GuildId,
        track: Track,
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

impl EventPayload {
    /// Every event variant carries the guild it belongs to.
    pub fn guild_id(&self) -> &GuildId {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the player may advance to the next queued track for this
    /// reason. `Replaced` means another start command preempted the track,
    /// so a new start is already in flight.
    pub fn may_advance(&self) -> bool {
        !matches!(self, Self::Replaced)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}

/// Exception severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Common,
    Suspicious,
    Fatal,
}
