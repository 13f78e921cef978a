use serde::Deserialize;
use serde_json::Value;

use crate::common::{GuildId, SessionId};
use crate::protocol::events::EventPayload;
use crate::protocol::stats::Stats;

/// Messages pushed by the node over the control channel, tagged by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Ready {
        resumed: bool,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    Stats(Stats),
    Event(EventPayload),
}

/// Periodic guild-scoped position/connection snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

/// A decoded inbound frame: either a recognized message or an opaque
/// passthrough for unknown discriminants.
#[derive(Debug, Clone)]
pub enum Frame {
    Message(ServerMessage),
    Raw(Value),
}

const KNOWN_OPS: [&str; 4] = ["ready", "playerUpdate", "stats", "event"];

const KNOWN_EVENT_TYPES: [&str; 5] = [
    "TrackStartEvent",
    "TrackEndEvent",
    "TrackExceptionEvent",
    "TrackStuckEvent",
    "WebSocketClosedEvent",
];

/// Decode one inbound control frame.
///
/// Frames with an unrecognized `op` (or an `event` frame with an
/// unrecognized `type`) are passed through as [`Frame::Raw`] for
/// forward-compatibility. A frame with a recognized discriminant that
/// fails to parse is an error; the caller drops it and keeps reading.
pub fn decode_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;

    let op = value.get("op").and_then(Value::as_str);
    let recognized = match op {
        Some("event") => value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| KNOWN_EVENT_TYPES.contains(&t)),
        Some(op) => KNOWN_OPS.contains(&op),
        None => false,
    };

    if recognized {
        serde_json::from_value(value).map(Frame::Message)
    } else {
        Ok(Frame::Raw(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events::TrackEndReason;

    #[test]
    fn decodes_ready() {
        let frame =
            decode_frame(r#"{"op":"ready","resumed":false,"sessionId":"la3kfltkdt0dirtmt"}"#)
                .unwrap();
        match frame {
            Frame::Message(ServerMessage::Ready {
                resumed,
                session_id,
            }) => {
                assert!(!resumed);
                assert_eq!(&*session_id, "la3kfltkdt0dirtmt");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_player_update() {
        let frame = decode_frame(
            r#"{"op":"playerUpdate","guildId":"1","state":{"time":1,"position":250,"connected":true,"ping":-1}}"#,
        )
        .unwrap();
        match frame {
            Frame::Message(ServerMessage::PlayerUpdate { guild_id, state }) => {
                assert_eq!(&*guild_id, "1");
                assert_eq!(state.position, 250);
                assert_eq!(state.ping, -1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_stats() {
        let frame = decode_frame(
            r#"{"op":"stats","players":2,"playingPlayers":1,"uptime":123,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":4,"systemLoad":0.5,"lavalinkLoad":0.25}}"#,
        )
        .unwrap();
        match frame {
            Frame::Message(ServerMessage::Stats(stats)) => {
                assert_eq!(stats.players, 2);
                assert_eq!(stats.cpu.cores, 4);
                assert!(stats.frame_stats.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_track_end_event() {
        let encoded = crate::protocol::tracks::Track::encode(&crate::protocol::tracks::TrackInfo {
            identifier: "abc".into(),
            is_seekable: true,
            author: "a".into(),
            length: 1000,
            is_stream: false,
            position: 0,
            title: "t".into(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "youtube".into(),
        });
        let json = format!(
            r#"{{"op":"event","type":"TrackEndEvent","guildId":"9",
                "track":{{"encoded":"{encoded}","info":{{"identifier":"abc","isSeekable":true,
                "author":"a","length":1000,"isStream":false,"position":0,"title":"t",
                "uri":null,"sourceName":"youtube"}}}},"reason":"FINISHED"}}"#
        );
        let frame = decode_frame(&json).unwrap();
        match frame {
            Frame::Message(ServerMessage::Event(EventPayload::TrackEnd {
                guild_id,
                reason,
                ..
            })) => {
                assert_eq!(&*guild_id, "9");
                assert_eq!(reason, TrackEndReason::Finished);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_op_passes_through_raw() {
        let frame = decode_frame(r#"{"op":"shiny","data":42}"#).unwrap();
        match frame {
            Frame::Raw(value) => assert_eq!(value["data"], 42),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_passes_through_raw() {
        let frame =
            decode_frame(r#"{"op":"event","type":"ChapterStartedEvent","guildId":"1"}"#).unwrap();
        assert!(matches!(frame, Frame::Raw(_)));
    }

    #[test]
    fn malformed_known_frame_is_an_error() {
        // Recognized op but missing required fields: the read loop drops it.
        assert!(decode_frame(r#"{"op":"ready"}"#).is_err());
        assert!(decode_frame("not json").is_err());
    }
}
