use std::io::{Cursor, Read, Write};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::protocol::events::Severity;

/// A single audio track with its node-opaque encoded form and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Base64-encoded track data. Opaque to callers; the node is the
    /// authority on its contents.
    pub encoded: String,
    pub info: TrackInfo,
    /// Plugin-specific info. Always `{}` without plugins.
    #[serde(default)]
    pub plugin_info: serde_json::Value,
    /// Caller-provided data attached to the track (e.g. the requester).
    #[serde(default)]
    pub user_data: serde_json::Value,
}

/// Metadata for an audio track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. 0 for streams.
    pub length: u64,
    pub is_stream: bool,
    /// Starting position in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

impl Track {
    /// Decode a track locally from its base64 form, without a REST round
    /// trip. `RestClient::decode_track` remains the authoritative path.
    pub fn decode(encoded: &str) -> Option<Self> {
        let data = BASE64_STANDARD.decode(encoded).ok()?;
        let mut cursor = Cursor::new(data);

        let version = cursor.read_u8().ok()?;
        if version > 3 {
            return None;
        }

        let title = read_utf(&mut cursor)?;
        let author = read_utf(&mut cursor)?;
        let length = cursor.read_u64::<BigEndian>().ok()?;
        let identifier = read_utf(&mut cursor)?;
        let is_stream = cursor.read_u8().ok()? != 0;

        let uri = read_opt_utf(&mut cursor);
        let artwork_url = if version >= 3 {
            read_opt_utf(&mut cursor)
        } else {
            None
        };
        let isrc = if version >= 3 {
            read_opt_utf(&mut cursor)
        } else {
            None
        };
        let source_name = read_utf(&mut cursor)?;

        let position = if version >= 2 {
            cursor.read_u64::<BigEndian>().unwrap_or(0)
        } else {
            0
        };

        Some(Self {
            encoded: encoded.to_string(),
            info: TrackInfo {
                identifier,
                is_seekable: !is_stream,
                author,
                length,
                is_stream,
                position,
                title,
                uri,
                artwork_url,
                isrc,
                source_name,
            },
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        })
    }

    /// Re-encode this track's metadata in the Lavalink v4 binary format.
    pub fn encode(info: &TrackInfo) -> String {
        let mut buf = Vec::new();
        // Version 3 (Lavalink v4 standard)
        buf.write_u8(3).unwrap();

        write_utf(&mut buf, &info.title);
        write_utf(&mut buf, &info.author);
        buf.write_u64::<BigEndian>(info.length).unwrap();
        write_utf(&mut buf, &info.identifier);
        buf.write_u8(if info.is_stream { 1 } else { 0 }).unwrap();

        write_opt_utf(&mut buf, info.uri.as_deref());
        write_opt_utf(&mut buf, info.artwork_url.as_deref());
        write_opt_utf(&mut buf, info.isrc.as_deref());
        write_utf(&mut buf, &info.source_name);

        buf.write_u64::<BigEndian>(info.position).unwrap();

        BASE64_STANDARD.encode(&buf)
    }
}

fn write_utf(w: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    w.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
    w.write_all(bytes).unwrap();
}

fn write_opt_utf(w: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            w.write_u8(1).unwrap();
            write_utf(w, s);
        }
        None => {
            w.write_u8(0).unwrap();
        }
    }
}

fn read_utf<R: Read>(r: &mut R) -> Option<String> {
    let len = r.read_u16::<BigEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn read_opt_utf<R: Read>(r: &mut R) -> Option<String> {
    let present = r.read_u8().ok()? != 0;
    if present { read_utf(r) } else { None }
}

/// Result of a track load operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    /// A single track was loaded.
    Track(Track),
    /// A playlist was loaded.
    Playlist(PlaylistData),
    /// A search returned results.
    Search(Vec<Track>),
    /// No matches found.
    Empty {},
    /// An error occurred during loading.
    Error(LoadError),
}

impl LoadResult {
    /// The first playable track of the result, if any.
    pub fn into_first_track(self) -> Option<Track> {
        match self {
            Self::Track(track) => Some(track),
            Self::Playlist(playlist) => playlist.tracks.into_iter().next(),
            Self::Search(tracks) => tracks.into_iter().next(),
            Self::Empty {} | Self::Error(_) => None,
        }
    }

    /// All tracks of the result, in order.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![track],
            Self::Playlist(playlist) => playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty {} | Self::Error(_) => Vec::new(),
        }
    }
}

/// Playlist data returned from a load operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: serde_json::Value,
    pub tracks: Vec<Track>,
}

/// Playlist metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track, or -1 if none.
    pub selected_track: i32,
}

/// Error from a failed track load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}
