//! Typed client for a node's `/v4` REST surface.
//!
//! Commands issued back-to-back are not ordered relative to each other;
//! the remote node is the final arbiter of applied order.

use reqwest::{Method, StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use crate::common::{Error, ErrorBody, GuildId, HttpClient, Result, SessionId};
use crate::config::NodeConfig;
use crate::protocol::tracks::{LoadResult, Track};

/// Search-source prefixes that suppress the default `ytsearch:` prefix.
const SEARCH_PREFIXES: [&str; 14] = [
    "ytsearch:",
    "scsearch:",
    "dzsearch:",
    "spsearch:",
    "bcsearch:",
    "ymsearch:",
    "spshortsearch:",
    "apple:",
    "deezer:",
    "spotify:",
    "soundcloud:",
    "bandcamp:",
    "youtube:",
    "yandexmusic:",
];

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    password: String,
    /// Set once the session handshake completes; cleared never — a resumed
    /// session keeps its identity, a fresh one overwrites it.
    session_id: parking_lot::RwLock<Option<SessionId>>,
}

impl RestClient {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            base_url: config.rest_base_url(),
            password: config.password.clone(),
            session_id: parking_lot::RwLock::new(None),
        })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    pub(crate) fn set_session_id(&self, session_id: SessionId) {
        *self.session_id.write() = Some(session_id);
    }

    /// Resolve a query or URL to a track list.
    ///
    /// Bare queries are prefixed with the given search source (default
    /// `ytsearch`); URLs and already-prefixed identifiers pass through.
    pub async fn load_tracks(&self, identifier: &str, source: Option<&str>) -> Result<LoadResult> {
        let identifier = resolve_identifier(identifier, source);
        let endpoint = format!("/loadtracks?identifier={}", urlencoding::encode(&identifier));
        self.request(Method::GET, &endpoint, None).await
    }

    /// Decode an opaque encoded-track string via the node.
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let endpoint = format!("/decodetrack?encodedTrack={}", urlencoding::encode(encoded));
        self.request(Method::GET, &endpoint, None).await
    }

    /// Patch a guild's player. Fails with [`Error::NoSessionId`] before the
    /// session handshake completes.
    pub async fn update_player(
        &self,
        guild_id: &GuildId,
        payload: &UpdatePlayerPayload,
    ) -> Result<()> {
        let session_id = self.session_id().ok_or(Error::NoSessionId)?;
        let endpoint = format!("/sessions/{session_id}/players/{guild_id}");
        let body = serde_json::to_value(payload)?;
        self.request_empty(Method::PATCH, &endpoint, Some(body))
            .await
    }

    /// Delete a guild's player. Without a session id there is nothing to
    /// destroy, so this is a deliberate no-op.
    pub async fn destroy_player(&self, guild_id: &GuildId) -> Result<()> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };
        let endpoint = format!("/sessions/{session_id}/players/{guild_id}");
        self.request_empty(Method::DELETE, &endpoint, None).await
    }

    /// Patch the session resume policy.
    pub async fn update_session(&self, resuming: bool, timeout_secs: u64) -> Result<()> {
        let session_id = self.session_id().ok_or(Error::NoSessionId)?;
        let endpoint = format!("/sessions/{session_id}");
        let body = serde_json::json!({ "resuming": resuming, "timeout": timeout_secs });
        self.request_empty(Method::PATCH, &endpoint, Some(body))
            .await
    }

    /// Fetch recommended tracks seeded by a track identifier.
    pub async fn recommendations(&self, identifier: &str) -> Result<LoadResult> {
        let endpoint = format!(
            "/loadtracks?identifier=ytsearch:recommended%20{}",
            urlencoding::encode(identifier)
        );
        self.request(Method::GET, &endpoint, None).await
    }

    /// Fetch lyrics for a track identifier.
    pub async fn lyrics(&self, track_id: &str) -> Result<LyricsResult> {
        let endpoint = format!("/lyrics?trackId={}", urlencoding::encode(track_id));
        self.request(Method::GET, &endpoint, None).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let response = self.send(method, endpoint, body).await?;
        Ok(response.json().await?)
    }

    /// Like [`Self::request`] but discards the response body (2xx with no
    /// useful content, e.g. 204 on DELETE).
    async fn request_empty(&self, method: Method, endpoint: &str, body: Option<Value>) -> Result<()> {
        self.send(method, endpoint, body).await?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%method, %url, "issuing rest request");

        let mut request = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, &self.password);
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(rest_error(status, &text))
    }
}

/// Map a non-2xx response to a typed error, falling back to the raw body
/// when it is not the structured v4 shape.
fn rest_error(status: StatusCode, body: &str) -> Error {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.into(),
        Err(_) => Error::Rest {
            status: status.as_u16(),
            error: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            message: body.to_string(),
        },
    }
}

/// Apply the search-source prefix policy to a raw identifier.
fn resolve_identifier(identifier: &str, source: Option<&str>) -> String {
    let is_url = identifier.starts_with("http://") || identifier.starts_with("https://");
    let has_prefix = SEARCH_PREFIXES
        .iter()
        .any(|prefix| identifier.starts_with(prefix));
    if is_url || has_prefix {
        identifier.to_string()
    } else {
        format!("{}:{}", source.unwrap_or("ytsearch"), identifier)
    }
}

/// Body for the player PATCH endpoint. `None` fields are omitted;
/// `encoded_track` uses a nested option so `Some(None)` serializes the
/// explicit `null` that stops playback.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceCredentials>,
}

impl UpdatePlayerPayload {
    /// The stop command: an explicit null encoded track.
    pub fn stop() -> Self {
        Self {
            encoded_track: Some(None),
            ..Default::default()
        }
    }

    pub fn start(encoded: String) -> Self {
        Self {
            encoded_track: Some(Some(encoded)),
            ..Default::default()
        }
    }
}

/// Complete voice credentials, assembled from the state and server halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCredentials {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LyricsResult {
    pub lyrics: String,
    pub source: String,
}
