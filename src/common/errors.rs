use serde::Deserialize;

/// Convenient Result alias for fallible crate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// A non-2xx REST response with the node's structured error body.
    #[error("{error} ({status}): {message}")]
    Rest {
        status: u16,
        error: String,
        message: String,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid handshake header: {0}")]
    Handshake(String),

    #[error("failed to decode payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no node is currently connected")]
    NoAvailableNode,

    #[error("node session has not completed its handshake yet")]
    NoSessionId,

    #[error("no track is currently loaded")]
    NoCurrentTrack,

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Config(#[from] toml::de::Error),
}

/// Lavalink v4 JSON error response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Unix timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: u64,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status reason phrase (e.g. "Bad Request").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// The request path that caused the error.
    #[serde(default)]
    pub path: String,
    /// Stack trace, present only when the node runs in non-production mode.
    #[serde(default)]
    pub trace: Option<String>,
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::Rest {
            status: body.status,
            error: body.error,
            message: body.message,
        }
    }
}
