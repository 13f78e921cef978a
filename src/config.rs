use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{GuildId, NodeId, Result};

/// Top-level client configuration: caller identity plus the nodes to
/// register at startup. More nodes can be added later via
/// [`Manager::add_node`](crate::manager::Manager::add_node).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    /// The user id presented to nodes in the `User-Id` handshake header.
    pub user_id: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ManagerConfig {
    /// Load the configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&config_str)?;
        Ok(config)
    }
}

/// Connection parameters for a single node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret presented in the `Authorization` header.
    pub password: String,
    /// Use wss/https instead of ws/http.
    #[serde(default)]
    pub secure: bool,
    /// Unique identifier for the node. Defaults to the host.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Remote-side session resume window, in seconds.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout: u64,
    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_resume_timeout() -> u64 {
    60
}

fn default_retry_interval_ms() -> u64 {
    5000
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        self.identifier
            .clone()
            .unwrap_or_else(|| self.host.clone())
            .into()
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }

    pub fn rest_base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}/v4", scheme, self.host, self.port)
    }
}

/// Options for creating a player. One player per guild.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    pub guild_id: GuildId,
    /// Voice channel to join. Stored for convenience; joining happens via
    /// [`Player::connect`](crate::player::Player::connect).
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Text channel for announcements. Stored for convenience.
    #[serde(default)]
    pub text_channel_id: Option<String>,
}

/// Voice-channel join options.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            self_mute: false,
            self_deaf: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_node_list() {
        let config: ManagerConfig = toml::from_str(
            r#"
            user_id = "123456789"

            [[nodes]]
            host = "lava-1.example.com"
            port = 2333
            password = "youshallnotpass"
            secure = true

            [[nodes]]
            host = "10.0.0.7"
            port = 2333
            password = "youshallnotpass"
            identifier = "local"
            retry_interval_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(&*config.nodes[0].node_id(), "lava-1.example.com");
        assert_eq!(
            config.nodes[0].ws_url(),
            "wss://lava-1.example.com:2333/v4/websocket"
        );
        assert_eq!(config.nodes[0].resume_timeout, 60);
        assert_eq!(&*config.nodes[1].node_id(), "local");
        assert_eq!(config.nodes[1].retry_interval(), Duration::from_secs(1));
        assert_eq!(
            config.nodes[1].rest_base_url(),
            "http://10.0.0.7:2333/v4"
        );
    }
}
