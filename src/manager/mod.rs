//! Cluster registry: owns the node sessions and the per-guild players,
//! and assigns new players to the least-loaded ready node.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::{debug, info};

use crate::common::{Error, GuildId, NodeId, Result};
use crate::config::{ManagerConfig, NodeConfig, PlayerConfig};
use crate::node::NodeSession;
use crate::player::{Player, SendGatewayPayload, VoiceUpdate};
use crate::protocol::stats::Stats;
use crate::protocol::tracks::{LoadResult, Track};

pub struct Manager {
    user_id: String,
    send: SendGatewayPayload,
    nodes: DashMap<NodeId, Arc<NodeSession>>,
    players: Arc<DashMap<GuildId, Arc<Player>>>,
}

impl Manager {
    pub fn new(user_id: impl Into<String>, send: SendGatewayPayload) -> Self {
        Self {
            user_id: user_id.into(),
            send,
            nodes: DashMap::new(),
            players: Arc::new(DashMap::new()),
        }
    }

    /// Build a manager from a loaded configuration, registering and
    /// connecting every configured node.
    pub async fn from_config(config: ManagerConfig, send: SendGatewayPayload) -> Result<Self> {
        let manager = Self::new(config.user_id, send);
        for node in config.nodes {
            manager.add_node(node).await?;
        }
        Ok(manager)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Register a node and start its websocket session. Re-adding an
    /// identifier is a full replacement: the previous session and every
    /// player bound to it are torn down first, as in [`Self::remove_node`].
    pub async fn add_node(&self, config: NodeConfig) -> Result<Arc<NodeSession>> {
        let id = config.node_id();
        if self.nodes.contains_key(&id) {
            self.remove_node(&id).await;
        }
        let node = Arc::new(NodeSession::new(config, self.user_id.clone())?);
        info!(node = %id, "node registered");
        self.nodes.insert(id, Arc::clone(&node));
        node.connect();
        Ok(node)
    }

    /// Remove a node, destroying every player bound to it first. Returns
    /// false if the identifier is unknown.
    pub async fn remove_node(&self, id: &NodeId) -> bool {
        let Some((_, node)) = self.nodes.remove(id) else {
            return false;
        };

        let bound: Vec<Arc<Player>> = self
            .players
            .iter()
            .filter(|entry| Arc::ptr_eq(entry.value().node(), &node))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for player in bound {
            // The node is going away, so its REST errors are expected.
            if let Err(err) = player.destroy().await {
                debug!(node = %id, guild = %player.guild_id(), error = %err, "destroy during node removal failed");
            }
        }

        node.disconnect();
        info!(node = %id, "node removed");
        true
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<NodeSession>> {
        self.nodes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn nodes(&self) -> Vec<Arc<NodeSession>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// The ready node with the lowest load score, if any.
    pub fn get_ideal_node(&self) -> Option<Arc<NodeSession>> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().is_ready())
            .min_by(|a, b| {
                let a = load_score(a.value().stats().as_ref());
                let b = load_score(b.value().stats().as_ref());
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Create a player for a guild on the least-loaded ready node, or
    /// return the existing one. Fails only when no node is ready.
    pub fn create_player(&self, config: PlayerConfig) -> Result<Arc<Player>> {
        match self.players.entry(config.guild_id.clone()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let node = self.get_ideal_node().ok_or(Error::NoAvailableNode)?;
                let player = Player::new(
                    node,
                    config,
                    Arc::clone(&self.send),
                    Arc::downgrade(&self.players),
                );
                slot.insert(Arc::clone(&player));
                Ok(player)
            }
        }
    }

    pub fn player(&self, guild_id: &GuildId) -> Option<Arc<Player>> {
        self.players
            .get(guild_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Destroy a guild's player. A missing player is not an error.
    pub async fn destroy_player(&self, guild_id: &GuildId) -> Result<()> {
        match self.player(guild_id) {
            Some(player) => player.destroy().await,
            None => Ok(()),
        }
    }

    /// Resolve tracks through the least-loaded ready node, stamping the
    /// caller-supplied requester into every returned track's user data.
    pub async fn search(
        &self,
        query: &str,
        requester: Option<Value>,
        source: Option<&str>,
    ) -> Result<LoadResult> {
        let node = self.get_ideal_node().ok_or(Error::NoAvailableNode)?;
        let mut result = node.rest().load_tracks(query, source).await?;
        if let Some(requester) = requester {
            attach_requester(&mut result, &requester);
        }
        Ok(result)
    }

    /// Decode a server-encoded track through the least-loaded ready node.
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let node = self.get_ideal_node().ok_or(Error::NoAvailableNode)?;
        node.rest().decode_track(encoded).await
    }

    /// Route a forwarded Discord voice update to the guild's player.
    /// Updates for guilds without a player are dropped.
    pub async fn handle_voice_update(&self, update: VoiceUpdate) {
        match self.player(update.guild_id()) {
            Some(player) => player.handle_voice_update(update).await,
            None => {
                debug!(guild = %update.guild_id(), "voice update for unknown guild");
            }
        }
    }
}

/// Load score for node selection: lavalink load per core, lower is
/// better. A ready node that has not reported stats yet scores worst, so
/// reporting nodes win; two statless nodes compare equal.
fn load_score(stats: Option<&Stats>) -> f64 {
    match stats {
        Some(stats) => stats.cpu.lavalink_load / stats.cpu.cores.max(1) as f64,
        None => f64::INFINITY,
    }
}

/// Stamp the requester into each track's `userData` bag, preserving any
/// keys the server already put there.
fn attach_requester(result: &mut LoadResult, requester: &Value) {
    let stamp = |track: &mut Track| {
        if !track.user_data.is_object() {
            track.user_data = Value::Object(serde_json::Map::new());
        }
        if let Some(bag) = track.user_data.as_object_mut() {
            bag.insert("requester".to_string(), requester.clone());
        }
    };
    match result {
        LoadResult::Track(track) => stamp(track),
        LoadResult::Playlist(playlist) => playlist.tracks.iter_mut().for_each(stamp),
        LoadResult::Search(tracks) => tracks.iter_mut().for_each(stamp),
        LoadResult::Empty {} | LoadResult::Error(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;
    use crate::protocol::stats::{Cpu, Memory};
    use crate::protocol::tracks::TrackInfo;

    fn node_config(identifier: &str) -> NodeConfig {
        NodeConfig {
            host: "127.0.0.1".into(),
            port: 2333,
            password: "test".into(),
            secure: false,
            identifier: Some(identifier.into()),
            resume_timeout: 60,
            retry_interval_ms: 600_000,
        }
    }

    fn manager() -> Manager {
        Manager::new("1234", Arc::new(|_, _| {}))
    }

    // Registers a session without opening its websocket, so tests control
    // the state transitions themselves.
    fn register_node(manager: &Manager, identifier: &str) -> Arc<NodeSession> {
        let node =
            Arc::new(NodeSession::new(node_config(identifier), "1234".into()).unwrap());
        manager.nodes.insert(node.id().clone(), Arc::clone(&node));
        node
    }

    fn stats(lavalink_load: f64) -> Stats {
        Stats {
            players: 2,
            playing_players: 1,
            uptime: 1000,
            memory: Memory {
                free: 0,
                used: 0,
                allocated: 0,
                reservable: 0,
            },
            cpu: Cpu {
                cores: 4,
                system_load: 0.3,
                lavalink_load,
            },
            frame_stats: None,
        }
    }

    #[test]
    fn load_score_is_lavalink_load_per_core() {
        assert!(load_score(None).is_infinite());
        assert_eq!(load_score(Some(&stats(0.4))), 0.1);
        // Any reporting node beats a statless one.
        assert!(load_score(Some(&stats(0.99))) < load_score(None));
    }

    #[test]
    fn attach_requester_preserves_existing_user_data() {
        let info = TrackInfo {
            identifier: "a".into(),
            is_seekable: true,
            author: "author".into(),
            length: 1000,
            is_stream: false,
            position: 0,
            title: "a".into(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "youtube".into(),
        };
        let track = Track {
            encoded: Track::encode(&info),
            info,
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({"origin": "plugin"}),
        };
        let mut result = LoadResult::Search(vec![track]);

        attach_requester(&mut result, &serde_json::json!({"id": "42"}));

        let tracks = result.into_tracks();
        assert_eq!(tracks[0].user_data["requester"]["id"], "42");
        assert_eq!(tracks[0].user_data["origin"], "plugin");
    }

    #[tokio::test]
    async fn ideal_node_skips_nodes_that_are_not_ready() {
        let manager = manager();
        let idle = register_node(&manager, "idle");
        let busy = register_node(&manager, "busy");

        assert!(manager.get_ideal_node().is_none());

        busy.force_state(NodeState::Ready);
        busy.inject_stats(stats(0.5));
        assert_eq!(manager.get_ideal_node().unwrap().id(), busy.id());

        idle.force_state(NodeState::Ready);
        idle.inject_stats(stats(0.1));
        assert_eq!(manager.get_ideal_node().unwrap().id(), idle.id());

        // A ready node without a stats snapshot sorts last.
        let fresh = register_node(&manager, "fresh");
        fresh.force_state(NodeState::Ready);
        assert_eq!(manager.get_ideal_node().unwrap().id(), idle.id());
    }

    #[tokio::test]
    async fn create_player_is_idempotent_per_guild() {
        let manager = manager();
        let node = register_node(&manager, "only");
        node.force_state(NodeState::Ready);

        let config = PlayerConfig {
            guild_id: "guild".into(),
            channel_id: None,
            text_channel_id: None,
        };
        let first = manager.create_player(config.clone()).unwrap();
        let second = manager.create_player(config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.players().len(), 1);
    }

    #[tokio::test]
    async fn create_player_fails_without_a_ready_node() {
        let manager = manager();
        register_node(&manager, "down");

        let result = manager.create_player(PlayerConfig {
            guild_id: "guild".into(),
            channel_id: None,
            text_channel_id: None,
        });
        assert!(matches!(result.err(), Some(Error::NoAvailableNode)));
    }

    #[tokio::test]
    async fn re_adding_a_node_identifier_tears_down_its_players() {
        let manager = manager();
        let old = register_node(&manager, "dup");
        old.force_state(NodeState::Ready);
        let player = manager
            .create_player(PlayerConfig {
                guild_id: "guild".into(),
                channel_id: None,
                text_channel_id: None,
            })
            .unwrap();

        let replacement = manager.add_node(node_config("dup")).await.unwrap();

        // The stranded player was destroyed, and the registry holds only
        // the replacement session.
        assert!(manager.player(player.guild_id()).is_none());
        let registered = manager.node(replacement.id()).unwrap();
        assert!(Arc::ptr_eq(&registered, &replacement));
        assert!(!Arc::ptr_eq(&registered, &old));
    }

    #[tokio::test]
    async fn remove_node_destroys_its_players() {
        let manager = manager();
        let node = register_node(&manager, "only");
        node.force_state(NodeState::Ready);

        let player = manager
            .create_player(PlayerConfig {
                guild_id: "guild".into(),
                channel_id: None,
                text_channel_id: None,
            })
            .unwrap();

        assert!(manager.remove_node(node.id()).await);
        assert!(manager.player(player.guild_id()).is_none());
        assert!(manager.node(node.id()).is_none());
        assert!(!manager.remove_node(node.id()).await);
    }

    #[tokio::test]
    async fn voice_updates_for_unknown_guilds_are_dropped() {
        let manager = manager();
        let update: VoiceUpdate = serde_json::from_str(
            r#"{"guild_id":"1","channel_id":null,"user_id":"2","session_id":"3"}"#,
        )
        .unwrap();
        manager.handle_voice_update(update).await;
    }
}
