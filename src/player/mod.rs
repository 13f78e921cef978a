//! Per-guild playback state machine.
//!
//! A player is driven by two reconciled input sources: direct command
//! calls from the caller, and asynchronous events fanned out by its
//! owning node session. The at-most-one in-flight start invariant is
//! enforced by the `playing` flag under the player's state mutex.

pub mod queue;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{Error, GuildId, Result};
use crate::config::{ConnectOptions, PlayerConfig};
use crate::node::{NodeEvent, NodeSession};
use crate::protocol::Filters;
use crate::protocol::events::{EventPayload, TrackEndReason, TrackException};
use crate::protocol::tracks::Track;
use crate::rest::{LyricsResult, UpdatePlayerPayload, VoiceCredentials};
use queue::Queue;

/// Caller-supplied function that forwards a voice-gateway payload
/// (opcode 4) upstream to Discord.
pub type SendGatewayPayload = Arc<dyn Fn(&GuildId, Value) + Send + Sync>;

/// Governs what is drawn next when a track ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    None,
    Track,
    Queue,
}

/// Notifications emitted to player subscribers.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStart(Track),
    TrackEnd {
        /// The track that ended, captured before any state mutation.
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackException {
        track: Option<Track>,
        exception: TrackException,
    },
    /// Generic error companion to `TrackException`, also emitted when a
    /// start command fails.
    TrackError {
        track: Option<Track>,
        message: String,
    },
    TrackStuck {
        track: Option<Track>,
        threshold_ms: u64,
    },
    /// Voice websocket closure, surfaced for caller-level diagnostics.
    WebSocketClosed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
    QueueEnd,
}

/// A Discord voice-state update, forwarded by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    pub channel_id: Option<String>,
    pub user_id: String,
    pub session_id: String,
}

/// A Discord voice-server update, forwarded by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: GuildId,
    /// May be null while Discord allocates a voice server.
    pub endpoint: Option<String>,
}

/// Either half of the voice credentials, discriminated by the presence
/// of the server-only `token` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VoiceUpdate {
    Server(VoiceServerUpdate),
    State(VoiceStateUpdate),
}

impl VoiceUpdate {
    pub fn guild_id(&self) -> &GuildId {
        match self {
            Self::Server(update) => &update.guild_id,
            Self::State(update) => &update.guild_id,
        }
    }
}

struct PlayerState {
    queue: Queue,
    current_track: Option<Track>,
    playing: bool,
    paused: bool,
    volume: u16,
    /// Position estimate, refreshed by periodic state pushes. Not
    /// authoritative.
    position: u64,
    loop_mode: LoopMode,
    autoplay: bool,
    /// Opaque filter bag, shallow-merged by `set_filters` and pushed in
    /// full on every change.
    filters: serde_json::Map<String, Value>,
    voice_state: Option<VoiceStateUpdate>,
    voice_server: Option<VoiceServerUpdate>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            queue: Queue::new(),
            current_track: None,
            playing: false,
            paused: false,
            volume: 100,
            position: 0,
            loop_mode: LoopMode::None,
            autoplay: false,
            filters: serde_json::Map::new(),
            voice_state: None,
            voice_server: None,
        }
    }
}

pub struct Player {
    guild_id: GuildId,
    text_channel_id: Option<String>,
    channel_id: parking_lot::Mutex<Option<String>>,
    node: Arc<NodeSession>,
    send: SendGatewayPayload,
    state: tokio::sync::Mutex<PlayerState>,
    subscribers: parking_lot::Mutex<Vec<flume::Sender<PlayerEvent>>>,
    event_pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Back-reference to the registry's live-player map, used by
    /// [`Player::destroy`] to remove this guild.
    registry: Weak<DashMap<GuildId, Arc<Player>>>,
}

impl Player {
    pub(crate) fn new(
        node: Arc<NodeSession>,
        config: PlayerConfig,
        send: SendGatewayPayload,
        registry: Weak<DashMap<GuildId, Arc<Player>>>,
    ) -> Arc<Self> {
        let player = Arc::new(Self {
            guild_id: config.guild_id,
            text_channel_id: config.text_channel_id,
            channel_id: parking_lot::Mutex::new(config.channel_id),
            node,
            send,
            state: tokio::sync::Mutex::new(PlayerState::default()),
            subscribers: parking_lot::Mutex::new(Vec::new()),
            event_pump: parking_lot::Mutex::new(None),
            registry,
        });
        player.spawn_event_pump();
        player
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn node(&self) -> &Arc<NodeSession> {
        &self.node
    }

    pub fn channel_id(&self) -> Option<String> {
        self.channel_id.lock().clone()
    }

    pub fn text_channel_id(&self) -> Option<&str> {
        self.text_channel_id.as_deref()
    }

    /// Subscribe to this player's notifications, delivered in order.
    pub fn subscribe(&self) -> flume::Receiver<PlayerEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: PlayerEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// The session fans events to every bound player; each player keeps
    /// only its own guild's.
    fn spawn_event_pump(self: &Arc<Self>) {
        let events = self.node.subscribe();
        let this = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let Some(player) = this.upgrade() else {
                    break;
                };
                match event {
                    NodeEvent::Event(payload) if *payload.guild_id() == player.guild_id => {
                        player.handle_event(payload).await;
                    }
                    NodeEvent::PlayerUpdate { guild_id, state } if guild_id == player.guild_id => {
                        player.state.lock().await.position = state.position;
                    }
                    _ => {}
                }
            }
        });
        *self.event_pump.lock() = Some(task);
    }

    async fn handle_event(&self, event: EventPayload) {
        match event {
            EventPayload::TrackStart { track, .. } => {
                self.state.lock().await.playing = true;
                self.emit(PlayerEvent::TrackStart(track));
            }
            EventPayload::TrackEnd { track, reason, .. } => {
                let (ended, advance) = {
                    let mut st = self.state.lock().await;
                    let stale = st
                        .current_track
                        .as_ref()
                        .is_some_and(|current| current.encoded != track.encoded);
                    if stale {
                        // End notice for a track this player already moved
                        // past (e.g. a skip started the next one first).
                        (Some(track), false)
                    } else {
                        st.playing = false;
                        if reason.may_advance() {
                            (st.current_track.take(), true)
                        } else {
                            // Replaced: a new start is already in flight, so
                            // the queue must not advance here.
                            (st.current_track.clone(), false)
                        }
                    }
                };
                if advance {
                    self.advance(ended.clone()).await;
                }
                self.emit(PlayerEvent::TrackEnd {
                    track: ended,
                    reason,
                });
            }
            EventPayload::TrackException { exception, .. } => {
                let current = self.state.lock().await.current_track.clone();
                warn!(
                    guild = %self.guild_id,
                    cause = %exception.cause,
                    "track exception"
                );
                let message = exception
                    .message
                    .clone()
                    .unwrap_or_else(|| exception.cause.clone());
                self.emit(PlayerEvent::TrackException {
                    track: current.clone(),
                    exception,
                });
                self.emit(PlayerEvent::TrackError {
                    track: current,
                    message,
                });
            }
            EventPayload::TrackStuck { threshold_ms, .. } => {
                let current = self.state.lock().await.current_track.clone();
                self.emit(PlayerEvent::TrackStuck {
                    track: current,
                    threshold_ms,
                });
            }
            EventPayload::WebSocketClosed {
                code,
                reason,
                by_remote,
                ..
            } => {
                self.emit(PlayerEvent::WebSocketClosed {
                    code,
                    reason,
                    by_remote,
                });
            }
        }
    }

    /// Play the next track. An argument is appended to the queue first;
    /// if a track is already playing this only enqueues and returns.
    ///
    /// Start failures surface as a `TrackError` event, never an error
    /// return.
    pub async fn play(&self, track: Option<Track>) {
        let ended = {
            let mut st = self.state.lock().await;
            if let Some(track) = track {
                st.queue.add(track);
            }
            if st.playing {
                return;
            }
            st.current_track.take()
        };
        self.advance(ended).await;
    }

    /// Draw and start the next track, honoring loop-mode precedence and
    /// autoplay. `ended` is the track whose end triggered this advance.
    async fn advance(&self, ended: Option<Track>) {
        let mut st = self.state.lock().await;
        if st.playing {
            return;
        }

        let seed = ended.as_ref().map(|track| track.info.identifier.clone());
        let mut next = draw_next(st.loop_mode, ended, &mut st.queue);

        if next.is_none() && st.autoplay {
            if let Some(seed) = seed {
                // Autoplay failures are never fatal; queue-end still fires
                // if the lookup yields nothing.
                match self.node.rest().recommendations(&seed).await {
                    Ok(result) => {
                        if let Some(recommended) = result.into_first_track() {
                            st.queue.add(recommended);
                            next = st.queue.remove_first();
                        }
                    }
                    Err(err) => {
                        debug!(guild = %self.guild_id, error = %err, "autoplay lookup failed");
                    }
                }
            }
        }

        let Some(next) = next else {
            drop(st);
            info!(guild = %self.guild_id, "queue is empty");
            self.emit(PlayerEvent::QueueEnd);
            return;
        };

        st.current_track = Some(next.clone());
        st.playing = true;
        drop(st);

        info!(guild = %self.guild_id, title = %next.info.title, "starting track");
        let payload = UpdatePlayerPayload::start(next.encoded.clone());
        if let Err(err) = self.node.rest().update_player(&self.guild_id, &payload).await {
            warn!(guild = %self.guild_id, error = %err, "failed to start track");
            self.state.lock().await.playing = false;
            self.emit(PlayerEvent::TrackError {
                track: Some(next),
                message: err.to_string(),
            });
        }
    }

    /// Stop playback and clear the queue.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            st.playing = false;
            st.queue.clear();
        }
        self.node
            .rest()
            .update_player(&self.guild_id, &UpdatePlayerPayload::stop())
            .await
    }

    /// Stop the current track and advance to the next queued item. Skip
    /// is an explicit override of track-loop: the skipped track is never
    /// preserved.
    pub async fn skip(&self) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            st.playing = false;
            st.current_track = None;
        }
        self.node
            .rest()
            .update_player(&self.guild_id, &UpdatePlayerPayload::stop())
            .await?;
        self.play(None).await;
        Ok(())
    }

    /// Pause or resume. No-op if the requested state matches.
    pub async fn pause(&self, state: bool) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            if st.paused == state {
                return Ok(());
            }
            st.paused = state;
        }
        let payload = UpdatePlayerPayload {
            paused: Some(state),
            ..Default::default()
        };
        self.node
            .rest()
            .update_player(&self.guild_id, &payload)
            .await
    }

    /// Seek to a position in the current track, in milliseconds.
    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        let payload = UpdatePlayerPayload {
            position: Some(position_ms),
            ..Default::default()
        };
        self.node
            .rest()
            .update_player(&self.guild_id, &payload)
            .await
    }

    /// Set the volume, clamped to 0..=1000.
    pub async fn set_volume(&self, volume: i64) -> Result<()> {
        let volume = volume.clamp(0, 1000) as u16;
        self.state.lock().await.volume = volume;
        let payload = UpdatePlayerPayload {
            volume: Some(volume),
            ..Default::default()
        };
        self.node
            .rest()
            .update_player(&self.guild_id, &payload)
            .await
    }

    /// Shallow-merge a filter patch into the held bag and push the full
    /// bag to the node.
    pub async fn set_filters(&self, patch: Filters) -> Result<()> {
        let full = {
            let mut st = self.state.lock().await;
            if let Value::Object(map) = serde_json::to_value(&patch)? {
                for (key, value) in map {
                    st.filters.insert(key, value);
                }
            }
            Value::Object(st.filters.clone())
        };
        let payload = UpdatePlayerPayload {
            filters: Some(full),
            ..Default::default()
        };
        self.node
            .rest()
            .update_player(&self.guild_id, &payload)
            .await
    }

    /// Reset the filter bag and push the empty bag.
    pub async fn clear_filters(&self) -> Result<()> {
        self.state.lock().await.filters.clear();
        let payload = UpdatePlayerPayload {
            filters: Some(Value::Object(serde_json::Map::new())),
            ..Default::default()
        };
        self.node
            .rest()
            .update_player(&self.guild_id, &payload)
            .await
    }

    /// Pure local state; nothing is pushed to the node.
    pub async fn set_loop(&self, mode: LoopMode) {
        self.state.lock().await.loop_mode = mode;
    }

    pub async fn set_autoplay(&self, enabled: bool) {
        self.state.lock().await.autoplay = enabled;
    }

    /// Fetch lyrics for the current track.
    pub async fn lyrics(&self) -> Result<LyricsResult> {
        let track_id = self
            .state
            .lock()
            .await
            .current_track
            .as_ref()
            .map(|track| track.info.identifier.clone())
            .ok_or(Error::NoCurrentTrack)?;
        self.node.rest().lyrics(&track_id).await
    }

    pub async fn is_playing(&self) -> bool {
        self.state.lock().await.playing
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    pub async fn volume(&self) -> u16 {
        self.state.lock().await.volume
    }

    pub async fn position(&self) -> u64 {
        self.state.lock().await.position
    }

    pub async fn loop_mode(&self) -> LoopMode {
        self.state.lock().await.loop_mode
    }

    pub async fn autoplay(&self) -> bool {
        self.state.lock().await.autoplay
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.state.lock().await.current_track.clone()
    }

    pub async fn enqueue(&self, track: Track) {
        self.state.lock().await.queue.add(track);
    }

    pub async fn enqueue_many(&self, tracks: impl IntoIterator<Item = Track>) {
        self.state.lock().await.queue.add_many(tracks);
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn queue_snapshot(&self) -> Vec<Track> {
        self.state.lock().await.queue.as_vec()
    }

    pub async fn clear_queue(&self) {
        self.state.lock().await.queue.clear();
    }

    pub async fn shuffle_queue(&self) {
        self.state.lock().await.queue.shuffle();
    }

    pub async fn remove_track(&self, index: usize) -> Option<Track> {
        self.state.lock().await.queue.remove(index)
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Option<Track> {
        self.state
            .lock()
            .await
            .queue
            .move_track(from, to)
            .cloned()
    }

    /// Request the upstream voice gateway to join a channel. This does
    /// not touch the node session; the resulting voice-state and
    /// voice-server fragments arrive via `handle_voice_update`.
    pub fn connect(&self, channel_id: impl Into<String>, options: ConnectOptions) {
        let channel_id = channel_id.into();
        *self.channel_id.lock() = Some(channel_id.clone());
        (self.send)(
            &self.guild_id,
            serde_json::json!({
                "op": 4,
                "d": {
                    "guild_id": self.guild_id,
                    "channel_id": channel_id,
                    "self_mute": options.self_mute,
                    "self_deaf": options.self_deaf,
                }
            }),
        );
    }

    /// Request the upstream voice gateway to leave the channel.
    pub fn disconnect(&self) {
        *self.channel_id.lock() = None;
        (self.send)(
            &self.guild_id,
            serde_json::json!({
                "op": 4,
                "d": {
                    "guild_id": self.guild_id,
                    "channel_id": Value::Null,
                    "self_mute": false,
                    "self_deaf": false,
                }
            }),
        );
    }

    /// Store the arriving credential half and push the combined
    /// credentials once both halves are present. A new fragment
    /// overwrites the held one; only the latest values are ever used.
    pub async fn handle_voice_update(&self, update: VoiceUpdate) {
        let credentials = {
            let mut st = self.state.lock().await;
            match update {
                VoiceUpdate::Server(server) => st.voice_server = Some(server),
                VoiceUpdate::State(state) => st.voice_state = Some(state),
            }
            voice_credentials(st.voice_state.as_ref(), st.voice_server.as_ref())
        };

        if let Some(voice) = credentials {
            let payload = UpdatePlayerPayload {
                voice: Some(voice),
                ..Default::default()
            };
            if let Err(err) = self.node.rest().update_player(&self.guild_id, &payload).await {
                warn!(guild = %self.guild_id, error = %err, "failed to push voice credentials");
            }
        }
    }

    /// Leave the voice channel, destroy the node-side player and remove
    /// this guild from the registry. Irreversible.
    pub async fn destroy(&self) -> Result<()> {
        self.disconnect();
        if let Some(task) = self.event_pump.lock().take() {
            task.abort();
        }
        if let Some(players) = self.registry.upgrade() {
            players.remove(&self.guild_id);
        }
        info!(guild = %self.guild_id, "player destroyed");
        self.node.rest().destroy_player(&self.guild_id).await
    }
}

/// Select the next track to start under the given loop mode.
fn draw_next(loop_mode: LoopMode, ended: Option<Track>, queue: &mut Queue) -> Option<Track> {
    match loop_mode {
        // Track-loop replays the ended track unchanged.
        LoopMode::Track => ended.or_else(|| queue.remove_first()),
        // Queue-loop re-appends the ended track before drawing the head.
        LoopMode::Queue => {
            if let Some(track) = ended {
                queue.add(track);
            }
            queue.remove_first()
        }
        LoopMode::None => queue.remove_first(),
    }
}

/// Combine the two credential halves once state's session id and
/// server's token and endpoint are all present.
fn voice_credentials(
    state: Option<&VoiceStateUpdate>,
    server: Option<&VoiceServerUpdate>,
) -> Option<VoiceCredentials> {
    let state = state?;
    let server = server?;
    let endpoint = server.endpoint.as_ref()?;
    Some(VoiceCredentials {
        token: server.token.clone(),
        endpoint: endpoint.clone(),
        session_id: state.session_id.clone(),
    })
}
