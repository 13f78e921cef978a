//! One resilient WebSocket session per audio node.
//!
//! A session owns at most one live transport at a time. Readiness is
//! signaled by the protocol-level `ready` frame, not the transport open.
//! Non-manual closures schedule a fixed-interval reconnect with a single
//! outstanding timer; the retained session id is presented as a resume
//! hint so the remote node can reattach in-flight player state.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::common::{Error, GuildId, NodeId, Result, SessionId};
use crate::config::NodeConfig;
use crate::protocol::events::EventPayload;
use crate::protocol::opcodes::{Frame, PlayerUpdateState, ServerMessage, decode_frame};
use crate::protocol::stats::Stats;
use crate::rest::RestClient;

/// Close pair used for caller-initiated disconnects. The close handler
/// matches on it to suppress reconnection.
const MANUAL_CLOSE_CODE: u16 = 1000;
const MANUAL_CLOSE_REASON: &str = "Manually disconnected";

const CLIENT_NAME: &str = concat!("nodelink/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
}

/// Notifications fanned out to session subscribers, in arrival order.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Transport-level open. Not yet Ready.
    Connect,
    Ready {
        resumed: bool,
        session_id: SessionId,
    },
    Stats(Stats),
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    Event(EventPayload),
    /// A frame with an unrecognized discriminant, passed through opaquely.
    Raw(Value),
    Disconnect {
        code: u16,
        reason: String,
    },
    Reconnecting,
    /// Transport-level error. Reported, never fatal; the close event that
    /// follows drives reconnect policy.
    Error(String),
}

pub struct NodeSession {
    id: NodeId,
    config: NodeConfig,
    user_id: String,
    rest: Arc<RestClient>,
    state: Mutex<NodeState>,
    stats: RwLock<Option<Stats>>,
    /// Write-pump sender for the live socket; `None` while disconnected.
    outbound: Mutex<Option<flume::Sender<Message>>>,
    /// At most one pending reconnect timer.
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    subscribers: Mutex<Vec<flume::Sender<NodeEvent>>>,
}

impl NodeSession {
    pub fn new(config: NodeConfig, user_id: String) -> Result<Self> {
        let rest = Arc::new(RestClient::new(&config)?);
        Ok(Self {
            id: config.node_id(),
            config,
            user_id,
            rest,
            state: Mutex::new(NodeState::Disconnected),
            stats: RwLock::new(None),
            outbound: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Ready
    }

    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.rest.session_id()
    }

    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    /// Subscribe to this session's notifications. Events are delivered in
    /// arrival order; a dropped receiver is pruned on the next emit.
    pub fn subscribe(&self) -> flume::Receiver<NodeEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: NodeEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Open the control connection. No-op if already Ready or an attempt
    /// is in flight, so duplicate sockets cannot exist.
    pub fn connect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            match *state {
                NodeState::Connecting | NodeState::Ready => return,
                _ => *state = NodeState::Connecting,
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run_socket().await {
                Ok((code, reason)) => this.handle_close(code, reason),
                Err(err) => {
                    warn!(node = %this.id, error = %err, "connection attempt failed");
                    this.emit(NodeEvent::Error(err.to_string()));
                    // No transport close will arrive; synthesize one so the
                    // reconnect policy has its single authoritative trigger.
                    this.handle_close(1006, err.to_string());
                }
            }
        });
    }

    /// Close the transport with the manual close pair, cancelling any
    /// pending reconnect timer so the session cannot dial out again.
    /// No-op when there is neither a live socket nor a pending retry.
    pub fn disconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
            let mut state = self.state.lock();
            if *state == NodeState::Reconnecting {
                *state = NodeState::Disconnected;
            }
        }

        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: MANUAL_CLOSE_REASON.into(),
        };
        let _ = tx.send(Message::Close(Some(frame)));
    }

    async fn run_socket(self: &Arc<Self>) -> Result<(u16, String)> {
        let mut request = self.config.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&self.config.password)?);
        headers.insert("User-Id", header_value(&self.user_id)?);
        headers.insert("Client-Name", header_value(CLIENT_NAME)?);
        if let Some(session_id) = self.rest.session_id() {
            // Resume hint: lets the node reattach in-flight player state.
            headers.insert("Session-Id", header_value(&session_id)?);
        }

        info!(node = %self.id, url = %self.config.ws_url(), "connecting");
        let (stream, _) = connect_async(request).await?;

        // Transport open: cancel any pending reconnect timer.
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        self.emit(NodeEvent::Connect);

        let (mut write, mut read) = stream.split();
        let (tx, rx) = flume::unbounded::<Message>();
        *self.outbound.lock() = Some(tx);

        let write_task = tokio::spawn(async move {
            while let Ok(msg) = rx.recv_async().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Frames are handled one at a time in arrival order. Handlers may
        // dispatch outbound requests but never gate the next frame on them.
        let mut close = (1006, "abnormal closure".to_string());
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        close = (u16::from(frame.code), frame.reason.to_string());
                    } else {
                        close = (1000, String::new());
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    self.emit(NodeEvent::Error(err.to_string()));
                    break;
                }
            }
        }

        write_task.abort();
        *self.outbound.lock() = None;
        Ok(close)
    }

    fn handle_frame(self: &Arc<Self>, text: &str) {
        match decode_frame(text) {
            Ok(Frame::Message(msg)) => self.handle_message(msg),
            Ok(Frame::Raw(value)) => {
                debug!(node = %self.id, "passing through unrecognized frame");
                self.emit(NodeEvent::Raw(value));
            }
            Err(err) => {
                // One bad frame never tears the session down.
                warn!(node = %self.id, error = %err, "dropping malformed frame");
            }
        }
    }

    fn handle_message(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::Ready {
                resumed,
                session_id,
            } => {
                info!(node = %self.id, %session_id, resumed, "node ready");
                self.rest.set_session_id(session_id.clone());
                *self.state.lock() = NodeState::Ready;
                self.emit(NodeEvent::Ready {
                    resumed,
                    session_id,
                });
                if !resumed {
                    // Fresh session: enable resuming so a reconnect within
                    // the window recovers remote-side player state.
                    let rest = Arc::clone(&self.rest);
                    let timeout = self.config.resume_timeout;
                    let node = self.id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = rest.update_session(true, timeout).await {
                            warn!(%node, error = %err, "failed to enable session resuming");
                        }
                    });
                }
            }
            ServerMessage::Stats(stats) => {
                *self.stats.write() = Some(stats.clone());
                self.emit(NodeEvent::Stats(stats));
            }
            ServerMessage::PlayerUpdate { guild_id, state } => {
                self.emit(NodeEvent::PlayerUpdate { guild_id, state });
            }
            ServerMessage::Event(event) => {
                self.emit(NodeEvent::Event(event));
            }
        }
    }

    fn handle_close(self: &Arc<Self>, code: u16, reason: String) {
        *self.state.lock() = NodeState::Disconnected;
        info!(node = %self.id, code, reason = %reason, "disconnected");
        self.emit(NodeEvent::Disconnect {
            code,
            reason: reason.clone(),
        });

        if code == MANUAL_CLOSE_CODE && reason == MANUAL_CLOSE_REASON {
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        *self.state.lock() = NodeState::Reconnecting;
        self.emit(NodeEvent::Reconnecting);

        let this = Arc::clone(self);
        let delay = self.config.retry_interval();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.connect();
        }));
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    #[cfg(test)]
    pub(crate) fn inject_stats(&self, stats: Stats) {
        *self.stats.write() = Some(stats);
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| Error::Handshake(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<NodeSession> {
        Arc::new(
            NodeSession::new(
                NodeConfig {
                    host: "127.0.0.1".into(),
                    port: 2333,
                    password: "test".into(),
                    secure: false,
                    identifier: Some("test-node".into()),
                    resume_timeout: 60,
                    retry_interval_ms: 60_000,
                },
                "1234".into(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn connect_is_a_noop_when_ready_or_connecting() {
        let node = session();
        node.force_state(NodeState::Ready);
        node.connect();
        assert_eq!(node.state(), NodeState::Ready);

        node.force_state(NodeState::Connecting);
        node.connect();
        assert_eq!(node.state(), NodeState::Connecting);
        assert!(node.reconnect_task.lock().is_none());
    }

    #[tokio::test]
    async fn manual_close_never_schedules_reconnect() {
        let node = session();
        node.handle_close(MANUAL_CLOSE_CODE, MANUAL_CLOSE_REASON.to_string());
        assert_eq!(node.state(), NodeState::Disconnected);
        assert!(node.reconnect_task.lock().is_none());
    }

    #[tokio::test]
    async fn non_manual_close_schedules_a_single_reconnect() {
        let node = session();
        node.handle_close(4006, "session invalidated".to_string());
        assert_eq!(node.state(), NodeState::Reconnecting);

        let first = node
            .reconnect_task
            .lock()
            .as_ref()
            .map(|task| task.id())
            .expect("timer should be pending");

        // A second closure while the timer is pending must not stack timers.
        node.handle_close(1011, "server restarting".to_string());
        let second = node
            .reconnect_task
            .lock()
            .as_ref()
            .map(|task| task.id())
            .expect("timer should still be pending");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn a_normal_1000_close_without_the_manual_reason_reconnects() {
        let node = session();
        node.handle_close(1000, String::new());
        assert_eq!(node.state(), NodeState::Reconnecting);
    }

    #[tokio::test]
    async fn ready_frame_captures_session_identity() {
        let node = session();
        node.handle_frame(r#"{"op":"ready","resumed":true,"sessionId":"resumed-id"}"#);
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.session_id().unwrap().0, "resumed-id");
    }

    #[tokio::test]
    async fn subscribers_see_events_in_arrival_order() {
        let node = session();
        let rx = node.subscribe();

        node.handle_frame(r#"{"op":"ready","resumed":false,"sessionId":"s1"}"#);
        node.handle_frame(r#"{"op":"unknownOp","x":1}"#);
        node.handle_frame("this is not json");
        node.handle_frame(
            r#"{"op":"playerUpdate","guildId":"7","state":{"time":0,"position":10,"connected":true,"ping":3}}"#,
        );

        assert!(matches!(rx.try_recv().unwrap(), NodeEvent::Ready { .. }));
        assert!(matches!(rx.try_recv().unwrap(), NodeEvent::Raw(_)));
        // The malformed frame was dropped, not forwarded.
        match rx.try_recv().unwrap() {
            NodeEvent::PlayerUpdate { guild_id, state } => {
                assert_eq!(&*guild_id, "7");
                assert_eq!(state.position, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_frame_replaces_the_held_snapshot() {
        let node = session();
        assert!(node.stats().is_none());
        node.handle_frame(
            r#"{"op":"stats","players":1,"playingPlayers":1,"uptime":5,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":8,"systemLoad":0.1,"lavalinkLoad":0.05}}"#,
        );
        assert_eq!(node.stats().unwrap().cpu.cores, 8);
    }

    #[tokio::test]
    async fn disconnect_without_a_live_socket_is_a_noop() {
        let node = session();
        node.disconnect();
        assert_eq!(node.state(), NodeState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_cancels_a_pending_reconnect() {
        let node = session();
        node.handle_close(4006, "session invalidated".to_string());
        assert_eq!(node.state(), NodeState::Reconnecting);

        node.disconnect();
        assert!(node.reconnect_task.lock().is_none());
        assert_eq!(node.state(), NodeState::Disconnected);
    }
}
