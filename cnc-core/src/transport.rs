//! Transport channel manager: platform peer connection, the single data channel,
//! connection-state tracking and the send primitive with backpressure.
//!
//! The core never talks to a WebRTC stack directly. The host implements
//! [`PeerConnector`], [`PeerConnection`] and [`DataChannel`] and forwards every
//! platform callback as a [`TransportEvent`] through the [`EventSink`] it was
//! given. Each sink is stamped with the epoch of the session it belongs to, so
//! events still in flight after a reset are recognisably stale.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::protocol::{DATA_CHANNEL_LABEL, DEFAULT_CHUNK_SIZE, DEFAULT_STUN_URL};
use crate::session::{PeerSession, Role};
use crate::signaling::SessionDescription;
use crate::wire::{ChunkEncoding, Payload};

/// Default backpressure threshold expressed in chunks.
pub const DEFAULT_BACKPRESSURE_CHUNKS: usize = 16;

/// Default pause before retrying a send refused for backpressure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Generation counter for sessions. Incremented for every session created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionEpoch(pub u64);

/// One STUN or TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Transport and transfer tuning shared by both sides of a session.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    pub chunk_size: usize,
    /// Buffered-but-unsent bytes above which sends are refused.
    pub backpressure_threshold: usize,
    pub retry_delay: Duration,
    pub chunk_encoding: ChunkEncoding,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            backpressure_threshold: DEFAULT_CHUNK_SIZE * DEFAULT_BACKPRESSURE_CHUNKS,
            retry_delay: DEFAULT_RETRY_DELAY,
            chunk_encoding: ChunkEncoding::default(),
        }
    }
}

/// Connection-level state, mirroring the platform connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected, Failed and Closed all end the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Everything the platform reports about a session.
pub enum TransportEvent {
    ConnectionState(ConnectionState),
    /// Responder side: the peer created the data channel.
    InboundChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    Message(Payload),
    RemoteTrack(MediaKind),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            TransportEvent::InboundChannel(dc) => {
                f.debug_tuple("InboundChannel").field(&dc.label()).finish()
            }
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
            TransportEvent::Message(p) => f.debug_tuple("Message").field(&p.len()).finish(),
            TransportEvent::RemoteTrack(k) => f.debug_tuple("RemoteTrack").field(k).finish(),
        }
    }
}

/// Where platform callbacks deliver their events. Cheap to clone into closures.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: SessionEpoch,
    tx: mpsc::UnboundedSender<(SessionEpoch, TransportEvent)>,
}

impl EventSink {
    pub fn new(epoch: SessionEpoch, tx: mpsc::UnboundedSender<(SessionEpoch, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Forward an event. Silently dropped once the host stopped listening.
    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send((self.epoch, event)).is_err() {
            debug!(event = "transport_event_dropped", epoch = self.epoch.0, "Event receiver gone");
        }
    }
}

/// Factory for platform connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Construct a connection using `config.ice_servers`. Every callback the
    /// connection (and any channel it creates or receives) fires must be
    /// forwarded to `events`.
    async fn connect(
        &self,
        config: &PeerConfig,
        events: EventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// One platform peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the ordered, reliable data channel (initiator side).
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;
    /// Create an offer, apply it locally and return it once it is complete.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    /// Apply a remote offer, create an answer, apply it locally and return it.
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError>;
    /// Attach local audio and video tracks for a call.
    async fn attach_local_media(&self) -> Result<(), TransportError>;
    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError>;
    /// Stop and release local tracks. No-op without tracks.
    async fn release_media(&self);
    /// Unregister every callback so nothing fires for this connection again.
    fn detach(&self);
    async fn close(&self);
}

/// The data channel as the core sees it.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn state(&self) -> ChannelState;
    /// Bytes queued by the platform but not yet on the wire.
    async fn buffered_amount(&self) -> usize;
    async fn send(&self, payload: &Payload) -> Result<(), TransportError>;
    fn detach(&self);
    async fn close(&self);
}

/// Handle used for all sends on the session channel. Cloned into transfer tasks.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<dyn DataChannel>,
    backpressure_threshold: usize,
    retry_delay: Duration,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Channel {
    pub fn new(inner: Arc<dyn DataChannel>, config: &PeerConfig) -> Self {
        Self {
            inner,
            backpressure_threshold: config.backpressure_threshold,
            retry_delay: config.retry_delay,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == ChannelState::Open
    }

    pub fn label(&self) -> String {
        self.inner.label()
    }

    /// Send one payload. Fails with `ChannelClosed` unless open and with the
    /// soft `BackpressureExceeded` when too much is already buffered.
    pub async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        if self.inner.state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        let buffered = self.inner.buffered_amount().await;
        if buffered > self.backpressure_threshold {
            return Err(TransportError::BackpressureExceeded {
                buffered,
                threshold: self.backpressure_threshold,
            });
        }
        self.inner.send(payload).await
    }

    /// Like [`Channel::send`] but waits out backpressure instead of failing.
    /// Returns how many times the send was deferred.
    pub async fn send_retrying(&self, payload: &Payload) -> Result<u32, TransportError> {
        let mut deferred = 0u32;
        loop {
            match self.send(payload).await {
                Ok(()) => return Ok(deferred),
                Err(TransportError::BackpressureExceeded { buffered, threshold }) => {
                    if deferred == 0 {
                        debug!(
                            event = "backpressure",
                            channel = %self.inner.label(),
                            buffered,
                            threshold,
                            "Channel buffer full, deferring send"
                        );
                    }
                    deferred = deferred.saturating_add(1);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Owns the connector and hands out sessions, channels and the event stream.
pub struct ChannelManager {
    connector: Arc<dyn PeerConnector>,
    config: PeerConfig,
    events_tx: mpsc::UnboundedSender<(SessionEpoch, TransportEvent)>,
    next_epoch: u64,
}

impl ChannelManager {
    /// Returns the manager and the receiver the host must drain into the core.
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        config: PeerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(SessionEpoch, TransportEvent)>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                connector,
                config,
                events_tx,
                next_epoch: 0,
            },
            events_rx,
        )
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Allocate a new platform connection. Any previous session must already
    /// be closed; `PeerCore` guarantees that.
    pub async fn create_session(
        &mut self,
        local_id: PeerId,
        remote_id: PeerId,
        role: Role,
    ) -> Result<PeerSession, TransportError> {
        self.next_epoch += 1;
        let epoch = SessionEpoch(self.next_epoch);
        let sink = EventSink::new(epoch, self.events_tx.clone());
        let connection = self
            .connector
            .connect(&self.config, sink)
            .await
            .map_err(|e| e.context("peer connection"))?;
        info!(event = "session_created", epoch = epoch.0, ?role, remote = %remote_id.short(), "Peer connection created");
        let mut session = PeerSession::new(local_id, remote_id, role, epoch, connection);
        session.transfers_mut().set_chunk_size(self.config.chunk_size);
        Ok(session)
    }

    /// Create the single application channel on the initiating side.
    pub async fn open_outbound_channel(
        &self,
        session: &mut PeerSession,
    ) -> Result<Channel, TransportError> {
        let dc = session
            .connection()
            .create_data_channel(&self.config.channel_label)
            .await
            .map_err(|e| e.context("data channel"))?;
        let channel = Channel::new(dc, &self.config);
        session.attach_channel(channel.clone());
        debug!(event = "channel_created", label = %self.config.channel_label, "Outbound data channel created");
        Ok(channel)
    }

    /// Adopt the channel the peer created (responding side). Returns false if
    /// the session already has a channel and the new one was rejected.
    pub async fn on_inbound_channel(
        &self,
        session: &mut PeerSession,
        dc: Arc<dyn DataChannel>,
    ) -> bool {
        if session.channel().is_some() {
            warn!(event = "extra_channel", label = %dc.label(), "Session already has a data channel, closing the new one");
            dc.detach();
            dc.close().await;
            return false;
        }
        let label = dc.label();
        if label != self.config.channel_label {
            warn!(event = "channel_label_mismatch", %label, expected = %self.config.channel_label, "Adopting channel with unexpected label");
        }
        session.attach_channel(Channel::new(dc, &self.config));
        debug!(event = "channel_received", %label, "Inbound data channel adopted");
        true
    }

    /// Record a connection-state change. Returns true when the session must be
    /// reset; only the first terminal state does so.
    pub fn observe_connection_state(
        &self,
        session: &mut PeerSession,
        state: ConnectionState,
    ) -> bool {
        let previous = session.connection_state();
        session.set_connection_state(state);
        debug!(event = "connection_state", ?previous, current = ?state);
        state.is_terminal() && !previous.is_terminal()
    }

    /// Detach callbacks, then close channel and connection and release media.
    pub async fn close(&self, mut session: PeerSession) {
        let epoch = session.epoch();
        if let Some(channel) = session.take_channel() {
            channel.inner.detach();
            channel.inner.close().await;
        }
        let connection = session.connection();
        connection.detach();
        connection.release_media().await;
        connection.close().await;
        info!(event = "session_closed", epoch = epoch.0, "Peer connection closed");
    }
}

/// Transport failures. `BackpressureExceeded` is soft and retried by callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection setup failed: {0}")]
    Setup(String),
    #[error("channel is not open")]
    ChannelClosed,
    #[error("channel buffer full ({buffered} bytes buffered, limit {threshold})")]
    BackpressureExceeded { buffered: usize, threshold: usize },
    #[error("session description rejected: {0}")]
    Negotiation(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// Prefix a setup failure with what was being set up; other kinds pass through.
    fn context(self, what: &str) -> Self {
        match self {
            TransportError::Setup(m) => TransportError::Setup(format!("{what}: {m}")),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryChannel, MemoryNetwork};

    #[test]
    fn terminal_states() {
        assert!(!ConnectionState::New.is_terminal());
        assert!(!ConnectionState::Checking.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
    }

    #[test]
    fn default_threshold_is_sixteen_chunks() {
        let cfg = PeerConfig::default();
        assert_eq!(cfg.backpressure_threshold, 16 * 16 * 1024);
        assert_eq!(cfg.channel_label, DATA_CHANNEL_LABEL);
        assert_eq!(cfg.ice_servers[0].urls[0], DEFAULT_STUN_URL);
    }

    #[tokio::test]
    async fn send_on_closed_channel_fails() {
        let dc = MemoryChannel::standalone("x");
        let channel = Channel::new(dc.clone(), &PeerConfig::default());
        let err = channel.send(&Payload::Text("hi".into())).await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn send_over_threshold_is_soft_failure() {
        let dc = MemoryChannel::standalone("x");
        dc.force_open();
        dc.set_buffered(usize::MAX / 2);
        let channel = Channel::new(dc.clone(), &PeerConfig::default());
        let err = channel.send(&Payload::Text("hi".into())).await.unwrap_err();
        assert!(matches!(err, TransportError::BackpressureExceeded { .. }));
        assert_eq!(dc.sent_count(), 0);
    }

    #[tokio::test]
    async fn send_retrying_waits_for_drain() {
        let dc = MemoryChannel::standalone("x");
        dc.force_open();
        dc.set_buffered(usize::MAX / 2);
        dc.drain_after_polls(3);
        let cfg = PeerConfig {
            retry_delay: Duration::from_millis(1),
            ..PeerConfig::default()
        };
        let channel = Channel::new(dc.clone(), &cfg);
        let deferred = channel
            .send_retrying(&Payload::Text("hi".into()))
            .await
            .unwrap();
        assert!(deferred >= 1);
        assert_eq!(dc.sent_count(), 1);
    }

    #[tokio::test]
    async fn second_terminal_state_does_not_request_reset() {
        let net = MemoryNetwork::new();
        let (mut manager, _rx) = ChannelManager::new(net.connector(), PeerConfig::default());
        let mut session = manager
            .create_session("a".into(), "b".into(), Role::Initiator)
            .await
            .unwrap();
        assert!(!manager.observe_connection_state(&mut session, ConnectionState::Checking));
        assert!(manager.observe_connection_state(&mut session, ConnectionState::Failed));
        assert!(!manager.observe_connection_state(&mut session, ConnectionState::Closed));
    }

    #[tokio::test]
    async fn epochs_increase_per_session() {
        let net = MemoryNetwork::new();
        let (mut manager, _rx) = ChannelManager::new(net.connector(), PeerConfig::default());
        let a = manager
            .create_session("a".into(), "b".into(), Role::Initiator)
            .await
            .unwrap();
        let epoch_a = a.epoch();
        manager.close(a).await;
        let b = manager
            .create_session("a".into(), "c".into(), Role::Responder)
            .await
            .unwrap();
        assert!(b.epoch() > epoch_a);
    }

    #[tokio::test]
    async fn connector_failure_is_setup_error() {
        let net = MemoryNetwork::new();
        net.fail_next_connect();
        let (mut manager, _rx) = ChannelManager::new(net.connector(), PeerConfig::default());
        let err = manager
            .create_session("a".into(), "b".into(), Role::Initiator)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Setup(_)));
    }
}
