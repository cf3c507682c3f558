//! Host-driven API: PeerCore receives signaling text, transport events and user
//! commands from the host and returns the events the host should act on.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, MessageHandler};
use crate::handshake::{Decision, Handshake, HandshakePhase};
use crate::identity::{self, Identity, PeerId};
use crate::protocol::{ApplicationMessage, DirectMessage, FileChunk, FileMetadata, Post};
use crate::session::{PeerSession, Role, SessionState};
use crate::signaling::{SessionDescription, SignalingEnvelope, SignalingError};
use crate::store::PostStore;
use crate::transfer::{
    ChunkOutcome, InboundTransfers, OutboundTransfer, OutgoingFile, ReceivedFile,
    TransferAssemblyError, TransferError, TransferProgress,
};
use crate::transport::{
    Channel, ChannelManager, MediaKind, PeerConfig, PeerConnector, SessionEpoch, TransportError,
    TransportEvent,
};
use crate::wire::{encode_message, FrameEncodeError};

/// Main coordinator. One per process; owns at most one live session.
pub struct PeerCore {
    identity: Identity,
    manager: ChannelManager,
    handshake: Handshake,
    session: Option<PeerSession>,
    posts: Box<dyn PostStore>,
    dispatcher: Dispatcher,
}

impl PeerCore {
    /// Build the core. The returned receiver carries every transport event;
    /// the host feeds each one back through [`PeerCore::handle_transport_event`].
    pub fn new(
        identity: Identity,
        connector: Arc<dyn PeerConnector>,
        config: PeerConfig,
        posts: Box<dyn PostStore>,
    ) -> (Self, mpsc::UnboundedReceiver<(SessionEpoch, TransportEvent)>) {
        let (manager, events) = ChannelManager::new(connector, config);
        let core = Self {
            identity,
            manager,
            handshake: Handshake::new(),
            session: None,
            posts,
            dispatcher: Dispatcher::new(),
        };
        (core, events)
    }

    pub fn local_id(&self) -> &PeerId {
        self.identity.local_id()
    }

    pub fn config(&self) -> &PeerConfig {
        self.manager.config()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, PeerSession::state)
    }

    pub fn phase(&self) -> HandshakePhase {
        self.handshake.phase()
    }

    pub fn role(&self) -> Option<Role> {
        self.handshake.role()
    }

    pub fn remote_id(&self) -> Option<&PeerId> {
        self.session.as_ref().map(PeerSession::remote_id)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn in_call(&self) -> bool {
        self.session.as_ref().is_some_and(PeerSession::media_active)
    }

    /// What this instance shows while Idle: "here is my id, make me an offer".
    pub fn initial_envelope(&self) -> SignalingEnvelope {
        SignalingEnvelope::Initial {
            sender_id: self.local_id().clone(),
        }
    }

    /// Stored posts, newest first.
    pub fn posts(&self) -> Vec<Post> {
        self.posts.all()
    }

    /// Handle envelope text obtained out of band (pasted code or relay frame).
    pub async fn handle_signaling(&mut self, text: &str) -> Vec<PeerEvent> {
        match SignalingEnvelope::parse(text) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => {
                warn!(event = "signaling_invalid", error = %e, "Rejecting envelope");
                let reason = e.to_string();
                let mut events = vec![PeerEvent::Error(PeerError::InvalidSignalingData(e))];
                events.extend(self.reset(&reason).await);
                events
            }
        }
    }

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) -> Vec<PeerEvent> {
        let decision = self.handshake.decide(&envelope);
        debug!(
            event = "envelope_received",
            kind = %envelope.kind(),
            sender = %envelope.sender_id().short(),
            phase = ?self.handshake.phase(),
            "Signaling envelope"
        );
        match decision {
            Decision::StartInitiator { remote } => self.start_initiator(remote).await,
            Decision::StartResponder { remote, offer } => self.start_responder(remote, offer).await,
            Decision::ApplyAnswer { answer } => self.apply_answer(answer).await,
            Decision::Ignore(reason) => {
                info!(event = "envelope_ignored", kind = %envelope.kind(), reason, "Ignoring envelope");
                Vec::new()
            }
            Decision::Violation(reason) => {
                warn!(event = "protocol_violation", %reason, "Unexpected envelope");
                self.fail(PeerError::ProtocolViolation(reason)).await
            }
        }
    }

    async fn start_initiator(&mut self, remote: PeerId) -> Vec<PeerEvent> {
        let local = self.local_id().clone();
        let mut session = match self
            .manager
            .create_session(local, remote, Role::Initiator)
            .await
        {
            Ok(s) => s,
            Err(e) => return self.fail(e.into()).await,
        };
        self.handshake.begin(Role::Initiator);
        let outcome = match self.manager.open_outbound_channel(&mut session).await {
            Ok(_) => {
                session.set_state(SessionState::OfferSent);
                session.connection().create_offer().await
            }
            Err(e) => Err(e),
        };
        let remote = session.remote_id().clone();
        self.session = Some(session);
        let offer = match outcome {
            Ok(offer) => offer,
            Err(e) => return self.fail(e.into()).await,
        };
        let mut events = vec![PeerEvent::StateChanged(SessionState::OfferSent)];
        events.extend(self.set_state(SessionState::AwaitingAnswer));
        info!(event = "offer_created", remote = %remote.short(), "Offer ready for delivery");
        events.push(PeerEvent::Envelope {
            envelope: SignalingEnvelope::Offer {
                sender_id: self.local_id().clone(),
                payload: offer,
            },
            recipient: remote,
        });
        events
    }

    async fn start_responder(
        &mut self,
        remote: PeerId,
        offer: SessionDescription,
    ) -> Vec<PeerEvent> {
        let local = self.local_id().clone();
        let session = match self
            .manager
            .create_session(local, remote, Role::Responder)
            .await
        {
            Ok(s) => s,
            Err(e) => return self.fail(e.into()).await,
        };
        self.handshake.begin(Role::Responder);
        let outcome = session.connection().accept_offer(&offer).await;
        let remote = session.remote_id().clone();
        self.session = Some(session);
        let answer = match outcome {
            Ok(answer) => answer,
            Err(e) => return self.fail(e.into()).await,
        };
        let mut events = self.set_state(SessionState::AnswerSent);
        info!(event = "answer_created", remote = %remote.short(), "Answer ready for delivery");
        events.push(PeerEvent::Envelope {
            envelope: SignalingEnvelope::Answer {
                sender_id: self.local_id().clone(),
                payload: answer,
            },
            recipient: remote,
        });
        events
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Vec<PeerEvent> {
        let result = match self.session.as_ref() {
            Some(session) => session.connection().apply_answer(&answer).await,
            None => Err(TransportError::Setup("no session to apply the answer to".into())),
        };
        match result {
            Ok(()) => {
                debug!(event = "answer_applied", "Waiting for the data channel to open");
                Vec::new()
            }
            Err(e) => self.fail(e.into()).await,
        }
    }

    /// Feed one platform event. Events from an older session are dropped.
    pub async fn handle_transport_event(
        &mut self,
        epoch: SessionEpoch,
        event: TransportEvent,
    ) -> Vec<PeerEvent> {
        let current = self.session.as_ref().map(PeerSession::epoch);
        if current != Some(epoch) {
            debug!(event = "stale_transport_event", epoch = epoch.0, ?event, "Dropping event from a closed session");
            if let TransportEvent::InboundChannel(dc) = event {
                dc.detach();
                dc.close().await;
            }
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        match event {
            TransportEvent::ConnectionState(state) => {
                if self.manager.observe_connection_state(session, state) {
                    self.reset(&format!("connection {state:?}").to_lowercase()).await
                } else {
                    Vec::new()
                }
            }
            TransportEvent::InboundChannel(dc) => {
                if session.role() != Role::Responder {
                    warn!(event = "unexpected_inbound_channel", label = %dc.label(), "Initiator received a channel, closing it");
                    dc.detach();
                    dc.close().await;
                    return Vec::new();
                }
                let adopted = self.manager.on_inbound_channel(session, dc).await;
                if adopted && session.channel().is_some_and(Channel::is_open) {
                    self.channel_opened()
                } else {
                    Vec::new()
                }
            }
            TransportEvent::ChannelOpen => self.channel_opened(),
            TransportEvent::ChannelClosed => {
                if session.state() == SessionState::Connected {
                    self.reset("data channel closed").await
                } else {
                    debug!(event = "channel_closed_early", state = %session.state());
                    Vec::new()
                }
            }
            TransportEvent::ChannelError(e) => {
                warn!(event = "channel_error", error = %e, "Data channel error");
                self.reset(&format!("data channel error: {e}")).await
            }
            TransportEvent::Message(payload) => {
                let mut events = Vec::new();
                let mut router = Router {
                    posts: self.posts.as_mut(),
                    transfers: session.transfers_mut(),
                    events: &mut events,
                };
                self.dispatcher.dispatch(&payload, &mut router);
                events
            }
            TransportEvent::RemoteTrack(kind) => {
                info!(event = "remote_track", ?kind, "Remote media track received");
                vec![PeerEvent::RemoteTrack(kind)]
            }
        }
    }

    fn channel_opened(&mut self) -> Vec<PeerEvent> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        if session.state() == SessionState::Connected || session.channel().is_none() {
            return Vec::new();
        }
        let remote = session.remote_id().clone();
        self.handshake.connected();
        let mut events = self.set_state(SessionState::Connected);
        info!(event = "connected", remote = %remote.short(), "Peer connected");
        events.push(PeerEvent::Connected { remote });
        events
    }

    fn set_state(&mut self, state: SessionState) -> Vec<PeerEvent> {
        match self.session.as_mut() {
            Some(session) if session.state() != state => {
                debug!(event = "session_state", from = %session.state(), to = %state);
                session.set_state(state);
                vec![PeerEvent::StateChanged(state)]
            }
            _ => Vec::new(),
        }
    }

    /// Record a failure and reset. With no session this only reports the error.
    async fn fail(&mut self, error: PeerError) -> Vec<PeerEvent> {
        let reason = error.to_string();
        let mut events = vec![PeerEvent::Error(error)];
        if let Some(session) = self.session.as_mut() {
            session.set_state(SessionState::Failed);
            self.handshake.fail();
        }
        events.extend(self.reset(&reason).await);
        events
    }

    /// Tear down the session and re-arm for a new handshake. Safe to call at
    /// any time; a no-op when already Idle with no session. The session is
    /// taken out before anything is awaited, so a second reset racing the
    /// first finds nothing to do.
    pub async fn reset(&mut self, reason: &str) -> Vec<PeerEvent> {
        let session = self.session.take();
        if session.is_none() && self.handshake.phase() == HandshakePhase::Idle {
            return Vec::new();
        }
        if let Some(mut session) = session {
            if !session.state().is_terminal() {
                session.set_state(SessionState::Closed);
            }
            session.transfers_mut().clear();
            self.manager.close(session).await;
        }
        self.handshake.reset();
        info!(event = "session_reset", %reason, "Session reset, ready for a new handshake");
        vec![
            PeerEvent::Reset {
                reason: reason.to_string(),
            },
            PeerEvent::StateChanged(SessionState::Idle),
            PeerEvent::Rearmed(self.initial_envelope()),
        ]
    }

    fn open_channel(&self) -> Result<Channel, PeerError> {
        self.session
            .as_ref()
            .filter(|s| s.state() == SessionState::Connected)
            .and_then(PeerSession::channel)
            .filter(|c| c.is_open())
            .cloned()
            .ok_or(PeerError::ChannelClosed)
    }

    async fn send_message(&self, msg: &ApplicationMessage) -> Result<(), PeerError> {
        let channel = self.open_channel()?;
        let payload = encode_message(msg, self.config().chunk_encoding)?;
        let deferred = channel.send_retrying(&payload).await?;
        debug!(event = "message_sent", kind = msg.kind(), bytes = payload.len(), deferred);
        Ok(())
    }

    /// Store a new post and send it when connected. The post is kept either way.
    pub async fn send_post(&mut self, content: &str) -> Result<(Post, PostDelivery), PeerError> {
        let post = Post {
            id: identity::new_token(),
            content: content.to_string(),
            sender: self.local_id().to_string(),
            timestamp: Utc::now(),
        };
        self.posts.put(post.clone());
        if !self.is_connected() {
            info!(event = "post_saved_locally", id = %post.id, "Not connected, post saved locally only");
            return Ok((post, PostDelivery::LocalOnly));
        }
        self.send_message(&ApplicationMessage::Post(post.clone()))
            .await?;
        Ok((post, PostDelivery::Delivered))
    }

    pub async fn send_direct_message(&mut self, content: &str) -> Result<DirectMessage, PeerError> {
        let message = DirectMessage {
            content: content.to_string(),
            sender: self.local_id().to_string(),
            timestamp: Utc::now(),
        };
        self.send_message(&ApplicationMessage::DirectMessage(message.clone()))
            .await?;
        Ok(message)
    }

    /// Remove a post locally and ask the peer to do the same when connected.
    /// Returns whether the post existed locally.
    pub async fn delete_post(&mut self, post_id: &str) -> Result<bool, PeerError> {
        let removed = self.posts.delete(post_id);
        if self.is_connected() {
            self.send_message(&ApplicationMessage::DeletePost {
                post_id: post_id.to_string(),
            })
            .await?;
        }
        Ok(removed)
    }

    /// Bind a file to the open channel. The host drives the returned transfer.
    pub fn prepare_file(&self, file: OutgoingFile) -> Result<OutboundTransfer, PeerError> {
        let channel = self.open_channel()?;
        let config = self.config();
        Ok(OutboundTransfer::new(
            file,
            channel,
            config.chunk_size,
            config.chunk_encoding,
        ))
    }

    /// Attach local audio and video. A no-op while a call is already active.
    pub async fn start_call(&mut self) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::ChannelClosed);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(PeerError::ChannelClosed);
        };
        if session.media_active() {
            return Ok(());
        }
        session.connection().attach_local_media().await?;
        session.set_media(true, true);
        info!(event = "call_started", "Local media attached");
        Ok(())
    }

    pub async fn end_call(&mut self) -> Result<(), PeerError> {
        let Some(session) = self.session.as_mut() else {
            return Err(PeerError::NoCall);
        };
        if !session.media_active() {
            return Err(PeerError::NoCall);
        }
        session.connection().release_media().await;
        session.set_media(false, false);
        info!(event = "call_ended", "Local media released");
        Ok(())
    }

    /// Flip the local video track. Returns whether video is now enabled.
    pub async fn toggle_video(&mut self) -> Result<bool, PeerError> {
        let Some(session) = self.session.as_mut().filter(|s| s.media_active()) else {
            return Err(PeerError::NoCall);
        };
        let enabled = !session.video_enabled();
        session.connection().set_video_enabled(enabled).await?;
        session.set_media(true, enabled);
        debug!(event = "video_toggled", enabled);
        Ok(enabled)
    }
}

/// Routes decoded channel messages into the post store and transfer table.
struct Router<'a> {
    posts: &'a mut dyn PostStore,
    transfers: &'a mut InboundTransfers,
    events: &'a mut Vec<PeerEvent>,
}

impl MessageHandler for Router<'_> {
    fn on_post(&mut self, post: Post) {
        self.posts.put(post.clone());
        self.events.push(PeerEvent::PostReceived(post));
    }

    fn on_direct_message(&mut self, message: DirectMessage) {
        self.events.push(PeerEvent::DirectMessage(message));
    }

    fn on_delete_post(&mut self, post_id: String) {
        if self.posts.delete(&post_id) {
            self.events.push(PeerEvent::PostDeleted { post_id });
        } else {
            debug!(event = "delete_unknown_post", %post_id, "Peer deleted a post we do not hold");
        }
    }

    fn on_file_metadata(&mut self, metadata: FileMetadata) {
        let progress = self.transfers.on_metadata(metadata);
        self.events.push(PeerEvent::TransferStarted(progress));
    }

    fn on_file_chunk(&mut self, chunk: FileChunk) {
        match self.transfers.on_chunk(chunk) {
            ChunkOutcome::Ignored => {}
            ChunkOutcome::Progress(p) => self.events.push(PeerEvent::TransferProgress(p)),
            ChunkOutcome::Complete(file) => self.events.push(PeerEvent::FileReceived(file)),
            ChunkOutcome::Failed { file_id, error } => {
                self.events.push(PeerEvent::TransferFailed { file_id, error })
            }
        }
    }
}

/// Where a new post ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDelivery {
    Delivered,
    /// Not connected; stored locally only.
    LocalOnly,
}

/// Everything the host must render, send or persist.
#[derive(Debug)]
pub enum PeerEvent {
    /// Deliver to the peer out of band (show as code, print, or relay).
    Envelope {
        envelope: SignalingEnvelope,
        recipient: PeerId,
    },
    StateChanged(SessionState),
    Connected {
        remote: PeerId,
    },
    Reset {
        reason: String,
    },
    /// Ready for a new handshake; show this envelope again.
    Rearmed(SignalingEnvelope),
    Error(PeerError),
    PostReceived(Post),
    PostDeleted {
        post_id: String,
    },
    DirectMessage(DirectMessage),
    TransferStarted(TransferProgress),
    TransferProgress(TransferProgress),
    FileReceived(ReceivedFile),
    TransferFailed {
        file_id: String,
        error: TransferAssemblyError,
    },
    RemoteTrack(MediaKind),
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connection setup failed: {0}")]
    Setup(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    InvalidSignalingData(#[from] SignalingError),
    #[error("not connected to a peer; exchange codes to reconnect")]
    ChannelClosed,
    #[error("channel buffer full")]
    BackpressureExceeded,
    #[error("send failed: {0}")]
    Send(String),
    #[error("could not encode message: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("media error: {0}")]
    Media(String),
    #[error("no call in progress")]
    NoCall,
}

impl From<TransportError> for PeerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ChannelClosed => PeerError::ChannelClosed,
            TransportError::BackpressureExceeded { .. } => PeerError::BackpressureExceeded,
            TransportError::Media(m) => PeerError::Media(m),
            TransportError::Setup(m) => PeerError::Setup(m),
            TransportError::Negotiation(m) => PeerError::Setup(format!("negotiation: {m}")),
            TransportError::Send(m) => PeerError::Send(m),
        }
    }
}
