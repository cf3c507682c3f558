//! The single live peer session: identifiers, lifecycle state, channel and
//! in-progress inbound transfers.

use std::fmt;

use crate::identity::PeerId;
use crate::transfer::InboundTransfers;
use crate::transport::{Channel, ConnectionState, PeerConnection, SessionEpoch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Local offer applied; envelope still being produced.
    OfferSent,
    /// Offer envelope emitted; waiting for the answer, then for the channel.
    AwaitingAnswer,
    /// Answer envelope emitted; waiting for the channel.
    AnswerSent,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::OfferSent => "offer-sent",
            SessionState::AwaitingAnswer => "awaiting-answer",
            SessionState::AnswerSent => "answer-sent",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        })
    }
}

/// Owns the platform connection, its channel and every inbound transfer.
/// Dropping or closing the session tears all of them down together.
pub struct PeerSession {
    local_id: PeerId,
    remote_id: PeerId,
    state: SessionState,
    role: Role,
    epoch: SessionEpoch,
    connection: Box<dyn PeerConnection>,
    connection_state: ConnectionState,
    channel: Option<Channel>,
    transfers: InboundTransfers,
    media_active: bool,
    video_enabled: bool,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("epoch", &self.epoch)
            .field("connection_state", &self.connection_state)
            .field("channel", &self.channel)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl PeerSession {
    pub fn new(
        local_id: PeerId,
        remote_id: PeerId,
        role: Role,
        epoch: SessionEpoch,
        connection: Box<dyn PeerConnection>,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            state: SessionState::Idle,
            role,
            epoch,
            connection,
            connection_state: ConnectionState::New,
            channel: None,
            transfers: InboundTransfers::new(),
            media_active: false,
            video_enabled: false,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn connection(&self) -> &dyn PeerConnection {
        self.connection.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn attach_channel(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }

    pub fn take_channel(&mut self) -> Option<Channel> {
        self.channel.take()
    }

    pub fn transfers(&self) -> &InboundTransfers {
        &self.transfers
    }

    pub fn transfers_mut(&mut self) -> &mut InboundTransfers {
        &mut self.transfers
    }

    pub fn media_active(&self) -> bool {
        self.media_active
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn set_media(&mut self, active: bool, video: bool) {
        self.media_active = active;
        self.video_enabled = active && video;
    }
}
