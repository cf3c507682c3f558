//! Handshake state machine: decides what an incoming signaling envelope means
//! given the current phase and role. Pure; `PeerCore` carries out the decision.

use crate::identity::PeerId;
use crate::session::Role;
use crate::signaling::{EnvelopeKind, SessionDescription, SignalingEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// What to do with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Peer asked for an offer: become initiator.
    StartInitiator { remote: PeerId },
    /// Peer sent an offer: become responder.
    StartResponder {
        remote: PeerId,
        offer: SessionDescription,
    },
    ApplyAnswer { answer: SessionDescription },
    Ignore(&'static str),
    /// Envelope does not fit the current phase; the session must be reset.
    Violation(String),
}

#[derive(Debug, Default)]
pub struct Handshake {
    phase: HandshakePhase,
    role: Option<Role>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn decide(&self, envelope: &SignalingEnvelope) -> Decision {
        let kind = envelope.kind();
        match (self.phase, self.role) {
            (HandshakePhase::Connected, _) => Decision::Ignore("already connected"),
            (HandshakePhase::Idle, _) => match envelope {
                SignalingEnvelope::Initial { sender_id } => Decision::StartInitiator {
                    remote: sender_id.clone(),
                },
                SignalingEnvelope::Offer { sender_id, payload } => Decision::StartResponder {
                    remote: sender_id.clone(),
                    offer: payload.clone(),
                },
                SignalingEnvelope::Answer { .. } => {
                    Decision::Violation("answer received with no offer outstanding".into())
                }
            },
            (HandshakePhase::Connecting, Some(Role::Initiator)) => match envelope {
                SignalingEnvelope::Answer { payload, .. } => Decision::ApplyAnswer {
                    answer: payload.clone(),
                },
                _ => Decision::Violation(format!("{kind} received while awaiting an answer")),
            },
            (HandshakePhase::Connecting, Some(Role::Responder)) => {
                if kind == EnvelopeKind::Initial {
                    Decision::Violation("initial received while answering an offer".into())
                } else {
                    Decision::Ignore("responder already answered")
                }
            }
            (HandshakePhase::Connecting, None) | (HandshakePhase::Failed, _) => {
                Decision::Violation(format!("{kind} received in phase {:?}", self.phase))
            }
        }
    }

    /// A session was created for `role` and the first envelope is on its way.
    pub fn begin(&mut self, role: Role) {
        self.phase = HandshakePhase::Connecting;
        self.role = Some(role);
    }

    pub fn connected(&mut self) {
        self.phase = HandshakePhase::Connected;
    }

    pub fn fail(&mut self) {
        self.phase = HandshakePhase::Failed;
    }

    /// Back to Idle with no role. Nothing from the previous attempt is kept.
    pub fn reset(&mut self) {
        self.phase = HandshakePhase::Idle;
        self.role = None;
    }
}
