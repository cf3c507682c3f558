//! CyberNetCall peer core.
//! Host-driven: no I/O; host passes signaling text, transport events and user
//! commands, and receives the events it must render, send or persist.

pub mod dispatch;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod wire;

pub mod core;

#[cfg(test)]
mod memory;

pub use crate::core::{PeerCore, PeerError, PeerEvent, PostDelivery};
pub use dispatch::{Dispatcher, MessageHandler};
pub use identity::{Identity, PeerId};
pub use protocol::{ApplicationMessage, DirectMessage, FileChunk, FileMetadata, Post};
pub use session::{Role, SessionState};
pub use signaling::{SessionDescription, SignalingEnvelope, SignalingError};
pub use store::{MemoryPostStore, PostStore};
pub use transfer::{OutboundTransfer, OutgoingFile, ReceivedFile, TransferProgress};
pub use transport::{
    ChannelState, ConnectionState, DataChannel, EventSink, IceServer, MediaKind, PeerConfig,
    PeerConnection, PeerConnector, SessionEpoch, TransportError, TransportEvent,
};
pub use wire::{ChunkEncoding, Payload};
