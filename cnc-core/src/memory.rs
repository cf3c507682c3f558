//! In-memory transport for tests: connections created from one
//! [`MemoryNetwork`] find each other through the session descriptions they
//! exchange, and their channels deliver straight into the peer's event sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::signaling::SessionDescription;
use crate::transport::{
    ChannelState, ConnectionState, DataChannel, EventSink, MediaKind, PeerConfig, PeerConnection,
    PeerConnector, TransportError, TransportEvent,
};
use crate::wire::Payload;

#[derive(Default)]
struct Registry {
    connections: Mutex<HashMap<u64, Arc<MemoryConnection>>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    next_id: AtomicU64,
    fail_next: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Registry>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(MemoryConnector {
            registry: self.inner.clone(),
        })
    }

    pub fn fail_next_connect(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    /// Connections created and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap()
            .values()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Channels in creation order; initiator channels come before the
    /// responder channel paired with them.
    pub fn channel(&self, index: usize) -> Option<Arc<MemoryChannel>> {
        self.inner.channels.lock().unwrap().get(index).cloned()
    }
}

struct MemoryConnector {
    registry: Arc<Registry>,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(
        &self,
        _config: &PeerConfig,
        events: EventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        if self.registry.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Setup("memory network refused".into()));
        }
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(MemoryConnection {
            id,
            sink: events,
            registry: Arc::downgrade(&self.registry),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            channel: Mutex::new(None),
            remote: Mutex::new(Weak::new()),
            media: AtomicBool::new(false),
            video: AtomicBool::new(false),
        });
        self.registry
            .connections
            .lock()
            .unwrap()
            .insert(id, conn.clone());
        Ok(Box::new(MemoryConnectionHandle(conn)))
    }
}

pub struct MemoryConnection {
    id: u64,
    sink: EventSink,
    registry: Weak<Registry>,
    detached: AtomicBool,
    closed: AtomicBool,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    remote: Mutex<Weak<MemoryConnection>>,
    media: AtomicBool,
    video: AtomicBool,
}

impl MemoryConnection {
    fn emit(&self, event: TransportEvent) {
        if !self.detached.load(Ordering::SeqCst) {
            self.sink.emit(event);
        }
    }

    fn lookup(&self, sdp: &SessionDescription) -> Result<Arc<MemoryConnection>, TransportError> {
        let id: u64 = sdp
            .sdp
            .strip_prefix("memory:")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::Negotiation(format!("unknown description {:?}", sdp.sdp)))?;
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| TransportError::Negotiation("network dropped".into()))?;
        let found = registry.connections.lock().unwrap().get(&id).cloned();
        found.ok_or_else(|| TransportError::Negotiation(format!("no connection {id}")))
    }

    fn description(&self) -> String {
        format!("memory:{}", self.id)
    }
}

struct MemoryConnectionHandle(Arc<MemoryConnection>);

#[async_trait]
impl PeerConnection for MemoryConnectionHandle {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MemoryChannel::new(label, Some(self.0.sink.clone()));
        if let Some(registry) = self.0.registry.upgrade() {
            registry.channels.lock().unwrap().push(channel.clone());
        }
        *self.0.channel.lock().unwrap() = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(self.0.description()))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let initiator = self.0.lookup(offer)?;
        *self.0.remote.lock().unwrap() = Arc::downgrade(&initiator);
        Ok(SessionDescription::answer(self.0.description()))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        let responder = self.0.lookup(answer)?;
        *self.0.remote.lock().unwrap() = Arc::downgrade(&responder);

        self.0.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        responder.emit(TransportEvent::ConnectionState(ConnectionState::Connected));

        let local = self.0.channel.lock().unwrap().clone();
        if let Some(local) = local {
            let remote = MemoryChannel::new(&local.label, Some(responder.sink.clone()));
            if let Some(registry) = self.0.registry.upgrade() {
                registry.channels.lock().unwrap().push(remote.clone());
            }
            *local.peer.lock().unwrap() = Arc::downgrade(&remote);
            *remote.peer.lock().unwrap() = Arc::downgrade(&local);
            local.force_open();
            remote.force_open();
            *responder.channel.lock().unwrap() = Some(remote.clone());
            responder.emit(TransportEvent::InboundChannel(remote.clone()));
            remote.emit(TransportEvent::ChannelOpen);
            local.emit(TransportEvent::ChannelOpen);
        }
        Ok(())
    }

    async fn attach_local_media(&self) -> Result<(), TransportError> {
        self.0.media.store(true, Ordering::SeqCst);
        self.0.video.store(true, Ordering::SeqCst);
        let remote = self.0.remote.lock().unwrap().upgrade();
        if let Some(remote) = remote {
            remote.emit(TransportEvent::RemoteTrack(MediaKind::Audio));
            remote.emit(TransportEvent::RemoteTrack(MediaKind::Video));
        }
        Ok(())
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        if !self.0.media.load(Ordering::SeqCst) {
            return Err(TransportError::Media("no local tracks".into()));
        }
        self.0.video.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn release_media(&self) {
        self.0.media.store(false, Ordering::SeqCst);
        self.0.video.store(false, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.0.detached.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.emit(TransportEvent::ConnectionState(ConnectionState::Closed));
        let remote = self.0.remote.lock().unwrap().upgrade();
        if let Some(remote) = remote {
            remote.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
        }
    }
}

pub struct MemoryChannel {
    label: String,
    sink: Option<EventSink>,
    state: Mutex<ChannelState>,
    detached: AtomicBool,
    buffered: AtomicUsize,
    polls_until_drained: AtomicUsize,
    sent: AtomicUsize,
    peer: Mutex<Weak<MemoryChannel>>,
}

impl MemoryChannel {
    fn new(label: &str, sink: Option<EventSink>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sink,
            state: Mutex::new(ChannelState::Connecting),
            detached: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            polls_until_drained: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            peer: Mutex::new(Weak::new()),
        })
    }

    /// A channel with no connection or peer behind it.
    pub fn standalone(label: &str) -> Arc<Self> {
        Self::new(label, None)
    }

    pub fn force_open(&self) {
        *self.state.lock().unwrap() = ChannelState::Open;
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// The buffer reads as empty from the `polls`-th query on.
    pub fn drain_after_polls(&self, polls: usize) {
        self.polls_until_drained.store(polls, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Deliver `text` to the peer as if it had been sent on this channel.
    pub fn inject(&self, text: &str) {
        self.deliver(Payload::Text(text.to_string()));
    }

    fn emit(&self, event: TransportEvent) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn deliver(&self, payload: Payload) {
        let peer = self.peer.lock().unwrap().upgrade();
        if let Some(peer) = peer {
            peer.emit(TransportEvent::Message(payload));
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn buffered_amount(&self) -> usize {
        let left = self.polls_until_drained.load(Ordering::SeqCst);
        if left > 0 {
            if left == 1 {
                self.buffered.store(0, Ordering::SeqCst);
            }
            self.polls_until_drained.store(left - 1, Ordering::SeqCst);
        }
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.deliver(payload.clone());
        Ok(())
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.emit(TransportEvent::ChannelClosed);
        let peer = self.peer.lock().unwrap().upgrade();
        if let Some(peer) = peer {
            *peer.state.lock().unwrap() = ChannelState::Closed;
            peer.emit(TransportEvent::ChannelClosed);
        }
    }
}
