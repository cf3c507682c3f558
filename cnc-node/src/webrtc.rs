//! WebRTC backend: the core transport traits on top of webrtc-rs.
//!
//! Every callback only forwards a [`TransportEvent`] into the core's event
//! sink. Detaching flips a gate so callbacks that are already queued inside
//! webrtc-rs become no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cnc_core::transport::{
    ChannelState, ConnectionState, DataChannel, EventSink, MediaKind, PeerConfig, PeerConnection,
    PeerConnector, TransportError, TransportEvent,
};
use cnc_core::{Payload, SessionDescription};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const MEDIA_STREAM_ID: &str = "cybernetcall";

/// Gate in front of an [`EventSink`]; closed for good by `detach`.
struct Forwarder {
    sink: EventSink,
    detached: AtomicBool,
}

impl Forwarder {
    fn new(sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            sink,
            detached: AtomicBool::new(false),
        })
    }

    /// A separate gate on the same sink, so a channel can be detached on its own.
    fn child(&self) -> Arc<Self> {
        Self::new(self.sink.clone())
    }

    fn emit(&self, event: TransportEvent) {
        if self.detached.load(Ordering::Acquire) {
            debug!(event = "callback_after_detach", epoch = self.sink.epoch().0, ?event);
            return;
        }
        self.sink.emit(event);
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

fn build_api() -> Result<API, webrtc::Error> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_servers(config: &PeerConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn connection_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Checking,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn channel_state(s: RTCDataChannelState) -> ChannelState {
    match s {
        RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
            ChannelState::Connecting
        }
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
    }
}

fn media_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn payload_from(msg: DataChannelMessage) -> Payload {
    if msg.is_string {
        Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
    } else {
        Payload::Binary(msg.data.to_vec())
    }
}

fn negotiation(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Creates webrtc-rs peer connections.
pub struct WebRtcConnector {
    gather_timeout: Duration,
}

impl WebRtcConnector {
    pub fn new(gather_timeout: Duration) -> Self {
        Self { gather_timeout }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        config: &PeerConfig,
        events: EventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let setup = |e: webrtc::Error| TransportError::Setup(e.to_string());
        let api = build_api().map_err(setup)?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers(config),
                ..Default::default()
            })
            .await
            .map_err(setup)?,
        );
        let forwarder = Forwarder::new(events);

        let fwd = forwarder.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let fwd = fwd.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established")
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        warn!(event = "webrtc_lost", state = %s, "WebRTC connection lost")
                    }
                    _ => debug!(event = "webrtc_state", state = %s),
                }
                fwd.emit(TransportEvent::ConnectionState(connection_state(s)));
            })
        }));

        let fwd = forwarder.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let fwd = fwd.clone();
            Box::pin(async move {
                debug!(event = "dc_received", channel = %dc.label());
                let channel = WebRtcChannel::attach(dc, fwd.child());
                fwd.emit(TransportEvent::InboundChannel(channel));
            })
        }));

        let fwd = forwarder.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let fwd = fwd.clone();
            Box::pin(async move {
                if let Some(kind) = media_kind(track.kind()) {
                    fwd.emit(TransportEvent::RemoteTrack(kind));
                }
            })
        }));

        // Negotiate audio and video up front so a call can start later by
        // swapping tracks in, without another offer/answer round.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(kind, None)
                .await
                .map_err(setup)?;
        }

        Ok(Box::new(WebRtcConnection {
            pc,
            forwarder,
            gather_timeout: self.gather_timeout,
            media: Mutex::new(None),
        }))
    }
}

struct LocalMedia {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
}

impl LocalMedia {
    fn new() -> Self {
        let track = |mime: &str, id: &str| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                MEDIA_STREAM_ID.to_owned(),
            ))
        };
        Self {
            audio: track(MIME_TYPE_OPUS, "audio"),
            video: track(MIME_TYPE_VP8, "video"),
        }
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    forwarder: Arc<Forwarder>,
    gather_timeout: Duration,
    media: Mutex<Option<LocalMedia>>,
}

impl WebRtcConnection {
    /// Wait for ICE gathering so the description carries every candidate;
    /// there is no trickle channel to send late candidates over.
    async fn gathered_local_description(&self) -> Result<RTCSessionDescription, TransportError> {
        if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let (tx, rx) = oneshot::channel::<()>();
            let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
            self.pc
                .on_ice_gathering_state_change(Box::new(move |state| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        if state == RTCIceGathererState::Complete {
                            if let Ok(mut guard) = tx.lock() {
                                if let Some(tx) = guard.take() {
                                    let _ = tx.send(());
                                }
                            }
                        }
                    })
                }));
            if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
                match timeout(self.gather_timeout, rx).await {
                    Ok(_) => {}
                    Err(_) => {
                        return Err(TransportError::Setup(format!(
                            "ICE gathering did not finish within {:?}",
                            self.gather_timeout
                        )))
                    }
                }
            }
        }
        self.pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("no local description after ICE gathering".into()))
    }

    async fn set_track(
        &self,
        kind: RTPCodecType,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), TransportError> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != kind {
                continue;
            }
            return transceiver
                .sender()
                .await
                .replace_track(track)
                .await
                .map_err(|e| TransportError::Media(e.to_string()));
        }
        Err(TransportError::Media(format!("no {kind} transceiver")))
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(WebRtcChannel::attach(dc, self.forwarder.child()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;
        let local = self.gathered_local_description().await?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote = RTCSessionDescription::offer(offer.sdp.clone()).map_err(negotiation)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation)?;
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation)?;
        let local = self.gathered_local_description().await?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        let remote = RTCSessionDescription::answer(answer.sdp.clone()).map_err(negotiation)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation)
    }

    async fn attach_local_media(&self) -> Result<(), TransportError> {
        let mut media = self.media.lock().await;
        if media.is_some() {
            return Ok(());
        }
        let local = LocalMedia::new();
        self.set_track(RTPCodecType::Audio, Some(local.audio.clone()))
            .await?;
        self.set_track(RTPCodecType::Video, Some(local.video.clone()))
            .await?;
        *media = Some(local);
        Ok(())
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        let media = self.media.lock().await;
        let Some(local) = media.as_ref() else {
            return Err(TransportError::Media("no local tracks".into()));
        };
        let track: Option<Arc<dyn TrackLocal + Send + Sync>> = if enabled {
            Some(local.video.clone())
        } else {
            None
        };
        self.set_track(RTPCodecType::Video, track).await
    }

    async fn release_media(&self) {
        if self.media.lock().await.take().is_none() {
            return;
        }
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            if let Err(e) = self.set_track(kind, None).await {
                debug!(event = "media_release_failed", %kind, error = %e);
            }
        }
    }

    fn detach(&self) {
        self.forwarder.detach();
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "webrtc_close_failed", error = %e, "Error closing peer connection");
        }
    }
}

/// One webrtc-rs data channel with its callbacks wired to a forwarder.
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    forwarder: Arc<Forwarder>,
}

impl WebRtcChannel {
    /// Install the open/close/error/message handlers. The same handler set is
    /// used for channels we create and channels the peer creates.
    fn attach(dc: Arc<RTCDataChannel>, forwarder: Arc<Forwarder>) -> Arc<Self> {
        let label = dc.label().to_string();

        let fwd = forwarder.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let fwd = fwd.clone();
            let label = open_label.clone();
            Box::pin(async move {
                info!(event = "dc_open", channel = %label, "DataChannel open");
                fwd.emit(TransportEvent::ChannelOpen);
            })
        }));

        let fwd = forwarder.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let fwd = fwd.clone();
            let label = close_label.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
                fwd.emit(TransportEvent::ChannelClosed);
            })
        }));

        let fwd = forwarder.clone();
        dc.on_error(Box::new(move |err| {
            let fwd = fwd.clone();
            let label = label.clone();
            Box::pin(async move {
                warn!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
                fwd.emit(TransportEvent::ChannelError(err.to_string()));
            })
        }));

        let fwd = forwarder.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let fwd = fwd.clone();
            Box::pin(async move {
                fwd.emit(TransportEvent::Message(payload_from(msg)));
            })
        }));

        Arc::new(Self { dc, forwarder })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn state(&self) -> ChannelState {
        channel_state(self.dc.ready_state())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        let sent = match payload {
            Payload::Text(text) => self.dc.send_text(text.clone()).await,
            Payload::Binary(bytes) => self.dc.send(&Bytes::from(bytes.clone())).await,
        };
        sent.map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn detach(&self) {
        self.forwarder.detach();
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(event = "dc_close_failed", channel = %self.dc.label(), error = %e);
        }
    }
}
