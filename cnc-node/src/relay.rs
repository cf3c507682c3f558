//! Websocket relay client for offer/answer envelopes.
//!
//! The relay routes frames on `recipientId`. We register our id once, push
//! envelopes addressed to the remote peer, and hand every inbound text frame
//! to the app loop, which feeds it to the core like a pasted code.

use std::sync::Arc;

use anyhow::Context;
use cnc_core::{PeerId, SignalingEnvelope};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Clone)]
pub struct Relay {
    writer: Arc<Mutex<WsWrite>>,
}

impl Relay {
    /// Connect, register `local_id`, and start the reader. Inbound text
    /// frames arrive on the returned receiver; it closes when the relay does.
    pub async fn connect(
        url: &str,
        local_id: &PeerId,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<String>)> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("relay connect to {url} failed"))?;
        let (write, read) = ws.split();
        let relay = Self {
            writer: Arc::new(Mutex::new(write)),
        };
        relay
            .send_text(register_message(local_id))
            .await
            .context("relay registration failed")?;
        info!(event = "relay_registered", url, id = %local_id, "Registered with relay");

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader(read, relay.clone(), tx);
        Ok((relay, rx))
    }

    /// Forward an offer or answer to `recipient`.
    pub async fn send(&self, envelope: &SignalingEnvelope, recipient: &PeerId) -> anyhow::Result<()> {
        let text = envelope.to_relay_json(recipient)?;
        debug!(event = "relay_send", kind = %envelope.kind(), recipient = %recipient);
        self.send_text(text).await
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
    }

    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.send_raw(Message::Text(text)).await
    }

    async fn send_raw(&self, message: Message) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(message)
            .await
            .context("relay send failed")
    }
}

fn register_message(local_id: &PeerId) -> String {
    serde_json::json!({ "type": "register", "deviceId": local_id }).to_string()
}

fn spawn_reader(mut read: WsRead, relay: Relay, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if tx.send(text).is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => {
                        if tx.send(text).is_err() {
                            break;
                        }
                    }
                    Err(_) => warn!(event = "relay_frame_dropped", "Non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(payload)) => {
                    let _ = relay.send_raw(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!(event = "relay_stream_error", error = %e);
                    break;
                }
            }
        }
        info!(event = "relay_closed", "Relay connection closed");
    })
}
