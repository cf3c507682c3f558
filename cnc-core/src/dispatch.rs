//! Message dispatch: decode inbound channel payloads and route them by type.

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{
    ApplicationMessage, DirectMessage, FileChunk, FileMetadata, Post, KNOWN_MESSAGE_TYPES,
};
use crate::wire::{self, Payload};

/// Receiver of routed messages. One method per message type.
pub trait MessageHandler {
    fn on_post(&mut self, post: Post);
    fn on_direct_message(&mut self, message: DirectMessage);
    fn on_delete_post(&mut self, post_id: String);
    fn on_file_metadata(&mut self, metadata: FileMetadata);
    fn on_file_chunk(&mut self, chunk: FileChunk);
}

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(ApplicationMessage),
    /// Untyped payload accepted as a post by the compatibility shim.
    LegacyPost(Post),
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not JSON, not a chunk frame, or a known type with a bad body.
    Malformed(String),
    /// Unknown or missing tag and not a legacy post.
    Unrecognized(Option<String>),
}

/// Decode a payload without routing it.
pub fn decode(payload: &Payload) -> Decoded {
    match payload {
        Payload::Text(text) => decode_json(text),
        Payload::Binary(bytes) => match wire::decode_chunk_frame(bytes) {
            Ok(frame) => Decoded::Message(ApplicationMessage::FileChunk(frame.into())),
            Err(_) => match std::str::from_utf8(bytes) {
                Ok(text) => decode_json(text),
                Err(e) => Decoded::Discarded(DiscardReason::Malformed(format!(
                    "binary payload is neither a chunk frame nor UTF-8: {e}"
                ))),
            },
        },
    }
}

fn decode_json(text: &str) -> Decoded {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Decoded::Discarded(DiscardReason::Malformed(e.to_string())),
    };
    let tag = value.get("type").and_then(Value::as_str).map(str::to_string);
    match tag {
        Some(t) if KNOWN_MESSAGE_TYPES.contains(&t.as_str()) => {
            match serde_json::from_value::<ApplicationMessage>(value) {
                Ok(msg) => Decoded::Message(msg),
                Err(e) => Decoded::Discarded(DiscardReason::Malformed(format!("{t}: {e}"))),
            }
        }
        other => match legacy_post(&value) {
            Some(post) => Decoded::LegacyPost(post),
            None => Decoded::Discarded(DiscardReason::Unrecognized(other)),
        },
    }
}

/// Best-effort shim for peers that send bare posts without a tag.
fn legacy_post(value: &Value) -> Option<Post> {
    let id = value.get("id")?.as_str()?;
    let content = value.get("content")?.as_str()?;
    let sender = value
        .get("sender")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(chrono::Utc::now);
    Some(Post {
        id: id.to_string(),
        content: content.to_string(),
        sender: sender.to_string(),
        timestamp,
    })
}

/// Decodes payloads and routes them to a [`MessageHandler`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher
    }

    /// Decode and route one payload. Returns false when the payload was
    /// discarded; the channel stays usable either way.
    pub fn dispatch<H: MessageHandler + ?Sized>(&self, payload: &Payload, handler: &mut H) -> bool {
        match decode(payload) {
            Decoded::Message(msg) => {
                debug!(event = "message_received", kind = msg.kind(), bytes = payload.len());
                route(msg, handler);
                true
            }
            Decoded::LegacyPost(post) => {
                warn!(event = "legacy_post", id = %post.id, "Untyped payload treated as a post");
                handler.on_post(post);
                true
            }
            Decoded::Discarded(DiscardReason::Malformed(reason)) => {
                warn!(event = "message_malformed", bytes = payload.len(), %reason, "Discarding malformed channel message");
                false
            }
            Decoded::Discarded(DiscardReason::Unrecognized(tag)) => {
                warn!(event = "message_unknown", tag = ?tag, "Discarding message of unknown type");
                false
            }
        }
    }
}

fn route<H: MessageHandler + ?Sized>(msg: ApplicationMessage, handler: &mut H) {
    match msg {
        ApplicationMessage::Post(post) => handler.on_post(post),
        ApplicationMessage::DirectMessage(dm) => handler.on_direct_message(dm),
        ApplicationMessage::DeletePost { post_id } => handler.on_delete_post(post_id),
        ApplicationMessage::FileMetadata(meta) => handler.on_file_metadata(meta),
        ApplicationMessage::FileChunk(chunk) => handler.on_file_chunk(chunk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_message, ChunkEncoding};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl MessageHandler for Recorder {
        fn on_post(&mut self, post: Post) {
            self.calls.push(format!("post:{}", post.id));
        }
        fn on_direct_message(&mut self, message: DirectMessage) {
            self.calls.push(format!("dm:{}", message.content));
        }
        fn on_delete_post(&mut self, post_id: String) {
            self.calls.push(format!("delete:{post_id}"));
        }
        fn on_file_metadata(&mut self, metadata: FileMetadata) {
            self.calls.push(format!("meta:{}", metadata.file_id));
        }
        fn on_file_chunk(&mut self, chunk: FileChunk) {
            self.calls.push(format!("chunk:{}:{}", chunk.file_id, chunk.index));
        }
    }

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[test]
    fn routes_each_type() {
        let mut rec = Recorder::default();
        let d = Dispatcher::new();
        assert!(d.dispatch(
            &text(r#"{"type":"post","id":"p1","content":"c","sender":"s","timestamp":"2024-01-01T00:00:00Z"}"#),
            &mut rec
        ));
        assert!(d.dispatch(
            &text(r#"{"type":"direct-message","content":"hey","sender":"s","timestamp":"2024-01-01T00:00:00Z"}"#),
            &mut rec
        ));
        assert!(d.dispatch(&text(r#"{"type":"delete-post","postId":"p1"}"#), &mut rec));
        assert!(d.dispatch(
            &text(r#"{"type":"file-metadata","fileId":"f","name":"n","size":1,"fileType":""}"#),
            &mut rec
        ));
        assert!(d.dispatch(
            &text(r#"{"type":"file-chunk","fileId":"f","index":0,"last":true,"data":"AA=="}"#),
            &mut rec
        ));
        assert_eq!(
            rec.calls,
            vec!["post:p1", "dm:hey", "delete:p1", "meta:f", "chunk:f:0"]
        );
    }

    #[test]
    fn binary_json_is_accepted() {
        let mut rec = Recorder::default();
        let bytes = br#"{"type":"delete-post","postId":"x"}"#.to_vec();
        assert!(Dispatcher::new().dispatch(&Payload::Binary(bytes), &mut rec));
        assert_eq!(rec.calls, vec!["delete:x"]);
    }

    #[test]
    fn binary_chunk_frame_is_routed() {
        let mut rec = Recorder::default();
        let msg = ApplicationMessage::FileChunk(FileChunk {
            file_id: "f".into(),
            index: 2,
            last: false,
            data: vec![9; 10],
        });
        let payload = encode_message(&msg, ChunkEncoding::Binary).unwrap();
        assert!(Dispatcher::new().dispatch(&payload, &mut rec));
        assert_eq!(rec.calls, vec!["chunk:f:2"]);
    }

    #[test]
    fn legacy_untyped_post() {
        let mut rec = Recorder::default();
        assert!(Dispatcher::new().dispatch(&text(r#"{"id":"old","content":"hi"}"#), &mut rec));
        assert_eq!(rec.calls, vec!["post:old"]);
    }

    #[test]
    fn unknown_type_with_post_fields_uses_legacy_shim() {
        assert!(matches!(
            decode(&text(r#"{"type":"status","id":"1","content":"x"}"#)),
            Decoded::LegacyPost(_)
        ));
    }

    #[test]
    fn unknown_type_without_post_fields_is_discarded() {
        let mut rec = Recorder::default();
        assert!(!Dispatcher::new().dispatch(&text(r#"{"type":"typing"}"#), &mut rec));
        assert!(!Dispatcher::new().dispatch(&text(r#"{"content":"no id"}"#), &mut rec));
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn malformed_payloads_are_discarded() {
        let mut rec = Recorder::default();
        let d = Dispatcher::new();
        assert!(!d.dispatch(&text("{not json"), &mut rec));
        assert!(!d.dispatch(&text(r#"{"type":"file-chunk","fileId":"f"}"#), &mut rec));
        assert!(!d.dispatch(&Payload::Binary(vec![0xff, 0xfe, 0x00]), &mut rec));
        assert!(rec.calls.is_empty());
        assert!(matches!(
            decode(&text(r#"{"type":"post","id":"1"}"#)),
            Decoded::Discarded(DiscardReason::Malformed(_))
        ));
    }
}
