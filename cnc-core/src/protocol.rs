//! Channel protocol: application message types carried over the data channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label of the single data channel that carries all application traffic.
pub const DATA_CHANNEL_LABEL: &str = "cybernetcall-data";

/// Default file chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Public STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Wire `type` tags understood by this implementation.
pub const KNOWN_MESSAGE_TYPES: [&str; 5] = [
    "post",
    "direct-message",
    "delete-post",
    "file-metadata",
    "file-chunk",
];

/// All channel messages. JSON, internally tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ApplicationMessage {
    /// Timestamped post; stored by both sides.
    Post(Post),
    /// Chat line; displayed, never stored.
    DirectMessage(DirectMessage),
    /// Ask the peer to remove a post it holds.
    DeletePost {
        #[serde(rename = "postId")]
        post_id: String,
    },
    /// Announces an incoming file; precedes its chunks.
    FileMetadata(FileMetadata),
    /// One slice of a file.
    FileChunk(FileChunk),
}

impl ApplicationMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ApplicationMessage::Post(_) => "post",
            ApplicationMessage::DirectMessage(_) => "direct-message",
            ApplicationMessage::DeletePost { .. } => "delete-post",
            ApplicationMessage::FileMetadata(_) => "file-metadata",
            ApplicationMessage::FileChunk(_) => "file-chunk",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub content: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    /// MIME type. Named `fileType` on the wire so it cannot clash with the tag.
    #[serde(rename = "fileType", default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    pub index: u64,
    pub last: bool,
    /// Raw bytes; base64 text on the wire.
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 chunk data: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_wire_shape() {
        let msg = ApplicationMessage::Post(Post {
            id: "p1".into(),
            content: "hello".into(),
            sender: "me".into(),
            timestamp: "2024-05-01T10:00:00Z".parse().unwrap(),
        });
        let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "post");
        assert_eq!(v["id"], "p1");
        assert_eq!(v["content"], "hello");
        assert_eq!(v["sender"], "me");
        assert!(v["timestamp"].as_str().unwrap().starts_with("2024-05-01T10:00:00"));
    }

    #[test]
    fn parses_browser_direct_message() {
        let raw = r#"{"type":"direct-message","content":"hi","sender":"abc","timestamp":"2024-05-01T10:00:00.123Z"}"#;
        let msg: ApplicationMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ApplicationMessage::DirectMessage(dm) => {
                assert_eq!(dm.content, "hi");
                assert_eq!(dm.sender, "abc");
            }
            other => panic!("expected DirectMessage, got {other:?}"),
        }
    }

    #[test]
    fn delete_post_uses_post_id_field() {
        let msg = ApplicationMessage::DeletePost {
            post_id: "p9".into(),
        };
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"delete-post","postId":"p9"}"#);
    }

    #[test]
    fn file_metadata_uses_file_type_field() {
        let raw = r#"{"type":"file-metadata","fileId":"f1","name":"a.txt","size":42,"fileType":"text/plain"}"#;
        let msg: ApplicationMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ApplicationMessage::FileMetadata(FileMetadata {
                file_id: "f1".into(),
                name: "a.txt".into(),
                size: 42,
                mime_type: "text/plain".into(),
            })
        );
    }

    #[test]
    fn file_chunk_data_is_base64() {
        let msg = ApplicationMessage::FileChunk(FileChunk {
            file_id: "f1".into(),
            index: 3,
            last: true,
            data: b"abc".to_vec(),
        });
        let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "file-chunk");
        assert_eq!(v["fileId"], "f1");
        assert_eq!(v["index"], 3);
        assert_eq!(v["last"], true);
        assert_eq!(v["data"], "YWJj");
    }

    #[test]
    fn bad_base64_is_rejected() {
        let raw = r#"{"type":"file-chunk","fileId":"f1","index":0,"last":true,"data":"@@@"}"#;
        assert!(serde_json::from_str::<ApplicationMessage>(raw).is_err());
    }
}
