use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::id_types::{ClientId, StreamKey, UserId};

/// Broadcast target a broadcaster uses to address every viewer of its stream.
pub const VIEWERS_TARGET: &str = "viewers";

/// Media source a chunk was recorded from. Camera and screen chunks live in
/// separate sequence spaces and must never be interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Camera,
    Screen,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Camera => write!(f, "camera"),
            Source::Screen => write!(f, "screen"),
        }
    }
}

/// One recorded media chunk as relayed over the signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub stream_key: StreamKey,
    #[serde(with = "b64_bytes")]
    pub chunk: Bytes,
    pub is_camera: bool,
    /// Epoch milliseconds of the batch this chunk belongs to.
    pub timestamp: u64,
    /// 0-based, contiguous within one `(source, timestamp)` batch.
    pub sequence: u64,
    pub mime_type: String,
    /// Set on exactly the final chunk of a batch so the receiver can
    /// demarcate group boundaries even if transport reorders delivery.
    pub is_last_chunk: bool,
    pub sender_id: ClientId,
}

/// Reference from a chat reply to the message it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub id: String,
    pub marker: String,
}

/// Chat message payload. `created_at` is epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub id: String,
    pub stream_key: StreamKey,
    pub pubkey: UserId,
    pub content: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
}

/// The named signaling messages of the protocol, tagged by their wire name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Signal {
    JoinStream {
        stream_key: StreamKey,
        user_id: UserId,
    },
    StartStream {
        stream_key: StreamKey,
        user_id: UserId,
        metadata: serde_json::Value,
    },
    EndStream {
        stream_key: StreamKey,
    },
    IceCandidate {
        /// JSON-encoded ICE candidate init, opaque to the channel.
        candidate: String,
        recipient_id: String,
        sender_id: ClientId,
    },
    Offer {
        /// SDP offer text.
        offer: String,
        sender_id: ClientId,
    },
    Answer {
        /// SDP answer text.
        answer: String,
        recipient_id: String,
        sender_id: ClientId,
    },
    StreamData(StreamChunk),
    ChatMessage(ChatPayload),
    ViewerCount(u64),
    PlaybackUrl(String),
    StreamingUrl(String),
}

impl Signal {
    /// The wire name used for handler routing.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::JoinStream { .. } => "join-stream",
            Signal::StartStream { .. } => "start-stream",
            Signal::EndStream { .. } => "end-stream",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::StreamData(_) => "stream-data",
            Signal::ChatMessage(_) => "chat-message",
            Signal::ViewerCount(_) => "viewer-count",
            Signal::PlaybackUrl(_) => "playback-url",
            Signal::StreamingUrl(_) => "streaming-url",
        }
    }
}

/// Wire-level unit exchanged over the signaling channel. Transient per
/// message; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender_id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(flatten)]
    pub signal: Signal,
}

impl Envelope {
    pub fn new(sender_id: ClientId, signal: Signal) -> Self {
        Envelope {
            sender_id,
            recipient_id: None,
            signal,
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient.into());
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_round_trip() {
        let env = Envelope::new(
            ClientId::from("c1"),
            Signal::Offer {
                offer: "v=0...".to_string(),
                sender_id: ClientId::from("c1"),
            },
        )
        .with_recipient(VIEWERS_TARGET);

        let frame = env.encode().unwrap();
        assert!(frame.contains("\"type\":\"offer\""));
        assert!(frame.contains("\"recipientId\":\"viewers\""));

        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back.sender_id, ClientId::from("c1"));
        match back.signal {
            Signal::Offer { offer, .. } => assert_eq!(offer, "v=0..."),
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_stream_data_base64_round_trip() {
        let chunk = StreamChunk {
            stream_key: StreamKey::from("abc"),
            chunk: Bytes::from_static(&[0u8, 1, 2, 255]),
            is_camera: true,
            timestamp: 1_700_000_000_000,
            sequence: 3,
            mime_type: "video/webm;codecs=vp8,opus".to_string(),
            is_last_chunk: true,
            sender_id: ClientId::from("c1"),
        };
        let env = Envelope::new(ClientId::from("c1"), Signal::StreamData(chunk));

        let frame = env.encode().unwrap();
        assert!(frame.contains("\"type\":\"stream-data\""));
        assert!(frame.contains("\"isLastChunk\":true"));

        let back = Envelope::decode(&frame).unwrap();
        match back.signal {
            Signal::StreamData(c) => {
                assert_eq!(c.chunk.as_ref(), &[0u8, 1, 2, 255]);
                assert_eq!(c.sequence, 3);
                assert!(c.is_camera);
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_viewer_count_bare_payload() {
        let frame = r#"{"senderId":"server","type":"viewer-count","payload":5}"#;
        let env = Envelope::decode(frame).unwrap();
        match env.signal {
            Signal::ViewerCount(n) => assert_eq!(n, 5),
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_chat_reply_field_is_optional() {
        let payload = ChatPayload {
            id: "m1".to_string(),
            stream_key: StreamKey::from("abc"),
            pubkey: UserId::from("npub1"),
            content: "hello".to_string(),
            created_at: 1_700_000_000_000,
            reply_to: None,
        };
        let frame = Envelope::new(ClientId::from("c1"), Signal::ChatMessage(payload))
            .encode()
            .unwrap();
        assert!(!frame.contains("replyTo"));
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let signal = Signal::EndStream {
            stream_key: StreamKey::from("abc"),
        };
        let frame = Envelope::new(ClientId::from("c1"), signal.clone())
            .encode()
            .unwrap();
        assert!(frame.contains(&format!("\"type\":\"{}\"", signal.kind())));
    }
}
