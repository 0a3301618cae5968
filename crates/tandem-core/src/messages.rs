//! Request/response families carried over the transport.
//!
//! The transport itself never inspects these; they are the payloads the
//! messenger and media services put into packets.

use serde::{Deserialize, Serialize};

/// Identifier of an open media stream (32 hex chars).
pub type StreamId = String;

// ── Messenger ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessengerRequest {
    SignUp { username: String, password: String },
    Login { username: String, password: String },
    Logout,
    GetInbox,
    SendMessage { to: String, text: String },
    ReadMessages { contact: String, count: usize },
    CheckUsername { username: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MessengerResponse {
    Done,
    UsernameAvailable(bool),
    Inbox(Vec<InboxItem>),
    Messages(Vec<MessageItem>),
}

/// One row of a user's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    pub user: String,
    /// Unix milliseconds of the latest message, `None` when no chat exists yet.
    pub last_modified: Option<u64>,
    pub unread_count: usize,
}

impl InboxItem {
    pub fn is_unread(&self) -> bool {
        self.unread_count > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageItem {
    pub sender: String,
    pub receiver: String,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub seen: bool,
}

// ── Media streaming ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaRequest {
    ListMedia,
    StartStream { filename: String },
    NextFrame { stream_id: StreamId },
    CloseStream { stream_id: StreamId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaResponse {
    MediaList {
        files: Vec<String>,
    },
    StreamStarted {
        stream_id: StreamId,
        frame_rate: f64,
    },
    Frame {
        #[serde(with = "frame_bytes")]
        data: Vec<u8>,
    },
    EndOfStream,
    StreamClosed,
}

/// Serialize `Vec<u8>` as a CBOR byte string instead of an integer array.
pub mod frame_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
