//! Kernel messages in the shape the Jupyter server relays over WebSocket.

use std::fmt;

use bytes::Bytes;
use chrono::Utc;
use jupyter_protocol::Header;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::fields::{
    deserialize_buffers, empty_object, serialize_buffers, serialize_parent_header,
};
use crate::msg_type::MessageType;

/// Messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The four kernel channels multiplexed over one WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Requests and replies.
    Shell,
    /// Out-of-band requests (interrupt, debug, shutdown).
    Control,
    /// Broadcast side effects: status, outputs, comm traffic.
    IOPub,
    /// Input prompts raised by the kernel.
    Stdin,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::Control => write!(f, "control"),
            Channel::IOPub => write!(f, "iopub"),
            Channel::Stdin => write!(f, "stdin"),
        }
    }
}

/// A single kernel message.
///
/// `content` and `metadata` stay as raw JSON: the client routes and
/// correlates messages but never interprets their payloads beyond the few
/// fields needed for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,

    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(
        default,
        serialize_with = "serialize_buffers",
        deserialize_with = "deserialize_buffers"
    )]
    pub buffers: Vec<Bytes>,

    pub channel: Channel,
}

impl KernelMessage {
    /// Build a new message with a fresh `msg_id` and the current timestamp.
    pub fn new(
        msg_type: MessageType,
        channel: Channel,
        session: &str,
        username: &str,
        content: Value,
    ) -> Self {
        let header = Header {
            msg_id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            session: session.to_string(),
            date: Utc::now(),
            msg_type: msg_type.as_str().to_string(),
            version: PROTOCOL_VERSION.to_string(),
        };
        Self {
            header,
            parent_header: None,
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
            channel,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Mark this message as a response to `parent`.
    pub fn with_parent(mut self, parent: &Header) -> Self {
        self.parent_header = Some(parent.clone());
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> MessageType {
        MessageType::from(self.header.msg_type.as_str())
    }

    /// The `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|h| h.msg_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Read a top-level string field of the content (e.g. `comm_id`).
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}
