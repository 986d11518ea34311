//! Kernel message codec for talking to Jupyter kernels through a Jupyter
//! server's WebSocket endpoint.
//!
//! # Features
//!
//! - [`KernelMessage`] with raw JSON content and binary attachments
//! - [`MessageType`] parsed once from the header, plus `is_*_msg` predicates
//! - Text and binary WebSocket framing ([`encode`] / [`decode`])
//! - Base64 serde adapters for buffers embedded in JSON

mod fields;
mod frame;
mod message;
mod msg_type;

pub use fields::{deserialize_buffers, serialize_buffers, serialize_parent_header};
pub use frame::{decode, deserialize_binary, encode, serialize_binary, CodecError, WireFrame};
pub use jupyter_protocol::Header;
pub use message::{Channel, KernelMessage, PROTOCOL_VERSION};
pub use msg_type::*;
