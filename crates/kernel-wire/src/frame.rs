//! WebSocket framing for kernel messages.
//!
//! Messages without attachments go out as a JSON text frame. Messages that
//! carry buffers use the binary layout understood by the Jupyter server:
//!
//! ```text
//! u32 nbufs | u32 offset[0] .. u32 offset[nbufs-1] | JSON | buf 1 | .. | buf n
//! ```
//!
//! All integers are big-endian. `nbufs` counts the JSON part, so a valid
//! binary frame always has `nbufs >= 2`. `offset[i]` is the byte position of
//! part `i` from the start of the frame; each part runs until the next offset
//! (the last one until the end of the frame).

use bytes::{BufMut, Bytes, BytesMut};
use jupyter_protocol::Header;
use serde::Serialize;
use serde_json::Value;

use crate::fields::serialize_parent_ref;
use crate::message::{Channel, KernelMessage};

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid binary frame: {0}")]
    InvalidFrame(String),
}

/// One WebSocket payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

/// The JSON part of a binary frame: everything except `buffers`.
#[derive(Serialize)]
struct Envelope<'a> {
    header: &'a Header,
    #[serde(serialize_with = "serialize_parent_ref")]
    parent_header: Option<&'a Header>,
    metadata: &'a Value,
    content: &'a Value,
    channel: Channel,
}

impl<'a> From<&'a KernelMessage> for Envelope<'a> {
    fn from(msg: &'a KernelMessage) -> Self {
        Self {
            header: &msg.header,
            parent_header: msg.parent_header.as_ref(),
            metadata: &msg.metadata,
            content: &msg.content,
            channel: msg.channel,
        }
    }
}

/// Encode a message, choosing the binary layout only when it has buffers.
pub fn encode(msg: &KernelMessage) -> Result<WireFrame, CodecError> {
    if msg.buffers.is_empty() {
        Ok(WireFrame::Text(serde_json::to_string(msg)?))
    } else {
        Ok(WireFrame::Binary(serialize_binary(msg)?))
    }
}

/// Decode either frame kind back into a message.
pub fn decode(frame: &WireFrame) -> Result<KernelMessage, CodecError> {
    match frame {
        WireFrame::Text(text) => Ok(serde_json::from_str(text)?),
        WireFrame::Binary(data) => deserialize_binary(data),
    }
}

pub fn serialize_binary(msg: &KernelMessage) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(&Envelope::from(msg))?;

    let nbufs = msg.buffers.len() + 1;
    let header_len = 4 * (nbufs + 1);
    let total = header_len + json.len() + msg.buffers.iter().map(Bytes::len).sum::<usize>();
    if u32::try_from(total).is_err() {
        return Err(CodecError::InvalidFrame(format!(
            "frame of {total} bytes exceeds the 32-bit offset range"
        )));
    }

    let mut out = BytesMut::with_capacity(total);
    out.put_u32(nbufs as u32);

    let mut offset = header_len;
    out.put_u32(offset as u32);
    offset += json.len();
    for buffer in &msg.buffers[..msg.buffers.len() - 1] {
        out.put_u32(offset as u32);
        offset += buffer.len();
    }
    out.put_u32(offset as u32);

    out.extend_from_slice(&json);
    for buffer in &msg.buffers {
        out.extend_from_slice(buffer);
    }
    Ok(out.freeze())
}

pub fn deserialize_binary(data: &Bytes) -> Result<KernelMessage, CodecError> {
    let read_u32 = |at: usize| -> Result<usize, CodecError> {
        data.get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| CodecError::InvalidFrame(format!("truncated at byte {at}")))
    };

    let nbufs = read_u32(0)?;
    if nbufs < 2 {
        return Err(CodecError::InvalidFrame(format!(
            "expected at least 2 parts, got {nbufs}"
        )));
    }

    let offsets = (1..=nbufs)
        .map(|i| read_u32(i * 4))
        .collect::<Result<Vec<_>, _>>()?;

    let part = |i: usize| -> Result<Bytes, CodecError> {
        let start = offsets[i];
        let stop = offsets.get(i + 1).copied().unwrap_or(data.len());
        if start > stop || stop > data.len() {
            return Err(CodecError::InvalidFrame(format!(
                "part {i} spans {start}..{stop} in a {} byte frame",
                data.len()
            )));
        }
        Ok(data.slice(start..stop))
    };

    let mut msg: KernelMessage = serde_json::from_slice(&part(0)?)?;
    msg.buffers = (1..nbufs).map(part).collect::<Result<_, _>>()?;
    Ok(msg)
}
