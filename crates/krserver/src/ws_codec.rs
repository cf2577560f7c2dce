//
// ws_codec.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Encoding and decoding of Jupyter messages as websocket frames.
//!
//! Messages without binary buffers travel as a single JSON text frame.
//! Messages with buffers travel as a binary frame laid out as:
//!
//! ```text
//! [nbufs: u32 BE][offset_0: u32 BE] ... [offset_{nbufs-1}: u32 BE][buf_0][buf_1]...
//! ```
//!
//! where `buf_0` is the JSON message (minus its buffers) and every offset is
//! measured from the start of the frame. The end of the last buffer is the
//! end of the frame.

use std::fmt;

use bytes::Bytes;
use krshared::jupyter_message::{JupyterChannel, JupyterMessage};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// A websocket frame carrying a Jupyter message.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WsFrame {
    /// The size of the frame's payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            WsFrame::Text(text) => text.len(),
            WsFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<WsFrame> for Message {
    fn from(frame: WsFrame) -> Self {
        match frame {
            WsFrame::Text(text) => Message::Text(text),
            WsFrame::Binary(data) => Message::Binary(data),
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    /// The frame is too short to hold the data it claims to hold
    Truncated { needed: usize, actual: usize },

    /// A binary frame declared no buffers at all
    NoBuffers,

    /// A buffer offset points outside the frame or before the previous one
    BadOffset { index: usize, offset: usize },

    /// The frame or buffer count does not fit the 32-bit framing
    TooLarge(usize),

    /// The JSON portion of the frame is malformed
    Json(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, actual } => write!(
                f,
                "Binary frame truncated: needed {} bytes, got {}",
                needed, actual
            ),
            CodecError::NoBuffers => write!(f, "Binary frame declares zero buffers"),
            CodecError::BadOffset { index, offset } => {
                write!(f, "Buffer {} has invalid offset {}", index, offset)
            }
            CodecError::TooLarge(size) => {
                write!(f, "Value {} does not fit in the binary framing", size)
            }
            CodecError::Json(err) => write!(f, "Invalid message JSON: {}", err),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err)
    }
}

/// Serialize a message received from the kernel on `channel` into a
/// websocket frame.
///
/// The JSON form gains `channel` plus top-level copies of `msg_id` and
/// `msg_type`; text frames also carry an empty `buffers` list.
pub fn serialize(msg: &JupyterMessage, channel: JupyterChannel) -> Result<WsFrame, CodecError> {
    let mut value = serde_json::to_value(msg)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            String::from("channel"),
            Value::String(channel.as_str().to_string()),
        );
        map.insert(
            String::from("msg_id"),
            Value::String(msg.header.msg_id.clone()),
        );
        map.insert(
            String::from("msg_type"),
            Value::String(msg.header.msg_type.clone()),
        );
        if msg.buffers.is_empty() {
            map.insert(String::from("buffers"), Value::Array(vec![]));
        }
    }

    if msg.buffers.is_empty() {
        return Ok(WsFrame::Text(serde_json::to_string(&value)?));
    }

    let json = serde_json::to_vec(&value)?;
    let mut parts: Vec<&[u8]> = Vec::with_capacity(msg.buffers.len() + 1);
    parts.push(&json[..]);
    parts.extend(msg.buffers.iter().map(|b| &b[..]));
    Ok(WsFrame::Binary(pack_buffers(&parts)?))
}

/// Decode a websocket frame sent by a client into a message.
///
/// The message's `channel` field is left as the client sent it; deciding what
/// to do with a missing or unknown channel is up to the caller.
pub fn deserialize(frame: WsFrame) -> Result<JupyterMessage, CodecError> {
    match frame {
        WsFrame::Text(text) => Ok(serde_json::from_str(&text)?),
        WsFrame::Binary(data) => {
            let mut bufs = unpack_buffers(Bytes::from(data))?;
            let json = bufs.remove(0);
            let mut msg: JupyterMessage = serde_json::from_slice(&json)?;
            msg.buffers = bufs;
            Ok(msg)
        }
    }
}

/// Lay out `parts` in the binary framing: a count, one offset per part, then
/// the parts themselves.
pub fn pack_buffers(parts: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
    let nbufs = parts.len();
    let table_len = 4 * (nbufs + 1);
    let total = table_len + parts.iter().map(|p| p.len()).sum::<usize>();
    if total > u32::MAX as usize {
        return Err(CodecError::TooLarge(total));
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(nbufs as u32).to_be_bytes());
    let mut offset = table_len;
    for part in parts {
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        offset += part.len();
    }
    for part in parts {
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Split a binary frame into its buffers. The returned buffers share the
/// frame's storage.
pub fn unpack_buffers(data: Bytes) -> Result<Vec<Bytes>, CodecError> {
    if data.len() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            actual: data.len(),
        });
    }
    let nbufs = read_u32(&data, 0) as usize;
    if nbufs == 0 {
        return Err(CodecError::NoBuffers);
    }
    let table_len = nbufs
        .checked_add(1)
        .and_then(|n| n.checked_mul(4))
        .ok_or(CodecError::TooLarge(nbufs))?;
    if data.len() < table_len {
        return Err(CodecError::Truncated {
            needed: table_len,
            actual: data.len(),
        });
    }

    let offsets: Vec<usize> = (0..nbufs)
        .map(|i| read_u32(&data, 4 * (i + 1)) as usize)
        .collect();

    let mut bufs = Vec::with_capacity(nbufs);
    for (index, &start) in offsets.iter().enumerate() {
        let end = offsets.get(index + 1).copied().unwrap_or(data.len());
        if start < table_len || start > end || end > data.len() {
            return Err(CodecError::BadOffset {
                index,
                offset: start,
            });
        }
        bufs.push(data.slice(start..end));
    }
    Ok(bufs)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[at..at + 4]);
    u32::from_be_bytes(word)
}
