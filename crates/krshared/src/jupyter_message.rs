//
// jupyter_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The version of the Jupyter messaging protocol spoken by this server when
/// acting as a kernel client.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The header of a Jupyter message.
///
/// Fields not modeled here (such as `subshell_id`) are preserved in `extra` so
/// that they survive a trip through the relay untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessageHeader {
    /// The message ID
    pub msg_id: String,

    /// The type of the message
    pub msg_type: String,

    /// The protocol session that produced the message
    #[serde(default)]
    pub session: String,

    /// The user that produced the message
    #[serde(default)]
    pub username: String,

    /// The date/time the message was created, normalized to UTC
    #[serde(default, with = "crate::iso_date", skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,

    /// The version of the Jupyter protocol
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Any other header fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JupyterMessageHeader {
    /// Create a header for a message originating from this server.
    pub fn new(msg_id: String, msg_type: &str, session: &str) -> Self {
        Self {
            msg_id,
            msg_type: msg_type.to_string(),
            session: session.to_string(),
            username: String::from("krserver"),
            date: Some(Utc::now()),
            version: PROTOCOL_VERSION.to_string(),
            extra: Map::new(),
        }
    }
}

/// The set of Jupyter sockets ("channels") over which messages are sent and
/// received.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// Request/reply traffic
    Shell,

    /// High-priority request/reply traffic (interrupts, shutdown)
    Control,

    /// Input prompts from the kernel
    Stdin,

    /// Broadcast output
    IOPub,
}

impl JupyterChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            JupyterChannel::Shell => "shell",
            JupyterChannel::Control => "control",
            JupyterChannel::Stdin => "stdin",
            JupyterChannel::IOPub => "iopub",
        }
    }
}

impl fmt::Display for JupyterChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JupyterChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(JupyterChannel::Shell),
            "control" => Ok(JupyterChannel::Control),
            "stdin" => Ok(JupyterChannel::Stdin),
            "iopub" => Ok(JupyterChannel::IOPub),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// A Jupyter message as it travels between a websocket client and a kernel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this
    /// message). Serialized as `{}` when absent.
    #[serde(default, with = "crate::parent_header")]
    pub parent_header: Option<JupyterMessageHeader>,

    /// The name of the channel on which the message was sent (or is to be
    /// sent). Kept as a raw name so that unknown channels can be reported
    /// rather than rejected during decoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Additional metadata
    #[serde(default = "empty_object")]
    pub metadata: Value,

    /// The message payload
    #[serde(default = "empty_object")]
    pub content: Value,

    /// Binary buffers attached to the message; carried out of band by the
    /// websocket and ZeroMQ framings.
    #[serde(skip)]
    pub buffers: Vec<Bytes>,
}

impl JupyterMessage {
    /// Create a message with no parent, metadata, or buffers.
    pub fn new(header: JupyterMessageHeader, content: Value) -> Self {
        Self {
            header,
            parent_header: None,
            channel: None,
            metadata: empty_object(),
            content,
            buffers: vec![],
        }
    }

    /// The channel this message names, if it names a known one.
    pub fn known_channel(&self) -> Option<Result<JupyterChannel, String>> {
        self.channel.as_deref().map(JupyterChannel::from_str)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
