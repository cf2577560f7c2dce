//
// wire_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Jupyter messages in their ZeroMQ multipart form:
//!
//! ```text
//! [identities...] <IDS|MSG> signature header parent_header metadata content [buffers...]
//! ```

use bytes::Bytes;
use krshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};
use serde_json::Value;
use zeromq::ZmqMessage;

use crate::kernel_connection::KernelConnection;

/// Separates routing identities from the message proper.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Routing identities that preceded the delimiter
    pub identities: Vec<Bytes>,

    /// The hex HMAC signature; empty for unsigned messages
    pub signature: Bytes,

    pub header: Bytes,
    pub parent_header: Bytes,
    pub metadata: Bytes,
    pub content: Bytes,
    pub buffers: Vec<Bytes>,
}

impl WireMessage {
    /// Encode a Jupyter message, signing it with the connection's key.
    pub fn from_jupyter(
        msg: JupyterMessage,
        connection: &KernelConnection,
    ) -> Result<Self, anyhow::Error> {
        let header = Bytes::from(serde_json::to_vec(&msg.header)?);
        let parent_header = Bytes::from(match &msg.parent_header {
            Some(parent) => serde_json::to_vec(parent)?,
            None => serde_json::to_vec(&serde_json::Map::new())?,
        });
        let metadata = Bytes::from(serde_json::to_vec(&msg.metadata)?);
        let content = Bytes::from(serde_json::to_vec(&msg.content)?);
        let signature =
            connection.sign(&[&header[..], &parent_header[..], &metadata[..], &content[..]]);

        Ok(Self {
            identities: vec![],
            signature: Bytes::from(signature),
            header,
            parent_header,
            metadata,
            content,
            buffers: msg.buffers,
        })
    }

    /// Split a multipart ZeroMQ message into its wire parts.
    pub fn from_zmq(msg: ZmqMessage) -> Result<Self, anyhow::Error> {
        let mut frames = msg.into_vec();
        let delimiter = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or_else(|| anyhow::anyhow!("Message has no <IDS|MSG> delimiter"))?;
        if frames.len() < delimiter + 6 {
            anyhow::bail!(
                "Message has {} part(s) after the delimiter; expected at least 5",
                frames.len() - delimiter - 1
            );
        }

        let mut rest = frames.split_off(delimiter + 1);
        frames.truncate(delimiter);
        let buffers = rest.split_off(5);
        let mut parts = rest.into_iter();
        let mut next = || parts.next().unwrap_or_default();
        Ok(Self {
            identities: frames,
            signature: next(),
            header: next(),
            parent_header: next(),
            metadata: next(),
            content: next(),
            buffers,
        })
    }

    /// Verify the signature and decode the message.
    pub fn to_jupyter(
        &self,
        connection: &KernelConnection,
    ) -> Result<JupyterMessage, anyhow::Error> {
        connection.verify(
            &self.signature,
            &[
                &self.header[..],
                &self.parent_header[..],
                &self.metadata[..],
                &self.content[..],
            ],
        )?;

        let header: JupyterMessageHeader = serde_json::from_slice(&self.header)?;
        let parent_header: Value = serde_json::from_slice(&self.parent_header)?;
        let parent_header = match parent_header {
            Value::Object(ref map) if map.is_empty() => None,
            Value::Null => None,
            other => Some(serde_json::from_value::<JupyterMessageHeader>(other)?),
        };

        Ok(JupyterMessage {
            header,
            parent_header,
            channel: None,
            metadata: serde_json::from_slice(&self.metadata)?,
            content: serde_json::from_slice(&self.content)?,
            buffers: self.buffers.clone(),
        })
    }

    /// The multipart frames of this message, in wire order.
    pub fn into_frames(self) -> Vec<Bytes> {
        let mut frames = self.identities;
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(self.signature);
        frames.push(self.header);
        frames.push(self.parent_header);
        frames.push(self.metadata);
        frames.push(self.content);
        frames.extend(self.buffers);
        frames
    }
}

impl TryFrom<WireMessage> for ZmqMessage {
    type Error = anyhow::Error;

    fn try_from(msg: WireMessage) -> Result<Self, Self::Error> {
        ZmqMessage::try_from(msg.into_frames()).map_err(|err| anyhow::anyhow!("{}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JupyterMessage {
        let header = JupyterMessageHeader::new("m1".to_string(), "execute_request", "s1");
        JupyterMessage::new(header, json!({ "code": "1 + 1" }))
    }

    #[test]
    fn test_frames_are_signed_and_ordered() {
        let connection = KernelConnection::new("k1", "secret").unwrap();
        let wire = WireMessage::from_jupyter(sample(), &connection).unwrap();
        let frames = wire.clone().into_frames();
        assert_eq!(frames[0].as_ref(), DELIMITER);
        assert_eq!(frames[1].len(), 64);
        assert_eq!(frames[3].as_ref(), b"{}");

        let zmq = ZmqMessage::try_from(wire.clone()).unwrap();
        let decoded = WireMessage::from_zmq(zmq).unwrap();
        assert_eq!(decoded, wire);
        let msg = decoded.to_jupyter(&connection).unwrap();
        assert_eq!(msg.header.msg_id, "m1");
        assert_eq!(msg.parent_header, None);
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let signer = KernelConnection::new("k1", "secret").unwrap();
        let verifier = KernelConnection::new("k1", "other").unwrap();
        let wire = WireMessage::from_jupyter(sample(), &signer).unwrap();
        assert!(wire.to_jupyter(&verifier).is_err());
    }

    #[test]
    fn test_missing_delimiter_is_rejected() {
        let zmq = ZmqMessage::try_from(vec![Bytes::from_static(b"abc")]).unwrap();
        assert!(WireMessage::from_zmq(zmq).is_err());
    }
}
