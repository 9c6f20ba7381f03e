//! Typed payloads carried inside frames
//!
//! Lifecycle messages (Start, Ready, Log) are JSON. Invocation traffic carries
//! opaque bodies, so those frames use a small binary layout instead:
//!
//! ```text
//! Invoke: [id: u64 BE][capability_len: u16 BE][capability][body]
//! Reply:  [id: u64 BE][body]
//! Error:  [id: u64 BE][utf-8 message]
//! Cancel: [id: u64 BE]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Frame, IpcError, MessageType, Result};

/// Correlates an Invoke with its Reply, Error or Cancel
pub type RequestId = u64;

/// Sent by the host once the plugin reported Ready
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMessage {
    pub plugin: String,
    pub generation: u64,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// First frame a plugin sends: the capabilities it can serve
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
}

/// Log message from plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
}

/// A request routed to one capability of the plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoke {
    pub id: RequestId,
    pub capability: String,
    pub body: Bytes,
}

impl Invoke {
    pub fn into_frame(self) -> Result<Frame> {
        let cap_len = u16::try_from(self.capability.len()).map_err(|_| {
            IpcError::Malformed(format!(
                "capability name of {} bytes is too long",
                self.capability.len()
            ))
        })?;

        let mut buf = BytesMut::with_capacity(10 + self.capability.len() + self.body.len());
        buf.put_u64(self.id);
        buf.put_u16(cap_len);
        buf.extend_from_slice(self.capability.as_bytes());
        buf.extend_from_slice(&self.body);
        Ok(Frame::new(MessageType::Invoke, buf.freeze()))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        frame.expect(MessageType::Invoke)?;
        let mut payload = frame.payload.clone();
        let id = take_id(&mut payload)?;

        if payload.remaining() < 2 {
            return Err(IpcError::Malformed("missing capability length".into()));
        }
        let cap_len = payload.get_u16() as usize;
        if payload.remaining() < cap_len {
            return Err(IpcError::Malformed("truncated capability name".into()));
        }
        let capability = String::from_utf8(payload.split_to(cap_len).to_vec())
            .map_err(|_| IpcError::Malformed("capability name is not utf-8".into()))?;

        Ok(Self {
            id,
            capability,
            body: payload,
        })
    }
}

/// Successful response to an Invoke
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: RequestId,
    pub body: Bytes,
}

impl Reply {
    pub fn into_frame(self) -> Frame {
        let mut buf = BytesMut::with_capacity(8 + self.body.len());
        buf.put_u64(self.id);
        buf.extend_from_slice(&self.body);
        Frame::new(MessageType::Reply, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        frame.expect(MessageType::Reply)?;
        let mut payload = frame.payload.clone();
        let id = take_id(&mut payload)?;
        Ok(Self { id, body: payload })
    }
}

/// The plugin could not serve an Invoke
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFailure {
    pub id: RequestId,
    pub message: String,
}

impl InvokeFailure {
    pub fn into_frame(self) -> Frame {
        let mut buf = BytesMut::with_capacity(8 + self.message.len());
        buf.put_u64(self.id);
        buf.extend_from_slice(self.message.as_bytes());
        Frame::new(MessageType::Error, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        frame.expect(MessageType::Error)?;
        let mut payload = frame.payload.clone();
        let id = take_id(&mut payload)?;
        Ok(Self {
            id,
            message: String::from_utf8_lossy(&payload).into_owned(),
        })
    }
}

/// The host gave up waiting on an Invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancel {
    pub id: RequestId,
}

impl Cancel {
    pub fn into_frame(self) -> Frame {
        Frame::new(
            MessageType::Cancel,
            Bytes::copy_from_slice(&self.id.to_be_bytes()),
        )
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        frame.expect(MessageType::Cancel)?;
        let mut payload = frame.payload.clone();
        Ok(Self {
            id: take_id(&mut payload)?,
        })
    }
}

fn take_id(payload: &mut Bytes) -> Result<RequestId> {
    if payload.remaining() < 8 {
        return Err(IpcError::Malformed("missing request id".into()));
    }
    Ok(payload.get_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_keeps_binary_body_intact() {
        let body = Bytes::from_static(&[0, 159, 146, 150, 255]);
        let frame = Invoke {
            id: 42,
            capability: "image.resize".into(),
            body: body.clone(),
        }
        .into_frame()
        .unwrap();

        let decoded = Invoke::from_frame(&frame).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.capability, "image.resize");
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn test_truncated_invoke_is_malformed() {
        let frame = Frame::new(MessageType::Invoke, &[0u8, 0, 0, 0, 0, 0, 0, 1, 0, 9, b'e'][..]);
        assert!(matches!(
            Invoke::from_frame(&frame),
            Err(IpcError::Malformed(_))
        ));
    }

    #[test]
    fn test_reply_decoder_rejects_other_frame_types() {
        let frame = Cancel { id: 3 }.into_frame();
        assert!(matches!(
            Reply::from_frame(&frame),
            Err(IpcError::UnexpectedType {
                expected: MessageType::Reply,
                actual: MessageType::Cancel,
            })
        ));
    }

    #[test]
    fn test_ready_message_tolerates_missing_sdk_version() {
        let frame = Frame::new(MessageType::Ready, &br#"{"capabilities":["echo"]}"#[..]);
        let ready: ReadyMessage = frame.parse_json().unwrap();
        assert_eq!(ready.capabilities, vec!["echo"]);
        assert!(ready.sdk_version.is_none());
    }
}
