//! Length-prefixed frame codec

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{IpcError, Result};

/// Upper bound for a single frame, type byte included
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message types for IPC protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Host → Plugin
    Start = 1,
    Stop = 2,
    Invoke = 3,
    Cancel = 4,

    // Plugin → Host
    Ready = 10,
    Log = 11,
    Reply = 12,
    Error = 13,
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Start),
            2 => Ok(MessageType::Stop),
            3 => Ok(MessageType::Invoke),
            4 => Ok(MessageType::Cancel),
            10 => Ok(MessageType::Ready),
            11 => Ok(MessageType::Log),
            12 => Ok(MessageType::Reply),
            13 => Ok(MessageType::Error),
            other => Err(IpcError::UnknownMessageType(other)),
        }
    }
}

/// A message received from or sent to a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Bytes::new(),
        }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub(crate) fn expect(&self, expected: MessageType) -> Result<()> {
        if self.msg_type == expected {
            Ok(())
        } else {
            Err(IpcError::UnexpectedType {
                expected,
                actual: self.msg_type,
            })
        }
    }
}

/// Writes frames to any async byte sink (a child's stdin, the plugin's stdout)
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a single frame and flush it
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let len = 1 + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_u8(frame.msg_type as u8);
        buf.extend_from_slice(&frame.payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads frames from any async byte source
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame. Returns `None` on a clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(IpcError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        // Type byte and payload are read together so an unknown type
        // does not leave the stream misaligned
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        let msg_type = MessageType::try_from(body[0])?;
        let payload = Bytes::from(body).slice(1..);

        Ok(Some(Frame::new(msg_type, payload)))
    }
}
