//! IPC protocol between the harbor host and plugin processes
//!
//! A plugin runs as a child process of the host. Both sides exchange frames
//! over the plugin's stdin (host → plugin) and stdout (plugin → host):
//!
//! ```text
//! [length: u32 BE][msg_type: u8][payload: length-1 bytes]
//! ```
//!
//! Stderr is left to the plugin for its own diagnostics.

mod frame;
mod message;

pub use frame::*;
pub use message::*;

/// Errors produced while encoding or decoding frames
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {0} bytes exceeds the 16 MiB limit")]
    FrameTooLarge(usize),

    #[error("Expected {expected:?} frame, got {actual:?}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;
