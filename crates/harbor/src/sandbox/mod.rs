//! Isolated execution contexts for plugin instances
//!
//! A [`Sandbox`] is whatever runs one generation of a plugin. The host only
//! talks to it through this trait, so the registry and gateways never see a
//! process handle. [`ProcessLauncher`] is the production implementation: one
//! OS child process per instance, speaking the `harbor-ipc` frame protocol
//! over its stdin and stdout.

mod process;
mod resources;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use process::ProcessLauncher;
pub use resources::{ResourceGuard, ResourceTracker};

use crate::loader::{LoadError, PluginDescriptor};

/// Failure of a single invocation inside a sandbox
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The plugin answered with an error; the sandbox is still healthy
    #[error("{0}")]
    Plugin(String),

    /// The sandbox went away while the call was pending
    #[error("plugin process exited")]
    Exited,

    /// The sandbox is being shut down by the host
    #[error("plugin is being unloaded")]
    Aborted,

    /// The IPC channel broke or carried garbage
    #[error("IPC failure: {0}")]
    Ipc(String),
}

impl SandboxError {
    /// Whether the sandbox can no longer be trusted to serve requests
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::Exited | SandboxError::Ipc(_))
    }
}

/// One running plugin generation
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Forward an opaque payload to `capability` and wait for the reply
    ///
    /// Dropping the returned future abandons the call; the sandbox is told to
    /// cancel it.
    async fn invoke(&self, capability: &str, payload: Bytes) -> Result<Bytes, SandboxError>;

    /// Whether the sandbox is still able to serve requests
    fn is_alive(&self) -> bool;

    /// Stop the sandbox, waiting up to `grace` before killing it
    ///
    /// Pending invocations fail with [`SandboxError::Aborted`]. Calling this
    /// more than once is a no-op.
    async fn shutdown(&self, grace: Duration);

    /// OS process id, when the sandbox is a process
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Everything a launcher needs to start one generation
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub descriptor: Arc<PluginDescriptor>,
    pub generation: u64,
    /// Extraction directory of this generation
    pub root: PathBuf,
}

/// Starts sandboxes for the loader
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn Sandbox>, LoadError>;
}
