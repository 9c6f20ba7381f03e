//! Guest side of the harbor plugin protocol
//!
//! A plugin binary implements [`Plugin`] and hands it to [`run`]. The runtime
//! speaks the frame protocol on stdin/stdout:
//!
//! 1. announce the capabilities in a Ready frame;
//! 2. wait for Start, which carries the plugin id, generation and the
//!    manifest's `[config]` table;
//! 3. serve Invoke frames concurrently, each on its own task, until Stop
//!    arrives or the host closes stdin.
//!
//! Cancel aborts the task serving the cancelled request. Logs go to stderr
//! through `tracing`, or to the host as Log frames via [`PluginContext::log`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use harbor_ipc::{
    Cancel, Frame, FrameReader, FrameWriter, Invoke, InvokeFailure, IpcError, LogMessage,
    MessageType, ReadyMessage, Reply, RequestId, StartMessage,
};

pub use bytes;

/// Error returned by a capability handler
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        PluginError::Failed(message.into())
    }
}

/// Severity of a log line forwarded to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// What the host told the plugin at Start
#[derive(Clone)]
pub struct PluginContext {
    start: Arc<StartMessage>,
    outbound: mpsc::Sender<Frame>,
}

impl PluginContext {
    /// Plugin id assigned by the host
    pub fn plugin(&self) -> &str {
        &self.start.plugin
    }

    pub fn generation(&self) -> u64 {
        self.start.generation
    }

    /// The manifest's `[config]` table
    pub fn config(&self) -> &serde_json::Value {
        &self.start.config
    }

    /// Send a log line to the host
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let log = LogMessage {
            level: level.as_str().to_string(),
            message: message.into(),
        };
        match Frame::json(MessageType::Log, &log) {
            Ok(frame) => {
                let _ = self.outbound.send(frame).await;
            }
            Err(e) => warn!("Failed to encode log frame: {}", e),
        }
    }
}

/// A plugin served by [`run`]
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Capabilities announced in the Ready frame
    fn capabilities(&self) -> Vec<String>;

    /// Called once after Start, before the first invocation
    async fn start(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Serve one invocation
    async fn invoke(
        &self,
        ctx: &PluginContext,
        capability: &str,
        body: Bytes,
    ) -> Result<Bytes, PluginError>;

    /// Called when the host asks the plugin to stop
    async fn stop(&self) {}
}

/// Serve `plugin` on stdin/stdout until the host stops it
pub async fn run<P: Plugin>(plugin: P) -> anyhow::Result<()> {
    serve(plugin, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

/// Log to stderr; stdout carries frames
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Serve `plugin` over an arbitrary byte stream pair
pub async fn serve<P, R, W>(plugin: P, input: R, output: W) -> Result<(), IpcError>
where
    P: Plugin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let plugin = Arc::new(plugin);
    let mut reader = FrameReader::new(input);
    let mut writer = FrameWriter::new(output);

    // Announce capabilities
    let ready = ReadyMessage {
        capabilities: plugin.capabilities(),
        sdk_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    writer.send(&Frame::json(MessageType::Ready, &ready)?).await?;

    let start = loop {
        match reader.recv().await? {
            Some(frame) if frame.msg_type == MessageType::Start => {
                break frame.parse_json::<StartMessage>()?;
            }
            Some(frame) if frame.msg_type == MessageType::Stop => return Ok(()),
            Some(frame) => warn!("Ignoring {:?} frame before Start", frame.msg_type),
            None => return Ok(()),
        }
    };
    info!(plugin = %start.plugin, generation = start.generation, "Plugin started");

    let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.send(&frame).await {
                warn!("Failed to write frame: {}", e);
                break;
            }
        }
    });

    let ctx = PluginContext {
        start: Arc::new(start),
        outbound: outbound.clone(),
    };
    if let Err(e) = plugin.start(&ctx).await {
        ctx.log(LogLevel::Error, format!("start failed: {e}")).await;
        drop(ctx);
        drop(outbound);
        let _ = writer_task.await;
        return Err(IpcError::Malformed(format!("plugin start failed: {e}")));
    }

    let running: Arc<Mutex<HashMap<RequestId, AbortHandle>>> = Arc::default();

    let result = loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Host closed the connection");
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        match frame.msg_type {
            MessageType::Invoke => {
                let invoke = match Invoke::from_frame(&frame) {
                    Ok(invoke) => invoke,
                    Err(e) => break Err(e),
                };
                dispatch(&plugin, &ctx, &running, invoke);
            }
            MessageType::Cancel => {
                let cancel = match Cancel::from_frame(&frame) {
                    Ok(cancel) => cancel,
                    Err(e) => break Err(e),
                };
                if let Some(task) = running.lock().remove(&cancel.id) {
                    debug!(id = cancel.id, "Invocation cancelled");
                    task.abort();
                }
            }
            MessageType::Stop => {
                info!("Received Stop");
                break Ok(());
            }
            other => warn!("Unexpected {:?} frame from host", other),
        }
    };

    for (_, task) in running.lock().drain() {
        task.abort();
    }
    plugin.stop().await;

    drop(ctx);
    drop(outbound);
    let _ = writer_task.await;
    result
}

fn dispatch<P: Plugin>(
    plugin: &Arc<P>,
    ctx: &PluginContext,
    running: &Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
    invoke: Invoke,
) {
    let plugin = plugin.clone();
    let ctx = ctx.clone();
    let tasks = running.clone();
    let id = invoke.id;

    // Held across spawn so the task cannot deregister before it is registered
    let mut guard = running.lock();
    let handle = tokio::spawn(async move {
        let result = plugin.invoke(&ctx, &invoke.capability, invoke.body).await;
        let frame = match result {
            Ok(body) => Reply { id, body }.into_frame(),
            Err(e) => InvokeFailure {
                id,
                message: e.to_string(),
            }
            .into_frame(),
        };
        // Cancelled calls are already forgotten by the host
        if tasks.lock().remove(&id).is_some() {
            let _ = ctx.outbound.send(frame).await;
        }
    });
    guard.insert(id, handle.abort_handle());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        fn capabilities(&self) -> Vec<String> {
            vec!["echo".into(), "wait".into()]
        }

        async fn invoke(
            &self,
            ctx: &PluginContext,
            capability: &str,
            body: Bytes,
        ) -> Result<Bytes, PluginError> {
            match capability {
                "echo" => Ok(body),
                "wait" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Bytes::new())
                }
                "whoami" => Ok(Bytes::from(format!("{}@{}", ctx.plugin(), ctx.generation()))),
                other => Err(PluginError::UnknownCapability(other.to_string())),
            }
        }
    }

    async fn started() -> (
        FrameWriter<tokio::io::DuplexStream>,
        FrameReader<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Result<(), IpcError>>,
    ) {
        let (host_out, plugin_in) = tokio::io::duplex(64 * 1024);
        let (plugin_out, host_in) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve(Echo, plugin_in, plugin_out));

        let mut writer = FrameWriter::new(host_out);
        let mut reader = FrameReader::new(host_in);

        let ready = reader.recv().await.unwrap().unwrap();
        let ready: ReadyMessage = ready.parse_json().unwrap();
        assert_eq!(ready.capabilities, vec!["echo", "wait"]);

        let start = StartMessage {
            plugin: "echo-plugin".into(),
            generation: 7,
            config: serde_json::Value::Null,
        };
        writer
            .send(&Frame::json(MessageType::Start, &start).unwrap())
            .await
            .unwrap();
        (writer, reader, task)
    }

    fn invoke(id: RequestId, capability: &str, body: &'static str) -> Frame {
        Invoke {
            id,
            capability: capability.into(),
            body: Bytes::from(body),
        }
        .into_frame()
        .unwrap()
    }

    #[tokio::test]
    async fn test_invocations_get_replies() {
        let (mut writer, mut reader, task) = started().await;

        writer.send(&invoke(1, "echo", "hello")).await.unwrap();
        let reply = Reply::from_frame(&reader.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.body, Bytes::from("hello"));

        writer.send(&invoke(2, "whoami", "")).await.unwrap();
        let reply = Reply::from_frame(&reader.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.body, Bytes::from("echo-plugin@7"));

        writer.send(&invoke(3, "nope", "")).await.unwrap();
        let failure = InvokeFailure::from_frame(&reader.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(failure.id, 3);
        assert!(failure.message.contains("nope"));

        writer.send(&Frame::empty(MessageType::Stop)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_invocation_never_replies() {
        let (mut writer, mut reader, task) = started().await;

        writer.send(&invoke(1, "wait", "")).await.unwrap();
        writer.send(&Cancel { id: 1 }.into_frame()).await.unwrap();
        writer.send(&invoke(2, "echo", "after")).await.unwrap();

        let reply = Reply::from_frame(&reader.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.id, 2);

        // Closing stdin ends the plugin even with nothing pending
        drop(writer);
        task.await.unwrap().unwrap();
        assert!(reader.recv().await.unwrap().is_none());
    }
}
