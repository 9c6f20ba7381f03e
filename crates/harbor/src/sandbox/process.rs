//! Process-isolated sandbox
//!
//! Each plugin generation runs as its own child process, giving true
//! OS-level fault isolation: a crash, hang or leak in the plugin cannot touch
//! the host's memory or another plugin's.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use harbor_ipc::{
    Cancel, Frame, FrameReader, FrameWriter, Invoke, InvokeFailure, LogMessage, MessageType,
    ReadyMessage, Reply, RequestId, StartMessage,
};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{LaunchSpec, Sandbox, SandboxError, SandboxLauncher};
use crate::loader::LoadError;

const OUTBOUND_QUEUE: usize = 64;

/// Launches plugins as child processes speaking the frame protocol over
/// stdin/stdout
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    ready_timeout: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a fresh process has to send its Ready frame
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

#[async_trait]
impl SandboxLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn Sandbox>, LoadError> {
        let descriptor = &spec.descriptor;
        let entry = spec.root.join(&descriptor.entry);

        info!(
            plugin = %descriptor.id,
            generation = spec.generation,
            "Spawning plugin process: {}",
            entry.display()
        );

        let mut cmd = Command::new(&entry);
        cmd.args(&descriptor.args)
            .current_dir(&spec.root)
            .env("HARBOR_PLUGIN", &descriptor.id)
            .env("HARBOR_GENERATION", spec.generation.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Plugin stderr goes to our stderr
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            LoadError::Io(format!("failed to spawn {}: {}", entry.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoadError::Io("failed to get plugin stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoadError::Io("failed to get plugin stdout".into()))?;

        let mut writer = FrameWriter::new(stdin);
        let mut reader = FrameReader::new(stdout);

        let handshake =
            tokio::time::timeout(self.ready_timeout, wait_ready(&mut reader, &descriptor.id))
                .await
                .unwrap_or_else(|_| {
                    Err(format!(
                        "no Ready frame within {}ms",
                        self.ready_timeout.as_millis()
                    ))
                })
                .and_then(|ready| {
                    let missing: Vec<&str> = descriptor
                        .capabilities
                        .iter()
                        .filter(|c| !ready.capabilities.contains(*c))
                        .map(String::as_str)
                        .collect();
                    if missing.is_empty() {
                        Ok(ready)
                    } else {
                        Err(format!(
                            "plugin does not serve declared capabilities: {}",
                            missing.join(", ")
                        ))
                    }
                });

        let ready = match handshake {
            Ok(ready) => ready,
            Err(reason) => {
                let _ = child.kill().await;
                return Err(LoadError::malformed(&descriptor.archive, reason));
            }
        };

        debug!(
            plugin = %descriptor.id,
            generation = spec.generation,
            capabilities = ?ready.capabilities,
            "Plugin is ready"
        );

        let start = Frame::json(
            MessageType::Start,
            &StartMessage {
                plugin: descriptor.id.clone(),
                generation: spec.generation,
                config: descriptor.config.clone(),
            },
        )
        .map_err(|e| LoadError::Io(format!("failed to encode Start: {e}")))?;

        if let Err(e) = writer.send(&start).await {
            let _ = child.kill().await;
            return Err(LoadError::Io(format!("failed to send Start: {e}")));
        }

        Ok(Box::new(ProcessSandbox::start(
            descriptor.id.clone(),
            spec.generation,
            child,
            writer,
            reader,
        )))
    }
}

async fn wait_ready<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    plugin: &str,
) -> Result<ReadyMessage, String> {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => match frame.msg_type {
                MessageType::Ready => {
                    return frame
                        .parse_json()
                        .map_err(|e| format!("invalid Ready payload: {e}"))
                }
                MessageType::Log => emit_log(plugin, &frame),
                other => return Err(format!("expected Ready, got {other:?}")),
            },
            Ok(None) => return Err("plugin exited before Ready".into()),
            Err(e) => return Err(format!("IPC error before Ready: {e}")),
        }
    }
}

/// Re-emit a plugin Log frame under the `plugin` target
fn emit_log(plugin: &str, frame: &Frame) {
    let Ok(log) = frame.parse_json::<LogMessage>() else {
        warn!(plugin = %plugin, "Unparseable log frame");
        return;
    };
    match log.level.as_str() {
        "trace" => tracing::trace!(target: "plugin", plugin = %plugin, "{}", log.message),
        "debug" => tracing::debug!(target: "plugin", plugin = %plugin, "{}", log.message),
        "warn" => tracing::warn!(target: "plugin", plugin = %plugin, "{}", log.message),
        "error" => tracing::error!(target: "plugin", plugin = %plugin, "{}", log.message),
        _ => tracing::info!(target: "plugin", plugin = %plugin, "{}", log.message),
    }
}

type PendingReply = oneshot::Sender<Result<Bytes, SandboxError>>;

/// State shared between the sandbox handle and its reader task
struct Shared {
    pending: Mutex<HashMap<RequestId, PendingReply>>,
    alive: AtomicBool,
    stopping: AtomicBool,
}

impl Shared {
    fn complete(&self, id: RequestId, result: Result<Bytes, SandboxError>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            // Late reply for an invocation the host already gave up on
            None => debug!("Dropping reply for abandoned request {}", id),
        }
    }

    fn fail_pending(&self, err: SandboxError) {
        let pending: Vec<PendingReply> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn closed_error(&self) -> SandboxError {
        if self.stopping.load(Ordering::SeqCst) {
            SandboxError::Aborted
        } else {
            SandboxError::Exited
        }
    }
}

/// Removes a pending request when the invoking future goes away, and tells
/// the plugin to cancel it if no reply arrived
struct PendingCall {
    id: RequestId,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let abandoned = self.shared.pending.lock().remove(&self.id).is_some();
        if abandoned && self.shared.alive.load(Ordering::SeqCst) {
            let _ = self.outbound.try_send(Cancel { id: self.id }.into_frame());
            debug!("Cancelled request {}", self.id);
        }
    }
}

/// A running plugin process
pub struct ProcessSandbox {
    plugin: String,
    generation: u64,
    pid: Option<u32>,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    next_id: AtomicU64,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSandbox {
    fn start(
        plugin: String,
        generation: u64,
        child: Child,
        mut writer: FrameWriter<tokio::process::ChildStdin>,
        mut reader: FrameReader<ChildStdout>,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        });

        let (outbound, mut queue) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

        let writer_task = {
            let plugin = plugin.clone();
            tokio::spawn(async move {
                while let Some(frame) = queue.recv().await {
                    if let Err(e) = writer.send(&frame).await {
                        debug!(plugin = %plugin, "Plugin stdin closed: {}", e);
                        break;
                    }
                }
            })
        };

        let reader_task = {
            let plugin = plugin.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    match reader.recv().await {
                        Ok(Some(frame)) => match frame.msg_type {
                            MessageType::Reply => match Reply::from_frame(&frame) {
                                Ok(reply) => shared.complete(reply.id, Ok(reply.body)),
                                Err(e) => warn!(plugin = %plugin, "Bad Reply frame: {}", e),
                            },
                            MessageType::Error => match InvokeFailure::from_frame(&frame) {
                                Ok(failure) => shared
                                    .complete(failure.id, Err(SandboxError::Plugin(failure.message))),
                                Err(e) => warn!(plugin = %plugin, "Bad Error frame: {}", e),
                            },
                            MessageType::Log => emit_log(&plugin, &frame),
                            other => {
                                warn!(plugin = %plugin, "Unexpected message type from plugin: {:?}", other);
                            }
                        },
                        Ok(None) => {
                            info!(plugin = %plugin, "Plugin closed connection");
                            break;
                        }
                        Err(e) => {
                            error!(plugin = %plugin, "Error reading from plugin: {}", e);
                            break;
                        }
                    }
                }

                shared.alive.store(false, Ordering::SeqCst);
                shared.fail_pending(shared.closed_error());
            })
        };

        Self {
            plugin,
            generation,
            pid: child.id(),
            shared,
            outbound,
            next_id: AtomicU64::new(1),
            child: tokio::sync::Mutex::new(Some(child)),
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn invoke(&self, capability: &str, payload: Bytes) -> Result<Bytes, SandboxError> {
        if !self.shared.alive.load(Ordering::SeqCst) || self.shared.stopping.load(Ordering::SeqCst)
        {
            return Err(self.shared.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Invoke {
            id,
            capability: capability.to_string(),
            body: payload,
        }
        .into_frame()
        .map_err(|e| SandboxError::Ipc(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let _call = PendingCall {
            id,
            shared: self.shared.clone(),
            outbound: self.outbound.clone(),
        };

        // Shutdown may have drained the table before the insert above
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(SandboxError::Aborted);
        }

        if self.outbound.send(frame).await.is_err() {
            return Err(self.shared.closed_error());
        }

        rx.await.unwrap_or_else(|_| Err(self.shared.closed_error()))
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self, grace: Duration) {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return;
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.fail_pending(SandboxError::Aborted);

        let _ = self.outbound.try_send(Frame::empty(MessageType::Stop));

        // Wait for process to exit gracefully
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(
                    plugin = %self.plugin,
                    generation = self.generation,
                    "Plugin exited with status: {}",
                    status
                );
            }
            Ok(Err(e)) => {
                error!(plugin = %self.plugin, "Error waiting for plugin: {}", e);
            }
            Err(_) => {
                warn!(plugin = %self.plugin, "Plugin did not exit in time, killing");
                let _ = child.kill().await;
            }
        }

        self.shared.alive.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
