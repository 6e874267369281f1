//! Host side of the worker protocol.
//!
//! An [`RpcPeer`] owns the worker's stdin and stdout. It performs the
//! `ready` handshake, then runs a background read loop that matches
//! responses to pending calls and routes notifications to the applied
//! progress endpoint.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use extsys_core::protocol::encode_line;
use extsys_core::{FacadeCall, HostMessage, RequestId, WorkerMessage};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::RpcError;
use crate::progress::ExportedEndpoint;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = HashMap<RequestId, oneshot::Sender<Result<Value, RpcError>>>;

/// What the worker announced in its `ready` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandshake {
    /// Worker process id, as reported by the worker.
    pub pid: u32,

    /// Entry point the worker was started with.
    pub entry_point: String,

    /// Resolver name, if the worker was launched for a known system.
    pub resolver: Option<String>,

    /// Task manager name, if the worker was launched for a known system.
    pub task_manager: Option<String>,
}

/// State shared between the peer and its read loop.
struct Shared {
    pending: Mutex<PendingMap>,
    endpoint: RwLock<Option<ExportedEndpoint>>,
    closed: AtomicBool,
}

impl Shared {
    /// Mark the connection dead and fail every in-flight call.
    async fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(in_flight = drained.len(), reason = reason, "Failing in-flight calls");
        }
        for (_, tx) in drained {
            tx.send(Err(RpcError::Communication(reason.to_string()))).ok();
        }
    }
}

/// Protocol peer for request/response communication with a worker.
pub struct RpcPeer {
    writer: Mutex<BoxedWriter>,
    shared: Arc<Shared>,
    read_task: JoinHandle<()>,
}

impl RpcPeer {
    /// Wait for the worker's `ready` line, then start the read loop.
    ///
    /// Non-JSON lines before the handshake are logged and skipped. Fails with
    /// [`RpcError::Timeout`] if nothing arrives within `timeout`, and with
    /// [`RpcError::Communication`] if the worker closes its stdout first.
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Result<(Self, WorkerHandshake), RpcError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader: BoxedReader = BufReader::new(Box::new(reader));

        let handshake = tokio::time::timeout(timeout, read_handshake(&mut reader))
            .await
            .map_err(|_| RpcError::Timeout)??;

        info!(
            pid = handshake.pid,
            entry_point = %handshake.entry_point,
            resolver = ?handshake.resolver,
            "Worker published its facade"
        );

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            endpoint: RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let read_task = tokio::spawn(async move {
            read_loop(reader, &loop_shared).await;
        });

        let peer = Self {
            writer: Mutex::new(Box::new(writer)),
            shared,
            read_task,
        };
        Ok((peer, handshake))
    }

    /// Invoke a facade method and wait for its answer.
    pub async fn call(&self, call: FacadeCall) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Communication("worker connection closed".to_string()));
        }

        let id = RequestId::generate();
        let method = call.method();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        // The read loop may have closed between the check above and the insert.
        if self.is_closed() {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcError::Communication("worker connection closed".to_string()));
        }

        let line = encode_line(&HostMessage::Request {
            id: id.clone(),
            call,
        })?;
        trace!(request_id = %id, method = method, "Sending request");

        if let Err(e) = self.write_line(&line).await {
            self.shared.pending.lock().await.remove(&id);
            self.shared.closed.store(true, Ordering::SeqCst);
            warn!(error = %e, method = method, "Failed to write to worker stdin");
            return Err(RpcError::Communication(format!("failed to write to worker: {}", e)));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Communication("worker connection closed".to_string())),
        }
    }

    /// Route notifications addressed to `endpoint` into it.
    pub async fn set_endpoint(&self, endpoint: ExportedEndpoint) {
        *self.shared.endpoint.write().await = Some(endpoint);
    }

    /// The endpoint notifications are currently routed to.
    pub async fn endpoint(&self) -> Option<ExportedEndpoint> {
        self.shared.endpoint.read().await.clone()
    }

    /// Whether the worker connection is known to be dead.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

impl fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPeer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Strip surrounding ASCII whitespace, including the line terminator.
fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

fn preview(line: &[u8]) -> String {
    String::from_utf8_lossy(line).chars().take(200).collect()
}

async fn read_handshake(reader: &mut BoxedReader) -> Result<WorkerHandshake, RpcError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| RpcError::Communication(format!("failed to read worker stdout: {}", e)))?;
        if bytes == 0 {
            return Err(RpcError::Communication(
                "worker exited before publishing its facade".to_string(),
            ));
        }

        let trimmed = trim_line(&line);
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_slice::<WorkerMessage>(trimmed) {
            Ok(WorkerMessage::Ready {
                pid,
                entry_point,
                resolver,
                task_manager,
            }) => {
                return Ok(WorkerHandshake {
                    pid,
                    entry_point,
                    resolver,
                    task_manager,
                })
            }
            Ok(other) => {
                return Err(RpcError::Protocol(format!(
                    "expected ready, got {}",
                    other.message_type()
                )))
            }
            Err(_) => {
                debug!(preview = %preview(trimmed), "Skipping non-protocol line before handshake");
            }
        }
    }
}

async fn read_loop(mut reader: BoxedReader, shared: &Shared) {
    let mut line = Vec::new();
    let mut message_count = 0u64;

    let reason = loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                info!(total_messages = message_count, "Worker stdout closed (EOF)");
                break "worker stdout closed".to_string();
            }
            Ok(_) => {
                let trimmed = trim_line(&line);
                if trimmed.is_empty() {
                    continue;
                }
                message_count += 1;

                match serde_json::from_slice::<WorkerMessage>(trimmed) {
                    Ok(message) => dispatch(message, shared).await,
                    Err(e) => {
                        warn!(error = %e, preview = %preview(trimmed), "Failed to parse worker message");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading worker stdout");
                break format!("failed to read worker stdout: {}", e);
            }
        }
    };

    shared.close(&reason).await;
}

async fn dispatch(message: WorkerMessage, shared: &Shared) {
    trace!(message_type = message.message_type(), "Worker message");
    match message {
        WorkerMessage::Response { id, result } => {
            match shared.pending.lock().await.remove(&id) {
                Some(tx) => {
                    tx.send(Ok(result)).ok();
                }
                None => warn!(request_id = %id, "Response for unknown request"),
            }
        }
        WorkerMessage::Error { id, message } => {
            match shared.pending.lock().await.remove(&id) {
                Some(tx) => {
                    tx.send(Err(RpcError::Remote(message))).ok();
                }
                None => warn!(request_id = %id, "Error for unknown request"),
            }
        }
        WorkerMessage::Notification { endpoint_id, event } => {
            match shared.endpoint.read().await.as_ref() {
                Some(endpoint) if endpoint.id() == &endpoint_id => endpoint.deliver(event),
                _ => debug!(endpoint_id = %endpoint_id, "Dropping notification for unapplied endpoint"),
            }
        }
        WorkerMessage::Ready { pid, .. } => {
            warn!(pid = pid, "Ignoring repeated ready message");
        }
    }
}
