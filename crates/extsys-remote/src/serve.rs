//! Worker side of the protocol.
//!
//! [`serve`] is what a worker binary runs: it announces the facade with a
//! `ready` line, answers requests concurrently and forwards progress events
//! as notifications once the host has applied a progress manager.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use extsys_core::protocol::encode_line;
use extsys_core::{
    ComponentInfo, EndpointId, FacadeCall, HostMessage, ProgressEvent, RequestId, TaskId,
    WorkerMessage,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::progress::ProgressSink;
use crate::resolver::ProjectResolver;

/// Worker-side settings.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Entry point name announced in the `ready` message.
    pub entry_point: String,

    /// How long a single write to the host may block before the host is
    /// considered gone.
    pub connection_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            entry_point: "extsys-worker".to_string(),
            connection_timeout: Duration::from_secs(60 * 60),
        }
    }
}

struct ServeState {
    resolver: Arc<dyn ProjectResolver>,
    endpoint: RwLock<Option<EndpointId>>,
    tasks: Mutex<HashMap<TaskId, CancellationToken>>,
    out: mpsc::UnboundedSender<WorkerMessage>,
}

/// Forwards progress events to the host as notifications.
struct NotificationSink {
    endpoint_id: EndpointId,
    out: mpsc::UnboundedSender<WorkerMessage>,
}

impl ProgressSink for NotificationSink {
    fn emit(&self, event: ProgressEvent) {
        let message = WorkerMessage::Notification {
            endpoint_id: self.endpoint_id.clone(),
            event,
        };
        // Writer gone means the host is gone; nothing left to tell.
        self.out.send(message).ok();
    }
}

/// Run the worker loop until the host closes stdin or asks for shutdown.
pub async fn serve<R, W>(
    resolver: Arc<dyn ProjectResolver>,
    reader: R,
    writer: W,
    options: ServeOptions,
) -> Result<(), RpcError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, out_rx, options.connection_timeout));

    out_tx
        .send(WorkerMessage::Ready {
            pid: std::process::id(),
            entry_point: options.entry_point.clone(),
            resolver: resolver.name().map(str::to_string),
            task_manager: resolver.task_manager_name().map(str::to_string),
        })
        .map_err(|_| RpcError::Communication("writer stopped".to_string()))?;
    info!(entry_point = %options.entry_point, "Facade published");

    let state = Arc::new(ServeState {
        resolver,
        endpoint: RwLock::new(None),
        tasks: Mutex::new(HashMap::new()),
        out: out_tx,
    });

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Error reading host stdin");
                break;
            }
        };
        if bytes == 0 {
            info!("Host closed stdin (EOF)");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let HostMessage::Request { id, call } = match serde_json::from_str::<HostMessage>(trimmed) {
            Ok(message) => message,
            Err(e) => {
                let preview: String = trimmed.chars().take(200).collect();
                warn!(error = %e, preview = %preview, "Failed to parse host message");
                continue;
            }
        };

        debug!(request_id = %id, method = call.method(), "Request");
        if call == FacadeCall::Shutdown {
            respond(&state, id, Ok(Value::Null));
            info!("Shutdown requested");
            break;
        }

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let result = handle_call(&state, call).await;
            respond(&state, id, result);
        });
    }

    for token in state.tasks.lock().await.values() {
        token.cancel();
    }
    // The writer drains once every sender (ours and in-flight handlers') is gone.
    drop(state);
    writer_task
        .await
        .map_err(|e| RpcError::Protocol(format!("writer task failed: {}", e)))?
}

fn respond(state: &ServeState, id: RequestId, result: Result<Value, String>) {
    let message = match result {
        Ok(result) => WorkerMessage::Response { id, result },
        Err(message) => WorkerMessage::Error { id, message },
    };
    state.out.send(message).ok();
}

async fn handle_call(state: &ServeState, call: FacadeCall) -> Result<Value, String> {
    match call {
        FacadeCall::GetResolver => to_value(ComponentInfo {
            name: state.resolver.name().map(str::to_string),
            pid: std::process::id(),
        }),
        FacadeCall::GetTaskManager => to_value(ComponentInfo {
            name: state.resolver.task_manager_name().map(str::to_string),
            pid: std::process::id(),
        }),
        FacadeCall::ApplyProgressManager { endpoint_id } => {
            info!(endpoint_id = %endpoint_id, "Progress manager applied");
            *state.endpoint.write().await = Some(endpoint_id);
            Ok(Value::Null)
        }
        FacadeCall::ResolveProject {
            task_id,
            project_path,
            preview,
        } => {
            let cancel = CancellationToken::new();
            state.tasks.lock().await.insert(task_id.clone(), cancel.clone());

            let sink: Box<dyn ProgressSink> = match state.endpoint.read().await.clone() {
                Some(endpoint_id) => Box::new(NotificationSink {
                    endpoint_id,
                    out: state.out.clone(),
                }),
                None => Box::new(crate::progress::NoopProgress),
            };

            let result = state
                .resolver
                .resolve_project(&task_id, Path::new(&project_path), preview, sink.as_ref(), &cancel)
                .await;

            state.tasks.lock().await.remove(&task_id);
            match result {
                Ok(model) => to_value(model),
                Err(e) => Err(e.to_string()),
            }
        }
        FacadeCall::CancelTask { task_id } => {
            let found = match state.tasks.lock().await.get(&task_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            };
            Ok(Value::Bool(found))
        }
        FacadeCall::Shutdown => Ok(Value::Null),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    connection_timeout: Duration,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = encode_line(&message)?;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        match tokio::time::timeout(connection_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(RpcError::Communication(format!("failed to write to host: {}", e)))
            }
            Err(_) => {
                error!(timeout_ms = connection_timeout.as_millis() as u64, "Host stopped reading");
                return Err(RpcError::Timeout);
            }
        }
    }
    Ok(())
}
