//! A single worker process and its facade.

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use extsys_core::WorkerKey;
use extsys_remote::{RemoteFacade, RpcError, SharedFacade, TracingFacade};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::launch::LaunchSpec;

/// How long a failed spawn waits for the killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl From<std::io::Result<ExitStatus>> for WorkerExit {
    fn from(status: std::io::Result<ExitStatus>) -> Self {
        Self {
            code: status.ok().and_then(|s| s.code()),
        }
    }
}

/// Point-in-time view of a tracked worker.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub key: WorkerKey,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub acquisitions: u64,
    pub running: bool,
}

/// A spawned worker whose facade has been published.
///
/// Dropping the last handle kills the process.
pub struct WorkerProcess {
    key: WorkerKey,
    pid: Option<u32>,
    remote: Arc<RemoteFacade>,
    facade: SharedFacade,
    started_at: DateTime<Utc>,
    acquisitions: AtomicU64,
    kill_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerProcess {
    /// Start a worker and wait for it to publish its facade.
    ///
    /// A worker that does not publish within `connection_timeout`, that
    /// exits before doing so, or whose start is cancelled through `cancel`,
    /// is killed and reaped before this returns.
    pub async fn spawn(
        key: WorkerKey,
        spec: &LaunchSpec,
        connection_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::ShutdownRace(key));
        }

        let program = spec.program.display().to_string();
        let mut cmd = spec.to_command()?;

        debug!(key = %key, command = ?cmd, "Spawning worker");

        let mut child = cmd.spawn().map_err(|source| {
            error!(key = %key, program = %program, error = %source, "Failed to spawn worker");
            BrokerError::Spawn {
                program: program.clone(),
                source,
            }
        })?;
        let pid = child.id();

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(BrokerError::Spawn {
                    program,
                    source: std::io::Error::other("worker stdio is not piped"),
                });
            }
        };

        info!(key = %key, pid = ?pid, "Worker process started");

        tokio::spawn(pump_stderr(key.clone(), stderr));

        let (kill_tx, kill_rx) = watch::channel(false);
        let (exit_tx, mut exit_rx) = watch::channel(None);
        tokio::spawn(observe_termination(key.clone(), pid, child, kill_rx, exit_tx));

        let connected = tokio::select! {
            result = RemoteFacade::connect(stdout, stdin, connection_timeout) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let remote = match connected {
            Some(Ok(remote)) => Arc::new(remote),
            None => {
                info!(key = %key, pid = ?pid, "Worker stopped while starting");
                kill_and_reap(&kill_tx, &mut exit_rx).await;
                return Err(BrokerError::ShutdownRace(key));
            }
            Some(Err(e)) => {
                warn!(key = %key, pid = ?pid, error = %e, "Worker did not publish its facade");
                kill_and_reap(&kill_tx, &mut exit_rx).await;
                return Err(match e {
                    RpcError::Timeout => BrokerError::ConnectionTimeout {
                        key,
                        timeout: connection_timeout,
                    },
                    source => BrokerError::Handshake { key, source },
                });
            }
        };

        info!(
            key = %key,
            pid = ?pid,
            entry_point = %remote.handshake().entry_point,
            "Worker facade published"
        );

        let facade: SharedFacade = Arc::new(TracingFacade::new(remote.clone(), key.to_string()));

        Ok(Self {
            key,
            pid,
            remote,
            facade,
            started_at: Utc::now(),
            acquisitions: AtomicU64::new(0),
            kill_tx,
            exit_rx,
        })
    }

    /// The key this worker serves.
    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The facade handed to callers. The same reference on every call.
    pub fn facade(&self) -> SharedFacade {
        Arc::clone(&self.facade)
    }

    /// How the process ended, once it has.
    pub fn exit(&self) -> Option<WorkerExit> {
        *self.exit_rx.borrow()
    }

    /// Whether the process has ended.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Whether the process is up and its pipes are open.
    pub fn is_running(&self) -> bool {
        !self.has_exited() && self.remote.is_connected()
    }

    /// Kill the process without waiting.
    pub fn request_stop(&self) {
        if !self.kill_tx.send_replace(true) {
            debug!(key = %self.key, pid = ?self.pid, "Stop requested");
        }
    }

    /// Wait until the process has ended.
    pub async fn exited(&self) {
        let mut exit_rx = self.exit_rx.clone();
        // The observer publishes before dropping its sender, so an error here
        // also means the process is gone.
        let _ = exit_rx.wait_for(Option::is_some).await;
    }

    /// Wait up to `grace` for the process to end. Returns whether it did.
    pub async fn wait_exit(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.exited()).await.is_ok()
    }

    /// Kill the process, optionally waiting up to `grace` for it to end.
    pub async fn stop(&self, wait: bool, grace: Duration) -> bool {
        self.request_stop();
        if wait {
            self.wait_exit(grace).await
        } else {
            self.has_exited()
        }
    }

    /// Count one more acquisition served by this worker.
    pub fn record_acquisition(&self) -> u64 {
        self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot for diagnostics.
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            key: self.key.clone(),
            pid: self.pid,
            started_at: self.started_at,
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("exit", &self.exit())
            .finish()
    }
}

/// Kill a child that never became a worker and wait briefly for it to be reaped.
async fn kill_and_reap(
    kill_tx: &watch::Sender<bool>,
    exit_rx: &mut watch::Receiver<Option<WorkerExit>>,
) {
    kill_tx.send_replace(true);
    let _ = tokio::time::timeout(REAP_TIMEOUT, exit_rx.wait_for(Option::is_some)).await;
}

/// Forward the worker's stderr into our log.
async fn pump_stderr(key: WorkerKey, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!(key = %key, stderr = %trimmed, "Worker stderr");
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}

/// Reap the child, killing it first if asked to or if every handle is gone.
async fn observe_termination(
    key: WorkerKey,
    pid: Option<u32>,
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx.wait_for(|kill| *kill) => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                debug!(key = %key, pid = ?pid, error = %e, "Kill failed, process already gone");
            }
            child.wait().await
        }
    };

    let exit = WorkerExit::from(status);
    info!(key = %key, pid = ?pid, exit_code = ?exit.code, "Worker process exited");
    exit_tx.send_replace(Some(exit));
}
