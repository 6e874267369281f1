//! One worker process per key.
//!
//! The supervisor owns every [`WorkerProcess`]. State mutation is serialized
//! behind a single lock; spawning happens outside it, guarded by a per-key
//! lock so concurrent acquisitions for one key share a single spawn. Every
//! `stop_all` bumps an epoch, and an acquisition that started in an older
//! epoch fails with [`BrokerError::ShutdownRace`] instead of returning a
//! facade for a worker that is being torn down. Stopped slots stay in a
//! draining list until their process has exited, so every waiting
//! `stop_all` sees the same set of workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use extsys_core::WorkerKey;
use extsys_remote::SharedFacade;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::launch::LaunchSpecBuilder;
use crate::process::{WorkerProcess, WorkerStatus};

struct WorkerSlot {
    key: WorkerKey,
    spawn_lock: Mutex<()>,
    process: Mutex<Option<Arc<WorkerProcess>>>,
    /// Cancelled when the slot is released or stopped; aborts a pending spawn.
    cancel: CancellationToken,
}

impl WorkerSlot {
    fn new(key: WorkerKey) -> Self {
        Self {
            key,
            spawn_lock: Mutex::new(()),
            process: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel any pending spawn and ask the cached process to stop.
    async fn shut(&self) -> bool {
        self.cancel.cancel();
        match self.process.lock().await.as_ref() {
            Some(process) => {
                process.request_stop();
                true
            }
            None => false,
        }
    }

    /// Wait for a pending spawn to give up and the process to exit.
    async fn stopped(&self) {
        let _spawning = self.spawn_lock.lock().await;
        let process = self.process.lock().await.clone();
        if let Some(process) = process {
            process.exited().await;
        }
    }

    /// Non-blocking check that nothing of this slot is still running.
    fn is_stopped(&self) -> bool {
        if self.spawn_lock.try_lock().is_err() {
            return false;
        }
        match self.process.try_lock() {
            Ok(process) => process.as_ref().map_or(true, |p| p.has_exited()),
            Err(_) => false,
        }
    }
}

#[derive(Default)]
struct SupervisorState {
    slots: HashMap<WorkerKey, Arc<WorkerSlot>>,
    /// Released or stopped slots whose workers may still be running.
    draining: Vec<Arc<WorkerSlot>>,
    epoch: u64,
    disposed: bool,
}

impl SupervisorState {
    fn holds(&self, key: &WorkerKey, slot: &Arc<WorkerSlot>) -> bool {
        self.slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Drop a slot nobody else is waiting on.
    fn forget_if_unused(&mut self, key: &WorkerKey, slot: &Arc<WorkerSlot>) {
        // One reference in the map, one held by the caller.
        if self.holds(key, slot) && Arc::strong_count(slot) == 2 {
            self.slots.remove(key);
        }
    }
}

/// Spawns, caches and stops worker processes.
pub struct ProcessSupervisor {
    builder: Arc<dyn LaunchSpecBuilder>,
    connection_timeout: Duration,
    stop_grace: Duration,
    state: Mutex<SupervisorState>,
}

impl ProcessSupervisor {
    /// Create a supervisor using `builder` for launch specs.
    pub fn new(builder: Arc<dyn LaunchSpecBuilder>, config: &BrokerConfig) -> Self {
        Self {
            builder,
            connection_timeout: config.connection_timeout,
            stop_grace: config.stop_grace,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    /// Return the facade of the worker for `key`, spawning it if needed.
    ///
    /// Returns `Ok(None)` when the launch spec builder declines to spawn.
    /// A cached worker that has died is discarded and replaced.
    pub async fn acquire(&self, key: &WorkerKey) -> Result<Option<SharedFacade>, BrokerError> {
        loop {
            let (slot, epoch) = {
                let mut state = self.state.lock().await;
                if state.disposed {
                    return Err(BrokerError::Disposed);
                }
                let slot = Arc::clone(
                    state
                        .slots
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(WorkerSlot::new(key.clone()))),
                );
                (slot, state.epoch)
            };

            let _spawning = slot.spawn_lock.lock().await;

            {
                let state = self.state.lock().await;
                if state.disposed {
                    return Err(BrokerError::Disposed);
                }
                if state.epoch != epoch {
                    return Err(BrokerError::ShutdownRace(key.clone()));
                }
                if !state.holds(key, &slot) {
                    debug!(key = %key, "Worker released while waiting, retrying");
                    continue;
                }

                let mut cached = slot.process.lock().await;
                if let Some(process) = cached.as_ref() {
                    if process.is_running() {
                        let count = process.record_acquisition();
                        debug!(key = %key, pid = ?process.pid(), acquisitions = count, "Reusing worker");
                        return Ok(Some(process.facade()));
                    }
                    warn!(key = %key, pid = ?process.pid(), exit = ?process.exit(), "Discarding dead worker");
                    process.request_stop();
                    *cached = None;
                }
            }

            let spec = match self.builder.build(key) {
                Ok(Some(spec)) => spec,
                Ok(None) => {
                    debug!(key = %key, "Launch suppressed, no worker");
                    self.state.lock().await.forget_if_unused(key, &slot);
                    return Ok(None);
                }
                Err(e) => {
                    self.state.lock().await.forget_if_unused(key, &slot);
                    return Err(e);
                }
            };

            info!(key = %key, program = %spec.program.display(), "Starting worker");

            let spawned = WorkerProcess::spawn(key.clone(), &spec, self.connection_timeout, &slot.cancel).await;
            let process = match spawned {
                Ok(process) => Arc::new(process),
                Err(e) => {
                    let mut state = self.state.lock().await;
                    state.forget_if_unused(key, &slot);
                    if state.disposed && matches!(e, BrokerError::ShutdownRace(_)) {
                        return Err(BrokerError::Disposed);
                    }
                    return Err(e);
                }
            };

            let state = self.state.lock().await;
            if state.disposed || state.epoch != epoch || !state.holds(key, &slot) {
                let disposed = state.disposed;
                drop(state);
                warn!(key = %key, pid = ?process.pid(), "Worker stopped while starting, killing it");
                process.stop(true, self.stop_grace).await;
                return Err(if disposed {
                    BrokerError::Disposed
                } else {
                    BrokerError::ShutdownRace(key.clone())
                });
            }

            process.record_acquisition();
            let facade = process.facade();
            *slot.process.lock().await = Some(process);
            return Ok(Some(facade));
        }
    }

    /// Stop the worker for `key`, if any. Returns whether one was tracked.
    ///
    /// A spawn still in progress for `key` is aborted.
    pub async fn release(&self, key: &WorkerKey) -> bool {
        let mut state = self.state.lock().await;
        let Some(slot) = state.slots.remove(key) else {
            return false;
        };

        let had_process = slot.shut().await;
        if had_process {
            info!(key = %key, "Releasing worker");
        }
        state.draining.push(slot);
        had_process
    }

    /// Stop every worker.
    ///
    /// With `wait`, blocks until each worker stopped by this or any earlier
    /// call has exited, or the grace period has elapsed. Safe to call
    /// repeatedly and concurrently.
    pub async fn stop_all(&self, wait: bool) {
        let waiting: Vec<_> = {
            let mut state = self.state.lock().await;
            state.epoch += 1;
            let slots: Vec<_> = state.slots.drain().map(|(_, slot)| slot).collect();
            for slot in slots {
                slot.shut().await;
                state.draining.push(slot);
            }
            state.draining.retain(|slot| !slot.is_stopped());
            state.draining.clone()
        };

        if waiting.is_empty() {
            return;
        }
        info!(count = waiting.len(), wait = wait, "Stopping workers");

        if wait {
            for slot in &waiting {
                if tokio::time::timeout(self.stop_grace, slot.stopped()).await.is_err() {
                    warn!(
                        key = %slot.key,
                        grace_secs = self.stop_grace.as_secs(),
                        "Worker still running after grace period"
                    );
                }
            }
            self.state.lock().await.draining.retain(|slot| !slot.is_stopped());
        }
    }

    /// Refuse further acquisitions and stop every worker without waiting.
    pub async fn dispose(&self) {
        self.state.lock().await.disposed = true;
        self.stop_all(false).await;
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub async fn is_disposed(&self) -> bool {
        self.state.lock().await.disposed
    }

    /// Snapshot of the tracked workers, ordered by key.
    pub async fn workers(&self) -> Vec<WorkerStatus> {
        let state = self.state.lock().await;
        let mut workers = Vec::with_capacity(state.slots.len());
        for slot in state.slots.values() {
            if let Some(process) = slot.process.lock().await.as_ref() {
                workers.push(process.status());
            }
        }
        workers.sort_by(|a, b| a.key.cmp(&b.key));
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBuilder {
        spec: Option<LaunchSpec>,
        builds: AtomicUsize,
    }

    impl FixedBuilder {
        fn new(spec: Option<LaunchSpec>) -> Arc<Self> {
            Arc::new(Self {
                spec,
                builds: AtomicUsize::new(0),
            })
        }
    }

    impl LaunchSpecBuilder for FixedBuilder {
        fn build(&self, _key: &WorkerKey) -> Result<Option<LaunchSpec>, BrokerError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(self.spec.clone())
        }
    }

    fn supervisor(builder: Arc<FixedBuilder>) -> ProcessSupervisor {
        let config = BrokerConfig::default()
            .with_connection_timeout(Duration::from_millis(200))
            .with_stop_grace(Duration::from_secs(2));
        ProcessSupervisor::new(builder, &config)
    }

    #[tokio::test]
    async fn test_suppressed_launch_returns_none() {
        let builder = FixedBuilder::new(None);
        let sup = supervisor(builder.clone());

        let facade = sup.acquire(&WorkerKey::new("projA")).await.unwrap();
        assert!(facade.is_none());
        assert!(sup.workers().await.is_empty());
        assert!(sup.state.lock().await.slots.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_behind() {
        let spec = LaunchSpec::new("/nonexistent/extsys-worker", "main", std::env::temp_dir());
        let builder = FixedBuilder::new(Some(spec));
        let sup = supervisor(builder.clone());

        let err = sup.acquire(&WorkerKey::new("projA")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Spawn { .. }));
        assert!(sup.state.lock().await.slots.is_empty());

        // A later acquisition tries again.
        let _ = sup.acquire(&WorkerKey::new("projA")).await;
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connection_timeout_is_reported() {
        let spec = LaunchSpec::new("sleep", "30", std::env::temp_dir());
        let sup = supervisor(FixedBuilder::new(Some(spec)));

        let err = sup.acquire(&WorkerKey::new("projA")).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionTimeout { .. }));
        assert!(sup.workers().await.is_empty());
    }

    #[tokio::test]
    async fn test_disposed_supervisor_refuses() {
        let sup = supervisor(FixedBuilder::new(None));
        sup.dispose().await;
        sup.dispose().await;

        assert!(sup.is_disposed().await);
        let err = sup.acquire(&WorkerKey::new("projA")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Disposed));
    }

    #[tokio::test]
    async fn test_stop_all_is_repeatable() {
        let sup = supervisor(FixedBuilder::new(None));
        sup.stop_all(true).await;
        sup.stop_all(false).await;
        assert!(!sup.release(&WorkerKey::new("projA")).await);
        assert_eq!(sup.state.lock().await.epoch, 2);
    }

    #[cfg(unix)]
    fn recording_sleeper(pidfile: &std::path::Path) -> LaunchSpec {
        let mut spec = LaunchSpec::new("sh", "worker", std::env::temp_dir());
        spec.runtime_options = vec![
            "-c".to_string(),
            format!("echo $$ > '{}'; exec sleep 30", pidfile.display()),
        ];
        spec
    }

    #[cfg(unix)]
    fn slow_supervisor(spec: LaunchSpec) -> Arc<ProcessSupervisor> {
        let config = BrokerConfig::default()
            .with_connection_timeout(Duration::from_secs(60))
            .with_stop_grace(Duration::from_secs(2));
        Arc::new(ProcessSupervisor::new(FixedBuilder::new(Some(spec)), &config))
    }

    #[cfg(unix)]
    async fn recorded_pid(pidfile: &std::path::Path) -> String {
        for _ in 0..100 {
            if let Ok(pid) = std::fs::read_to_string(pidfile) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker never recorded its pid");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_kills_worker_still_starting() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let sup = slow_supervisor(recording_sleeper(&pidfile));

        let pending = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.acquire(&WorkerKey::new("projA")).await })
        };
        let pid = recorded_pid(&pidfile).await;

        sup.stop_all(true).await;
        assert!(!crate::process::tests::process_alive(&pid));

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("acquire still pending after stop_all")
            .unwrap();
        assert!(matches!(result, Err(BrokerError::ShutdownRace(_))));
        assert!(sup.workers().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_stop_all_callers_all_wait() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let sup = slow_supervisor(recording_sleeper(&pidfile));

        let pending = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.acquire(&WorkerKey::new("projA")).await })
        };
        let pid = recorded_pid(&pidfile).await;

        let first = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.stop_all(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        sup.stop_all(true).await;
        assert!(!crate::process::tests::process_alive(&pid));

        first.await.unwrap();
        assert!(!crate::process::tests::process_alive(&pid));
        assert!(pending.await.unwrap().is_err());
        assert!(sup.state.lock().await.draining.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_aborts_pending_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let sup = slow_supervisor(recording_sleeper(&pidfile));

        let pending = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.acquire(&WorkerKey::new("projA")).await })
        };
        let pid = recorded_pid(&pidfile).await;

        assert!(!sup.release(&WorkerKey::new("projA")).await);
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("acquire still pending after release")
            .unwrap();
        assert!(matches!(result, Err(BrokerError::ShutdownRace(_))));
        assert!(!crate::process::tests::process_alive(&pid));
    }
}
