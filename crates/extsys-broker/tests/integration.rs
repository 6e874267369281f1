//! Integration tests for extsys-broker.
//! Spawns the real extsys-worker binary against temporary project directories.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extsys_broker::{
    BrokerConfig, BrokerError, CommunicationManager, DefaultLaunchSpecBuilder, EndpointExporter,
    ExportError, LaunchSpec, LaunchSpecBuilder, LocalExporter, RemoteCommunicationManager,
    SystemRegistry,
};
use extsys_core::{ProgressEvent, SystemId, TaskId, WorkerKey};
use extsys_remote::{
    DirectoryScanResolver, ExportedEndpoint, InProcessFacade, ProgressNotificationManager,
    SharedFacade,
};
use tempfile::TempDir;

const WORKER: &str = env!("CARGO_BIN_EXE_extsys-worker");

fn config(fallback: &Path) -> BrokerConfig {
    BrokerConfig::default()
        .with_worker_program(WORKER)
        .with_fallback_working_dir(fallback)
        .with_connection_timeout(Duration::from_secs(30))
        .with_stop_grace(Duration::from_secs(5))
}

fn manager(fallback: &Path) -> Arc<RemoteCommunicationManager> {
    Arc::new(RemoteCommunicationManager::new(
        config(fallback),
        SystemRegistry::builtin(),
    ))
}

fn manager_with(
    fallback: &Path,
    exporter: Arc<dyn EndpointExporter>,
) -> Arc<RemoteCommunicationManager> {
    let config = config(fallback);
    let builder = Arc::new(DefaultLaunchSpecBuilder::new(
        Arc::new(config.clone()),
        Arc::new(SystemRegistry::builtin()),
    ));
    Arc::new(RemoteCommunicationManager::with_parts(builder, exporter, &config))
}

fn project() -> (TempDir, WorkerKey) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("build.gradle"), "apply plugin: 'java'\n").unwrap();
    std::fs::create_dir(dir.path().join("app")).unwrap();
    std::fs::write(dir.path().join("app").join("build.gradle"), "").unwrap();
    let key = WorkerKey::new(dir.path().display().to_string());
    (dir, key)
}

fn gradle() -> SystemId {
    SystemId::new("gradle")
}

async fn acquire(manager: &RemoteCommunicationManager, key: &WorkerKey) -> SharedFacade {
    manager
        .acquire(key, &gradle())
        .await
        .expect("acquire failed")
        .expect("no facade")
}

struct FailingExporter {
    attempts: AtomicUsize,
}

#[async_trait]
impl EndpointExporter for FailingExporter {
    async fn export(
        &self,
        _manager: Arc<ProgressNotificationManager>,
    ) -> Result<ExportedEndpoint, ExportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ExportError("registry unavailable".to_string()))
    }
}

struct CountingExporter {
    exports: AtomicUsize,
}

#[async_trait]
impl EndpointExporter for CountingExporter {
    async fn export(
        &self,
        manager: Arc<ProgressNotificationManager>,
    ) -> Result<ExportedEndpoint, ExportError> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        LocalExporter.export(manager).await
    }
}

struct FixedBuilder(LaunchSpec);

impl LaunchSpecBuilder for FixedBuilder {
    fn build(&self, _key: &WorkerKey) -> Result<Option<LaunchSpec>, BrokerError> {
        Ok(Some(self.0.clone()))
    }
}

// ============================================================================
// Acquisition
// ============================================================================

#[tokio::test]
async fn test_acquire_reuse_and_respawn_after_release() {
    let (dir, key) = project();
    let manager = manager(dir.path());

    let first = acquire(&manager, &key).await;
    let resolver = first.get_resolver().await.unwrap();
    assert_eq!(resolver.name.as_deref(), Some("GradleProjectResolver"));
    assert_ne!(resolver.pid, std::process::id());
    assert!(manager.notifications().exported().is_some());

    // Same key, different caller: same worker, no second spawn.
    let second = manager
        .acquire(&key, &SystemId::new("maven"))
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let workers = manager.workers().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].acquisitions, 2);

    manager.release(&key, &gradle()).await.unwrap();
    assert!(manager.workers().await.is_empty());

    let third = acquire(&manager, &key).await;
    assert!(!Arc::ptr_eq(&first, &third));
    let respawned = third.get_resolver().await.unwrap();
    assert_ne!(respawned.pid, resolver.pid);

    manager.shutdown(true).await;
}

#[tokio::test]
async fn test_concurrent_acquires_share_one_worker() {
    let (dir, key) = project();
    let manager = manager(dir.path());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let key = key.clone();
        handles.push(tokio::spawn(async move { acquire(&manager, &key).await }));
    }
    let mut facades = Vec::new();
    for handle in handles {
        facades.push(handle.await.unwrap());
    }

    assert!(facades.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    let workers = manager.workers().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].acquisitions, 8);

    manager.shutdown(true).await;
}

#[tokio::test]
async fn test_bound_system_reaches_each_worker() {
    let (dir_a, key_a) = project();
    let (_dir_b, key_b) = project();
    let manager = manager(dir_a.path());

    let gradle_id = SystemId::new("gradle");
    let maven_id = SystemId::new("maven");
    let (a, b) = tokio::join!(
        manager.acquire(&key_a, &gradle_id),
        manager.acquire(&key_b, &maven_id),
    );
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    assert_eq!(
        a.get_resolver().await.unwrap().name.as_deref(),
        Some("GradleProjectResolver")
    );
    assert_eq!(
        b.get_task_manager().await.unwrap().name.as_deref(),
        Some("MavenTaskManager")
    );

    manager.shutdown(true).await;
}

#[tokio::test]
async fn test_resolve_streams_progress_to_host() {
    let (dir, key) = project();
    let manager = manager(dir.path());
    let mut events = manager.notification_manager().subscribe();

    let facade = acquire(&manager, &key).await;
    let task_id = TaskId::generate();
    let model = facade
        .resolve_project(task_id.clone(), key.as_str(), false)
        .await
        .unwrap();

    assert_eq!(model.build_system.as_deref(), Some("gradle"));
    let paths: Vec<_> = model.modules.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec![".", "app"]);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(ProgressEvent::Started { .. })));
    assert!(matches!(
        received.last(),
        Some(ProgressEvent::Finished { success: true, .. })
    ));
    assert!(received.iter().all(|e| e.task_id() == &task_id));

    manager.shutdown(true).await;
}

#[tokio::test]
async fn test_missing_program_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RemoteCommunicationManager::new(
        config(dir.path()).with_worker_program("/nonexistent/extsys-worker"),
        SystemRegistry::builtin(),
    );

    let err = manager
        .acquire(&WorkerKey::new("projA"), &gradle())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Spawn { .. }));
    assert!(manager.workers().await.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_connection_timeout_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_connection_timeout(Duration::from_millis(300));
    let builder = Arc::new(FixedBuilder(LaunchSpec::new("sleep", "30", dir.path())));
    let manager = RemoteCommunicationManager::with_parts(builder, Arc::new(LocalExporter), &config);

    let started = std::time::Instant::now();
    let err = manager
        .acquire(&WorkerKey::new("projA"), &gradle())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(manager.workers().await.is_empty());
}

// ============================================================================
// Notification endpoint
// ============================================================================

#[tokio::test]
async fn test_export_failure_degrades_without_error() {
    let (dir, key) = project();
    let exporter = Arc::new(FailingExporter {
        attempts: AtomicUsize::new(0),
    });
    let manager = manager_with(dir.path(), exporter.clone());

    let facade = acquire(&manager, &key).await;
    let model = facade
        .resolve_project(TaskId::generate(), key.as_str(), true)
        .await
        .unwrap();
    assert!(model.preview);
    assert!(manager.notifications().exported().is_none());

    // Retried on the next acquisition, not before.
    assert_eq!(exporter.attempts.load(Ordering::SeqCst), 1);
    acquire(&manager, &key).await;
    assert_eq!(exporter.attempts.load(Ordering::SeqCst), 2);

    manager.shutdown(true).await;
}

#[tokio::test]
async fn test_endpoint_exported_once_for_all_workers() {
    let (dir_a, key_a) = project();
    let (_dir_b, key_b) = project();
    let exporter = Arc::new(CountingExporter {
        exports: AtomicUsize::new(0),
    });
    let manager = manager_with(dir_a.path(), exporter.clone());

    let (a, b) = tokio::join!(acquire(&manager, &key_a), acquire(&manager, &key_b));
    assert!(!Arc::ptr_eq(&a, &b));
    acquire(&manager, &key_a).await;

    assert_eq!(exporter.exports.load(Ordering::SeqCst), 1);
    assert_eq!(manager.workers().await.len(), 2);

    manager.shutdown(true).await;
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn test_liveness_follows_the_worker() {
    let (dir, key) = project();
    let manager = manager(dir.path());

    let facade = acquire(&manager, &key).await;
    assert!(manager.is_alive(&facade).await);

    manager.clear().await;
    assert!(manager.workers().await.is_empty());
    assert!(!manager.is_alive(&facade).await);
}

#[tokio::test]
async fn test_in_process_facade_is_never_alive() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let facade: SharedFacade = Arc::new(InProcessFacade::new(Arc::new(
        DirectoryScanResolver::new(None, None),
    )));
    assert!(!manager.is_alive(&facade).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_dead_worker_is_replaced() {
    let (dir, key) = project();
    let manager = manager(dir.path());

    let first = acquire(&manager, &key).await;
    let pid = manager.workers().await[0].pid.unwrap();

    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.workers().await.first().is_some_and(|w| w.running) {
        assert!(tokio::time::Instant::now() < deadline, "worker never died");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!manager.is_alive(&first).await);

    let second = acquire(&manager, &key).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(manager.workers().await[0].pid, Some(pid));

    manager.shutdown(true).await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_stop_all_leaves_nothing_running() {
    let (dir_a, key_a) = project();
    let (_dir_b, key_b) = project();
    let manager = manager(dir_a.path());

    let a = acquire(&manager, &key_a).await;
    let b = acquire(&manager, &key_b).await;
    assert_eq!(manager.workers().await.len(), 2);

    manager.shutdown(true).await;
    manager.shutdown(true).await;

    assert!(manager.workers().await.is_empty());
    assert!(a.get_resolver().await.unwrap_err().is_communication());
    assert!(b.get_resolver().await.unwrap_err().is_communication());

    // The manager stays usable after stopping everything.
    let c = acquire(&manager, &key_a).await;
    assert!(!Arc::ptr_eq(&a, &c));
    manager.shutdown(true).await;
}

#[tokio::test]
async fn test_dispose_refuses_further_work() {
    let (dir, key) = project();
    let manager = manager(dir.path());
    acquire(&manager, &key).await;

    let (first, second) = tokio::join!(manager.dispose(), manager.dispose());
    assert!(first ^ second);

    let err = manager.acquire(&key, &gradle()).await.unwrap_err();
    assert!(matches!(err, BrokerError::Disposed));
    assert!(manager.workers().await.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_all_during_spawn_fails_the_acquire() {
    let (dir, key) = project();
    let config = config(dir.path());

    // Delay the real worker so stop_all lands while it is starting.
    let mut spec = LaunchSpec::new("sh", "extsys.worker.RemoteExternalSystemFacade", dir.path());
    spec.runtime_options = vec![
        "-c".to_string(),
        format!("sleep 1; exec '{}' --headless -- \"$@\"", WORKER),
    ];
    let manager = Arc::new(RemoteCommunicationManager::with_parts(
        Arc::new(FixedBuilder(spec)),
        Arc::new(LocalExporter),
        &config,
    ));

    let pending = {
        let manager = Arc::clone(&manager);
        let key = key.clone();
        tokio::spawn(async move { manager.acquire(&key, &gradle()).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.shutdown(true).await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::ShutdownRace(_)));
    assert!(manager.workers().await.is_empty());

    // A fresh acquisition after the race works.
    acquire(&manager, &key).await;
    manager.shutdown(true).await;
}
