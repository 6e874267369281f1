//! Facade acquisition for callers.
//!
//! A [`CommunicationManager`] hands out facades by caller key and target
//! system. [`RemoteCommunicationManager`] runs each key in its own worker
//! process; [`InProcessCommunicationManager`] resolves inside the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use extsys_core::{SystemId, WorkerKey};
use extsys_remote::{
    DirectoryScanResolver, InProcessFacade, ProgressNotificationManager, SharedFacade,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::context::with_target_system;
use crate::error::BrokerError;
use crate::launch::{DefaultLaunchSpecBuilder, LaunchSpecBuilder, SystemRegistry};
use crate::liveness::LivenessProbe;
use crate::notification::{EndpointExporter, LocalExporter, NotificationChannel};
use crate::process::WorkerStatus;
use crate::supervisor::ProcessSupervisor;

/// Acquire and release facades.
#[async_trait]
pub trait CommunicationManager: Send + Sync {
    /// Facade serving `key` for `system`, or `None` if the system has no worker.
    ///
    /// Repeated calls with the same key return the same facade until the key
    /// is released.
    async fn acquire(
        &self,
        key: &WorkerKey,
        system: &SystemId,
    ) -> Result<Option<SharedFacade>, BrokerError>;

    /// Stop using the facade for `key`.
    async fn release(&self, key: &WorkerKey, system: &SystemId) -> Result<(), BrokerError>;

    /// Whether `facade` still reaches a live worker.
    async fn is_alive(&self, facade: &SharedFacade) -> bool;

    /// Drop every facade and stop every worker.
    async fn clear(&self);
}

/// Runs one worker process per key.
pub struct RemoteCommunicationManager {
    supervisor: ProcessSupervisor,
    notifications: NotificationChannel,
    probe: LivenessProbe,
    disposed: AtomicBool,
}

impl RemoteCommunicationManager {
    /// Create a manager launching workers as `config` and `registry` describe.
    pub fn new(config: BrokerConfig, registry: SystemRegistry) -> Self {
        let config = Arc::new(config);
        let builder = Arc::new(DefaultLaunchSpecBuilder::new(
            Arc::clone(&config),
            Arc::new(registry),
        ));
        Self::with_parts(builder, Arc::new(LocalExporter), &config)
    }

    /// Create a manager from explicit parts.
    pub fn with_parts(
        builder: Arc<dyn LaunchSpecBuilder>,
        exporter: Arc<dyn EndpointExporter>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(builder, config),
            notifications: NotificationChannel::new(exporter),
            probe: LivenessProbe::new(config.probe_timeout),
            disposed: AtomicBool::new(false),
        }
    }

    /// Where progress from every worker is delivered.
    pub fn notification_manager(&self) -> &Arc<ProgressNotificationManager> {
        self.notifications.manager()
    }

    /// The notification endpoint shared by all workers.
    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    /// The underlying supervisor.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Snapshot of running workers.
    pub async fn workers(&self) -> Vec<WorkerStatus> {
        self.supervisor.workers().await
    }

    /// Stop every worker, optionally waiting for them to exit.
    pub async fn shutdown(&self, wait: bool) {
        self.supervisor.stop_all(wait).await;
    }

    /// Stop every worker and refuse further acquisitions.
    ///
    /// Only the first call does anything; it returns `true`.
    pub async fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Disposing communication manager");
        self.supervisor.dispose().await;
        true
    }
}

#[async_trait]
impl CommunicationManager for RemoteCommunicationManager {
    async fn acquire(
        &self,
        key: &WorkerKey,
        system: &SystemId,
    ) -> Result<Option<SharedFacade>, BrokerError> {
        let facade = with_target_system(system.clone(), self.supervisor.acquire(key)).await?;
        let Some(facade) = facade else {
            return Ok(None);
        };

        let attached = self.notifications.attach(&facade).await?;
        debug!(key = %key, system = %system, progress = attached, "Facade acquired");
        Ok(Some(facade))
    }

    async fn release(&self, key: &WorkerKey, system: &SystemId) -> Result<(), BrokerError> {
        if self.supervisor.release(key).await {
            debug!(key = %key, system = %system, "Facade released");
        }
        Ok(())
    }

    async fn is_alive(&self, facade: &SharedFacade) -> bool {
        self.probe.is_alive(facade).await
    }

    async fn clear(&self) {
        self.supervisor.stop_all(true).await;
    }
}

/// Resolves inside the host process, one facade per key.
pub struct InProcessCommunicationManager {
    registry: SystemRegistry,
    notifications: NotificationChannel,
    facades: Mutex<HashMap<WorkerKey, SharedFacade>>,
}

impl InProcessCommunicationManager {
    /// Create a manager naming resolvers after `registry`.
    pub fn new(registry: SystemRegistry) -> Self {
        Self {
            registry,
            notifications: NotificationChannel::new(Arc::new(LocalExporter)),
            facades: Mutex::new(HashMap::new()),
        }
    }

    /// Where progress from every facade is delivered.
    pub fn notification_manager(&self) -> &Arc<ProgressNotificationManager> {
        self.notifications.manager()
    }
}

#[async_trait]
impl CommunicationManager for InProcessCommunicationManager {
    async fn acquire(
        &self,
        key: &WorkerKey,
        system: &SystemId,
    ) -> Result<Option<SharedFacade>, BrokerError> {
        let facade = {
            let mut facades = self.facades.lock().await;
            let facade = facades.entry(key.clone()).or_insert_with(|| {
                let params = self.registry.get(system);
                let resolver = DirectoryScanResolver::new(
                    params.map(|p| p.resolver_name().to_string()),
                    params.map(|p| p.task_manager_name().to_string()),
                );
                let facade: SharedFacade = Arc::new(InProcessFacade::new(Arc::new(resolver)));
                facade
            });
            Arc::clone(facade)
        };

        self.notifications.attach(&facade).await?;
        Ok(Some(facade))
    }

    async fn release(&self, key: &WorkerKey, _system: &SystemId) -> Result<(), BrokerError> {
        self.facades.lock().await.remove(key);
        Ok(())
    }

    async fn is_alive(&self, _facade: &SharedFacade) -> bool {
        false
    }

    async fn clear(&self) {
        self.facades.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{LaunchSpec, StaticSystem};
    use extsys_core::TaskId;
    use std::time::Duration;

    struct NoWorker;

    impl LaunchSpecBuilder for NoWorker {
        fn build(&self, _key: &WorkerKey) -> Result<Option<LaunchSpec>, BrokerError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_in_process_reuses_facade_per_key() {
        let manager = InProcessCommunicationManager::new(SystemRegistry::builtin());
        let key = WorkerKey::new("projA");
        let gradle = SystemId::new("gradle");

        let first = manager.acquire(&key, &gradle).await.unwrap().unwrap();
        let second = manager
            .acquire(&key, &SystemId::new("maven"))
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let resolver = first.get_resolver().await.unwrap();
        assert_eq!(resolver.name.as_deref(), Some("GradleProjectResolver"));
        assert_eq!(resolver.pid, std::process::id());

        assert!(!manager.is_alive(&first).await);

        manager.release(&key, &gradle).await.unwrap();
        let third = manager.acquire(&key, &gradle).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_in_process_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();

        let manager = InProcessCommunicationManager::new(
            SystemRegistry::new().with_system(StaticSystem::new("maven", "R", "T")),
        );
        let mut events = manager.notification_manager().subscribe();
        let key = WorkerKey::new(dir.path().display().to_string());

        let facade = manager
            .acquire(&key, &SystemId::new("maven"))
            .await
            .unwrap()
            .unwrap();
        let task_id = TaskId::generate();
        let model = facade
            .resolve_project(task_id.clone(), key.as_str(), false)
            .await
            .unwrap();
        assert_eq!(model.build_system.as_deref(), Some("maven"));

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.task_id(), &task_id);
    }

    #[tokio::test]
    async fn test_remote_without_worker_returns_none() {
        let manager = RemoteCommunicationManager::with_parts(
            Arc::new(NoWorker),
            Arc::new(LocalExporter),
            &BrokerConfig::default(),
        );

        let facade = manager
            .acquire(&WorkerKey::new("projA"), &SystemId::new("gradle"))
            .await
            .unwrap();
        assert!(facade.is_none());
        assert!(manager.notifications().exported().is_none());
    }

    #[tokio::test]
    async fn test_dispose_runs_once() {
        let manager = RemoteCommunicationManager::with_parts(
            Arc::new(NoWorker),
            Arc::new(LocalExporter),
            &BrokerConfig::default(),
        );

        assert!(manager.dispose().await);
        assert!(!manager.dispose().await);

        let err = manager
            .acquire(&WorkerKey::new("projA"), &SystemId::new("gradle"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Disposed));
    }
}
