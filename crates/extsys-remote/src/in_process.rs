//! Same-process stand-in for a worker.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use extsys_core::{ComponentInfo, ProjectModel, TaskId};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::facade::{ExternalSystemFacade, FacadeKind};
use crate::progress::{ExportedEndpoint, NoopProgress, ProgressSink};
use crate::resolver::ProjectResolver;

/// Facade that runs its resolver inside the host process.
///
/// There is no separate worker behind it, so liveness probes always report
/// it as not alive.
pub struct InProcessFacade {
    resolver: Arc<dyn ProjectResolver>,
    endpoint: RwLock<Option<ExportedEndpoint>>,
    tasks: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl InProcessFacade {
    /// Create a stand-in around `resolver`.
    pub fn new(resolver: Arc<dyn ProjectResolver>) -> Self {
        Self {
            resolver,
            endpoint: RwLock::new(None),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn component(&self, name: Option<&str>) -> ComponentInfo {
        ComponentInfo {
            name: name.map(str::to_string),
            pid: std::process::id(),
        }
    }
}

impl fmt::Debug for InProcessFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessFacade")
            .field("resolver", &self.resolver.name())
            .finish()
    }
}

#[async_trait]
impl ExternalSystemFacade for InProcessFacade {
    async fn get_resolver(&self) -> Result<ComponentInfo, RpcError> {
        Ok(self.component(self.resolver.name()))
    }

    async fn get_task_manager(&self) -> Result<ComponentInfo, RpcError> {
        Ok(self.component(self.resolver.task_manager_name()))
    }

    async fn resolve_project(
        &self,
        task_id: TaskId,
        project_path: &str,
        preview: bool,
    ) -> Result<ProjectModel, RpcError> {
        let cancel = CancellationToken::new();
        self.tasks.lock().await.insert(task_id.clone(), cancel.clone());

        let endpoint = self.endpoint.read().await.clone();
        let sink: &dyn ProgressSink = match &endpoint {
            Some(endpoint) => endpoint,
            None => &NoopProgress,
        };

        let result = self
            .resolver
            .resolve_project(&task_id, Path::new(project_path), preview, sink, &cancel)
            .await;

        self.tasks.lock().await.remove(&task_id);
        result.map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<bool, RpcError> {
        match self.tasks.lock().await.get(task_id) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_progress_manager(&self, endpoint: ExportedEndpoint) -> Result<(), RpcError> {
        *self.endpoint.write().await = Some(endpoint);
        Ok(())
    }

    fn kind(&self) -> FacadeKind {
        FacadeKind::InProcess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use extsys_core::{EndpointId, ProgressEvent};

    use crate::progress::ProgressNotificationManager;
    use crate::resolver::DirectoryScanResolver;

    #[tokio::test]
    async fn test_progress_reaches_applied_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "").unwrap();

        let facade = InProcessFacade::new(Arc::new(DirectoryScanResolver::new(None, None)));
        let manager = Arc::new(ProgressNotificationManager::new());
        let mut events = manager.subscribe();
        facade
            .apply_progress_manager(ExportedEndpoint::new(EndpointId::new("ep"), manager))
            .await
            .unwrap();

        let model = facade
            .resolve_project(TaskId::new("t"), &dir.path().display().to_string(), false)
            .await
            .unwrap();
        assert_eq!(model.build_system.as_deref(), Some("maven"));
        assert!(matches!(events.recv().await.unwrap(), ProgressEvent::Started { .. }));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::create_dir(dir.path().join(format!("m{}", i))).unwrap();
        }
        let resolver = DirectoryScanResolver::new(None, None)
            .with_step_delay(Duration::from_millis(200));
        let facade = Arc::new(InProcessFacade::new(Arc::new(resolver)));

        let runner = Arc::clone(&facade);
        let path = dir.path().display().to_string();
        let handle = tokio::spawn(async move {
            runner.resolve_project(TaskId::new("slow"), &path, false).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(facade.cancel_task(&TaskId::new("slow")).await.unwrap());

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("cancelled")));
        assert!(!facade.cancel_task(&TaskId::new("slow")).await.unwrap());
    }
}
