//! The facade contract shared by remote stubs, in-process stand-ins and wrappers.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use extsys_core::{ComponentInfo, ProjectModel, TaskId};
use tracing::debug;

use crate::error::RpcError;
use crate::progress::ExportedEndpoint;

/// What kind of object sits behind a facade reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeKind {
    /// A stub whose calls execute inside a worker process.
    Remote,
    /// A stand-in that executes inside the host process.
    InProcess,
    /// A transparent decorator around another facade.
    Wrapper,
}

/// Operations a worker exposes to the host.
///
/// Every method may cross a process boundary. A call on a dead worker
/// fails with [`RpcError::Communication`].
#[async_trait]
pub trait ExternalSystemFacade: Send + Sync + fmt::Debug {
    /// Describe the project resolver. Has no side effects.
    async fn get_resolver(&self) -> Result<ComponentInfo, RpcError>;

    /// Describe the task manager.
    async fn get_task_manager(&self) -> Result<ComponentInfo, RpcError>;

    /// Resolve the project rooted at `project_path`.
    ///
    /// Progress is reported to the endpoint applied through
    /// [`apply_progress_manager`](Self::apply_progress_manager), if any.
    async fn resolve_project(
        &self,
        task_id: TaskId,
        project_path: &str,
        preview: bool,
    ) -> Result<ProjectModel, RpcError>;

    /// Cancel a running task. Returns `false` if no such task is running.
    async fn cancel_task(&self, task_id: &TaskId) -> Result<bool, RpcError>;

    /// Route this facade's progress events to `endpoint`.
    async fn apply_progress_manager(&self, endpoint: ExportedEndpoint) -> Result<(), RpcError>;

    /// What kind of facade this is.
    fn kind(&self) -> FacadeKind;

    /// The wrapped facade, for decorators.
    fn delegate(&self) -> Option<SharedFacade> {
        None
    }
}

/// A shared facade reference, as handed out to callers.
pub type SharedFacade = Arc<dyn ExternalSystemFacade>;

/// Strip every decorator layer and return the innermost facade.
pub fn innermost(facade: &SharedFacade) -> SharedFacade {
    let mut current = Arc::clone(facade);
    while let Some(inner) = current.delegate() {
        current = inner;
    }
    current
}

/// Decorator that logs every call and its duration.
#[derive(Debug)]
pub struct TracingFacade {
    inner: SharedFacade,
    label: String,
}

impl TracingFacade {
    /// Wrap `inner`, tagging log lines with `label`.
    pub fn new(inner: SharedFacade, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
        }
    }

    fn record<T>(&self, method: &str, started: Instant, result: &Result<T, RpcError>) {
        debug!(
            label = %self.label,
            method = method,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Facade call"
        );
    }
}

#[async_trait]
impl ExternalSystemFacade for TracingFacade {
    async fn get_resolver(&self) -> Result<ComponentInfo, RpcError> {
        let started = Instant::now();
        let result = self.inner.get_resolver().await;
        self.record("get_resolver", started, &result);
        result
    }

    async fn get_task_manager(&self) -> Result<ComponentInfo, RpcError> {
        let started = Instant::now();
        let result = self.inner.get_task_manager().await;
        self.record("get_task_manager", started, &result);
        result
    }

    async fn resolve_project(
        &self,
        task_id: TaskId,
        project_path: &str,
        preview: bool,
    ) -> Result<ProjectModel, RpcError> {
        let started = Instant::now();
        let result = self.inner.resolve_project(task_id, project_path, preview).await;
        self.record("resolve_project", started, &result);
        result
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<bool, RpcError> {
        let started = Instant::now();
        let result = self.inner.cancel_task(task_id).await;
        self.record("cancel_task", started, &result);
        result
    }

    async fn apply_progress_manager(&self, endpoint: ExportedEndpoint) -> Result<(), RpcError> {
        let started = Instant::now();
        let result = self.inner.apply_progress_manager(endpoint).await;
        self.record("apply_progress_manager", started, &result);
        result
    }

    fn kind(&self) -> FacadeKind {
        FacadeKind::Wrapper
    }

    fn delegate(&self) -> Option<SharedFacade> {
        Some(Arc::clone(&self.inner))
    }
}
