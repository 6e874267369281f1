//! Genuine cross-process facade stub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extsys_core::{ComponentInfo, FacadeCall, ProjectModel, TaskId};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::RpcError;
use crate::facade::{ExternalSystemFacade, FacadeKind};
use crate::peer::{RpcPeer, WorkerHandshake};
use crate::progress::ExportedEndpoint;

/// Facade whose calls execute inside a worker process.
#[derive(Debug)]
pub struct RemoteFacade {
    peer: Arc<RpcPeer>,
    handshake: WorkerHandshake,
}

impl RemoteFacade {
    /// Perform the handshake over a worker's stdout/stdin and wrap the peer.
    pub async fn connect<R, W>(reader: R, writer: W, timeout: Duration) -> Result<Self, RpcError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (peer, handshake) = RpcPeer::connect(reader, writer, timeout).await?;
        Ok(Self {
            peer: Arc::new(peer),
            handshake,
        })
    }

    /// Process id the worker reported at handshake.
    pub fn pid(&self) -> u32 {
        self.handshake.pid
    }

    /// The worker's `ready` announcement.
    pub fn handshake(&self) -> &WorkerHandshake {
        &self.handshake
    }

    /// Whether the worker's pipes are still open.
    pub fn is_connected(&self) -> bool {
        !self.peer.is_closed()
    }

    /// Ask the worker to exit. A worker that is already gone is not an error.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        match self.peer.call(FacadeCall::Shutdown).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_communication() => {
                debug!(pid = self.pid(), "Worker already gone at shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn invoke<T: DeserializeOwned>(&self, call: FacadeCall) -> Result<T, RpcError> {
        let value = self.peer.call(call).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ExternalSystemFacade for RemoteFacade {
    async fn get_resolver(&self) -> Result<ComponentInfo, RpcError> {
        self.invoke(FacadeCall::GetResolver).await
    }

    async fn get_task_manager(&self) -> Result<ComponentInfo, RpcError> {
        self.invoke(FacadeCall::GetTaskManager).await
    }

    async fn resolve_project(
        &self,
        task_id: TaskId,
        project_path: &str,
        preview: bool,
    ) -> Result<ProjectModel, RpcError> {
        self.invoke(FacadeCall::ResolveProject {
            task_id,
            project_path: project_path.to_string(),
            preview,
        })
        .await
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<bool, RpcError> {
        self.invoke(FacadeCall::CancelTask {
            task_id: task_id.clone(),
        })
        .await
    }

    async fn apply_progress_manager(&self, endpoint: ExportedEndpoint) -> Result<(), RpcError> {
        let endpoint_id = endpoint.id().clone();
        // Route first so events emitted right after the ack are not lost.
        self.peer.set_endpoint(endpoint).await;
        self.peer
            .call(FacadeCall::ApplyProgressManager { endpoint_id })
            .await?;
        Ok(())
    }

    fn kind(&self) -> FacadeKind {
        FacadeKind::Remote
    }
}
