//! The host's progress notification endpoint.
//!
//! One [`ProgressNotificationManager`] collects progress from every worker.
//! It is exported at most once, on first need, and the exported endpoint is
//! applied to each facade as it is handed out. A failed export is logged and
//! retried on the next acquisition; it never fails the acquisition itself.

use std::sync::Arc;

use async_trait::async_trait;
use extsys_core::EndpointId;
use extsys_remote::{ExportedEndpoint, ProgressNotificationManager, RpcError, SharedFacade};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::ExportError;

/// Makes a notification manager addressable by workers.
#[async_trait]
pub trait EndpointExporter: Send + Sync {
    async fn export(
        &self,
        manager: Arc<ProgressNotificationManager>,
    ) -> Result<ExportedEndpoint, ExportError>;
}

/// Exports under a fresh random id. Workers address notifications by that id
/// over their own channel, so there is nothing else to publish.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExporter;

#[async_trait]
impl EndpointExporter for LocalExporter {
    async fn export(
        &self,
        manager: Arc<ProgressNotificationManager>,
    ) -> Result<ExportedEndpoint, ExportError> {
        Ok(ExportedEndpoint::new(EndpointId::generate(), manager))
    }
}

/// Lazily exported progress endpoint shared by all workers.
pub struct NotificationChannel {
    manager: Arc<ProgressNotificationManager>,
    exporter: Arc<dyn EndpointExporter>,
    exported: OnceCell<ExportedEndpoint>,
}

impl NotificationChannel {
    /// Create a channel around a fresh manager.
    pub fn new(exporter: Arc<dyn EndpointExporter>) -> Self {
        Self::with_manager(exporter, Arc::new(ProgressNotificationManager::new()))
    }

    /// Create a channel around an existing manager.
    pub fn with_manager(
        exporter: Arc<dyn EndpointExporter>,
        manager: Arc<ProgressNotificationManager>,
    ) -> Self {
        Self {
            manager,
            exporter,
            exported: OnceCell::new(),
        }
    }

    /// The manager events are delivered to.
    pub fn manager(&self) -> &Arc<ProgressNotificationManager> {
        &self.manager
    }

    /// The exported endpoint, if an export has succeeded.
    pub fn exported(&self) -> Option<&ExportedEndpoint> {
        self.exported.get()
    }

    /// Export the manager unless already exported.
    ///
    /// Concurrent callers share one export attempt. A failed attempt leaves
    /// the channel unexported so the next call tries again.
    pub async fn ensure_exported(&self) -> Result<&ExportedEndpoint, ExportError> {
        self.exported
            .get_or_try_init(|| async {
                let endpoint = self.exporter.export(Arc::clone(&self.manager)).await?;
                debug!(endpoint_id = %endpoint.id(), "Exported progress manager");
                Ok::<_, ExportError>(endpoint)
            })
            .await
    }

    /// Apply the exported endpoint to `facade`.
    ///
    /// Returns `Ok(false)` if the endpoint could not be exported; the facade
    /// is then usable but reports no progress. A failure applying an
    /// exported endpoint is returned.
    pub async fn attach(&self, facade: &SharedFacade) -> Result<bool, RpcError> {
        let endpoint = match self.ensure_exported().await {
            Ok(endpoint) => endpoint.clone(),
            Err(e) => {
                warn!(error = %e, "Can't export progress manager");
                return Ok(false);
            }
        };
        facade.apply_progress_manager(endpoint).await?;
        Ok(true)
    }
}
