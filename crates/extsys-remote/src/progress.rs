//! Progress notification plumbing.
//!
//! Workers stream [`ProgressEvent`]s back to the host. On the host side they
//! land in a [`ProgressNotificationManager`], reachable from workers only
//! once it has been exported as an [`ExportedEndpoint`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use extsys_core::{EndpointId, ProgressEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// Default number of buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: ProgressEvent);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Host-side fan-out point for progress events from every worker.
pub struct ProgressNotificationManager {
    tx: broadcast::Sender<ProgressEvent>,
    delivered: AtomicU64,
}

impl ProgressNotificationManager {
    /// Create a manager with the default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a manager buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            delivered: AtomicU64::new(0),
        }
    }

    /// Subscribe to events delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`. Lagging subscribers see `Err` items.
    pub fn stream(&self) -> BroadcastStream<ProgressEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Handle one event from a worker.
    pub fn on_event(&self, event: ProgressEvent) {
        trace!(task_id = %event.task_id(), "Progress event");
        self.delivered.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        self.tx.send(event).ok();
    }

    /// Total events delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl Default for ProgressNotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProgressNotificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressNotificationManager")
            .field("subscribers", &self.tx.receiver_count())
            .field("delivered", &self.delivered())
            .finish()
    }
}

impl ProgressSink for ProgressNotificationManager {
    fn emit(&self, event: ProgressEvent) {
        self.on_event(event);
    }
}

/// A [`ProgressNotificationManager`] made addressable by workers.
///
/// Cloning is cheap and every clone refers to the same endpoint.
#[derive(Clone)]
pub struct ExportedEndpoint {
    id: EndpointId,
    manager: Arc<ProgressNotificationManager>,
}

impl ExportedEndpoint {
    /// Wrap an exported manager under `id`.
    pub fn new(id: EndpointId, manager: Arc<ProgressNotificationManager>) -> Self {
        Self { id, manager }
    }

    /// The id workers address notifications to.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// The manager behind this endpoint.
    pub fn manager(&self) -> &Arc<ProgressNotificationManager> {
        &self.manager
    }

    /// Deliver an event to the manager.
    pub fn deliver(&self, event: ProgressEvent) {
        self.manager.on_event(event);
    }

    /// Whether two handles refer to the same export.
    pub fn same_as(&self, other: &ExportedEndpoint) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.manager, &other.manager)
    }
}

impl fmt::Debug for ExportedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedEndpoint").field("id", &self.id).finish()
    }
}

impl ProgressSink for ExportedEndpoint {
    fn emit(&self, event: ProgressEvent) {
        self.deliver(event);
    }
}
