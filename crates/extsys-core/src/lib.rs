//! extsys Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Process spawning
//! - The async runtime
//! - Transport specifics
//!
//! Both sides of the host/worker boundary share these types.

pub mod error;
pub mod event;
pub mod ids;
pub mod project;
pub mod protocol;

// Re-export commonly used types
pub use error::CoreError;
pub use event::ProgressEvent;
pub use ids::{EndpointId, RequestId, SystemId, TaskId, WorkerKey};
pub use project::{ComponentInfo, ModuleInfo, ProjectModel};
pub use protocol::{FacadeCall, HostMessage, WorkerMessage};
