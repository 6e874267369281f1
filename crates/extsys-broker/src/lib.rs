//! Worker process supervision and facade acquisition.
//!
//! The host never runs expensive project resolution itself. It asks a
//! [`RemoteCommunicationManager`] for a facade keyed by project; the manager
//! spawns (or reuses) one worker process per key, waits for the worker to
//! publish its facade, wires the shared progress endpoint into it and hands
//! it back.
//!
//! # Example
//!
//! ```rust,no_run
//! use extsys_broker::{BrokerConfig, CommunicationManager, RemoteCommunicationManager, SystemRegistry};
//! use extsys_core::{SystemId, TaskId, WorkerKey};
//!
//! async fn resolve() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = RemoteCommunicationManager::new(BrokerConfig::from_env(), SystemRegistry::builtin());
//!     let key = WorkerKey::new("/work/projA");
//!     let system = SystemId::new("gradle");
//!
//!     if let Some(facade) = manager.acquire(&key, &system).await? {
//!         let model = facade.resolve_project(TaskId::generate(), key.as_str(), false).await?;
//!         println!("{} modules", model.modules.len());
//!     }
//!     manager.release(&key, &system).await?;
//!     manager.shutdown(true).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod launch;
pub mod liveness;
pub mod manager;
pub mod notification;
pub mod process;
pub mod shutdown;
pub mod supervisor;

// Re-export commonly used types
pub use config::BrokerConfig;
pub use error::{BrokerError, ExportError};
pub use launch::{
    DefaultLaunchSpecBuilder, LaunchSpec, LaunchSpecBuilder, StaticSystem, SystemLaunchParams,
    SystemRegistry,
};
pub use liveness::LivenessProbe;
pub use manager::{CommunicationManager, InProcessCommunicationManager, RemoteCommunicationManager};
pub use notification::{EndpointExporter, LocalExporter, NotificationChannel};
pub use process::{WorkerExit, WorkerProcess, WorkerStatus};
pub use shutdown::install_shutdown_hook;
pub use supervisor::ProcessSupervisor;
