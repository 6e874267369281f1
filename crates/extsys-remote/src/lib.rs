//! Cross-process facade layer for extsys.
//!
//! The host talks to a worker process through an [`ExternalSystemFacade`].
//! A [`RemoteFacade`] forwards every call over a newline-delimited JSON
//! channel to a worker running [`serve`]; an [`InProcessFacade`] runs the
//! same [`ProjectResolver`] inside the host instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use extsys_remote::{ExternalSystemFacade, RemoteFacade};
//!
//! async fn ping(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout)
//!     -> Result<(), Box<dyn std::error::Error>>
//! {
//!     let facade = RemoteFacade::connect(stdout, stdin, Duration::from_secs(30)).await?;
//!     let resolver = facade.get_resolver().await?;
//!     println!("resolver {:?} in pid {}", resolver.name, resolver.pid);
//!     Ok(())
//! }
//! ```

mod error;
mod facade;
mod in_process;
mod peer;
mod progress;
mod remote;
mod resolver;
mod serve;

pub use error::{ResolveError, RpcError};
pub use facade::{innermost, ExternalSystemFacade, FacadeKind, SharedFacade, TracingFacade};
pub use in_process::InProcessFacade;
pub use peer::{RpcPeer, WorkerHandshake};
pub use progress::{ExportedEndpoint, NoopProgress, ProgressNotificationManager, ProgressSink};
pub use remote::RemoteFacade;
pub use resolver::{DirectoryScanResolver, ProjectResolver, BUILD_FILES};
pub use serve::{serve, ServeOptions};
