//! extsys worker process
//!
//! Started by the broker with piped stdio. Publishes its facade on stdout,
//! serves calls until the host hangs up and logs to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use extsys_remote::{serve, DirectoryScanResolver, ServeOptions};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "extsys-worker")]
#[command(about = "Out-of-process project resolver for extsys", long_about = None)]
struct Args {
    /// Run without any interactive UI
    #[arg(long)]
    headless: bool,

    /// How long a write to the host may block, in milliseconds
    #[arg(long = "connection-timeout-ms", default_value_t = 3_600_000)]
    connection_timeout_ms: u64,

    /// Port for attaching a debugger. Also turns on debug logging.
    #[arg(long)]
    debug_port: Option<u16>,

    /// Extra library path entries
    #[arg(long = "class-path")]
    class_path: Option<std::ffi::OsString>,

    /// Entry point announced to the host
    entry_point: String,

    /// Resolver name, task manager name, then system-specific arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Stdout carries the protocol, so logs go to stderr.
    let default_level = if args.debug_port.is_some() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let class_path: Vec<PathBuf> = args
        .class_path
        .as_deref()
        .map(|joined| std::env::split_paths(joined).collect())
        .unwrap_or_default();

    info!(
        entry_point = %args.entry_point,
        headless = args.headless,
        pid = std::process::id(),
        "Starting extsys worker"
    );
    if let Some(port) = args.debug_port {
        info!(port = port, "Debug port requested");
    }
    debug!(class_path = ?class_path, args = ?args.args, "Worker arguments");

    let mut rest = args.args.into_iter();
    let resolver = Arc::new(DirectoryScanResolver::new(rest.next(), rest.next()));

    let options = ServeOptions {
        entry_point: args.entry_point,
        connection_timeout: Duration::from_millis(args.connection_timeout_ms),
    };

    serve(resolver, tokio::io::stdin(), tokio::io::stdout(), options).await?;

    info!("Worker exiting");
    Ok(())
}
