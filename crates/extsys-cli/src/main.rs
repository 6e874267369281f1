//! extsys CLI
//!
//! Resolves a project directory in a dedicated worker process, printing the
//! worker's progress as it arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use extsys_broker::{
    install_shutdown_hook, BrokerConfig, CommunicationManager, RemoteCommunicationManager,
    SystemLaunchParams, SystemRegistry,
};
use extsys_core::{ProgressEvent, ProjectModel, SystemId, TaskId, WorkerKey};
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "extsys")]
#[command(about = "Resolve projects in out-of-process workers", long_about = None)]
struct Cli {
    /// Worker executable
    #[arg(long, env = "EXTSYS_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    /// Seconds a worker may take to come up
    #[arg(long, env = "EXTSYS_CONNECTION_TIMEOUT_SECS")]
    connection_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a project and print its modules
    Resolve {
        /// Project directory
        path: PathBuf,

        /// External system to resolve with
        #[arg(short, long, default_value = "gradle")]
        system: String,

        /// Only detect the build system, skip module discovery
        #[arg(long)]
        preview: bool,

        /// Print the project model as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a worker for a project and check that it answers
    Probe {
        /// Project directory
        path: PathBuf,

        /// External system to probe with
        #[arg(short, long, default_value = "gradle")]
        system: String,
    },

    /// List the known external systems
    Systems,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = BrokerConfig::from_env();
    if let Some(bin) = cli.worker_bin {
        config = config.with_worker_program(bin);
    }
    if let Some(secs) = cli.connection_timeout_secs {
        config = config.with_connection_timeout(Duration::from_secs(secs));
    }
    let registry = SystemRegistry::builtin();

    match cli.command {
        Commands::Resolve {
            path,
            system,
            preview,
            json,
        } => {
            resolve(config, registry, path, SystemId::new(system), preview, json).await?;
        }
        Commands::Probe { path, system } => {
            probe(config, registry, path, SystemId::new(system)).await?;
        }
        Commands::Systems => {
            list_systems(&registry);
        }
    }

    Ok(())
}

async fn resolve(
    config: BrokerConfig,
    registry: SystemRegistry,
    path: PathBuf,
    system: SystemId,
    preview: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = path.canonicalize()?;
    let key = WorkerKey::try_new(path.display().to_string())?;

    let manager = Arc::new(RemoteCommunicationManager::new(config, registry));
    let hook = install_shutdown_hook(Arc::clone(&manager));

    let Some(facade) = manager.acquire(&key, &system).await? else {
        println!("System '{}' does not run in a worker", system);
        return Ok(());
    };

    let task_id = TaskId::generate();
    let printer = {
        let mut events = manager.notification_manager().stream();
        let task_id = task_id.clone();
        let quiet = json;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Progress stream lagged");
                        continue;
                    }
                };
                if event.task_id() != &task_id {
                    continue;
                }
                if !quiet {
                    print_event(&event);
                }
                if event.is_terminal() {
                    break;
                }
            }
        })
    };

    let result = facade
        .resolve_project(task_id, key.as_str(), preview)
        .await;

    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Progress printer did not see the final event");
    }

    manager.release(&key, &system).await?;
    manager.shutdown(true).await;
    hook.abort();

    let model = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&model)?);
    } else {
        print_model(&model);
    }

    Ok(())
}

async fn probe(
    config: BrokerConfig,
    registry: SystemRegistry,
    path: PathBuf,
    system: SystemId,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = path.canonicalize()?;
    let key = WorkerKey::try_new(path.display().to_string())?;

    let manager = Arc::new(RemoteCommunicationManager::new(config, registry));
    let hook = install_shutdown_hook(Arc::clone(&manager));

    let Some(facade) = manager.acquire(&key, &system).await? else {
        println!("System '{}' does not run in a worker", system);
        return Ok(());
    };

    let alive = manager.is_alive(&facade).await;
    let workers = manager.workers().await;

    println!("Worker for {}:", key);
    println!("  Alive:      {}", if alive { "yes" } else { "no" });
    for worker in &workers {
        let pid = worker
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  PID:        {}", pid);
        println!(
            "  Started:    {}",
            worker.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    if alive {
        let resolver = facade.get_resolver().await?;
        let task_manager = facade.get_task_manager().await?;
        println!("  Resolver:   {}", resolver.name.as_deref().unwrap_or("-"));
        println!("  Tasks:      {}", task_manager.name.as_deref().unwrap_or("-"));
    }

    manager.release(&key, &system).await?;
    manager.shutdown(true).await;
    hook.abort();

    Ok(())
}

fn list_systems(registry: &SystemRegistry) {
    println!("{:<12}  {:<28}  {}", "SYSTEM", "RESOLVER", "TASK MANAGER");
    println!("{}", "-".repeat(70));

    for id in registry.system_ids() {
        if let Some(params) = registry.get(&id) {
            println!(
                "{:<12}  {:<28}  {}",
                id,
                params.resolver_name(),
                params.task_manager_name()
            );
        }
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Started {
            description,
            timestamp_ms,
            ..
        } => {
            println!("[{}] started   {}", format_timestamp(*timestamp_ms), description);
        }
        ProgressEvent::StatusUpdate {
            message,
            progress,
            timestamp_ms,
            ..
        } => match progress {
            Some(p) => println!(
                "[{}] status    {} ({:.0}%)",
                format_timestamp(*timestamp_ms),
                message,
                p * 100.0
            ),
            None => println!("[{}] status    {}", format_timestamp(*timestamp_ms), message),
        },
        ProgressEvent::Output {
            text,
            stdout,
            timestamp_ms,
            ..
        } => {
            let stream = if *stdout { "out" } else { "err" };
            println!(
                "[{}] {}       {}",
                format_timestamp(*timestamp_ms),
                stream,
                text.trim_end()
            );
        }
        ProgressEvent::Finished {
            success,
            timestamp_ms,
            ..
        } => {
            let outcome = if *success { "success" } else { "failure" };
            println!("[{}] finished  {}", format_timestamp(*timestamp_ms), outcome);
        }
    }
}

fn print_model(model: &ProjectModel) {
    println!("Project:      {}", model.root);
    println!(
        "Build system: {}",
        model.build_system.as_deref().unwrap_or("unknown")
    );
    if model.preview {
        println!("(preview, modules not scanned)");
        return;
    }

    println!("Modules ({}):", model.modules.len());
    println!("{:<24}  {:<32}  {}", "NAME", "PATH", "BUILD FILE");
    println!("{}", "-".repeat(76));
    for module in &model.modules {
        println!("{:<24}  {:<32}  {}", module.name, module.path, module.build_file);
    }
}

fn format_timestamp(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M:%S%.3f").to_string(),
        _ => ms.to_string(),
    }
}
