//! Worker launch specs.
//!
//! A [`LaunchSpecBuilder`] turns a worker key into the command line used to
//! start a worker. The default builder reads the target system from the
//! call-scoped context and lets the system's [`SystemLaunchParams`] add
//! class path entries, resolver arguments and arbitrary tweaks.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use extsys_core::{SystemId, WorkerKey};
use tokio::process::Command;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::context::current_target_system;
use crate::error::BrokerError;

/// Flag telling the worker it has no UI.
pub const HEADLESS_OPTION: &str = "--headless";

/// Option carrying the worker's connection timeout in milliseconds.
pub const CONNECTION_TIMEOUT_OPTION: &str = "--connection-timeout-ms";

/// Option carrying the debug-attach port.
pub const DEBUG_PORT_OPTION: &str = "--debug-port";

/// Option carrying the joined class path.
pub const CLASS_PATH_OPTION: &str = "--class-path";

/// Everything needed to start one worker process.
///
/// The command line is
/// `program <runtime_options..> [--class-path <joined>] -- <entry_point> <args..>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run.
    pub program: PathBuf,

    /// Options understood by the worker runtime, before the entry point.
    pub runtime_options: Vec<String>,

    /// Extra library entries, joined with the platform path separator.
    pub class_path: Vec<PathBuf>,

    /// Entry point the worker starts.
    pub entry_point: String,

    /// Program arguments after the entry point.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Working directory of the worker.
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Create a spec with no options or arguments.
    pub fn new(
        program: impl Into<PathBuf>,
        entry_point: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            runtime_options: Vec::new(),
            class_path: Vec::new(),
            entry_point: entry_point.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Set a runtime option, replacing any earlier occurrence.
    ///
    /// `value` is passed as the following argument when present.
    pub fn set_option(&mut self, name: &str, value: Option<String>) {
        self.remove_option(name);
        self.runtime_options.push(name.to_string());
        if let Some(value) = value {
            self.runtime_options.push(value);
        }
    }

    /// Remove a runtime option and its value, if present.
    pub fn remove_option(&mut self, name: &str) {
        if let Some(pos) = self.runtime_options.iter().position(|o| o == name) {
            let takes_value = self
                .runtime_options
                .get(pos + 1)
                .is_some_and(|next| !next.starts_with("--"));
            let end = if takes_value { pos + 2 } else { pos + 1 };
            self.runtime_options.drain(pos..end);
        }
    }

    /// Value of a runtime option, or `Some("")` for a bare flag.
    pub fn option(&self, name: &str) -> Option<&str> {
        let pos = self.runtime_options.iter().position(|o| o == name)?;
        match self.runtime_options.get(pos + 1) {
            Some(next) if !next.starts_with("--") => Some(next.as_str()),
            _ => Some(""),
        }
    }

    /// Full argument vector, excluding the program itself.
    pub fn arguments(&self) -> Result<Vec<OsString>, BrokerError> {
        let mut args: Vec<OsString> = self.runtime_options.iter().map(OsString::from).collect();

        if !self.class_path.is_empty() {
            let joined = std::env::join_paths(&self.class_path)
                .map_err(|e| BrokerError::InvalidLaunchSpec(format!("bad class path entry: {}", e)))?;
            args.push(CLASS_PATH_OPTION.into());
            args.push(joined);
        }

        args.push("--".into());
        args.push(OsString::from(&self.entry_point));
        args.extend(self.args.iter().map(OsString::from));
        Ok(args)
    }

    /// Build the process command: piped stdio, killed when dropped.
    pub fn to_command(&self) -> Result<Command, BrokerError> {
        if self.program.as_os_str().is_empty() {
            return Err(BrokerError::InvalidLaunchSpec(
                "no worker executable configured".to_string(),
            ));
        }
        if self.entry_point.trim().is_empty() {
            return Err(BrokerError::InvalidLaunchSpec("empty entry point".to_string()));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(self.arguments()?)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}

/// Per-system launch parameters.
pub trait SystemLaunchParams: Send + Sync {
    /// The system these parameters belong to.
    fn system_id(&self) -> &SystemId;

    /// Resolver name passed as the first program argument.
    fn resolver_name(&self) -> &str;

    /// Task manager name passed as the second program argument.
    fn task_manager_name(&self) -> &str;

    /// Extra class path entries.
    fn class_path(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Whether this system runs in a separate worker at all.
    ///
    /// When `false` the builder produces no spec and acquisition yields no facade.
    fn runs_out_of_process(&self) -> bool {
        true
    }

    /// Last chance to adjust the spec.
    fn enhance_launch(&self, _spec: &mut LaunchSpec) {}
}

/// Launch parameters given as plain data.
#[derive(Debug, Clone)]
pub struct StaticSystem {
    id: SystemId,
    resolver: String,
    task_manager: String,
    class_path: Vec<PathBuf>,
    extra_args: Vec<String>,
    env: Vec<(String, String)>,
    out_of_process: bool,
}

impl StaticSystem {
    /// Create parameters for `id`.
    pub fn new(
        id: impl Into<SystemId>,
        resolver: impl Into<String>,
        task_manager: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resolver: resolver.into(),
            task_manager: task_manager.into(),
            class_path: Vec::new(),
            extra_args: Vec::new(),
            env: Vec::new(),
            out_of_process: true,
        }
    }

    /// Builder method to add a class path entry.
    pub fn with_class_path(mut self, entry: impl Into<PathBuf>) -> Self {
        self.class_path.push(entry.into());
        self
    }

    /// Builder method to add a program argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Builder method to add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builder method to keep this system in the host process.
    pub fn in_process_only(mut self) -> Self {
        self.out_of_process = false;
        self
    }
}

impl SystemLaunchParams for StaticSystem {
    fn system_id(&self) -> &SystemId {
        &self.id
    }

    fn resolver_name(&self) -> &str {
        &self.resolver
    }

    fn task_manager_name(&self) -> &str {
        &self.task_manager
    }

    fn class_path(&self) -> Vec<PathBuf> {
        self.class_path.clone()
    }

    fn runs_out_of_process(&self) -> bool {
        self.out_of_process
    }

    fn enhance_launch(&self, spec: &mut LaunchSpec) {
        spec.args.extend(self.extra_args.iter().cloned());
        spec.env.extend(self.env.iter().cloned());
    }
}

/// Launch parameters indexed by system.
#[derive(Default, Clone)]
pub struct SystemRegistry {
    systems: HashMap<SystemId, Arc<dyn SystemLaunchParams>>,
}

impl SystemRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the systems the bundled worker understands.
    pub fn builtin() -> Self {
        Self::new()
            .with_system(StaticSystem::new(
                "gradle",
                "GradleProjectResolver",
                "GradleTaskManager",
            ))
            .with_system(StaticSystem::new(
                "maven",
                "MavenProjectResolver",
                "MavenTaskManager",
            ))
    }

    /// Builder method to register a system.
    pub fn with_system(mut self, params: impl SystemLaunchParams + 'static) -> Self {
        self.register(Arc::new(params));
        self
    }

    /// Register (or replace) a system's parameters.
    pub fn register(&mut self, params: Arc<dyn SystemLaunchParams>) {
        self.systems.insert(params.system_id().clone(), params);
    }

    /// Look up a system.
    pub fn get(&self, id: &SystemId) -> Option<&Arc<dyn SystemLaunchParams>> {
        self.systems.get(id)
    }

    /// Registered system ids, sorted.
    pub fn system_ids(&self) -> Vec<SystemId> {
        let mut ids: Vec<_> = self.systems.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

/// Produces the launch spec for a worker key.
pub trait LaunchSpecBuilder: Send + Sync {
    /// Build the spec for `key`, or `None` if no worker should be spawned.
    fn build(&self, key: &WorkerKey) -> Result<Option<LaunchSpec>, BrokerError>;
}

/// Builder driven by [`BrokerConfig`] and a [`SystemRegistry`].
pub struct DefaultLaunchSpecBuilder {
    config: Arc<BrokerConfig>,
    registry: Arc<SystemRegistry>,
}

impl DefaultLaunchSpecBuilder {
    /// Create a builder.
    pub fn new(config: Arc<BrokerConfig>, registry: Arc<SystemRegistry>) -> Self {
        Self { config, registry }
    }
}

impl LaunchSpecBuilder for DefaultLaunchSpecBuilder {
    fn build(&self, key: &WorkerKey) -> Result<Option<LaunchSpec>, BrokerError> {
        if self.config.worker_program.as_os_str().is_empty() {
            return Err(BrokerError::InvalidLaunchSpec(
                "no worker executable configured".to_string(),
            ));
        }

        let working_dir = if key.as_path().is_dir() {
            key.as_path().to_path_buf()
        } else {
            self.config.fallback_working_dir.clone()
        };

        let mut spec = LaunchSpec::new(
            &self.config.worker_program,
            &self.config.entry_point,
            working_dir,
        );

        if let Some(system) = current_target_system() {
            match self.registry.get(&system) {
                Some(params) if !params.runs_out_of_process() => {
                    debug!(system = %system, key = %key, "System runs in process, no worker");
                    return Ok(None);
                }
                Some(params) => {
                    spec.class_path.extend(params.class_path());
                    spec.args.push(params.resolver_name().to_string());
                    spec.args.push(params.task_manager_name().to_string());
                    params.enhance_launch(&mut spec);
                }
                None => debug!(system = %system, "No launch parameters registered"),
            }
        }

        // Set last so no system can drop them.
        spec.set_option(HEADLESS_OPTION, None);
        spec.set_option(
            CONNECTION_TIMEOUT_OPTION,
            Some(self.config.connection_timeout.as_millis().to_string()),
        );
        if let Some(port) = self.config.debug_port {
            spec.set_option(DEBUG_PORT_OPTION, Some(port.to_string()));
        }

        Ok(Some(spec))
    }
}
