//! Worker-side project resolution.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use extsys_core::{ModuleInfo, ProgressEvent, ProjectModel, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ResolveError;
use crate::progress::ProgressSink;

/// Build files that mark a directory as a module, with the system they imply.
pub const BUILD_FILES: &[(&str, &str)] = &[
    ("build.gradle", "gradle"),
    ("build.gradle.kts", "gradle"),
    ("pom.xml", "maven"),
    ("Cargo.toml", "cargo"),
    ("package.json", "npm"),
];

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &["build", "target", "node_modules", "out"];

/// The computation a worker performs on the host's behalf.
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    /// Resolver name reported by `get_resolver`.
    fn name(&self) -> Option<&str>;

    /// Task manager name reported by `get_task_manager`.
    fn task_manager_name(&self) -> Option<&str>;

    /// Resolve the project at `project_path`, reporting progress to `progress`.
    ///
    /// Implementations should check `cancel` regularly and return
    /// [`ResolveError::Cancelled`] once it fires.
    async fn resolve_project(
        &self,
        task_id: &TaskId,
        project_path: &Path,
        preview: bool,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ProjectModel, ResolveError>;
}

/// Resolver that walks a directory tree looking for build files.
#[derive(Debug, Clone)]
pub struct DirectoryScanResolver {
    resolver: Option<String>,
    task_manager: Option<String>,
    max_depth: usize,
    step_delay: Option<Duration>,
}

impl DirectoryScanResolver {
    /// Create a resolver reporting the given component names.
    pub fn new(resolver: Option<String>, task_manager: Option<String>) -> Self {
        Self {
            resolver,
            task_manager,
            max_depth: 4,
            step_delay: None,
        }
    }

    /// Limit how deep below the root modules are searched.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Pause between directories.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    async fn scan(
        &self,
        task_id: &TaskId,
        root: &Path,
        preview: bool,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ProjectModel, ResolveError> {
        let metadata = match tokio::fs::metadata(root).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(root.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_dir() {
            return Err(ResolveError::NotADirectory(root.display().to_string()));
        }

        let mut model = ProjectModel::new(root.display().to_string());
        model.build_system = detect_build_file(root).await?.map(|(_, system)| system.to_string());
        model.preview = preview;
        if preview {
            return Ok(model);
        }

        let mut queue: VecDeque<(PathBuf, usize)> = VecDeque::from([(root.to_path_buf(), 0)]);
        while let Some((dir, depth)) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            if let Some(delay) = self.step_delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                }
            }

            if let Some((build_file, _)) = detect_build_file(&dir).await? {
                let relative = dir.strip_prefix(root).unwrap_or(dir.as_path());
                let path = if relative.as_os_str().is_empty() {
                    ".".to_string()
                } else {
                    relative.display().to_string()
                };
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());

                progress.emit(ProgressEvent::status_update(
                    task_id.clone(),
                    format!("Found module {}", name),
                    None,
                ));
                progress.emit(ProgressEvent::output(
                    task_id.clone(),
                    format!("{} ({})", path, build_file),
                    true,
                ));
                model.modules.push(ModuleInfo {
                    name,
                    path,
                    build_file: build_file.to_string(),
                });
            }

            if depth >= self.max_depth {
                continue;
            }

            let mut children = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                    continue;
                }
                children.push(entry.path());
            }
            children.sort();
            queue.extend(children.into_iter().map(|p| (p, depth + 1)));
        }

        model.modules.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(root = %root.display(), modules = model.modules.len(), "Scan complete");
        Ok(model)
    }
}

#[async_trait]
impl ProjectResolver for DirectoryScanResolver {
    fn name(&self) -> Option<&str> {
        self.resolver.as_deref()
    }

    fn task_manager_name(&self) -> Option<&str> {
        self.task_manager.as_deref()
    }

    async fn resolve_project(
        &self,
        task_id: &TaskId,
        project_path: &Path,
        preview: bool,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ProjectModel, ResolveError> {
        progress.emit(ProgressEvent::started(
            task_id.clone(),
            format!("Resolving {}", project_path.display()),
        ));
        let result = self.scan(task_id, project_path, preview, progress, cancel).await;
        progress.emit(ProgressEvent::finished(task_id.clone(), result.is_ok()));
        result
    }
}

async fn detect_build_file(dir: &Path) -> Result<Option<(&'static str, &'static str)>, ResolveError> {
    for &(file, system) in BUILD_FILES {
        if tokio::fs::try_exists(dir.join(file)).await? {
            return Ok(Some((file, system)));
        }
    }
    Ok(None)
}
