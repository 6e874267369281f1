//! Project model types produced by resolvers.

use serde::{Deserialize, Serialize};

/// Describes a component running inside a worker (resolver or task manager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Component name as passed on the worker command line.
    pub name: Option<String>,

    /// Process id of the worker hosting the component.
    pub pid: u32,
}

/// A module discovered inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Module name (directory name).
    pub name: String,

    /// Path of the module directory, relative to the project root.
    pub path: String,

    /// Build file that marks the directory as a module.
    pub build_file: String,
}

/// The resolved structure of an external project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectModel {
    /// Absolute project root.
    pub root: String,

    /// Build system detected at the root, if any.
    pub build_system: Option<String>,

    /// Modules discovered under the root, sorted by path.
    pub modules: Vec<ModuleInfo>,

    /// Whether only the root was inspected.
    #[serde(default)]
    pub preview: bool,
}

impl ProjectModel {
    /// Create an empty model for a root directory.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            build_system: None,
            modules: Vec::new(),
            preview: false,
        }
    }

    /// Builder method to add a module.
    pub fn with_module(mut self, module: ModuleInfo) -> Self {
        self.modules.push(module);
        self
    }
}
