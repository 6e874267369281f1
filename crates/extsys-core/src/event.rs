//! Progress notifications streamed from workers back to the host.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// A progress event emitted by a worker while it runs a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A task has started.
    Started {
        task_id: TaskId,
        description: String,
        timestamp_ms: i64,
    },

    /// Intermediate status for a running task.
    StatusUpdate {
        task_id: TaskId,
        message: String,
        /// Fraction complete in `0.0..=1.0`, when the worker can tell.
        #[serde(default)]
        progress: Option<f32>,
        timestamp_ms: i64,
    },

    /// Raw output text produced by the task.
    Output {
        task_id: TaskId,
        text: String,
        /// `true` for stdout-like text, `false` for stderr-like text.
        stdout: bool,
        timestamp_ms: i64,
    },

    /// A task has finished.
    Finished {
        task_id: TaskId,
        success: bool,
        timestamp_ms: i64,
    },
}

impl ProgressEvent {
    /// Create a Started event.
    pub fn started(task_id: TaskId, description: impl Into<String>) -> Self {
        Self::Started {
            task_id,
            description: description.into(),
            timestamp_ms: now_ms(),
        }
    }

    /// Create a StatusUpdate event.
    pub fn status_update(task_id: TaskId, message: impl Into<String>, progress: Option<f32>) -> Self {
        Self::StatusUpdate {
            task_id,
            message: message.into(),
            progress,
            timestamp_ms: now_ms(),
        }
    }

    /// Create an Output event.
    pub fn output(task_id: TaskId, text: impl Into<String>, stdout: bool) -> Self {
        Self::Output {
            task_id,
            text: text.into(),
            stdout,
            timestamp_ms: now_ms(),
        }
    }

    /// Create a Finished event.
    pub fn finished(task_id: TaskId, success: bool) -> Self {
        Self::Finished {
            task_id,
            success,
            timestamp_ms: now_ms(),
        }
    }

    /// The task this event belongs to.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Started { task_id, .. }
            | Self::StatusUpdate { task_id, .. }
            | Self::Output { task_id, .. }
            | Self::Finished { task_id, .. } => task_id,
        }
    }

    /// Whether this event ends its task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
