//! Wire messages exchanged between the host and a worker.
//!
//! The transport is newline-delimited JSON: the host writes [`HostMessage`]s
//! to the worker's stdin and reads [`WorkerMessage`]s from its stdout. The
//! first protocol line a worker writes is always [`WorkerMessage::Ready`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::event::ProgressEvent;
use crate::ids::{EndpointId, RequestId, TaskId};

/// Message written by the host to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Invoke a facade method inside the worker.
    Request { id: RequestId, call: FacadeCall },
}

/// A facade method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FacadeCall {
    /// Describe the project resolver. Side-effect free; used as the liveness ping.
    GetResolver,

    /// Describe the task manager.
    GetTaskManager,

    /// Start forwarding progress events to the given host endpoint.
    ApplyProgressManager { endpoint_id: EndpointId },

    /// Resolve the project rooted at `project_path`.
    ResolveProject {
        task_id: TaskId,
        project_path: String,
        #[serde(default)]
        preview: bool,
    },

    /// Cancel a running task. Answers `true` if the task was found.
    CancelTask { task_id: TaskId },

    /// Ask the worker to exit after answering.
    Shutdown,
}

impl FacadeCall {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetResolver => "get_resolver",
            Self::GetTaskManager => "get_task_manager",
            Self::ApplyProgressManager { .. } => "apply_progress_manager",
            Self::ResolveProject { .. } => "resolve_project",
            Self::CancelTask { .. } => "cancel_task",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Message written by a worker to its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker's facade is reachable.
    Ready {
        pid: u32,
        entry_point: String,
        #[serde(default)]
        resolver: Option<String>,
        #[serde(default)]
        task_manager: Option<String>,
    },

    /// Successful answer to a request.
    Response { id: RequestId, result: Value },

    /// Failed answer to a request. The worker itself is still healthy.
    Error { id: RequestId, message: String },

    /// A progress event addressed to an exported host endpoint.
    Notification {
        endpoint_id: EndpointId,
        event: ProgressEvent,
    },
}

impl WorkerMessage {
    /// Message type name, for logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "Ready",
            Self::Response { .. } => "Response",
            Self::Error { .. } => "Error",
            Self::Notification { .. } => "Notification",
        }
    }
}

/// Encode a message as a single protocol line (without the trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let msg = HostMessage::Request {
            id: RequestId::new("req-1"),
            call: FacadeCall::ResolveProject {
                task_id: TaskId::new("t-1"),
                project_path: "/work/projA".to_string(),
                preview: false,
            },
        };

        let json = encode_line(&msg).unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""method":"resolve_project""#));
        assert!(json.contains("req-1"));
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_unit_call_serialization() {
        let value = serde_json::to_value(FacadeCall::GetResolver).unwrap();
        assert_eq!(value, json!({ "method": "get_resolver" }));
    }

    #[test]
    fn test_ready_parses_without_optional_fields() {
        let raw = r#"{"type":"ready","pid":42,"entry_point":"extsys.worker"}"#;
        let msg: WorkerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            WorkerMessage::Ready {
                pid,
                resolver,
                task_manager,
                ..
            } => {
                assert_eq!(pid, 42);
                assert!(resolver.is_none());
                assert!(task_manager.is_none());
            }
            other => panic!("Expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_parses() {
        let raw = r#"{"type":"notification","endpoint_id":"ep","event":{"kind":"finished","task_id":"t","success":true,"timestamp_ms":5}}"#;
        let msg: WorkerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type(), "Notification");
    }
}
