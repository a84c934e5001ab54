use std::any::Any;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = TaskError> = std::result::Result<T, E>;

/// Terminal error details as they travel through futures and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error class name, e.g. `ParseIntError` or `ExecutionConflict`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("no active session; enter a session before creating task instances")]
    NoSession,

    #[error("session {session_id} is already active")]
    SessionReentry { session_id: String },

    #[error("instance {instance_id} is not owned by session {session_id}")]
    SessionOwnership {
        session_id: String,
        instance_id: String,
    },

    #[error("instance {instance_id} already has an active execution {active_execution_id}")]
    ExecutionConflict {
        instance_id: String,
        active_execution_id: String,
    },

    #[error("task {task_name} already runs {limit} parallel executions")]
    MaxInstancesReached { task_name: String, limit: usize },

    #[error(
        "task {task_name} has max_parallel={max_parallel}; start it with instance().start() instead"
    )]
    DirectCallNotSupported {
        task_name: String,
        max_parallel: usize,
    },

    #[error("execution {execution_id} was cancelled")]
    TaskCancelled {
        execution_id: String,
        reason: Option<String>,
    },

    #[error("gave up waiting for execution {execution_id} after {waited:?}")]
    Timeout {
        execution_id: String,
        waited: Duration,
    },

    #[error("task raised {}: {}", .0.kind, .0.message)]
    TaskExecution(ErrorPayload),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown execution: {0}")]
    UnknownExecution(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("manifest error: {0}")]
    Manifest(String),
}

impl TaskError {
    /// Stable kind name used on the wire and in failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSession => "NoSession",
            Self::SessionReentry { .. } => "SessionReentry",
            Self::SessionOwnership { .. } => "SessionOwnership",
            Self::ExecutionConflict { .. } => "ExecutionConflict",
            Self::MaxInstancesReached { .. } => "MaxInstancesReached",
            Self::DirectCallNotSupported { .. } => "DirectCallNotSupported",
            Self::TaskCancelled { .. } => "TaskCancelled",
            Self::Timeout { .. } => "Timeout",
            Self::TaskExecution(_) => "TaskExecutionError",
            Self::Transport(_) => "TransportError",
            Self::UnknownTask(_) => "UnknownTask",
            Self::UnknownInstance(_) => "UnknownInstance",
            Self::UnknownExecution(_) => "UnknownExecution",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Serialization(_) => "SerializationError",
            Self::Manifest(_) => "ManifestError",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::TaskExecution(payload) => payload.clone(),
            other => ErrorPayload::new(other.kind(), other.to_string()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::TaskCancelled { .. })
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Cooperative cancellation signal a task body returns once it observed
/// `should_stop`.
///
/// ```
/// use numerous_tasks::{TaskCancelled, TaskFailure};
///
/// let failure: TaskFailure = TaskCancelled.into();
/// assert!(failure.is_cancelled());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("task cancelled")]
pub struct TaskCancelled;

/// How a task body ended when it did not return a value.
///
/// Any `std::error::Error` converts into a failure through `?`; the error's
/// type name becomes the failure kind and its source chain the traceback.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailure {
    Cancelled,
    Error(ErrorPayload),
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload::new(kind, message))
    }

    pub fn cancelled() -> Self {
        Self::Cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `anyhow::Error` is not a `std::error::Error`, so it gets its own
    /// conversion instead of `?`.
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        if error.downcast_ref::<TaskCancelled>().is_some() {
            return Self::Cancelled;
        }
        let mut payload = ErrorPayload::new("Error", error.to_string());
        let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
        if !chain.is_empty() {
            payload.traceback = Some(format_chain(&chain));
        }
        Self::Error(payload)
    }

    /// Converts the payload of a panicked worker into a failure.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = panic.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = panic.downcast_ref::<String>() {
            text.clone()
        } else {
            "task panicked".to_string()
        };
        Self::new("panic", message)
    }

    pub fn into_payload(self) -> ErrorPayload {
        match self {
            Self::Cancelled => ErrorPayload::new("TaskCancelled", "task cancelled"),
            Self::Error(payload) => payload,
        }
    }
}

impl<E> From<E> for TaskFailure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        let any: &dyn Any = &error;
        if any.is::<TaskCancelled>() {
            return Self::Cancelled;
        }
        if let Some(TaskError::TaskCancelled { .. }) = any.downcast_ref::<TaskError>() {
            return Self::Cancelled;
        }

        let mut payload = ErrorPayload::new(short_type_name::<E>(), error.to_string());
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        if !chain.is_empty() {
            payload.traceback = Some(format_chain(&chain));
        }
        Self::Error(payload)
    }
}

fn format_chain(chain: &[String]) -> String {
    chain
        .iter()
        .map(|cause| format!("caused by: {cause}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
