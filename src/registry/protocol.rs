//! Wire messages exchanged with the control plane. Every request is one JSON
//! object tagged by `op`; every response is `{"ok": reply}` or
//! `{"error": fault}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::InstanceRecord;
use crate::error::{ErrorPayload, TaskError};
use crate::runtime::event::{ExecutionEvent, LogFields, LogLevel, Outcome};
use crate::runtime::state::ExecutionState;
use crate::runtime::task::TaskDescriptor;
use crate::wire::WirePayload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryRequest {
    UpsertTask {
        task: TaskDescriptor,
    },
    UpsertInstance {
        instance: InstanceRecord,
    },
    StartExecution {
        instance_id: String,
        session_id: String,
        client_id: String,
        args: WirePayload,
        force: bool,
    },
    /// Sent by the process that actually runs the body: `STARTING -> RUNNING`.
    BeginExecution {
        execution_id: String,
        client_id: String,
    },
    ForceStopExecution {
        execution_id: String,
        session_id: String,
        reason: String,
    },
    RequestStop {
        execution_id: String,
        session_id: String,
    },
    ReportProgress {
        execution_id: String,
        progress: f64,
        #[serde(default)]
        status: Option<String>,
    },
    ReportStatus {
        execution_id: String,
        status: String,
    },
    ReportLog {
        execution_id: String,
        level: LogLevel,
        message: String,
        #[serde(default)]
        fields: LogFields,
    },
    CompleteExecution {
        execution_id: String,
        result: WirePayload,
    },
    FailExecution {
        execution_id: String,
        error: ErrorPayload,
    },
    CheckStopRequested {
        execution_id: String,
    },
    GetActiveExecution {
        instance_id: String,
    },
    PollEvents {
        execution_id: String,
        cursor: usize,
    },
    CancelInstance {
        instance_id: String,
        session_id: String,
    },
}

impl RegistryRequest {
    pub fn op(&self) -> &'static str {
        match self {
            Self::UpsertTask { .. } => "upsert_task",
            Self::UpsertInstance { .. } => "upsert_instance",
            Self::StartExecution { .. } => "start_execution",
            Self::BeginExecution { .. } => "begin_execution",
            Self::ForceStopExecution { .. } => "force_stop_execution",
            Self::RequestStop { .. } => "request_stop",
            Self::ReportProgress { .. } => "report_progress",
            Self::ReportStatus { .. } => "report_status",
            Self::ReportLog { .. } => "report_log",
            Self::CompleteExecution { .. } => "complete_execution",
            Self::FailExecution { .. } => "fail_execution",
            Self::CheckStopRequested { .. } => "check_stop_requested",
            Self::GetActiveExecution { .. } => "get_active_execution",
            Self::PollEvents { .. } => "poll_events",
            Self::CancelInstance { .. } => "cancel_instance",
        }
    }

    /// `(instance_id, session_id)` for requests whose instance must belong to
    /// the caller's session.
    pub fn ownership(&self) -> Option<(&str, &str)> {
        match self {
            Self::UpsertInstance { instance } => {
                Some((instance.instance_id.as_str(), instance.session_id.as_str()))
            }
            Self::StartExecution {
                instance_id,
                session_id,
                ..
            }
            | Self::CancelInstance {
                instance_id,
                session_id,
            } => Some((instance_id.as_str(), session_id.as_str())),
            _ => None,
        }
    }

    /// Progress, status and log reports; safe to drop when the registry is
    /// unreachable.
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            Self::ReportProgress { .. } | Self::ReportStatus { .. } | Self::ReportLog { .. }
        )
    }
}

/// Execution as the registry stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub instance_id: String,
    pub session_id: String,
    pub client_id: String,
    pub task_name: String,
    pub version: String,
    pub state: ExecutionState,
    pub args: WirePayload,
    pub progress: f64,
    #[serde(default)]
    pub status: Option<String>,
    pub stop_requested: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum RegistryReply {
    Ack,
    TaskUpserted {
        created: bool,
        version: String,
    },
    InstanceUpserted {
        instance: InstanceRecord,
    },
    ExecutionStarted {
        execution_id: String,
    },
    StopRequested {
        requested: bool,
    },
    ActiveExecution {
        execution: Option<ExecutionRecord>,
    },
    Events {
        events: Vec<ExecutionEvent>,
        cursor: usize,
        finished: bool,
    },
}

impl RegistryReply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::TaskUpserted { .. } => "task_upserted",
            Self::InstanceUpserted { .. } => "instance_upserted",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::StopRequested { .. } => "stop_requested",
            Self::ActiveExecution { .. } => "active_execution",
            Self::Events { .. } => "events",
        }
    }
}

/// Error reported by the registry for a request it understood but refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RegistryFault {
    SessionOwnership {
        session_id: String,
        instance_id: String,
    },
    ExecutionConflict {
        instance_id: String,
        active_execution_id: String,
    },
    UnknownTask {
        name: String,
    },
    UnknownInstance {
        instance_id: String,
    },
    UnknownExecution {
        execution_id: String,
    },
    Rejected {
        message: String,
    },
}

impl From<TaskError> for RegistryFault {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::SessionOwnership {
                session_id,
                instance_id,
            } => Self::SessionOwnership {
                session_id,
                instance_id,
            },
            TaskError::ExecutionConflict {
                instance_id,
                active_execution_id,
            } => Self::ExecutionConflict {
                instance_id,
                active_execution_id,
            },
            TaskError::UnknownTask(name) => Self::UnknownTask { name },
            TaskError::UnknownInstance(instance_id) => Self::UnknownInstance { instance_id },
            TaskError::UnknownExecution(execution_id) => Self::UnknownExecution { execution_id },
            other => Self::Rejected {
                message: other.to_string(),
            },
        }
    }
}

impl From<RegistryFault> for TaskError {
    fn from(fault: RegistryFault) -> Self {
        match fault {
            RegistryFault::SessionOwnership {
                session_id,
                instance_id,
            } => Self::SessionOwnership {
                session_id,
                instance_id,
            },
            RegistryFault::ExecutionConflict {
                instance_id,
                active_execution_id,
            } => Self::ExecutionConflict {
                instance_id,
                active_execution_id,
            },
            RegistryFault::UnknownTask { name } => Self::UnknownTask(name),
            RegistryFault::UnknownInstance { instance_id } => Self::UnknownInstance(instance_id),
            RegistryFault::UnknownExecution { execution_id } => {
                Self::UnknownExecution(execution_id)
            }
            RegistryFault::Rejected { message } => {
                Self::Transport(format!("registry rejected request: {message}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryResponse {
    Ok(RegistryReply),
    Error(RegistryFault),
}
