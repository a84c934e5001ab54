use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;
use crate::runtime::state::ExecutionState;
use crate::wire::WirePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

pub type LogFields = BTreeMap<String, Value>;

/// Structured log line emitted by a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub execution_id: String,
    pub instance_id: String,
    pub task_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: LogFields,
    pub timestamp: DateTime<Utc>,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed { result: WirePayload },
    Failed { error: ErrorPayload },
    Cancelled {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Outcome {
    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Completed { .. } => ExecutionState::Completed,
            Self::Failed { .. } => ExecutionState::Failed,
            Self::Cancelled { .. } => ExecutionState::Cancelled,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: Some(reason.into()),
        }
    }
}

/// One entry on an execution's update stream. The stream is finite and its
/// last entry is always `Terminal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The execution left `STARTING` and its body is running.
    Started,
    Progress {
        progress: f64,
        #[serde(default)]
        status: Option<String>,
    },
    Status {
        status: String,
    },
    Log(LogRecord),
    StopRequested {
        #[serde(default)]
        reason: Option<String>,
    },
    Terminal(Outcome),
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress { .. } => "progress",
            Self::Status { .. } => "status",
            Self::Log(_) => "log",
            Self::StopRequested { .. } => "stop_requested",
            Self::Terminal(_) => "terminal",
        }
    }
}

/// Clamps a progress report into `[0, 100]`; NaN counts as zero.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
