use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Starting,
    Running,
    Completed,
    Failed,
    #[serde(rename = "CANCELED")]
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a task instance:
/// `PENDING -> READY -> RUNNING -> {COMPLETED, FAILED, CANCELED}`.
///
/// A terminal instance may be started again, which moves it back to
/// `RUNNING` under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    #[serde(rename = "CANCELED")]
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<ExecutionState> for InstanceState {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Starting | ExecutionState::Running => Self::Running,
            ExecutionState::Completed => Self::Completed,
            ExecutionState::Failed => Self::Failed,
            ExecutionState::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELED",
        };
        f.write_str(name)
    }
}
