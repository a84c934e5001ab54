use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::{Backend, EventStream};
use crate::error::{Result, TaskError};
use crate::runtime::event::{ExecutionEvent, LogRecord, Outcome, clamp_progress};
use crate::runtime::state::InstanceState;
use crate::runtime::task::InstanceShared;

/// Caller-side view of an execution. Only ever moves forward:
/// `PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FutureStatus {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(rename = "CANCELED")]
    Cancelled,
}

impl FutureStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for FutureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELED",
        };
        f.write_str(text)
    }
}

impl From<FutureStatus> for InstanceState {
    fn from(status: FutureStatus) -> Self {
        match status {
            FutureStatus::Pending | FutureStatus::Running => InstanceState::Running,
            FutureStatus::Completed => InstanceState::Completed,
            FutureStatus::Failed => InstanceState::Failed,
            FutureStatus::Cancelled => InstanceState::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    status: FutureStatus,
    progress: f64,
    status_message: Option<String>,
    result: Option<Value>,
    error: Option<TaskError>,
    stop_requested: bool,
}

/// Shared state behind every clone of a [`TaskFuture`]. Fed by the event
/// pump; the first terminal transition wins.
///
/// While unsettled the cell pins the instance that started it, so sessions
/// keep counting executions whose instance handle was dropped.
pub(crate) struct FutureCell {
    execution_id: String,
    instance_id: String,
    session_id: String,
    backend: Arc<dyn Backend>,
    state: watch::Sender<Snapshot>,
    history: Mutex<Vec<FutureStatus>>,
    logs: Mutex<Vec<LogRecord>>,
    owner: Mutex<Option<Arc<InstanceShared>>>,
}

impl FutureCell {
    pub(crate) fn new(
        execution_id: impl Into<String>,
        instance_id: impl Into<String>,
        session_id: impl Into<String>,
        backend: Arc<dyn Backend>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(Snapshot {
            status: FutureStatus::Pending,
            progress: 0.0,
            status_message: None,
            result: None,
            error: None,
            stop_requested: false,
        });
        Arc::new(Self {
            execution_id: execution_id.into(),
            instance_id: instance_id.into(),
            session_id: session_id.into(),
            backend,
            state,
            history: Mutex::new(vec![FutureStatus::Pending]),
            logs: Mutex::new(Vec::new()),
            owner: Mutex::new(None),
        })
    }

    /// Keeps `instance` alive until this cell settles.
    pub(crate) fn pin_owner(&self, instance: Arc<InstanceShared>) {
        let mut owner = self.owner.lock();
        if !self.status().is_terminal() {
            *owner = Some(instance);
        }
    }

    pub(crate) fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub(crate) fn status(&self) -> FutureStatus {
        self.state.borrow().status
    }

    pub(crate) fn apply(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Started => {
                self.advance(FutureStatus::Running);
            }
            ExecutionEvent::Progress { progress, status } => {
                self.advance(FutureStatus::Running);
                self.state.send_if_modified(|snap| {
                    if snap.status.is_terminal() {
                        return false;
                    }
                    snap.progress = clamp_progress(progress);
                    if status.is_some() {
                        snap.status_message = status;
                    }
                    true
                });
            }
            ExecutionEvent::Status { status } => {
                self.state.send_if_modified(|snap| {
                    if snap.status.is_terminal() {
                        return false;
                    }
                    snap.status_message = Some(status);
                    true
                });
            }
            ExecutionEvent::Log(record) => self.logs.lock().push(record),
            ExecutionEvent::StopRequested { .. } => {
                self.state.send_if_modified(|snap| !std::mem::replace(&mut snap.stop_requested, true));
            }
            ExecutionEvent::Terminal(outcome) => self.settle_outcome(outcome),
        }
    }

    fn settle_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Completed { result } => match result.decode_value() {
                Ok(value) => self.settle(FutureStatus::Completed, Some(value), None),
                Err(error) => self.settle(FutureStatus::Failed, None, Some(error)),
            },
            Outcome::Failed { error } => {
                self.settle(FutureStatus::Failed, None, Some(TaskError::TaskExecution(error)))
            }
            Outcome::Cancelled { reason } => {
                let error = TaskError::TaskCancelled {
                    execution_id: self.execution_id.clone(),
                    reason,
                };
                self.settle(FutureStatus::Cancelled, None, Some(error))
            }
        };
    }

    fn advance(&self, to: FutureStatus) -> bool {
        self.state.send_if_modified(|snap| {
            if snap.status.is_terminal() || to.rank() <= snap.status.rank() {
                return false;
            }
            snap.status = to;
            self.history.lock().push(to);
            true
        })
    }

    pub(crate) fn settle(
        &self,
        to: FutureStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> bool {
        let settled = self.state.send_if_modified(|snap| {
            if snap.status.is_terminal() {
                debug!(
                    execution_id = %self.execution_id,
                    current = %snap.status,
                    ignored = %to,
                    "ignoring terminal report on settled future"
                );
                return false;
            }
            snap.status = to;
            snap.result = result;
            snap.error = error;
            if to == FutureStatus::Completed {
                snap.progress = 100.0;
            }
            self.history.lock().push(to);
            true
        });
        if settled {
            // Dropped outside the lock.
            let _owner = self.owner.lock().take();
        }
        settled
    }
}

/// Drives a cell from an update stream until it settles.
pub(crate) fn spawn_pump(cell: Arc<FutureCell>, mut events: EventStream) {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let terminal = event.is_terminal();
            cell.apply(event);
            if terminal {
                return;
            }
        }
        if !cell.status().is_terminal() {
            warn!(
                execution_id = %cell.execution_id,
                "update stream ended before a terminal event"
            );
            cell.settle(
                FutureStatus::Failed,
                None,
                Some(TaskError::Transport(
                    "update stream ended before the execution finished".to_string(),
                )),
            );
        }
    });
}

/// Handle to one execution. Cheap to clone; all clones observe the same
/// state.
pub struct TaskFuture<R = Value> {
    cell: Arc<FutureCell>,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for TaskFuture<R> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _result: PhantomData,
        }
    }
}

impl<R> fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("execution_id", &self.cell.execution_id)
            .field("status", &self.cell.status())
            .finish()
    }
}

impl<R> TaskFuture<R> {
    pub(crate) fn new(cell: Arc<FutureCell>) -> Self {
        Self {
            cell,
            _result: PhantomData,
        }
    }

    pub(crate) fn cell(&self) -> &Arc<FutureCell> {
        &self.cell
    }

    pub fn execution_id(&self) -> &str {
        &self.cell.execution_id
    }

    pub fn instance_id(&self) -> &str {
        &self.cell.instance_id
    }

    pub fn status(&self) -> FutureStatus {
        self.cell.status()
    }

    pub fn progress(&self) -> f64 {
        self.cell.state.borrow().progress
    }

    pub fn status_message(&self) -> Option<String> {
        self.cell.state.borrow().status_message.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.cell.state.borrow().stop_requested
    }

    /// Terminal error, if the execution failed or was cancelled.
    pub fn error(&self) -> Option<TaskError> {
        self.cell.state.borrow().error.clone()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Every status this future has held, in order.
    pub fn history(&self) -> Vec<FutureStatus> {
        self.cell.history.lock().clone()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.cell.logs.lock().clone()
    }

    /// Asks the task to stop. The execution settles once the body notices.
    pub async fn cancel(&self) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        self.cell
            .backend
            .request_stop(&self.cell.execution_id, &self.cell.session_id)
            .await
    }

    async fn settled(&self, timeout: Option<Duration>) -> Result<Snapshot> {
        let mut updates = self.cell.state.subscribe();
        let wait = async {
            updates
                .wait_for(|snap| snap.status.is_terminal())
                .await
                .map(|snap| (*snap).clone())
        };
        let snapshot = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TaskError::Timeout {
                    execution_id: self.cell.execution_id.clone(),
                    waited: limit,
                }
            })?,
            None => wait.await,
        };
        // The cell owns the sender, so the channel outlives every receiver.
        snapshot.map_err(|_| TaskError::Transport("future state channel closed".to_string()))
    }

    /// Waits for the terminal status without decoding the result.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<FutureStatus> {
        Ok(self.settled(timeout).await?.status)
    }
}

impl<R: DeserializeOwned> TaskFuture<R> {
    /// Waits until the execution settles or the deadline passes. The deadline
    /// only bounds the wait; the execution keeps running.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<R> {
        let snapshot = self.settled(timeout).await?;
        match snapshot.status {
            FutureStatus::Completed => {
                let value = snapshot.result.unwrap_or(Value::Null);
                Ok(serde_json::from_value(value)?)
            }
            FutureStatus::Cancelled => Err(snapshot.error.unwrap_or_else(|| {
                TaskError::TaskCancelled {
                    execution_id: self.cell.execution_id.clone(),
                    reason: None,
                }
            })),
            _ => Err(snapshot
                .error
                .unwrap_or_else(|| TaskError::Transport("execution failed without an error".into()))),
        }
    }
}
