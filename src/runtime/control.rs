use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::TaskCancelled;
use crate::runtime::event::{LogFields, LogLevel, LogRecord, clamp_progress};
use crate::runtime::handler::{ControlHandler, NullHandler};

/// Identity of the execution a control belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlContext {
    pub execution_id: String,
    pub instance_id: String,
    pub session_id: String,
    pub task_name: String,
}

/// Per-execution channel handed to task bodies: progress, status, structured
/// logs and the cooperative stop flag.
///
/// Every call is routed to the configured [`ControlHandler`]. Nothing here
/// interrupts the task; bodies poll [`should_stop`](Self::should_stop) and
/// return [`TaskCancelled`] to exit early.
pub struct TaskControl {
    context: ControlContext,
    progress: Mutex<f64>,
    status: Mutex<Option<String>>,
    stop: Arc<AtomicBool>,
    handler: Arc<dyn ControlHandler>,
}

impl TaskControl {
    pub fn new(context: ControlContext, handler: Arc<dyn ControlHandler>) -> Self {
        Self::with_stop_flag(context, handler, Arc::new(AtomicBool::new(false)))
    }

    /// Shares the stop flag with whoever else may request a stop (the
    /// backend, a registry watcher).
    pub fn with_stop_flag(
        context: ControlContext,
        handler: Arc<dyn ControlHandler>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            context,
            progress: Mutex::new(0.0),
            status: Mutex::new(None),
            stop,
            handler,
        }
    }

    /// A control that reports nowhere, for inline calls outside any backend.
    pub fn detached(task_name: &str) -> Self {
        let context = ControlContext {
            execution_id: format!("inline-{}", crate::runtime::ids::new_execution_id()),
            instance_id: String::new(),
            session_id: String::new(),
            task_name: task_name.to_string(),
        };
        Self::new(context, Arc::new(NullHandler))
    }

    pub fn context(&self) -> &ControlContext {
        &self.context
    }

    pub fn execution_id(&self) -> &str {
        &self.context.execution_id
    }

    pub fn instance_id(&self) -> &str {
        &self.context.instance_id
    }

    pub fn task_name(&self) -> &str {
        &self.context.task_name
    }

    pub fn progress(&self) -> f64 {
        *self.progress.lock()
    }

    pub fn status(&self) -> Option<String> {
        self.status.lock().clone()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_with(level, message, LogFields::new());
    }

    pub fn log_with(&self, level: LogLevel, message: impl Into<String>, fields: LogFields) {
        let record = LogRecord {
            level,
            message: message.into(),
            execution_id: self.context.execution_id.clone(),
            instance_id: self.context.instance_id.clone(),
            task_name: self.context.task_name.clone(),
            fields,
            timestamp: Utc::now(),
        };
        trace_record(&record);
        self.handler.log(&self.context, record);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Stores and reports progress, clamped to `[0, 100]`.
    pub fn update_progress(&self, value: f64, status: Option<&str>) {
        let value = clamp_progress(value);
        *self.progress.lock() = value;
        if let Some(status) = status {
            *self.status.lock() = Some(status.to_string());
        }
        self.handler.update_progress(&self.context, value, status);
    }

    pub fn update_status(&self, status: &str) {
        *self.status.lock() = Some(status.to_string());
        self.handler.update_status(&self.context, status);
    }

    /// True once a stop was requested by the task, its future, the backend or
    /// the control plane. Never resets.
    pub fn should_stop(&self) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }
        if self.handler.check_stop_requested(&self.context) {
            self.stop.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Sets the stop flag. The body keeps running until it observes it.
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            self.handler.request_stop(&self.context);
        }
    }

    /// `Err(TaskCancelled)` once a stop was requested, for use with `?`.
    pub fn check_cancelled(&self) -> Result<(), TaskCancelled> {
        if self.should_stop() {
            Err(TaskCancelled)
        } else {
            Ok(())
        }
    }

    pub fn ensure_registered(&self) {
        self.handler.ensure_task_registered(&self.context);
        self.handler.ensure_instance_registered(&self.context);
    }
}

fn trace_record(record: &LogRecord) {
    let fields = Value::Object(
        record
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    match record.level {
        LogLevel::Debug => debug!(
            execution_id = %record.execution_id,
            instance_id = %record.instance_id,
            task = %record.task_name,
            fields = %fields,
            "{}", record.message
        ),
        LogLevel::Info => info!(
            execution_id = %record.execution_id,
            instance_id = %record.instance_id,
            task = %record.task_name,
            fields = %fields,
            "{}", record.message
        ),
        LogLevel::Warning => warn!(
            execution_id = %record.execution_id,
            instance_id = %record.instance_id,
            task = %record.task_name,
            fields = %fields,
            "{}", record.message
        ),
        LogLevel::Error => error!(
            execution_id = %record.execution_id,
            instance_id = %record.instance_id,
            task = %record.task_name,
            fields = %fields,
            "{}", record.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event::ExecutionEvent;
    use crate::runtime::handler::LocalHandler;
    use crate::runtime::journal::EventJournal;

    fn local_control() -> (TaskControl, Arc<EventJournal>) {
        let journal = Arc::new(EventJournal::new("exec"));
        let stop = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(LocalHandler::new(Arc::clone(&journal), Arc::clone(&stop)));
        let context = ControlContext {
            execution_id: "exec".into(),
            instance_id: "s:t:1".into(),
            session_id: "s".into(),
            task_name: "t".into(),
        };
        (TaskControl::with_stop_flag(context, handler, stop), journal)
    }

    #[test]
    fn progress_is_clamped_and_routed() {
        let (control, journal) = local_control();
        control.update_progress(150.0, Some("almost"));
        assert_eq!(control.progress(), 100.0);
        assert_eq!(control.status().as_deref(), Some("almost"));
        assert_eq!(
            journal.since(0),
            vec![ExecutionEvent::Progress {
                progress: 100.0,
                status: Some("almost".into())
            }]
        );
    }

    #[test]
    fn request_stop_is_monotonic_and_reported_once() {
        let (control, journal) = local_control();
        assert!(!control.should_stop());
        assert!(control.check_cancelled().is_ok());
        control.request_stop();
        control.request_stop();
        assert!(control.should_stop());
        assert_eq!(control.check_cancelled(), Err(TaskCancelled));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn logs_carry_execution_identity() {
        let (control, journal) = local_control();
        let mut fields = LogFields::new();
        fields.insert("rows".into(), Value::from(3));
        control.log_with(LogLevel::Warning, "slow batch", fields);
        let events = journal.since(0);
        let ExecutionEvent::Log(record) = &events[0] else {
            panic!("expected a log event");
        };
        assert_eq!(record.level, LogLevel::Warning);
        assert_eq!(record.instance_id, "s:t:1");
        assert_eq!(record.task_name, "t");
        assert_eq!(record.fields["rows"], Value::from(3));
    }

    #[test]
    fn detached_controls_still_track_stop() {
        let control = TaskControl::detached("inline");
        assert!(control.execution_id().starts_with("inline-"));
        control.request_stop();
        assert!(control.should_stop());
    }
}
