use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;

use crate::runtime::control::ControlContext;
use crate::runtime::event::{ExecutionEvent, LogRecord};
use crate::runtime::journal::EventJournal;

/// 控制通道处理器：TaskControl 的每个调用都路由到这里
///
/// Methods are called from the task's worker thread and must not block on
/// the network; remote implementations queue and forward.
pub trait ControlHandler: Send + Sync {
    fn log(&self, ctx: &ControlContext, record: LogRecord);

    fn update_progress(&self, ctx: &ControlContext, progress: f64, status: Option<&str>);

    fn update_status(&self, ctx: &ControlContext, status: &str);

    fn check_stop_requested(&self, ctx: &ControlContext) -> bool;

    fn request_stop(&self, ctx: &ControlContext);

    fn ensure_task_registered(&self, _ctx: &ControlContext) {}

    fn ensure_instance_registered(&self, _ctx: &ControlContext) {}
}

/// In-process handler: writes into the execution's journal, which feeds the
/// owning future.
pub struct LocalHandler {
    journal: Arc<EventJournal>,
    stop: Arc<AtomicBool>,
}

impl LocalHandler {
    pub fn new(journal: Arc<EventJournal>, stop: Arc<AtomicBool>) -> Self {
        Self { journal, stop }
    }
}

impl ControlHandler for LocalHandler {
    fn log(&self, _ctx: &ControlContext, record: LogRecord) {
        self.journal.append(ExecutionEvent::Log(record));
    }

    fn update_progress(&self, _ctx: &ControlContext, progress: f64, status: Option<&str>) {
        self.journal.append(ExecutionEvent::Progress {
            progress,
            status: status.map(str::to_string),
        });
    }

    fn update_status(&self, _ctx: &ControlContext, status: &str) {
        self.journal.append(ExecutionEvent::Status {
            status: status.to_string(),
        });
    }

    fn check_stop_requested(&self, _ctx: &ControlContext) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self, _ctx: &ControlContext) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            self.journal.append(ExecutionEvent::StopRequested {
                reason: Some("requested by task".to_string()),
            });
        }
    }
}

/// Discards everything.
pub struct NullHandler;

impl ControlHandler for NullHandler {
    fn log(&self, _ctx: &ControlContext, _record: LogRecord) {}

    fn update_progress(&self, _ctx: &ControlContext, _progress: f64, _status: Option<&str>) {}

    fn update_status(&self, _ctx: &ControlContext, _status: &str) {}

    fn check_stop_requested(&self, _ctx: &ControlContext) -> bool {
        false
    }

    fn request_stop(&self, _ctx: &ControlContext) {}
}

/// Fans every call out to several handlers. A stop requested on any of them
/// counts.
pub struct CompositeHandler {
    handlers: Vec<Arc<dyn ControlHandler>>,
}

impl CompositeHandler {
    pub fn new(handlers: Vec<Arc<dyn ControlHandler>>) -> Self {
        Self { handlers }
    }
}

impl ControlHandler for CompositeHandler {
    fn log(&self, ctx: &ControlContext, record: LogRecord) {
        for handler in &self.handlers {
            handler.log(ctx, record.clone());
        }
    }

    fn update_progress(&self, ctx: &ControlContext, progress: f64, status: Option<&str>) {
        for handler in &self.handlers {
            handler.update_progress(ctx, progress, status);
        }
    }

    fn update_status(&self, ctx: &ControlContext, status: &str) {
        for handler in &self.handlers {
            handler.update_status(ctx, status);
        }
    }

    fn check_stop_requested(&self, ctx: &ControlContext) -> bool {
        self.handlers.iter().any(|h| h.check_stop_requested(ctx))
    }

    fn request_stop(&self, ctx: &ControlContext) {
        for handler in &self.handlers {
            handler.request_stop(ctx);
        }
    }

    fn ensure_task_registered(&self, ctx: &ControlContext) {
        for handler in &self.handlers {
            handler.ensure_task_registered(ctx);
        }
    }

    fn ensure_instance_registered(&self, ctx: &ControlContext) {
        for handler in &self.handlers {
            handler.ensure_instance_registered(ctx);
        }
    }
}

/// Mirrors control events to stdout as JSON lines
/// (`NUMEROUS_MOCK_REMOTE_LOGGING`).
pub struct StdoutHandler;

impl StdoutHandler {
    fn emit(&self, line: serde_json::Value) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

impl ControlHandler for StdoutHandler {
    fn log(&self, ctx: &ControlContext, record: LogRecord) {
        self.emit(json!({
            "event": "log",
            "execution_id": ctx.execution_id,
            "record": record,
        }));
    }

    fn update_progress(&self, ctx: &ControlContext, progress: f64, status: Option<&str>) {
        self.emit(json!({
            "event": "progress",
            "execution_id": ctx.execution_id,
            "progress": progress,
            "status": status,
        }));
    }

    fn update_status(&self, ctx: &ControlContext, status: &str) {
        self.emit(json!({
            "event": "status",
            "execution_id": ctx.execution_id,
            "status": status,
        }));
    }

    fn check_stop_requested(&self, _ctx: &ControlContext) -> bool {
        false
    }

    fn request_stop(&self, ctx: &ControlContext) {
        self.emit(json!({
            "event": "stop_requested",
            "execution_id": ctx.execution_id,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flagged(AtomicBool);

    impl ControlHandler for Flagged {
        fn log(&self, _ctx: &ControlContext, _record: LogRecord) {}
        fn update_progress(&self, _ctx: &ControlContext, _p: f64, _s: Option<&str>) {}
        fn update_status(&self, _ctx: &ControlContext, _s: &str) {}
        fn check_stop_requested(&self, _ctx: &ControlContext) -> bool {
            self.0.load(Ordering::Acquire)
        }
        fn request_stop(&self, _ctx: &ControlContext) {
            self.0.store(true, Ordering::Release);
        }
    }

    fn ctx() -> ControlContext {
        ControlContext {
            execution_id: "e".into(),
            instance_id: "s:t:1".into(),
            session_id: "s".into(),
            task_name: "t".into(),
        }
    }

    #[test]
    fn composite_stop_is_any_of_its_parts() {
        let flagged = Arc::new(Flagged(AtomicBool::new(false)));
        let composite = CompositeHandler::new(vec![Arc::new(NullHandler), flagged.clone()]);
        assert!(!composite.check_stop_requested(&ctx()));
        composite.request_stop(&ctx());
        assert!(flagged.0.load(Ordering::Acquire));
        assert!(composite.check_stop_requested(&ctx()));
    }
}
