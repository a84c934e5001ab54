use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::InstanceRecord;
use crate::error::{Result, TaskError};
use crate::registry::RegistryClient;
use crate::runtime::control::ControlContext;
use crate::runtime::event::LogRecord;
use crate::runtime::handler::ControlHandler;
use crate::runtime::task::TaskDescriptor;

enum Outbound {
    Register,
    Log(LogRecord),
    Progress(f64, Option<String>),
    Status(String),
    StopRequested,
    Flush(oneshot::Sender<()>),
}

/// Handler that forwards control calls to the registry.
///
/// Calls are queued and sent in order by a background forwarder, so the task
/// thread never waits on the network. The first forwarded call upserts the
/// task definition and the instance record. Once a report fails at the
/// transport level the handler degrades to local tracing only; the
/// execution itself carries on.
pub struct RemoteHandler {
    queue: mpsc::UnboundedSender<Outbound>,
    stop: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
}

struct Forwarder {
    client: RegistryClient,
    context: ControlContext,
    descriptor: TaskDescriptor,
    instance: InstanceRecord,
    registered: bool,
    degraded: Arc<AtomicBool>,
}

impl RemoteHandler {
    /// Must be called inside a tokio runtime; the forwarder is spawned onto
    /// it.
    pub fn new(
        client: RegistryClient,
        context: ControlContext,
        descriptor: TaskDescriptor,
        instance: InstanceRecord,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        let degraded = Arc::new(AtomicBool::new(false));
        let forwarder = Forwarder {
            client,
            context,
            descriptor,
            instance,
            registered: false,
            degraded: Arc::clone(&degraded),
        };
        tokio::spawn(forwarder.run(inbox));
        Self {
            queue,
            stop,
            degraded,
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Waits until everything queued so far has been sent (or dropped).
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(Outbound::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn enqueue(&self, message: Outbound) {
        if self.queue.send(message).is_err() {
            debug!("remote handler forwarder has exited");
        }
    }
}

impl ControlHandler for RemoteHandler {
    fn log(&self, _ctx: &ControlContext, record: LogRecord) {
        self.enqueue(Outbound::Log(record));
    }

    fn update_progress(&self, _ctx: &ControlContext, progress: f64, status: Option<&str>) {
        self.enqueue(Outbound::Progress(progress, status.map(str::to_string)));
    }

    fn update_status(&self, _ctx: &ControlContext, status: &str) {
        self.enqueue(Outbound::Status(status.to_string()));
    }

    fn check_stop_requested(&self, _ctx: &ControlContext) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self, _ctx: &ControlContext) {
        self.stop.store(true, Ordering::Release);
        self.enqueue(Outbound::StopRequested);
    }

    fn ensure_task_registered(&self, _ctx: &ControlContext) {
        self.enqueue(Outbound::Register);
    }

    fn ensure_instance_registered(&self, _ctx: &ControlContext) {
        self.enqueue(Outbound::Register);
    }
}

impl Forwarder {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(message) = inbox.recv().await {
            if let Outbound::Flush(done) = message {
                let _ = done.send(());
                continue;
            }
            if self.degraded.load(Ordering::Acquire) {
                continue;
            }
            let op = message_kind(&message);
            let sent = match self.register().await {
                Ok(()) => self.forward(message).await,
                Err(error) => Err(error),
            };
            if let Err(error) = sent {
                self.failed(op, error);
            }
        }
    }

    async fn register(&mut self) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        self.client.upsert_task(&self.descriptor).await?;
        self.client.upsert_instance(&self.instance).await?;
        self.registered = true;
        debug!(
            task = %self.descriptor.name,
            instance_id = %self.instance.instance_id,
            "remote handler registered task and instance"
        );
        Ok(())
    }

    async fn forward(&self, message: Outbound) -> Result<()> {
        let execution_id = self.context.execution_id.as_str();
        match message {
            Outbound::Register | Outbound::Flush(_) => Ok(()),
            Outbound::Log(record) => {
                self.client
                    .report_log(execution_id, record.level, &record.message, &record.fields)
                    .await
            }
            Outbound::Progress(progress, status) => {
                self.client
                    .report_progress(execution_id, progress, status.as_deref())
                    .await
            }
            Outbound::Status(status) => self.client.report_status(execution_id, &status).await,
            Outbound::StopRequested => {
                self.client
                    .request_stop(execution_id, &self.context.session_id)
                    .await
            }
        }
    }

    fn failed(&self, op: &'static str, error: TaskError) {
        if matches!(error, TaskError::Transport(_)) {
            if !self.degraded.swap(true, Ordering::AcqRel) {
                warn!(
                    execution_id = %self.context.execution_id,
                    op,
                    error = %error,
                    "registry unreachable, control events now only logged locally"
                );
            }
        } else {
            debug!(
                execution_id = %self.context.execution_id,
                op,
                error = %error,
                "control event rejected by registry"
            );
        }
    }
}

fn message_kind(message: &Outbound) -> &'static str {
    match message {
        Outbound::Register => "register",
        Outbound::Log(_) => "log",
        Outbound::Progress(..) => "progress",
        Outbound::Status(_) => "status",
        Outbound::StopRequested => "request_stop",
        Outbound::Flush(_) => "flush",
    }
}
