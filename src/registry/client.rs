use std::sync::Arc;

use tracing::warn;

use crate::backend::{InstanceRecord, StartRequest, TaskUpsert};
use crate::error::{ErrorPayload, Result, TaskError};
use crate::registry::protocol::{
    ExecutionRecord, RegistryReply, RegistryRequest, RegistryResponse,
};
use crate::registry::retry::RetryPolicy;
use crate::registry::transport::Transport;
use crate::runtime::event::{ExecutionEvent, LogFields, LogLevel};
use crate::runtime::ids;
use crate::runtime::task::TaskDescriptor;
use crate::wire::WirePayload;

/// One page of an execution's event log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<ExecutionEvent>,
    /// Pass back on the next poll.
    pub cursor: usize,
    /// The terminal event has been delivered.
    pub finished: bool,
}

/// Typed registry operations over an injected [`Transport`].
///
/// Ownership of instance-scoped requests is checked before anything is
/// sent, and transient transport failures are retried per the
/// [`RetryPolicy`].
#[derive(Clone)]
pub struct RegistryClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    client_id: String,
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            client_id: ids::new_client_id(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn call(&self, request: RegistryRequest) -> Result<RegistryReply> {
        if let Some((instance_id, session_id)) = request.ownership() {
            ids::validate_ownership(instance_id, session_id)?;
        }
        let op = request.op();
        let mut retry = 0;
        loop {
            match self.transport.send(request.clone()).await {
                Ok(RegistryResponse::Ok(reply)) => return Ok(reply),
                Ok(RegistryResponse::Error(fault)) => return Err(fault.into()),
                Err(error) if error.is_transient() => {
                    retry += 1;
                    let Some(delay) = self.retry.delay_for(retry) else {
                        return Err(TaskError::Transport(format!(
                            "{op}: {error} (gave up after {retry} attempts)"
                        )));
                    };
                    warn!(
                        op,
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying registry call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(TaskError::Transport(format!("{op}: {error}"))),
            }
        }
    }

    async fn ack(&self, request: RegistryRequest) -> Result<()> {
        let op = request.op();
        match self.call(request).await? {
            RegistryReply::Ack => Ok(()),
            other => Err(unexpected(op, &other)),
        }
    }

    pub async fn upsert_task(&self, task: &TaskDescriptor) -> Result<TaskUpsert> {
        match self
            .call(RegistryRequest::UpsertTask { task: task.clone() })
            .await?
        {
            RegistryReply::TaskUpserted { created, version } => Ok(TaskUpsert { created, version }),
            other => Err(unexpected("upsert_task", &other)),
        }
    }

    pub async fn upsert_instance(&self, instance: &InstanceRecord) -> Result<InstanceRecord> {
        match self
            .call(RegistryRequest::UpsertInstance {
                instance: instance.clone(),
            })
            .await?
        {
            RegistryReply::InstanceUpserted { instance } => Ok(instance),
            other => Err(unexpected("upsert_instance", &other)),
        }
    }

    pub async fn start_execution(&self, request: StartRequest) -> Result<String> {
        let request = RegistryRequest::StartExecution {
            instance_id: request.instance_id,
            session_id: request.session_id,
            client_id: request.client_id,
            args: request.args,
            force: request.force,
        };
        match self.call(request).await? {
            RegistryReply::ExecutionStarted { execution_id } => Ok(execution_id),
            other => Err(unexpected("start_execution", &other)),
        }
    }

    pub async fn begin_execution(&self, execution_id: &str) -> Result<()> {
        self.ack(RegistryRequest::BeginExecution {
            execution_id: execution_id.to_string(),
            client_id: self.client_id.clone(),
        })
        .await
    }

    pub async fn force_stop_execution(
        &self,
        execution_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.ack(RegistryRequest::ForceStopExecution {
            execution_id: execution_id.to_string(),
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn request_stop(&self, execution_id: &str, session_id: &str) -> Result<()> {
        self.ack(RegistryRequest::RequestStop {
            execution_id: execution_id.to_string(),
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn report_progress(
        &self,
        execution_id: &str,
        progress: f64,
        status: Option<&str>,
    ) -> Result<()> {
        self.ack(RegistryRequest::ReportProgress {
            execution_id: execution_id.to_string(),
            progress,
            status: status.map(str::to_string),
        })
        .await
    }

    pub async fn report_status(&self, execution_id: &str, status: &str) -> Result<()> {
        self.ack(RegistryRequest::ReportStatus {
            execution_id: execution_id.to_string(),
            status: status.to_string(),
        })
        .await
    }

    pub async fn report_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
        fields: &LogFields,
    ) -> Result<()> {
        self.ack(RegistryRequest::ReportLog {
            execution_id: execution_id.to_string(),
            level,
            message: message.to_string(),
            fields: fields.clone(),
        })
        .await
    }

    pub async fn complete_execution(&self, execution_id: &str, result: WirePayload) -> Result<()> {
        self.ack(RegistryRequest::CompleteExecution {
            execution_id: execution_id.to_string(),
            result,
        })
        .await
    }

    pub async fn fail_execution(&self, execution_id: &str, error: ErrorPayload) -> Result<()> {
        self.ack(RegistryRequest::FailExecution {
            execution_id: execution_id.to_string(),
            error,
        })
        .await
    }

    pub async fn check_stop_requested(&self, execution_id: &str) -> Result<bool> {
        match self
            .call(RegistryRequest::CheckStopRequested {
                execution_id: execution_id.to_string(),
            })
            .await?
        {
            RegistryReply::StopRequested { requested } => Ok(requested),
            other => Err(unexpected("check_stop_requested", &other)),
        }
    }

    pub async fn get_active_execution(&self, instance_id: &str) -> Result<Option<ExecutionRecord>> {
        match self
            .call(RegistryRequest::GetActiveExecution {
                instance_id: instance_id.to_string(),
            })
            .await?
        {
            RegistryReply::ActiveExecution { execution } => Ok(execution),
            other => Err(unexpected("get_active_execution", &other)),
        }
    }

    pub async fn poll_events(&self, execution_id: &str, cursor: usize) -> Result<EventPage> {
        match self
            .call(RegistryRequest::PollEvents {
                execution_id: execution_id.to_string(),
                cursor,
            })
            .await?
        {
            RegistryReply::Events {
                events,
                cursor,
                finished,
            } => Ok(EventPage {
                events,
                cursor,
                finished,
            }),
            other => Err(unexpected("poll_events", &other)),
        }
    }

    pub async fn cancel_instance(&self, instance_id: &str, session_id: &str) -> Result<()> {
        self.ack(RegistryRequest::CancelInstance {
            instance_id: instance_id.to_string(),
            session_id: session_id.to_string(),
        })
        .await
    }
}

fn unexpected(op: &str, reply: &RegistryReply) -> TaskError {
    TaskError::Transport(format!("unexpected {} reply to {op}", reply.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::transport::{FnTransport, TransportError};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(fail_first: usize, error: TransportError) -> (RegistryClient, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let transport = FnTransport::new(move |_request| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            async move {
                if n < fail_first {
                    Err(error)
                } else {
                    Ok(RegistryResponse::Ok(RegistryReply::StopRequested { requested: true }))
                }
            }
            .boxed()
        });
        let client = RegistryClient::new(Arc::new(transport)).with_retry(RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        (client, calls)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (client, calls) = counting(2, TransportError::Transient("reset".into()));
        assert!(client.check_stop_requested("e").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_capped() {
        let (client, calls) = counting(10, TransportError::Transient("reset".into()));
        let err = client.check_stop_requested("e").await.unwrap_err();
        assert_eq!(err.kind(), "TransportError");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (client, calls) = counting(1, TransportError::Permanent("401".into()));
        assert!(client.check_stop_requested("e").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ownership_is_checked_before_sending() {
        let (client, calls) = counting(0, TransportError::Permanent("unused".into()));
        let err = client.cancel_instance("s1:add:1", "s2").await.unwrap_err();
        assert_eq!(err.kind(), "SessionOwnership");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
