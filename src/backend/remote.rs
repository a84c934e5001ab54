use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::backend::{Backend, EventStream, InstanceRecord, StartRequest, TaskUpsert};
use crate::error::{ErrorPayload, Result, TaskError};
use crate::registry::RegistryClient;
use crate::runtime::event::{LogFields, LogLevel};
use crate::runtime::ids;
use crate::runtime::task::TaskDefinition;
use crate::wire::WirePayload;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(2);

/// Backend that delegates every operation to the external control plane.
///
/// Executions run wherever the control plane schedules them; this side only
/// registers, starts, stops and observes them. Updates arrive by polling the
/// execution's event log.
#[derive(Clone)]
pub struct RemoteBackend {
    client: RegistryClient,
    poll_interval: Duration,
}

impl RemoteBackend {
    pub fn new(client: RegistryClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }
}

struct Poller {
    client: RegistryClient,
    execution_id: String,
    cursor: usize,
    interval: Duration,
    finished: bool,
    failures: u32,
}

impl Poller {
    /// Delay after the current run of consecutive failures.
    fn backoff(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.saturating_sub(1).min(16));
        self.interval.saturating_mul(factor).min(MAX_POLL_BACKOFF)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn client_id(&self) -> &str {
        self.client.client_id()
    }

    async fn upsert_task(&self, definition: &Arc<TaskDefinition>) -> Result<TaskUpsert> {
        let upsert = self.client.upsert_task(&definition.descriptor()).await?;
        debug!(
            task = %definition.name,
            version = %upsert.version,
            created = upsert.created,
            "task definition upserted"
        );
        Ok(upsert)
    }

    async fn upsert_instance(&self, instance: &InstanceRecord) -> Result<InstanceRecord> {
        self.client.upsert_instance(instance).await
    }

    async fn start_execution(&self, request: StartRequest) -> Result<String> {
        self.client.start_execution(request).await
    }

    async fn force_stop_execution(
        &self,
        execution_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.client
            .force_stop_execution(execution_id, session_id, reason)
            .await
    }

    async fn request_stop(&self, execution_id: &str, session_id: &str) -> Result<()> {
        self.client.request_stop(execution_id, session_id).await
    }

    async fn report_progress(
        &self,
        execution_id: &str,
        progress: f64,
        status: Option<&str>,
    ) -> Result<()> {
        self.client
            .report_progress(execution_id, progress, status)
            .await
    }

    async fn report_status(&self, execution_id: &str, status: &str) -> Result<()> {
        self.client.report_status(execution_id, status).await
    }

    async fn report_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
        fields: &LogFields,
    ) -> Result<()> {
        self.client
            .report_log(execution_id, level, message, fields)
            .await
    }

    async fn complete_execution(&self, execution_id: &str, result: WirePayload) -> Result<()> {
        self.client.complete_execution(execution_id, result).await
    }

    async fn fail_execution(&self, execution_id: &str, error: ErrorPayload) -> Result<()> {
        self.client.fail_execution(execution_id, error).await
    }

    async fn check_stop_requested(&self, execution_id: &str) -> Result<bool> {
        self.client.check_stop_requested(execution_id).await
    }

    async fn subscribe_execution_updates(
        &self,
        execution_id: &str,
        session_id: &str,
    ) -> Result<EventStream> {
        ids::validate_session_id(session_id)?;
        let poller = Poller {
            client: self.client.clone(),
            execution_id: execution_id.to_string(),
            cursor: 0,
            interval: self.poll_interval,
            finished: false,
            failures: 0,
        };
        let pages = stream::unfold(poller, |mut poller| async move {
            if poller.finished {
                return None;
            }
            loop {
                match poller
                    .client
                    .poll_events(&poller.execution_id, poller.cursor)
                    .await
                {
                    Ok(page) => {
                        if poller.failures > 0 {
                            debug!(
                                execution_id = %poller.execution_id,
                                failures = poller.failures,
                                "execution update polling recovered"
                            );
                            poller.failures = 0;
                        }
                        poller.cursor = page.cursor;
                        poller.finished = page.finished;
                        if !page.events.is_empty() {
                            return Some((page.events, poller));
                        }
                        if page.finished {
                            return None;
                        }
                        tokio::time::sleep(poller.interval).await;
                    }
                    // The execution lives on in the registry; keep reading.
                    Err(TaskError::Transport(error)) => {
                        poller.failures += 1;
                        if poller.failures == 1 {
                            warn!(
                                execution_id = %poller.execution_id,
                                error = %error,
                                "polling execution updates failed, retrying"
                            );
                        } else {
                            debug!(
                                execution_id = %poller.execution_id,
                                failures = poller.failures,
                                error = %error,
                                "polling execution updates still failing"
                            );
                        }
                        tokio::time::sleep(poller.backoff()).await;
                    }
                    Err(error) => {
                        warn!(
                            execution_id = %poller.execution_id,
                            error = %error,
                            "execution update stream ended"
                        );
                        return None;
                    }
                }
            }
        });
        Ok(pages.flat_map(stream::iter).boxed())
    }

    async fn cancel_instance(&self, instance_id: &str, session_id: &str) -> Result<()> {
        self.client.cancel_instance(instance_id, session_id).await
    }
}
