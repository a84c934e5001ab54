pub mod local;
pub mod remote;
pub mod remote_handler;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::error::{ErrorPayload, Result};
use crate::registry::{HttpTransport, RegistryClient};
use crate::runtime::event::{ExecutionEvent, LogFields, LogLevel};
use crate::runtime::task::TaskDefinition;
use crate::wire::WirePayload;

pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use remote_handler::RemoteHandler;

/// Finite stream of execution updates; the last item is the terminal event.
pub type EventStream = BoxStream<'static, ExecutionEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpsert {
    /// False when the registry already knew `(name, version)`.
    pub created: bool,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub session_id: String,
    pub task_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub instance_id: String,
    pub session_id: String,
    pub client_id: String,
    pub args: WirePayload,
    pub force: bool,
}

/// Capability set shared by every execution backend.
///
/// Mutating operations carry the caller's session id and fail with
/// `SessionOwnership` when it does not match the one embedded in the
/// instance id.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn client_id(&self) -> &str;

    async fn upsert_task(&self, definition: &Arc<TaskDefinition>) -> Result<TaskUpsert>;

    async fn upsert_instance(&self, instance: &InstanceRecord) -> Result<InstanceRecord>;

    /// Returns the new execution id, or fails with `ExecutionConflict`
    /// naming the live execution when `force` is false.
    async fn start_execution(&self, request: StartRequest) -> Result<String>;

    /// Moves a live execution straight to `CANCELED`.
    async fn force_stop_execution(&self, execution_id: &str, session_id: &str, reason: &str)
    -> Result<()>;

    /// Raises the cooperative stop flag; the execution keeps running until
    /// its body observes it.
    async fn request_stop(&self, execution_id: &str, session_id: &str) -> Result<()>;

    async fn report_progress(&self, execution_id: &str, progress: f64, status: Option<&str>)
    -> Result<()>;

    async fn report_status(&self, execution_id: &str, status: &str) -> Result<()>;

    async fn report_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
        fields: &LogFields,
    ) -> Result<()>;

    async fn complete_execution(&self, execution_id: &str, result: WirePayload) -> Result<()>;

    async fn fail_execution(&self, execution_id: &str, error: ErrorPayload) -> Result<()>;

    async fn check_stop_requested(&self, execution_id: &str) -> Result<bool>;

    /// Read-only: requires a well-formed session id but not ownership.
    async fn subscribe_execution_updates(&self, execution_id: &str, session_id: &str)
    -> Result<EventStream>;

    async fn cancel_instance(&self, instance_id: &str, session_id: &str) -> Result<()>;
}

/// Remote when `NUMEROUS_API_URL` is set, in-process otherwise.
pub fn from_config(config: &Config) -> Result<Arc<dyn Backend>> {
    match &config.api_url {
        Some(url) => {
            let transport = HttpTransport::new(
                url,
                config.access_token.clone(),
                config.organization_id.clone(),
            )?;
            info!(api_url = %url, "using remote backend");
            Ok(Arc::new(RemoteBackend::new(RegistryClient::new(Arc::new(
                transport,
            )))))
        }
        None => {
            let workers = config.worker_count();
            info!(workers, "using local backend");
            Ok(Arc::new(LocalBackend::with_workers(workers)))
        }
    }
}
