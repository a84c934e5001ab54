//! Executes one task instance on behalf of the control plane.
//!
//! The control plane launches a runner process per execution with the
//! instance id and function name in its environment. The runner locates the
//! callable, inflates the arguments recorded at start time, runs the body
//! with a registry-bound [`TaskControl`] and reports the terminal outcome.

pub mod catalog;
pub mod cli;
pub mod manifest;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::backend::{InstanceRecord, LocalBackend, RemoteHandler};
use crate::config::Config;
use crate::error::{ErrorPayload, Result, TaskError, TaskFailure};
use crate::registry::{ExecutionRecord, HttpTransport, RegistryClient};
use crate::runtime::control::{ControlContext, TaskControl};
use crate::runtime::handler::{CompositeHandler, ControlHandler, StdoutHandler};
use crate::runtime::session::Session;
use crate::runtime::task::{Task, TaskDefinition};
use crate::wire::WirePayload;

pub use catalog::TaskCatalog;
pub use manifest::{Manifest, ManifestEntry};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub function_name: String,
    /// Registry instance to execute. Without one the task runs against a
    /// throwaway local backend.
    pub instance_id: Option<String>,
    /// Merged over the inflated arguments.
    pub overrides: Map<String, Value>,
}

/// How a run ended, as seen by the process.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    Failed(ErrorPayload),
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed(_) => 0,
            Self::Failed(_) => 1,
            Self::Cancelled => 2,
        }
    }
}

pub struct Runner {
    catalog: TaskCatalog,
    client: Option<RegistryClient>,
    manifest: Option<Manifest>,
    mirror_events: bool,
    stop_poll_interval: Duration,
}

impl Runner {
    pub fn new(catalog: TaskCatalog) -> Self {
        Self {
            catalog,
            client: None,
            manifest: None,
            mirror_events: false,
            stop_poll_interval: STOP_POLL_INTERVAL,
        }
    }

    pub fn from_config(config: &Config, catalog: TaskCatalog) -> Result<Self> {
        let mut runner = Self::new(catalog).mirror_events(config.mock_remote_logging);
        if let Some(url) = &config.api_url {
            let transport = HttpTransport::new(
                url,
                config.access_token.clone(),
                config.organization_id.clone(),
            )?;
            runner = runner.with_client(RegistryClient::new(Arc::new(transport)));
        }
        if let Some(path) = &config.manifest_path {
            runner = runner.with_manifest(Manifest::load(path)?);
        }
        Ok(runner)
    }

    pub fn with_client(mut self, client: RegistryClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Also write every control event to stdout as a JSON line.
    pub fn mirror_events(mut self, enabled: bool) -> Self {
        self.mirror_events = enabled;
        self
    }

    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    /// Finds the definition for `function_name`, going through the manifest
    /// when one is loaded.
    pub fn resolve(&self, function_name: &str) -> Result<Arc<TaskDefinition>> {
        let Some(manifest) = &self.manifest else {
            return self.catalog.get(function_name);
        };
        let entry = manifest.locate(function_name)?;
        let source = manifest.source_path(entry);
        if !source.exists() {
            debug!(task = function_name, source = %source.display(), "manifest source not on disk");
        }
        self.catalog
            .find_function(manifest.function_name(function_name)?)
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let definition = self.resolve(&request.function_name)?;
        match (&self.client, &request.instance_id) {
            (Some(client), Some(instance_id)) => {
                self.run_remote(client, definition, instance_id, request.overrides)
                    .await
            }
            (Some(_), None) => Err(TaskError::InvalidConfig(
                "a registry is configured but no task instance id was given".into(),
            )),
            (None, _) => self.run_local(definition, request.overrides).await,
        }
    }

    async fn run_remote(
        &self,
        client: &RegistryClient,
        definition: Arc<TaskDefinition>,
        instance_id: &str,
        overrides: Map<String, Value>,
    ) -> Result<RunOutcome> {
        let record = client
            .get_active_execution(instance_id)
            .await?
            .ok_or_else(|| {
                TaskError::UnknownExecution(format!("no active execution for instance {instance_id}"))
            })?;
        if record.task_name != definition.name {
            return Err(TaskError::Manifest(format!(
                "instance {instance_id} runs task {}, not {}",
                record.task_name, definition.name
            )));
        }
        let args = merge_overrides(record.args.decode_value()?, overrides);
        let execution_id = record.execution_id.clone();
        client.begin_execution(&execution_id).await?;
        info!(
            execution_id = %execution_id,
            instance_id,
            task = %definition.name,
            "runner executing task"
        );

        let context = ControlContext {
            execution_id: execution_id.clone(),
            instance_id: instance_id.to_string(),
            session_id: record.session_id.clone(),
            task_name: definition.name.clone(),
        };
        let stop = Arc::new(AtomicBool::new(record.stop_requested));
        let remote = Arc::new(RemoteHandler::new(
            client.clone(),
            context.clone(),
            definition.descriptor(),
            instance_record(&record),
            Arc::clone(&stop),
        ));
        let handler: Arc<dyn ControlHandler> = if self.mirror_events {
            Arc::new(CompositeHandler::new(vec![
                remote.clone() as Arc<dyn ControlHandler>,
                Arc::new(StdoutHandler),
            ]))
        } else {
            remote.clone()
        };
        let control = TaskControl::with_stop_flag(context, handler, Arc::clone(&stop));
        control.ensure_registered();

        let watcher = tokio::spawn(watch_stop(
            client.clone(),
            execution_id.clone(),
            Arc::clone(&stop),
            self.stop_poll_interval,
        ));
        let body = Arc::clone(&definition);
        let joined = tokio::task::spawn_blocking(move || body.invoke(&control, args)).await;
        watcher.abort();
        remote.flush().await;

        let outcome = match joined {
            Ok(Ok(value)) => RunOutcome::Completed(value),
            Ok(Err(TaskFailure::Cancelled)) => RunOutcome::Cancelled,
            Ok(Err(TaskFailure::Error(payload))) => RunOutcome::Failed(payload),
            Err(join_error) => RunOutcome::Failed(match join_error.try_into_panic() {
                Ok(panic) => TaskFailure::from_panic(panic).into_payload(),
                Err(join_error) => ErrorPayload::new("JoinError", join_error.to_string()),
            }),
        };
        match &outcome {
            RunOutcome::Completed(value) => {
                client
                    .complete_execution(&execution_id, WirePayload::from_value(value.clone()))
                    .await?
            }
            RunOutcome::Failed(error) => client.fail_execution(&execution_id, error.clone()).await?,
            RunOutcome::Cancelled => {
                let reason = if stop.load(Ordering::Acquire) {
                    "stop requested"
                } else {
                    "stopped by task"
                };
                client
                    .fail_execution(&execution_id, ErrorPayload::new("TaskCancelled", reason))
                    .await?
            }
        }
        info!(
            execution_id = %execution_id,
            exit_code = outcome.exit_code(),
            "runner reported outcome"
        );
        Ok(outcome)
    }

    async fn run_local(
        &self,
        definition: Arc<TaskDefinition>,
        overrides: Map<String, Value>,
    ) -> Result<RunOutcome> {
        info!(task = %definition.name, "no registry configured; running locally");
        let session = Session::new("runner", Arc::new(LocalBackend::new()));
        let task = Task::from_definition(definition);
        let future = task
            .instance_in(&session)
            .start(Value::Object(overrides))
            .await?;
        Ok(match future.result(None).await {
            Ok(value) => RunOutcome::Completed(value),
            Err(TaskError::TaskCancelled { .. }) => RunOutcome::Cancelled,
            Err(TaskError::TaskExecution(payload)) => RunOutcome::Failed(payload),
            Err(other) => RunOutcome::Failed(other.to_payload()),
        })
    }
}

fn instance_record(record: &ExecutionRecord) -> InstanceRecord {
    InstanceRecord {
        instance_id: record.instance_id.clone(),
        session_id: record.session_id.clone(),
        task_name: record.task_name.clone(),
        version: record.version.clone(),
        created_at: record.started_at,
    }
}

/// Object arguments take the overrides key by key. Any other shape is kept
/// as recorded.
fn merge_overrides(args: Value, overrides: Map<String, Value>) -> Value {
    if overrides.is_empty() {
        return args;
    }
    match args {
        Value::Object(mut map) => {
            map.extend(overrides);
            Value::Object(map)
        }
        Value::Null => Value::Object(overrides),
        other => {
            warn!("argument overrides ignored; recorded arguments are not an object");
            other
        }
    }
}

async fn watch_stop(
    client: RegistryClient,
    execution_id: String,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    while !stop.load(Ordering::Acquire) {
        tokio::time::sleep(interval).await;
        match client.check_stop_requested(&execution_id).await {
            Ok(true) => {
                info!(execution_id = %execution_id, "stop requested by control plane");
                stop.store(true, Ordering::Release);
            }
            Ok(false) => {}
            Err(error) => debug!(execution_id = %execution_id, error = %error, "stop poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overrides_merge_into_object_arguments() {
        let mut overrides = Map::new();
        overrides.insert("b".into(), json!(10));
        assert_eq!(
            merge_overrides(json!({"a": 1, "b": 2}), overrides.clone()),
            json!({"a": 1, "b": 10})
        );
        assert_eq!(merge_overrides(json!([1, 2]), overrides), json!([1, 2]));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Completed(json!(1)).exit_code(), 0);
        assert_eq!(RunOutcome::Failed(ErrorPayload::new("E", "e")).exit_code(), 1);
        assert_eq!(RunOutcome::Cancelled.exit_code(), 2);
    }
}
