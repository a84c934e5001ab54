use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, EventStream, InstanceRecord, StartRequest, TaskUpsert};
use crate::error::{ErrorPayload, Result, TaskError, TaskFailure};
use crate::runtime::control::{ControlContext, TaskControl};
use crate::runtime::event::{ExecutionEvent, LogFields, LogLevel, LogRecord, Outcome, clamp_progress};
use crate::runtime::handler::LocalHandler;
use crate::runtime::ids;
use crate::runtime::journal::EventJournal;
use crate::runtime::state::ExecutionState;
use crate::runtime::task::TaskDefinition;
use crate::wire::WirePayload;

/// Settled executions kept around for late subscribers and lookups.
const RETAINED_SETTLED: usize = 256;

/// In-process backend: a bounded pool of blocking worker threads with
/// per-definition admission control.
#[derive(Clone)]
pub struct LocalBackend {
    inner: Arc<LocalState>,
}

struct LocalState {
    client_id: String,
    definitions: DashMap<String, Arc<TaskDefinition>>,
    instances: DashMap<String, InstanceRecord>,
    // live executions only; settled ones move to `retired`
    executions: DashMap<String, Arc<LocalExecution>>,
    retired: Mutex<VecDeque<Arc<LocalExecution>>>,
    retain_settled: usize,
    // instance id -> its live execution
    active: DashMap<String, String>,
    // task name -> live execution ids, oldest first; one lock per definition
    admissions: DashMap<String, Arc<Mutex<Vec<String>>>>,
    workers: Arc<Semaphore>,
}

struct LocalExecution {
    id: String,
    instance_id: String,
    session_id: String,
    task_name: String,
    client_id: String,
    started_at: DateTime<Utc>,
    journal: Arc<EventJournal>,
    stop: Arc<AtomicBool>,
    stop_reason: Mutex<Option<String>>,
    state: Mutex<ExecutionState>,
}

impl LocalExecution {
    fn context(&self) -> ControlContext {
        ControlContext {
            execution_id: self.id.clone(),
            instance_id: self.instance_id.clone(),
            session_id: self.session_id.clone(),
            task_name: self.task_name.clone(),
        }
    }

    fn is_settled(&self) -> bool {
        self.journal.is_closed()
    }

    /// Returns false when the flag was already up.
    fn raise_stop(&self, reason: &str) -> bool {
        if self.stop.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.stop_reason.lock() = Some(reason.to_string());
        self.journal.append(ExecutionEvent::StopRequested {
            reason: Some(reason.to_string()),
        });
        true
    }

    fn mark_running(&self) -> bool {
        if !self.journal.append(ExecutionEvent::Started) {
            return false;
        }
        let mut state = self.state.lock();
        if *state == ExecutionState::Starting {
            *state = ExecutionState::Running;
        }
        true
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let state = outcome.state();
        if self.journal.append(ExecutionEvent::Terminal(outcome)) {
            *self.state.lock() = state;
            true
        } else {
            false
        }
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(workers)
    }

    /// `workers` bounds how many task bodies run at once across all
    /// definitions.
    pub fn with_workers(workers: usize) -> Self {
        Self::with_limits(workers, RETAINED_SETTLED)
    }

    /// Like [`with_workers`](Self::with_workers), also bounding how many
    /// settled executions stay queryable. Older ones are forgotten.
    pub fn with_limits(workers: usize, retain_settled: usize) -> Self {
        Self {
            inner: Arc::new(LocalState {
                client_id: ids::new_client_id(),
                definitions: DashMap::new(),
                instances: DashMap::new(),
                executions: DashMap::new(),
                retired: Mutex::new(VecDeque::new()),
                retain_settled: retain_settled.max(1),
                active: DashMap::new(),
                admissions: DashMap::new(),
                workers: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    /// Live executions of a definition.
    pub fn running_count(&self, task_name: &str) -> usize {
        self.inner
            .admissions
            .get(task_name)
            .map(|admission| admission.lock().len())
            .unwrap_or(0)
    }

    /// Executions admitted and not yet settled, across all definitions.
    pub fn live_execution_count(&self) -> usize {
        self.inner.executions.len()
    }

    pub fn execution_state(&self, execution_id: &str) -> Option<ExecutionState> {
        self.inner
            .execution(execution_id)
            .ok()
            .map(|execution| *execution.state.lock())
    }

    /// Live execution of an instance, if any.
    pub fn active_execution(&self, instance_id: &str) -> Option<String> {
        self.inner
            .active
            .get(instance_id)
            .map(|entry| entry.value().clone())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalState {
    fn execution(&self, execution_id: &str) -> Result<Arc<LocalExecution>> {
        if let Some(entry) = self.executions.get(execution_id) {
            return Ok(Arc::clone(entry.value()));
        }
        self.retired
            .lock()
            .iter()
            .rev()
            .find(|execution| execution.id == execution_id)
            .cloned()
            .ok_or_else(|| TaskError::UnknownExecution(execution_id.to_string()))
    }

    /// Moves a settled execution out of the live table. Subscribers keep
    /// their own handle on the journal.
    fn retire(&self, execution_id: &str) {
        let Some(execution) = self
            .executions
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        {
            let mut retired = self.retired.lock();
            retired.push_back(execution);
            while retired.len() > self.retain_settled {
                retired.pop_front();
            }
        }
        self.executions.remove(execution_id);
    }

    fn admission(&self, task_name: &str) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(self.admissions.entry(task_name.to_string()).or_default().value())
    }

    /// Test-and-register under the definition's lock.
    fn admit(
        &self,
        definition: &TaskDefinition,
        request: &StartRequest,
    ) -> Result<Arc<LocalExecution>> {
        let admission = self.admission(&definition.name);
        let mut running = admission.lock();

        let active = self
            .active
            .get(&request.instance_id)
            .map(|entry| entry.value().clone());
        if let Some(active) = active {
            if !request.force {
                return Err(TaskError::ExecutionConflict {
                    instance_id: request.instance_id.clone(),
                    active_execution_id: active,
                });
            }
            self.cancel_locked(&mut running, &active, "pre-empted");
        }

        let limit = definition.config.max_parallel;
        if running.len() >= limit {
            if !request.force {
                warn!(
                    task = %definition.name,
                    limit,
                    instance_id = %request.instance_id,
                    "admission denied: parallel limit reached"
                );
                return Err(TaskError::MaxInstancesReached {
                    task_name: definition.name.clone(),
                    limit,
                });
            }
            if let Some(oldest) = running.first().cloned() {
                self.cancel_locked(&mut running, &oldest, "pre-empted");
            }
        }

        let execution_id = ids::new_execution_id();
        let execution = Arc::new(LocalExecution {
            journal: Arc::new(EventJournal::new(execution_id.as_str())),
            id: execution_id,
            instance_id: request.instance_id.clone(),
            session_id: request.session_id.clone(),
            task_name: definition.name.clone(),
            client_id: request.client_id.clone(),
            started_at: Utc::now(),
            stop: Arc::new(AtomicBool::new(false)),
            stop_reason: Mutex::new(None),
            state: Mutex::new(ExecutionState::Starting),
        });
        running.push(execution.id.clone());
        self.executions
            .insert(execution.id.clone(), Arc::clone(&execution));
        self.active
            .insert(request.instance_id.clone(), execution.id.clone());
        Ok(execution)
    }

    /// Caller holds the definition's admission lock.
    fn cancel_locked(&self, running: &mut Vec<String>, execution_id: &str, reason: &str) {
        running.retain(|id| id != execution_id);
        let Ok(execution) = self.execution(execution_id) else {
            return;
        };
        self.active
            .remove_if(&execution.instance_id, |_, active| active == execution_id);
        execution.raise_stop(reason);
        if execution.settle(Outcome::cancelled(reason)) {
            info!(
                execution_id,
                instance_id = %execution.instance_id,
                reason,
                "execution force-stopped"
            );
        }
        self.retire(execution_id);
    }

    fn finish(&self, execution: &LocalExecution, outcome: Outcome) -> bool {
        let admission = self.admission(&execution.task_name);
        let mut running = admission.lock();
        let settled = execution.settle(outcome);
        running.retain(|id| id != &execution.id);
        self.active
            .remove_if(&execution.instance_id, |_, active| active == &execution.id);
        self.retire(&execution.id);
        settled
    }

    fn spawn(
        self: &Arc<Self>,
        definition: Arc<TaskDefinition>,
        execution: Arc<LocalExecution>,
        args: Value,
    ) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match Arc::clone(&state.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(execution_id = %execution.id, "worker pool closed");
                    state.finish(
                        &execution,
                        Outcome::Failed {
                            error: ErrorPayload::new("WorkerPoolClosed", "worker pool closed"),
                        },
                    );
                    return;
                }
            };
            if !execution.mark_running() {
                debug!(execution_id = %execution.id, "execution settled before it was scheduled");
                return;
            }

            let handler = Arc::new(LocalHandler::new(
                Arc::clone(&execution.journal),
                Arc::clone(&execution.stop),
            ));
            let control =
                TaskControl::with_stop_flag(execution.context(), handler, Arc::clone(&execution.stop));
            let body_definition = Arc::clone(&definition);
            let mut body = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                body_definition.invoke(&control, args)
            });

            let joined = match definition.config.timeout() {
                Some(limit) => match tokio::time::timeout(limit, &mut body).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            execution_id = %execution.id,
                            task = %definition.name,
                            timeout_ms = limit.as_millis() as u64,
                            "execution exceeded its timeout; requesting stop"
                        );
                        execution.raise_stop("timeout");
                        body.await
                    }
                },
                None => body.await,
            };

            let outcome = match joined {
                Ok(Ok(value)) => Outcome::Completed {
                    result: WirePayload::from_value(value),
                },
                Ok(Err(TaskFailure::Cancelled)) => Outcome::Cancelled {
                    reason: execution
                        .stop_reason
                        .lock()
                        .clone()
                        .or_else(|| Some("stopped by task".to_string())),
                },
                Ok(Err(TaskFailure::Error(payload))) => Outcome::Failed { error: payload },
                Err(join_error) => {
                    let payload = match join_error.try_into_panic() {
                        Ok(panic) => TaskFailure::from_panic(panic).into_payload(),
                        Err(join_error) => ErrorPayload::new("JoinError", join_error.to_string()),
                    };
                    Outcome::Failed { error: payload }
                }
            };
            let terminal = outcome.state();
            if state.finish(&execution, outcome) {
                info!(
                    execution_id = %execution.id,
                    task = %definition.name,
                    state = %terminal,
                    "execution finished"
                );
            } else {
                debug!(
                    execution_id = %execution.id,
                    dropped = %terminal,
                    "execution already settled; dropping outcome"
                );
            }
        });
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    async fn upsert_task(&self, definition: &Arc<TaskDefinition>) -> Result<TaskUpsert> {
        let created = match self.inner.definitions.entry(definition.name.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().version == definition.version {
                    false
                } else {
                    entry.insert(Arc::clone(definition));
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(definition));
                true
            }
        };
        if created {
            debug!(task = %definition.name, version = %definition.version, "task registered");
        }
        Ok(TaskUpsert {
            created,
            version: definition.version.clone(),
        })
    }

    async fn upsert_instance(&self, instance: &InstanceRecord) -> Result<InstanceRecord> {
        ids::validate_ownership(&instance.instance_id, &instance.session_id)?;
        let record = match self.inner.instances.entry(instance.instance_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().version != instance.version {
                    entry.get_mut().version = instance.version.clone();
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(instance.clone()).value().clone(),
        };
        Ok(record)
    }

    async fn start_execution(&self, request: StartRequest) -> Result<String> {
        ids::validate_ownership(&request.instance_id, &request.session_id)?;
        let task_name = self
            .inner
            .instances
            .get(&request.instance_id)
            .map(|entry| entry.task_name.clone())
            .ok_or_else(|| TaskError::UnknownInstance(request.instance_id.clone()))?;
        let definition = self
            .inner
            .definitions
            .get(&task_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TaskError::UnknownTask(task_name.clone()))?;
        let args = request.args.decode_value()?;

        let execution = self.inner.admit(&definition, &request)?;
        let execution_id = execution.id.clone();
        debug!(
            execution_id = %execution_id,
            instance_id = %request.instance_id,
            client_id = %execution.client_id,
            started_at = %execution.started_at,
            force = request.force,
            "execution admitted"
        );
        self.inner.spawn(definition, execution, args);
        Ok(execution_id)
    }

    async fn force_stop_execution(
        &self,
        execution_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        ids::validate_ownership(&execution.instance_id, session_id)?;
        let admission = self.inner.admission(&execution.task_name);
        let mut running = admission.lock();
        self.inner.cancel_locked(&mut running, execution_id, reason);
        Ok(())
    }

    async fn request_stop(&self, execution_id: &str, session_id: &str) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        ids::validate_ownership(&execution.instance_id, session_id)?;
        if !execution.is_settled() && execution.raise_stop("cancel requested") {
            info!(execution_id, "stop requested");
        }
        Ok(())
    }

    async fn report_progress(
        &self,
        execution_id: &str,
        progress: f64,
        status: Option<&str>,
    ) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        execution.journal.append(ExecutionEvent::Progress {
            progress: clamp_progress(progress),
            status: status.map(str::to_string),
        });
        Ok(())
    }

    async fn report_status(&self, execution_id: &str, status: &str) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        execution.journal.append(ExecutionEvent::Status {
            status: status.to_string(),
        });
        Ok(())
    }

    async fn report_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
        fields: &LogFields,
    ) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        execution.journal.append(ExecutionEvent::Log(LogRecord {
            level,
            message: message.to_string(),
            execution_id: execution.id.clone(),
            instance_id: execution.instance_id.clone(),
            task_name: execution.task_name.clone(),
            fields: fields.clone(),
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    async fn complete_execution(&self, execution_id: &str, result: WirePayload) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        self.inner
            .finish(&execution, Outcome::Completed { result });
        Ok(())
    }

    async fn fail_execution(&self, execution_id: &str, error: ErrorPayload) -> Result<()> {
        let execution = self.inner.execution(execution_id)?;
        let outcome = if error.kind == "TaskCancelled" {
            Outcome::Cancelled {
                reason: Some(error.message),
            }
        } else {
            Outcome::Failed { error }
        };
        self.inner.finish(&execution, outcome);
        Ok(())
    }

    async fn check_stop_requested(&self, execution_id: &str) -> Result<bool> {
        let execution = self.inner.execution(execution_id)?;
        Ok(execution.stop.load(Ordering::Acquire))
    }

    async fn subscribe_execution_updates(
        &self,
        execution_id: &str,
        session_id: &str,
    ) -> Result<EventStream> {
        ids::validate_session_id(session_id)?;
        let execution = self.inner.execution(execution_id)?;
        Ok(execution.journal.subscribe())
    }

    async fn cancel_instance(&self, instance_id: &str, session_id: &str) -> Result<()> {
        ids::validate_ownership(instance_id, session_id)?;
        let Some(active) = self.active_execution(instance_id) else {
            return Ok(());
        };
        let execution = self.inner.execution(&active)?;
        if execution.raise_stop("instance stopped") {
            info!(instance_id, execution_id = %active, "instance stop requested");
        }
        Ok(())
    }
}
