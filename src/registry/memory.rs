use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::InstanceRecord;
use crate::error::{ErrorPayload, Result, TaskError};
use crate::registry::protocol::{
    ExecutionRecord, RegistryReply, RegistryRequest, RegistryResponse,
};
use crate::registry::transport::{Transport, TransportError};
use crate::runtime::event::{ExecutionEvent, LogRecord, Outcome, clamp_progress};
use crate::runtime::ids;
use crate::runtime::journal::EventJournal;
use crate::runtime::state::ExecutionState;
use crate::runtime::task::TaskDescriptor;

/// A complete control plane living in process memory.
///
/// Enforces what the hosted registry enforces: idempotent upserts keyed on
/// `(name, version)` and instance id, session ownership, one live execution
/// per instance, and first-terminal-wins outcomes. Usable as a
/// [`Transport`] so the remote backend and the runner can be exercised
/// without a network.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
    mutations: AtomicUsize,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<(String, String), TaskDescriptor>,
    instances: HashMap<String, InstanceRecord>,
    executions: HashMap<String, StoredExecution>,
    active: HashMap<String, String>,
}

struct StoredExecution {
    record: ExecutionRecord,
    journal: Arc<EventJournal>,
}

impl StoredExecution {
    fn settle(&mut self, outcome: Outcome) -> bool {
        let state = outcome.state();
        if !self.journal.append(ExecutionEvent::Terminal(outcome.clone())) {
            return false;
        }
        self.record.state = state;
        self.record.finished_at = Some(Utc::now());
        self.record.outcome = Some(outcome);
        true
    }

    fn stop(&mut self, reason: &str) -> bool {
        if self.record.stop_requested {
            return false;
        }
        self.record.stop_requested = true;
        self.journal.append(ExecutionEvent::StopRequested {
            reason: Some(reason.to_string()),
        });
        true
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests that changed stored state.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.state
            .lock()
            .executions
            .get(execution_id)
            .map(|stored| stored.record.clone())
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.state.lock().instances.get(instance_id).cloned()
    }

    pub fn task_versions(&self, name: &str) -> Vec<String> {
        let mut versions: Vec<String> = self
            .state
            .lock()
            .tasks
            .keys()
            .filter(|(task, _)| task == name)
            .map(|(_, version)| version.clone())
            .collect();
        versions.sort();
        versions
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn handle(&self, request: RegistryRequest) -> Result<RegistryReply> {
        let mut state = self.state.lock();
        match request {
            RegistryRequest::UpsertTask { task } => {
                let key = (task.name.clone(), task.version.clone());
                let created = !state.tasks.contains_key(&key);
                if created {
                    debug!(task = %task.name, version = %task.version, "registry: task created");
                    state.tasks.insert(key, task.clone());
                    self.mutated();
                }
                Ok(RegistryReply::TaskUpserted {
                    created,
                    version: task.version,
                })
            }
            RegistryRequest::UpsertInstance { instance } => {
                ids::validate_ownership(&instance.instance_id, &instance.session_id)?;
                if !state.tasks.keys().any(|(name, _)| name == &instance.task_name) {
                    return Err(TaskError::UnknownTask(instance.task_name));
                }
                let stored = match state.instances.get_mut(&instance.instance_id) {
                    Some(existing) => {
                        if existing.version != instance.version {
                            existing.version = instance.version.clone();
                            self.mutated();
                        }
                        existing.clone()
                    }
                    None => {
                        state
                            .instances
                            .insert(instance.instance_id.clone(), instance.clone());
                        self.mutated();
                        instance
                    }
                };
                Ok(RegistryReply::InstanceUpserted { instance: stored })
            }
            RegistryRequest::StartExecution {
                instance_id,
                session_id,
                client_id,
                args,
                force,
            } => {
                ids::validate_ownership(&instance_id, &session_id)?;
                let instance = state
                    .instances
                    .get(&instance_id)
                    .cloned()
                    .ok_or_else(|| TaskError::UnknownInstance(instance_id.clone()))?;
                if let Some(active) = state.active.get(&instance_id).cloned() {
                    if !force {
                        return Err(TaskError::ExecutionConflict {
                            instance_id,
                            active_execution_id: active,
                        });
                    }
                    if let Some(stored) = state.executions.get_mut(&active) {
                        stored.stop("pre-empted");
                        stored.settle(Outcome::cancelled("pre-empted"));
                    }
                    state.active.remove(&instance_id);
                }

                let execution_id = ids::new_execution_id();
                let record = ExecutionRecord {
                    execution_id: execution_id.clone(),
                    instance_id: instance_id.clone(),
                    session_id,
                    client_id,
                    task_name: instance.task_name,
                    version: instance.version,
                    state: ExecutionState::Starting,
                    args,
                    progress: 0.0,
                    status: None,
                    stop_requested: false,
                    started_at: Utc::now(),
                    finished_at: None,
                    outcome: None,
                };
                state.executions.insert(
                    execution_id.clone(),
                    StoredExecution {
                        record,
                        journal: Arc::new(EventJournal::new(execution_id.as_str())),
                    },
                );
                state.active.insert(instance_id, execution_id.clone());
                self.mutated();
                Ok(RegistryReply::ExecutionStarted { execution_id })
            }
            RegistryRequest::BeginExecution { execution_id, .. } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                if stored.record.state == ExecutionState::Starting
                    && stored.journal.append(ExecutionEvent::Started)
                {
                    stored.record.state = ExecutionState::Running;
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::ForceStopExecution {
                execution_id,
                session_id,
                reason,
            } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                ids::validate_ownership(&stored.record.instance_id, &session_id)?;
                stored.stop(&reason);
                if stored.settle(Outcome::cancelled(reason)) {
                    let instance_id = stored.record.instance_id.clone();
                    release(&mut state, &instance_id, &execution_id);
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::RequestStop {
                execution_id,
                session_id,
            } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                ids::validate_ownership(&stored.record.instance_id, &session_id)?;
                if !stored.record.state.is_terminal() && stored.stop("cancel requested") {
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::ReportProgress {
                execution_id,
                progress,
                status,
            } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                let progress = clamp_progress(progress);
                if stored.journal.append(ExecutionEvent::Progress {
                    progress,
                    status: status.clone(),
                }) {
                    stored.record.progress = progress;
                    if status.is_some() {
                        stored.record.status = status;
                    }
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::ReportStatus {
                execution_id,
                status,
            } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                if stored.journal.append(ExecutionEvent::Status {
                    status: status.clone(),
                }) {
                    stored.record.status = Some(status);
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::ReportLog {
                execution_id,
                level,
                message,
                fields,
            } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                let record = LogRecord {
                    level,
                    message,
                    execution_id: execution_id.clone(),
                    instance_id: stored.record.instance_id.clone(),
                    task_name: stored.record.task_name.clone(),
                    fields,
                    timestamp: Utc::now(),
                };
                if stored.journal.append(ExecutionEvent::Log(record)) {
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::CompleteExecution {
                execution_id,
                result,
            } => {
                self.settle(&mut state, &execution_id, Outcome::Completed { result })?;
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::FailExecution {
                execution_id,
                error,
            } => {
                self.settle(&mut state, &execution_id, failure_outcome(error))?;
                Ok(RegistryReply::Ack)
            }
            RegistryRequest::CheckStopRequested { execution_id } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                Ok(RegistryReply::StopRequested {
                    requested: stored.record.stop_requested,
                })
            }
            RegistryRequest::GetActiveExecution { instance_id } => {
                let execution = state
                    .active
                    .get(&instance_id)
                    .and_then(|id| state.executions.get(id))
                    .map(|stored| stored.record.clone());
                Ok(RegistryReply::ActiveExecution { execution })
            }
            RegistryRequest::PollEvents {
                execution_id,
                cursor,
            } => {
                let stored = execution_mut(&mut state, &execution_id)?;
                let events = stored.journal.since(cursor);
                let cursor = cursor + events.len();
                let finished = stored.journal.is_closed() && cursor >= stored.journal.len();
                Ok(RegistryReply::Events {
                    events,
                    cursor,
                    finished,
                })
            }
            RegistryRequest::CancelInstance {
                instance_id,
                session_id,
            } => {
                ids::validate_ownership(&instance_id, &session_id)?;
                if let Some(active) = state.active.get(&instance_id).cloned()
                    && let Some(stored) = state.executions.get_mut(&active)
                    && stored.stop("instance stopped")
                {
                    self.mutated();
                }
                Ok(RegistryReply::Ack)
            }
        }
    }

    /// Duplicate terminal reports are accepted and change nothing.
    fn settle(&self, state: &mut RegistryState, execution_id: &str, outcome: Outcome) -> Result<()> {
        let stored = execution_mut(state, execution_id)?;
        if stored.settle(outcome) {
            let instance_id = stored.record.instance_id.clone();
            release(state, &instance_id, execution_id);
            self.mutated();
        } else {
            debug!(execution_id, "registry: duplicate terminal report ignored");
        }
        Ok(())
    }
}

fn execution_mut<'a>(
    state: &'a mut RegistryState,
    execution_id: &str,
) -> Result<&'a mut StoredExecution> {
    state
        .executions
        .get_mut(execution_id)
        .ok_or_else(|| TaskError::UnknownExecution(execution_id.to_string()))
}

fn release(state: &mut RegistryState, instance_id: &str, execution_id: &str) {
    if state.active.get(instance_id).map(String::as_str) == Some(execution_id) {
        state.active.remove(instance_id);
    }
}

/// A reported `TaskCancelled` failure settles the execution as `CANCELED`.
fn failure_outcome(error: ErrorPayload) -> Outcome {
    if error.kind == "TaskCancelled" {
        Outcome::Cancelled {
            reason: Some(error.message),
        }
    } else {
        Outcome::Failed { error }
    }
}

#[async_trait]
impl Transport for InMemoryRegistry {
    async fn send(&self, request: RegistryRequest) -> Result<RegistryResponse, TransportError> {
        Ok(match self.handle(request) {
            Ok(reply) => RegistryResponse::Ok(reply),
            Err(error) => RegistryResponse::Error(error.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::TaskConfig;
    use crate::wire::WirePayload;
    use serde_json::json;

    fn descriptor(version: &str) -> TaskDescriptor {
        TaskDescriptor {
            name: "add".into(),
            version: version.into(),
            function_name: "add".into(),
            module: "tests".into(),
            doc: None,
            parameters: Vec::new(),
            config: TaskConfig::default(),
            expects_task_control: false,
        }
    }

    fn registered(registry: &InMemoryRegistry) -> String {
        registry
            .handle(RegistryRequest::UpsertTask {
                task: descriptor("v1"),
            })
            .unwrap();
        registry
            .handle(RegistryRequest::UpsertInstance {
                instance: InstanceRecord {
                    instance_id: "s:add:1".into(),
                    session_id: "s".into(),
                    task_name: "add".into(),
                    version: "v1".into(),
                    created_at: Utc::now(),
                },
            })
            .unwrap();
        let RegistryReply::ExecutionStarted { execution_id } = registry
            .handle(RegistryRequest::StartExecution {
                instance_id: "s:add:1".into(),
                session_id: "s".into(),
                client_id: "c".into(),
                args: WirePayload::from_value(json!([1, 2])),
                force: false,
            })
            .unwrap()
        else {
            panic!("expected a started execution");
        };
        execution_id
    }

    #[test]
    fn second_upsert_changes_nothing() {
        let registry = InMemoryRegistry::new();
        let first = registry
            .handle(RegistryRequest::UpsertTask {
                task: descriptor("v1"),
            })
            .unwrap();
        let before = registry.mutation_count();
        let second = registry
            .handle(RegistryRequest::UpsertTask {
                task: descriptor("v1"),
            })
            .unwrap();
        assert_eq!(registry.mutation_count(), before);
        assert_eq!(
            first,
            RegistryReply::TaskUpserted {
                created: true,
                version: "v1".into()
            }
        );
        assert_eq!(
            second,
            RegistryReply::TaskUpserted {
                created: false,
                version: "v1".into()
            }
        );
    }

    #[test]
    fn duplicate_terminal_reports_are_ignored() {
        let registry = InMemoryRegistry::new();
        let execution_id = registry_run(&registry);
        let before = registry.mutation_count();
        registry
            .handle(RegistryRequest::FailExecution {
                execution_id: execution_id.clone(),
                error: ErrorPayload::new("Late", "too late"),
            })
            .unwrap();
        assert_eq!(registry.mutation_count(), before);
        let record = registry.execution(&execution_id).unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
    }

    fn registry_run(registry: &InMemoryRegistry) -> String {
        let execution_id = registered(registry);
        registry
            .handle(RegistryRequest::CompleteExecution {
                execution_id: execution_id.clone(),
                result: WirePayload::from_value(json!(3)),
            })
            .unwrap();
        execution_id
    }

    #[test]
    fn live_execution_blocks_a_second_start() {
        let registry = InMemoryRegistry::new();
        let active = registered(&registry);
        let err = registry
            .handle(RegistryRequest::StartExecution {
                instance_id: "s:add:1".into(),
                session_id: "s".into(),
                client_id: "c".into(),
                args: WirePayload::from_value(json!([3, 4])),
                force: false,
            })
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::ExecutionConflict {
                instance_id: "s:add:1".into(),
                active_execution_id: active.clone()
            }
        );

        registry
            .handle(RegistryRequest::StartExecution {
                instance_id: "s:add:1".into(),
                session_id: "s".into(),
                client_id: "c".into(),
                args: WirePayload::from_value(json!([3, 4])),
                force: true,
            })
            .unwrap();
        assert_eq!(
            registry.execution(&active).unwrap().state,
            ExecutionState::Cancelled
        );
    }

    #[test]
    fn foreign_sessions_are_refused() {
        let registry = InMemoryRegistry::new();
        let execution_id = registered(&registry);
        let err = registry
            .handle(RegistryRequest::RequestStop {
                execution_id,
                session_id: "intruder".into(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), "SessionOwnership");
    }
}
