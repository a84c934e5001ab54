use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend::{Backend, InstanceRecord, StartRequest};
use crate::error::{Result, TaskError, TaskFailure};
use crate::runtime::control::TaskControl;
use crate::runtime::future::{FutureCell, TaskFuture, spawn_pump};
use crate::runtime::session::{InstanceSnapshot, Session};
use crate::runtime::state::InstanceState;
use crate::version::{VersionInputs, resolve_version};
use crate::wire::WirePayload;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Default as a JSON literal.
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Concurrent executions allowed per definition. Always at least 1.
    pub max_parallel: usize,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            size: None,
            timeout_ms: None,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Type-erased task body: JSON arguments in, JSON result out.
pub type TaskBody = Arc<dyn Fn(&TaskControl, Value) -> Result<Value, TaskFailure> + Send + Sync>;

/// An immutable, named callable plus everything that identifies it.
pub struct TaskDefinition {
    pub name: String,
    pub version: String,
    pub function_name: String,
    pub module: String,
    pub doc: Option<String>,
    pub parameters: Vec<Parameter>,
    pub config: TaskConfig,
    pub expects_task_control: bool,
    body: TaskBody,
}

impl TaskDefinition {
    pub fn invoke(&self, control: &TaskControl, args: Value) -> Result<Value, TaskFailure> {
        (self.body)(control, args)
    }

    /// What the registry stores: the definition without its body.
    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            function_name: self.function_name.clone(),
            module: self.module.clone(),
            doc: self.doc.clone(),
            parameters: self.parameters.clone(),
            config: self.config.clone(),
            expects_task_control: self.expects_task_control,
        }
    }

    /// `add(a: i64, b: i64 = 3)`
    pub fn signature(&self) -> String {
        let mut params: Vec<String> = Vec::with_capacity(self.parameters.len() + 1);
        if self.expects_task_control {
            params.push("control: &TaskControl".to_string());
        }
        for p in &self.parameters {
            match &p.default {
                Some(default) => params.push(format!("{}: {} = {}", p.name, p.type_name, default)),
                None => params.push(format!("{}: {}", p.name, p.type_name)),
            }
        }
        format!("{}({})", self.function_name, params.join(", "))
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("module", &self.module)
            .field("config", &self.config)
            .field("expects_task_control", &self.expects_task_control)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub version: String,
    pub function_name: String,
    pub module: String,
    #[serde(default)]
    pub doc: Option<String>,
    pub parameters: Vec<Parameter>,
    pub config: TaskConfig,
    pub expects_task_control: bool,
}

/// Declares a task.
///
/// ```
/// use numerous_tasks::TaskBuilder;
///
/// let add = TaskBuilder::new("add")
///     .param::<i64>("a")
///     .param::<i64>("b")
///     .build(|(a, b): (i64, i64)| Ok(a + b))
///     .unwrap();
/// assert!(add.version().starts_with("local-"));
/// ```
pub struct TaskBuilder {
    name: String,
    function_name: Option<String>,
    module: String,
    doc: Option<String>,
    version: Option<String>,
    config: TaskConfig,
    parameters: Vec<Parameter>,
}

impl TaskBuilder {
    /// The module defaults to the caller's source file.
    #[track_caller]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            function_name: None,
            module: Location::caller().file().to_string(),
            doc: None,
            version: None,
            config: TaskConfig::default(),
            parameters: Vec::new(),
        }
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = module.to_string();
        self
    }

    pub fn function_name(mut self, function_name: &str) -> Self {
        self.function_name = Some(function_name.to_string());
        self
    }

    pub fn doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    /// Pins the version instead of hashing the definition.
    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.config.max_parallel = max_parallel;
        self
    }

    pub fn size(mut self, size: &str) -> Self {
        self.config.size = Some(size.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some(timeout.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn param<T: ?Sized>(mut self, name: &str) -> Self {
        self.parameters.push(Parameter {
            name: name.to_string(),
            type_name: type_name::<T>().to_string(),
            default: None,
        });
        self
    }

    pub fn param_with_default<T: ?Sized>(mut self, name: &str, default: impl Into<Value>) -> Self {
        self.parameters.push(Parameter {
            name: name.to_string(),
            type_name: type_name::<T>().to_string(),
            default: Some(default.into().to_string()),
        });
        self
    }

    pub fn build<A, R, F>(self, body: F) -> Result<Task<A, R>>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Result<R, TaskFailure> + Send + Sync + 'static,
    {
        self.finish(false, erase(move |_: &TaskControl, args: A| body(args)))
    }

    /// Like [`build`](Self::build), but the body receives the execution's
    /// [`TaskControl`].
    pub fn build_with_control<A, R, F>(self, body: F) -> Result<Task<A, R>>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&TaskControl, A) -> Result<R, TaskFailure> + Send + Sync + 'static,
    {
        self.finish(true, erase(body))
    }

    fn finish<A, R>(self, expects_task_control: bool, body: TaskBody) -> Result<Task<A, R>> {
        if self.name.is_empty() {
            return Err(TaskError::InvalidConfig("task name must not be empty".to_string()));
        }
        if self.config.max_parallel == 0 {
            return Err(TaskError::InvalidConfig(format!(
                "task {} has max_parallel=0; it must be at least 1",
                self.name
            )));
        }

        let function_name = self.function_name.unwrap_or_else(|| self.name.clone());
        let parameters = if self.parameters.is_empty() {
            vec![Parameter {
                name: "args".to_string(),
                type_name: type_name::<A>().to_string(),
                default: None,
            }]
        } else {
            self.parameters
        };
        let version = resolve_version(
            self.version.as_deref(),
            VersionInputs {
                function_name: &function_name,
                module: &self.module,
                doc: self.doc.as_deref(),
                parameters: &parameters,
                config: &self.config,
            },
        )?;

        Ok(Task {
            definition: Arc::new(TaskDefinition {
                name: self.name,
                version,
                function_name,
                module: self.module,
                doc: self.doc,
                parameters,
                config: self.config,
                expects_task_control,
                body,
            }),
            _types: PhantomData,
        })
    }
}

fn erase<A, R, F>(body: F) -> TaskBody
where
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(&TaskControl, A) -> Result<R, TaskFailure> + Send + Sync + 'static,
{
    Arc::new(move |control: &TaskControl, args: Value| {
        let args: A = serde_json::from_value(args)
            .map_err(|e| TaskFailure::new("ArgumentError", e.to_string()))?;
        let result = body(control, args)?;
        serde_json::to_value(result).map_err(|e| TaskFailure::new("SerializationError", e.to_string()))
    })
}

#[track_caller]
pub fn task<A, R, F>(name: &str, body: F) -> Result<Task<A, R>>
where
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(A) -> Result<R, TaskFailure> + Send + Sync + 'static,
{
    TaskBuilder::new(name).build(body)
}

#[track_caller]
pub fn task_with_control<A, R, F>(name: &str, body: F) -> Result<Task<A, R>>
where
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(&TaskControl, A) -> Result<R, TaskFailure> + Send + Sync + 'static,
{
    TaskBuilder::new(name).build_with_control(body)
}

/// Maps how a body ended onto the caller-facing error.
pub(crate) fn failure_to_error(failure: TaskFailure, execution_id: &str) -> TaskError {
    match failure {
        TaskFailure::Cancelled => TaskError::TaskCancelled {
            execution_id: execution_id.to_string(),
            reason: None,
        },
        TaskFailure::Error(payload) => TaskError::TaskExecution(payload),
    }
}

/// A typed task handle. `A` is the argument type (a struct or tuple), `R`
/// the result type.
pub struct Task<A, R> {
    definition: Arc<TaskDefinition>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Task<A, R> {
    fn clone(&self) -> Self {
        Self {
            definition: Arc::clone(&self.definition),
            _types: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for Task<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.definition).finish()
    }
}

impl Task<Value, Value> {
    /// Untyped handle over an already-built definition.
    pub fn from_definition(definition: Arc<TaskDefinition>) -> Self {
        Self {
            definition,
            _types: PhantomData,
        }
    }
}

impl<A, R> Task<A, R>
where
    A: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn version(&self) -> &str {
        &self.definition.version
    }

    pub fn config(&self) -> &TaskConfig {
        &self.definition.config
    }

    pub fn expects_task_control(&self) -> bool {
        self.definition.expects_task_control
    }

    pub fn signature(&self) -> String {
        self.definition.signature()
    }

    pub fn definition(&self) -> &Arc<TaskDefinition> {
        &self.definition
    }

    /// New unstarted instance under the current session.
    pub fn instance(&self) -> Result<TaskInstance<A, R>> {
        let session = Session::current().ok_or(TaskError::NoSession)?;
        Ok(self.instance_in(&session))
    }

    pub fn instance_in(&self, session: &Session) -> TaskInstance<A, R> {
        let shared = Arc::new(InstanceShared {
            id: session.next_instance_id(&self.definition.name),
            session_id: session.id().to_string(),
            definition: Arc::clone(&self.definition),
            backend: Arc::clone(session.backend()),
            created_at: Utc::now(),
            state: Mutex::new(InstanceState::Pending),
            registered: OnceCell::new(),
            current: Mutex::new(None),
        });
        session.track(&shared);
        TaskInstance {
            shared,
            _types: PhantomData,
        }
    }

    /// Direct call. Inside a session this runs through a throwaway instance
    /// and is only allowed for `max_parallel = 1`; outside one it runs inline.
    pub async fn call(&self, args: A) -> Result<R> {
        let Some(session) = Session::current() else {
            return self.call_inline(args);
        };
        warn!(
            task = %self.definition.name,
            session_id = %session.id(),
            "task called directly inside a session; use instance().start() to track its execution"
        );
        if self.definition.config.max_parallel != 1 {
            return Err(TaskError::DirectCallNotSupported {
                task_name: self.definition.name.clone(),
                max_parallel: self.definition.config.max_parallel,
            });
        }
        let instance = self.instance_in(&session);
        instance.start(args).await?.result(None).await
    }

    /// Runs the body on the current thread with a control that reports
    /// nowhere.
    pub fn call_inline(&self, args: A) -> Result<R> {
        let control = TaskControl::detached(&self.definition.name);
        let value = serde_json::to_value(&args)?;
        let result = self
            .definition
            .invoke(&control, value)
            .map_err(|failure| failure_to_error(failure, control.execution_id()))?;
        Ok(serde_json::from_value(result)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Pre-empt a live execution (or, locally, the oldest one when the
    /// parallel cap is reached) instead of failing.
    pub force: bool,
}

impl StartOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

pub(crate) struct InstanceShared {
    id: String,
    session_id: String,
    definition: Arc<TaskDefinition>,
    backend: Arc<dyn Backend>,
    created_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    registered: OnceCell<InstanceRecord>,
    current: Mutex<Option<Arc<FutureCell>>>,
}

impl InstanceShared {
    pub(crate) fn task_name(&self) -> &str {
        &self.definition.name
    }

    pub(crate) fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|cell| !cell.status().is_terminal())
    }

    fn state(&self) -> InstanceState {
        match self.current.lock().as_ref() {
            Some(cell) => cell.status().into(),
            None => *self.state.lock(),
        }
    }

    pub(crate) fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.id.clone(),
            task_name: self.definition.name.clone(),
            state: self.state(),
            execution_id: self
                .current
                .lock()
                .as_ref()
                .map(|cell| cell.execution_id().to_string()),
        }
    }
}

/// A session-scoped reservation of a task. Runs at most one execution at a
/// time and may be started again once the previous execution settled.
pub struct TaskInstance<A, R> {
    shared: Arc<InstanceShared>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for TaskInstance<A, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _types: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for TaskInstance<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInstance")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<A, R> TaskInstance<A, R>
where
    A: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned,
{
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn task_name(&self) -> &str {
        &self.shared.definition.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    pub fn state(&self) -> InstanceState {
        self.shared.state()
    }

    /// Future of the most recent execution.
    pub fn current_future(&self) -> Option<TaskFuture<R>> {
        self.shared
            .current
            .lock()
            .as_ref()
            .map(|cell| TaskFuture::new(Arc::clone(cell)))
    }

    pub async fn start(&self, args: A) -> Result<TaskFuture<R>> {
        self.start_with(args, StartOptions::default()).await
    }

    pub async fn start_forced(&self, args: A) -> Result<TaskFuture<R>> {
        self.start_with(args, StartOptions::forced()).await
    }

    /// Registers on first use, then starts a new execution. Registration and
    /// admission errors are returned here; everything after that reaches the
    /// caller through the future.
    pub async fn start_with(&self, args: A, options: StartOptions) -> Result<TaskFuture<R>> {
        let caller = self.caller_session();
        let args = WirePayload::encode(&args)?;
        self.ensure_registered().await?;

        let backend = &self.shared.backend;
        let request = StartRequest {
            instance_id: self.shared.id.clone(),
            session_id: caller.clone(),
            client_id: backend.client_id().to_string(),
            args,
            force: false,
        };
        let execution_id = match backend.start_execution(request.clone()).await {
            Ok(execution_id) => execution_id,
            Err(TaskError::ExecutionConflict {
                active_execution_id,
                ..
            }) if options.force => {
                info!(
                    instance_id = %self.shared.id,
                    active_execution_id = %active_execution_id,
                    "pre-empting active execution"
                );
                backend
                    .force_stop_execution(&active_execution_id, &caller, "pre-empted")
                    .await?;
                backend
                    .start_execution(StartRequest {
                        force: true,
                        ..request
                    })
                    .await?
            }
            Err(TaskError::MaxInstancesReached { .. }) if options.force => {
                backend
                    .start_execution(StartRequest {
                        force: true,
                        ..request
                    })
                    .await?
            }
            Err(err) => return Err(err),
        };

        let cell = FutureCell::new(
            execution_id.as_str(),
            self.shared.id.as_str(),
            caller.as_str(),
            Arc::clone(backend),
        );
        let events = backend
            .subscribe_execution_updates(&execution_id, &caller)
            .await?;
        cell.pin_owner(Arc::clone(&self.shared));
        spawn_pump(Arc::clone(&cell), events);
        *self.shared.current.lock() = Some(Arc::clone(&cell));
        *self.shared.state.lock() = InstanceState::Running;

        info!(
            task = %self.shared.definition.name,
            instance_id = %self.shared.id,
            execution_id = %execution_id,
            backend = backend.name(),
            "execution started"
        );
        Ok(TaskFuture::new(cell))
    }

    /// Requests a cooperative stop of the live execution, if any.
    pub async fn stop(&self) -> Result<()> {
        let caller = self.caller_session();
        self.shared
            .backend
            .cancel_instance(&self.shared.id, &caller)
            .await
    }

    fn caller_session(&self) -> String {
        Session::current()
            .map(|session| session.id().to_string())
            .unwrap_or_else(|| self.shared.session_id.clone())
    }

    async fn ensure_registered(&self) -> Result<&InstanceRecord> {
        let shared = &self.shared;
        shared
            .registered
            .get_or_try_init(|| async {
                let upsert = shared.backend.upsert_task(&shared.definition).await?;
                let record = InstanceRecord {
                    instance_id: shared.id.clone(),
                    session_id: shared.session_id.clone(),
                    task_name: shared.definition.name.clone(),
                    version: upsert.version,
                    created_at: shared.created_at,
                };
                let record = shared.backend.upsert_instance(&record).await?;
                {
                    let mut state = shared.state.lock();
                    if *state == InstanceState::Pending {
                        *state = InstanceState::Ready;
                    }
                }
                Ok::<_, TaskError>(record)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err = TaskBuilder::new("t")
            .max_parallel(0)
            .build(|x: i64| Ok(x))
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidConfig");
    }

    #[test]
    fn explicit_versions_cannot_look_local() {
        assert!(TaskBuilder::new("t")
            .version("local-00000000")
            .build(|x: i64| Ok(x))
            .is_err());
        let pinned = TaskBuilder::new("t").version("v2").build(|x: i64| Ok(x)).unwrap();
        assert_eq!(pinned.version(), "v2");
    }

    #[test]
    fn signature_lists_parameters_and_control() {
        let t = TaskBuilder::new("add")
            .param::<i64>("a")
            .param_with_default::<i64>("b", 3)
            .build_with_control(|_: &TaskControl, args: AddArgs| Ok(args.a + args.b))
            .unwrap();
        assert!(t.expects_task_control());
        assert_eq!(t.signature(), "add(control: &TaskControl, a: i64, b: i64 = 3)");
    }

    #[test]
    fn inline_calls_decode_arguments() {
        let add = task("add", |args: AddArgs| Ok(args.a + args.b)).unwrap();
        assert_eq!(add.call_inline(AddArgs { a: 2, b: 3 }).unwrap(), 5);

        let strict = task("strict", |n: u8| Ok(n)).unwrap();
        let definition = strict.definition();
        let control = TaskControl::detached("strict");
        let failure = definition.invoke(&control, Value::from(-1)).unwrap_err();
        assert_eq!(failure.into_payload().kind, "ArgumentError");
    }

    #[test]
    fn instance_requires_a_session() {
        let add = task("add", |args: AddArgs| Ok(args.a + args.b)).unwrap();
        assert_eq!(add.instance().unwrap_err(), TaskError::NoSession);
    }
}
