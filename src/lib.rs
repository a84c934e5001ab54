//! Distributed task execution runtime.
//!
//! Application code declares functions as tasks, materializes per-session
//! instances of them and starts executions on a backend: either the
//! in-process worker pool ([`backend::LocalBackend`]) or an external control
//! plane reached through the registry protocol ([`backend::RemoteBackend`]).
//! Running tasks talk back through a [`TaskControl`]; callers observe them
//! through a [`TaskFuture`].

pub mod backend;
pub mod config;
pub mod error;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod version;
pub mod wire;

pub use backend::{Backend, LocalBackend, RemoteBackend};
pub use config::Config;
pub use error::{ErrorPayload, Result, TaskCancelled, TaskError, TaskFailure};
pub use registry::{InMemoryRegistry, RegistryClient};
pub use runner::{RunOutcome, RunRequest, Runner, TaskCatalog};
pub use runtime::control::{ControlContext, TaskControl};
pub use runtime::event::{ExecutionEvent, LogLevel, LogRecord, Outcome};
pub use runtime::future::{FutureStatus, TaskFuture};
pub use runtime::session::{InstanceSnapshot, Session, SessionGuard};
pub use runtime::state::{ExecutionState, InstanceState};
pub use runtime::task::{
    StartOptions, Task, TaskBuilder, TaskConfig, TaskDefinition, TaskDescriptor, TaskInstance,
    task, task_with_control,
};
pub use wire::WirePayload;
