use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{self, Backend};
use crate::config::Config;
use crate::error::{Result, TaskError};
use crate::runtime::ids;
use crate::runtime::state::InstanceState;
use crate::runtime::task::InstanceShared;

thread_local! {
    static SESSION_STACK: RefCell<Vec<Session>> = const { RefCell::new(Vec::new()) };
}

/// Scoping container for task instances. Every instance id created under a
/// session starts with its id, and backends check that prefix on every
/// mutation.
///
/// Sessions become current through [`enter`](Session::enter); the returned
/// guard pops the session when dropped. Leaving a session does not cancel
/// anything it started.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    name: String,
    parent: Mutex<Option<String>>,
    active: AtomicBool,
    backend: Arc<dyn Backend>,
    ticks: AtomicU64,
    instances: Mutex<Vec<Weak<InstanceShared>>>,
}

/// Point-in-time view of one instance tracked by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub task_name: String,
    pub state: InstanceState,
    pub execution_id: Option<String>,
}

impl Session {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self::build(ids::new_session_id(), name.into(), backend)
    }

    /// Uses a caller-chosen id, e.g. to re-attach to instances registered by
    /// an earlier process.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        let id = id.into();
        ids::validate_session_id(&id)?;
        Ok(Self::build(id, name.into(), backend))
    }

    /// Picks the backend from the process environment.
    pub fn from_env(name: impl Into<String>) -> Result<Self> {
        let config = Config::from_env()?;
        Ok(Self::new(name, backend::from_config(&config)?))
    }

    fn build(id: String, name: String, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                name,
                parent: Mutex::new(None),
                active: AtomicBool::new(false),
                backend,
                ticks: AtomicU64::new(0),
                instances: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// The session that was current when this one was entered.
    pub fn parent_id(&self) -> Option<String> {
        self.inner.parent.lock().clone()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Makes this the current session on this thread until the guard drops.
    pub fn enter(&self) -> Result<SessionGuard> {
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TaskError::SessionReentry {
                session_id: self.inner.id.clone(),
            });
        }
        let parent = Self::current().map(|s| s.id().to_string());
        *self.inner.parent.lock() = parent.clone();
        SESSION_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        info!(
            session_id = %self.inner.id,
            name = %self.inner.name,
            parent = ?parent,
            backend = self.inner.backend.name(),
            "entered session"
        );
        Ok(SessionGuard {
            session: self.clone(),
            _not_send: PhantomData,
        })
    }

    /// Runs `f` with this session current.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.enter()?;
        Ok(f())
    }

    /// The innermost active session on this thread.
    pub fn current() -> Option<Session> {
        SESSION_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Instances created under this session that are still referenced, by a
    /// handle or by an execution that has not settled.
    pub fn tasks(&self) -> Vec<InstanceSnapshot> {
        self.live_instances()
            .iter()
            .map(|instance| instance.snapshot())
            .collect()
    }

    /// Non-terminal executions of the named task started from this session.
    pub fn running_count(&self, task_name: &str) -> usize {
        self.live_instances()
            .iter()
            .filter(|instance| instance.task_name() == task_name && instance.is_running())
            .count()
    }

    pub fn validate_ownership(&self, instance_id: &str) -> Result<()> {
        ids::validate_ownership(instance_id, &self.inner.id)
    }

    pub(crate) fn next_instance_id(&self, task_name: &str) -> String {
        let tick = self.inner.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        ids::instance_id(&self.inner.id, task_name, tick)
    }

    pub(crate) fn track(&self, instance: &Arc<InstanceShared>) {
        let mut instances = self.inner.instances.lock();
        instances.retain(|weak| weak.strong_count() > 0);
        instances.push(Arc::downgrade(instance));
    }

    fn live_instances(&self) -> Vec<Arc<InstanceShared>> {
        let mut instances = self.inner.instances.lock();
        instances.retain(|weak| weak.strong_count() > 0);
        instances.iter().filter_map(Weak::upgrade).collect()
    }

    fn leave(&self) {
        SESSION_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|s| Arc::ptr_eq(&s.inner, &self.inner)) {
                stack.remove(pos);
            }
        });
        self.inner.active.store(false, Ordering::Release);
        debug!(session_id = %self.inner.id, "left session");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Keeps a session current. Bound to the thread that entered it.
#[derive(Debug)]
#[must_use = "the session is left as soon as the guard is dropped"]
pub struct SessionGuard {
    session: Session,
    _not_send: PhantomData<*const ()>,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    fn session(name: &str) -> Session {
        Session::new(name, Arc::new(LocalBackend::new()))
    }

    #[test]
    fn entering_pushes_and_dropping_pops() {
        let outer = session("outer");
        let inner = session("inner");
        assert!(Session::current().is_none());

        let outer_guard = outer.enter().unwrap();
        {
            let _inner_guard = inner.enter().unwrap();
            assert_eq!(Session::current().unwrap().id(), inner.id());
            assert_eq!(inner.parent_id().as_deref(), Some(outer.id()));
        }
        assert_eq!(Session::current().unwrap().id(), outer.id());
        assert!(!inner.is_active());
        drop(outer_guard);
        assert!(Session::current().is_none());
    }

    #[test]
    fn reentry_is_rejected() {
        let s = session("s");
        let _guard = s.enter().unwrap();
        let err = s.enter().unwrap_err();
        assert_eq!(
            err,
            TaskError::SessionReentry {
                session_id: s.id().to_string()
            }
        );
    }

    #[test]
    fn instance_ids_are_predictable() {
        let s = Session::with_id("fixed", "s", Arc::new(LocalBackend::new())).unwrap();
        assert_eq!(s.next_instance_id("add"), "fixed:add:1");
        assert_eq!(s.next_instance_id("add"), "fixed:add:2");
        assert!(s.validate_ownership("fixed:add:1").is_ok());
        assert!(s.validate_ownership("other:add:1").is_err());
        assert!(Session::with_id("a:b", "bad", Arc::new(LocalBackend::new())).is_err());
    }
}
