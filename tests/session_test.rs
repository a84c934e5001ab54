use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use numerous_tasks::{
    FutureStatus, InstanceState, LocalBackend, Session, TaskBuilder, TaskError, TaskFailure,
};

fn session(name: &str) -> Session {
    Session::new(name, Arc::new(LocalBackend::with_workers(4)))
}

#[test]
fn test_instances_require_a_session() -> Result<()> {
    let noop = TaskBuilder::new("noop").build(|_: ()| Ok::<_, TaskFailure>(()))?;
    assert!(matches!(noop.instance(), Err(TaskError::NoSession)));

    let outer = session("outer");
    let inner = session("inner");
    let _outer_guard = outer.enter()?;
    {
        let _inner_guard = inner.enter()?;
        assert_eq!(inner.parent_id().as_deref(), Some(outer.id()));
        let instance = noop.instance()?;
        assert!(instance.id().starts_with(&format!("{}:noop:", inner.id())));
    }
    let instance = noop.instance()?;
    assert_eq!(instance.session_id(), outer.id());
    assert!(matches!(outer.enter(), Err(TaskError::SessionReentry { .. })));
    Ok(())
}

#[test]
fn test_instance_ids_increase_within_a_session() -> Result<()> {
    let noop = TaskBuilder::new("noop").build(|_: ()| Ok::<_, TaskFailure>(()))?;
    let s = session("ticks");
    let first = noop.instance_in(&s);
    let second = noop.instance_in(&s);
    assert_eq!(first.id(), format!("{}:noop:1", s.id()));
    assert_eq!(second.id(), format!("{}:noop:2", s.id()));
    assert_eq!(s.tasks().len(), 2);

    drop(first);
    let remaining = s.tasks();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].instance_id, second.id());
    assert_eq!(remaining[0].state, InstanceState::Pending);
    Ok(())
}

#[tokio::test]
async fn test_leaving_a_session_does_not_cancel_its_executions() -> Result<()> {
    let nap = TaskBuilder::new("nap").build(|ms: u64| {
        thread::sleep(Duration::from_millis(ms));
        Ok::<_, TaskFailure>(ms)
    })?;

    let s = session("leave");
    let instance = {
        let _guard = s.enter()?;
        nap.instance()?
    };
    let future = {
        let _guard = s.enter()?;
        instance.start(100).await?
    };
    assert!(!s.is_active());
    assert_eq!(future.result(Some(Duration::from_secs(5))).await?, 100);
    assert_eq!(future.status(), FutureStatus::Completed);

    let snapshot = s.tasks();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].state, InstanceState::Completed);
    assert_eq!(snapshot[0].execution_id.as_deref(), Some(future.execution_id()));
    Ok(())
}
