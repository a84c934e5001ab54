use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use numerous_tasks::registry::{
    FnTransport, RegistryRequest, RetryPolicy, Transport, TransportError,
};
use numerous_tasks::{
    ExecutionState, FutureStatus, InMemoryRegistry, RegistryClient, RemoteBackend, RunOutcome,
    RunRequest, Runner, Session, StartOptions, Task, TaskBuilder, TaskCatalog, TaskError,
    TaskFailure, WirePayload,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Serialize, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

struct Plane {
    registry: Arc<InMemoryRegistry>,
    client: RegistryClient,
}

impl Plane {
    fn new() -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        let client = RegistryClient::new(registry.clone()).with_retry(RetryPolicy::none());
        Self { registry, client }
    }

    fn session(&self, name: &str) -> Session {
        let backend = RemoteBackend::new(self.client.clone()).with_poll_interval(Duration::from_millis(5));
        Session::new(name, Arc::new(backend))
    }

    fn runner(&self, catalog: TaskCatalog) -> Runner {
        Runner::new(catalog)
            .with_client(self.client.clone())
            .with_stop_poll_interval(Duration::from_millis(10))
    }
}

fn add_task() -> Result<Task<AddArgs, i64>> {
    Ok(TaskBuilder::new("add").build(|args: AddArgs| Ok::<_, TaskFailure>(args.a + args.b))?)
}

fn run_request(function_name: &str, instance_id: &str) -> RunRequest {
    RunRequest {
        function_name: function_name.to_string(),
        instance_id: Some(instance_id.to_string()),
        overrides: Map::new(),
    }
}

#[tokio::test]
async fn test_remote_add_runs_through_the_runner() -> Result<()> {
    let plane = Plane::new();
    let add = add_task()?;
    let mut catalog = TaskCatalog::new();
    catalog.register(&add);
    let runner = plane.runner(catalog);

    let session = plane.session("remote-add");
    let _guard = session.enter()?;
    let instance = add.instance()?;
    let future = instance.start(AddArgs { a: 2, b: 3 }).await?;

    let record = plane.registry.execution(future.execution_id()).unwrap();
    assert_eq!(record.state, ExecutionState::Starting);
    assert_eq!(record.args.decode_value()?, json!({"a": 2, "b": 3}));

    let (outcome, result) = tokio::join!(
        runner.run(run_request("add", instance.id())),
        future.result(Some(Duration::from_secs(5)))
    );
    assert_eq!(outcome?, RunOutcome::Completed(json!(5)));
    assert_eq!(result?, 5);
    assert!(future.history().contains(&FutureStatus::Running));

    let record = plane.registry.execution(future.execution_id()).unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert!(record.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_remote_conflict_and_force() -> Result<()> {
    let plane = Plane::new();
    let add = add_task()?;
    let session = plane.session("remote-force");
    let _guard = session.enter()?;
    let instance = add.instance()?;

    let first = instance.start(AddArgs { a: 1, b: 1 }).await?;
    let err = instance.start(AddArgs { a: 2, b: 2 }).await.unwrap_err();
    assert_eq!(err.kind(), "ExecutionConflict");

    let second = instance
        .start_with(AddArgs { a: 2, b: 2 }, StartOptions::forced())
        .await?;
    assert_eq!(
        first.wait(Some(Duration::from_secs(2))).await?,
        FutureStatus::Cancelled
    );
    assert_eq!(
        plane.registry.execution(first.execution_id()).unwrap().state,
        ExecutionState::Cancelled
    );

    let mut catalog = TaskCatalog::new();
    catalog.register(&add);
    let runner = plane.runner(catalog);
    let (outcome, result) = tokio::join!(
        runner.run(run_request("add", instance.id())),
        second.result(Some(Duration::from_secs(5)))
    );
    assert_eq!(outcome?.exit_code(), 0);
    assert_eq!(result?, 4);
    Ok(())
}

#[tokio::test]
async fn test_remote_cancel_reaches_the_runner() -> Result<()> {
    let plane = Plane::new();
    let countdown = TaskBuilder::new("countdown").build_with_control(|control, from: u32| {
        for remaining in (0..from).rev() {
            control.check_cancelled()?;
            control.update_status(&format!("{remaining} left"));
            thread::sleep(Duration::from_millis(20));
        }
        Ok::<_, TaskFailure>(from)
    })?;
    let mut catalog = TaskCatalog::new();
    catalog.register(&countdown);
    let runner = plane.runner(catalog);

    let session = plane.session("remote-cancel");
    let _guard = session.enter()?;
    let instance = countdown.instance()?;
    let future = instance.start(500).await?;

    let canceller = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        future.cancel().await
    };
    let (outcome, cancelled) = tokio::join!(runner.run(run_request("countdown", instance.id())), canceller);
    cancelled?;
    let outcome = outcome?;
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(outcome.exit_code(), 2);

    assert_eq!(
        future.wait(Some(Duration::from_secs(2))).await?,
        FutureStatus::Cancelled
    );
    assert!(future.stop_requested());
    assert!(future.status_message().is_some());
    Ok(())
}

#[tokio::test]
async fn test_remote_failure_is_reported() -> Result<()> {
    let plane = Plane::new();
    let divide = TaskBuilder::new("divide").build(|(a, b): (i64, i64)| {
        if b == 0 {
            return Err(TaskFailure::new("ZeroDivisionError", "division by zero"));
        }
        Ok(a / b)
    })?;
    let mut catalog = TaskCatalog::new();
    catalog.register(&divide);
    let runner = plane.runner(catalog);

    let session = plane.session("remote-fail");
    let _guard = session.enter()?;
    let instance = divide.instance()?;
    let future = instance.start((1, 0)).await?;

    let (outcome, result) = tokio::join!(
        runner.run(run_request("divide", instance.id())),
        future.result(Some(Duration::from_secs(5)))
    );
    match outcome? {
        RunOutcome::Failed(payload) => assert_eq!(payload.kind, "ZeroDivisionError"),
        other => panic!("expected a failed run, got {other:?}"),
    }
    match result {
        Err(TaskError::TaskExecution(payload)) => assert_eq!(payload.message, "division by zero"),
        other => panic!("expected a task failure, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_runner_overrides_merge_into_recorded_arguments() -> Result<()> {
    let plane = Plane::new();
    let add = add_task()?;
    let mut catalog = TaskCatalog::new();
    catalog.register(&add);
    let runner = plane.runner(catalog);

    let session = plane.session("overrides");
    let _guard = session.enter()?;
    let instance = add.instance()?;
    let future = instance.start(AddArgs { a: 1, b: 1 }).await?;

    let mut request = run_request("add", instance.id());
    request.overrides.insert("b".into(), Value::from(41));
    let (outcome, result) = tokio::join!(runner.run(request), future.result(Some(Duration::from_secs(5))));
    assert_eq!(outcome?, RunOutcome::Completed(json!(42)));
    assert_eq!(result?, 42);
    Ok(())
}

#[tokio::test]
async fn test_remote_ownership_is_checked_before_sending() -> Result<()> {
    let plane = Plane::new();
    let add = add_task()?;
    let s1 = plane.session("owner");
    let s2 = plane.session("intruder");
    let instance = add.instance_in(&s1);

    let _guard = s2.enter()?;
    let err = instance.start(AddArgs { a: 1, b: 2 }).await.unwrap_err();
    assert_eq!(err.kind(), "SessionOwnership");
    assert!(plane.client.get_active_execution(instance.id()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_runner_without_active_execution_fails() -> Result<()> {
    let plane = Plane::new();
    let add = add_task()?;
    let mut catalog = TaskCatalog::new();
    catalog.register(&add);
    let err = plane
        .runner(catalog)
        .run(run_request("add", "s:add:1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UnknownExecution");
    Ok(())
}

#[tokio::test]
async fn test_update_stream_survives_a_failed_poll() -> Result<()> {
    let plane = Plane::new();
    let polls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&polls);
    let registry = Arc::clone(&plane.registry);
    let flaky = FnTransport::new(move |request| {
        let registry = Arc::clone(&registry);
        let drop_reply = matches!(request, RegistryRequest::PollEvents { .. })
            && seen.fetch_add(1, Ordering::SeqCst) == 1;
        async move {
            if drop_reply {
                Err(TransportError::Permanent("connection reset".into()))
            } else {
                registry.send(request).await
            }
        }
        .boxed()
    });
    let client = RegistryClient::new(Arc::new(flaky)).with_retry(RetryPolicy::none());
    let backend = RemoteBackend::new(client).with_poll_interval(Duration::from_millis(5));
    let session = Session::new("flaky-polls", Arc::new(backend));

    let add = add_task()?;
    let _guard = session.enter()?;
    let future = add.instance()?.start(AddArgs { a: 2, b: 3 }).await?;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while polls.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(polls.load(Ordering::SeqCst) >= 3);
    assert!(!future.is_done());

    plane.client.begin_execution(future.execution_id()).await?;
    plane
        .client
        .complete_execution(future.execution_id(), WirePayload::from_value(json!(5)))
        .await?;

    assert_eq!(future.result(Some(Duration::from_secs(5))).await?, 5);
    assert_eq!(future.status(), FutureStatus::Completed);
    assert_eq!(
        plane.registry.execution(future.execution_id()).unwrap().state,
        ExecutionState::Completed
    );
    Ok(())
}
