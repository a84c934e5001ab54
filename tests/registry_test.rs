use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use numerous_tasks::backend::{InstanceRecord, StartRequest};
use numerous_tasks::registry::{InMemoryRegistry, RegistryClient, RetryPolicy};
use numerous_tasks::{ErrorPayload, ExecutionEvent, ExecutionState, TaskBuilder, TaskFailure, WirePayload};
use serde_json::json;

fn client(registry: &Arc<InMemoryRegistry>) -> RegistryClient {
    RegistryClient::new(registry.clone()).with_retry(RetryPolicy::none())
}

async fn started(client: &RegistryClient) -> Result<String> {
    let add = TaskBuilder::new("add").build(|(a, b): (i64, i64)| Ok::<_, TaskFailure>(a + b))?;
    let upsert = client.upsert_task(&add.definition().descriptor()).await?;
    client
        .upsert_instance(&InstanceRecord {
            instance_id: "s1:add:1".into(),
            session_id: "s1".into(),
            task_name: "add".into(),
            version: upsert.version,
            created_at: Utc::now(),
        })
        .await?;
    Ok(client
        .start_execution(StartRequest {
            instance_id: "s1:add:1".into(),
            session_id: "s1".into(),
            client_id: client.client_id().into(),
            args: WirePayload::encode(&json!([1, 2]))?,
            force: false,
        })
        .await?)
}

#[tokio::test]
async fn test_task_upsert_is_idempotent() -> Result<()> {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = client(&registry);
    let add = TaskBuilder::new("add").build(|(a, b): (i64, i64)| Ok::<_, TaskFailure>(a + b))?;
    let descriptor = add.definition().descriptor();

    let first = client.upsert_task(&descriptor).await?;
    let mutations = registry.mutation_count();
    let second = client.upsert_task(&descriptor).await?;

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.version, second.version);
    assert_eq!(registry.mutation_count(), mutations);
    assert_eq!(registry.task_versions("add"), vec![add.version().to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_instance_upsert_is_idempotent() -> Result<()> {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = client(&registry);
    started(&client).await?;
    let original = registry.instance("s1:add:1").unwrap();
    let mutations = registry.mutation_count();

    let again = client
        .upsert_instance(&InstanceRecord {
            created_at: Utc::now(),
            ..original.clone()
        })
        .await?;
    assert_eq!(again, original);
    assert_eq!(registry.mutation_count(), mutations);
    Ok(())
}

#[tokio::test]
async fn test_execution_lifecycle_and_duplicate_terminal_reports() -> Result<()> {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = client(&registry);
    let execution_id = started(&client).await?;

    let active = client.get_active_execution("s1:add:1").await?.unwrap();
    assert_eq!(active.execution_id, execution_id);
    assert_eq!(active.state, ExecutionState::Starting);

    client.begin_execution(&execution_id).await?;
    client.report_progress(&execution_id, 150.0, Some("almost")).await?;
    client
        .complete_execution(&execution_id, WirePayload::encode(&3)?)
        .await?;
    client
        .fail_execution(&execution_id, ErrorPayload::new("Late", "ignored"))
        .await?;

    let record = registry.execution(&execution_id).unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.progress, 100.0);
    assert!(client.get_active_execution("s1:add:1").await?.is_none());

    let page = client.poll_events(&execution_id, 0).await?;
    assert!(page.finished);
    assert_eq!(page.events.first(), Some(&ExecutionEvent::Started));
    assert!(page.events.last().is_some_and(ExecutionEvent::is_terminal));
    let rest = client.poll_events(&execution_id, page.cursor).await?;
    assert!(rest.events.is_empty());
    assert!(rest.finished);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_failures_settle_as_cancelled() -> Result<()> {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = client(&registry);
    let execution_id = started(&client).await?;

    client.request_stop(&execution_id, "s1").await?;
    assert!(client.check_stop_requested(&execution_id).await?);
    client
        .fail_execution(&execution_id, ErrorPayload::new("TaskCancelled", "stop requested"))
        .await?;
    assert_eq!(
        registry.execution(&execution_id).unwrap().state,
        ExecutionState::Cancelled
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_ids_are_rejected() -> Result<()> {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = client(&registry);
    let err = client.check_stop_requested("missing").await.unwrap_err();
    assert_eq!(err.kind(), "UnknownExecution");

    let err = client
        .start_execution(StartRequest {
            instance_id: "s1:ghost:1".into(),
            session_id: "s1".into(),
            client_id: "c".into(),
            args: WirePayload::encode(&json!({}))?,
            force: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UnknownInstance");
    Ok(())
}
