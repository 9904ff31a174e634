//! Called case instances, tenant propagation and all-or-nothing commands.

mod common;

use std::sync::Arc;

use arbor_core::ExecutionState::*;
use arbor_engine::{
    CaseEngine, CreateCaseInstance, EngineConfig, EngineError, HistoryError, HistoryEvent,
    HistoryEventHandler, StaticTenantIdProvider,
};
use arbor_storage::{ExecutionQuery, MemoryStorage};
use async_trait::async_trait;
use serde_json::json;

use common::{create, deploy, deploy_model, engine, node, state};

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

fn deploy_parent_and_child(engine: &CaseEngine<MemoryStorage>) {
    deploy(
        engine,
        "parent",
        json!({
            "id": "plan", "type": "case_plan_model",
            "children": [ { "id": "call", "type": "case_task", "called_element": "child" } ]
        }),
    );
    deploy(
        engine,
        "child",
        json!({
            "id": "child_plan", "type": "case_plan_model", "auto_complete": true,
            "children": [ { "id": "work", "type": "task" } ]
        }),
    );
}

struct FailingHistory;

#[async_trait]
impl HistoryEventHandler for FailingHistory {
    async fn handle_events(&self, _events: &[HistoryEvent]) -> Result<(), HistoryError> {
        Err(HistoryError::Handler("sink offline".to_string()))
    }
}

fn all() -> ExecutionQuery {
    ExecutionQuery::builder().build()
}

// ──────────────────────────────────────────────
// Sub-instances
// ──────────────────────────────────────────────

#[tokio::test]
async fn case_task_starts_linked_sub_instance() {
    let engine = engine();
    deploy_parent_and_child(&engine);
    let ci = engine
        .create_case_instance(CreateCaseInstance::by_key("parent").business_key("bk-1"))
        .await
        .unwrap()
        .case_instance_id;

    let call = node(&engine, &ci, "call").await;
    assert_eq!(call.state, Active);
    let sub_id = call.sub_case_instance_id.clone().expect("sub-instance link");
    let sub = engine.execution(&sub_id).await.unwrap();
    assert!(sub.is_case_instance());
    assert_eq!(sub.super_case_execution_id.as_deref(), Some(call.id.as_str()));
    assert_eq!(sub.business_key.as_deref(), Some("bk-1"));
    assert_eq!(state(&engine, &sub_id, "work").await, Active);
}

#[tokio::test]
async fn completing_sub_instance_completes_caller() {
    let engine = engine();
    deploy_parent_and_child(&engine);
    let ci = create(&engine, "parent").await;
    let sub_id = node(&engine, &ci, "call").await.sub_case_instance_id.unwrap();

    let work = node(&engine, &sub_id, "work").await;
    engine.complete(&work.id).await.unwrap();

    assert_eq!(engine.execution(&sub_id).await.unwrap().state, Completed);
    assert_eq!(state(&engine, &ci, "call").await, Completed);
}

#[tokio::test]
async fn terminating_caller_terminates_sub_instance() {
    let engine = engine();
    deploy_parent_and_child(&engine);
    let ci = create(&engine, "parent").await;
    let sub_id = node(&engine, &ci, "call").await.sub_case_instance_id.unwrap();

    engine.terminate(&ci).await.unwrap();

    assert_eq!(state(&engine, &ci, "call").await, Terminated);
    assert_eq!(engine.execution(&sub_id).await.unwrap().state, Terminated);
    assert_eq!(state(&engine, &sub_id, "work").await, Terminated);
}

#[tokio::test]
async fn deleting_caller_deletes_sub_instance() {
    let engine = engine();
    deploy_parent_and_child(&engine);
    let ci = create(&engine, "parent").await;
    let sub_id = node(&engine, &ci, "call").await.sub_case_instance_id.unwrap();
    engine.terminate(&ci).await.unwrap();

    let err = engine.delete_case_instance(&sub_id).await.unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed { .. }), "{err}");

    let report = engine.delete_case_instance(&ci).await.unwrap();
    assert_eq!(report.deleted.executions, 4);
    assert!(engine.query(&all()).await.unwrap().is_empty());
}

// ──────────────────────────────────────────────
// Tenants
// ──────────────────────────────────────────────

#[tokio::test]
async fn tenant_flows_from_caller_to_sub_instance() {
    let engine = engine();
    deploy_parent_and_child(&engine);
    let ci = engine
        .create_case_instance(CreateCaseInstance::by_key("parent").tenant_id("acme"))
        .await
        .unwrap()
        .case_instance_id;

    let call = node(&engine, &ci, "call").await;
    assert_eq!(call.tenant_id.as_deref(), Some("acme"));
    let sub = engine
        .execution(call.sub_case_instance_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(sub.tenant_id.as_deref(), Some("acme"));

    let acme = ExecutionQuery::builder().tenant_id_in(["acme"]).build();
    assert_eq!(engine.query(&acme).await.unwrap().len(), 4);
}

#[tokio::test]
async fn definition_tenant_beats_provider() {
    let engine = CaseEngine::builder(MemoryStorage::new())
        .tenant_provider(Arc::new(StaticTenantIdProvider::new("provided")))
        .build();
    deploy_model(
        &engine,
        json!({
            "id": "owned:1", "key": "owned", "tenant_id": "owner",
            "plan_model": { "id": "plan", "type": "case_plan_model" }
        }),
    );
    deploy(&engine, "shared", json!({ "id": "plan", "type": "case_plan_model" }));

    let owned = create(&engine, "owned").await;
    let shared = create(&engine, "shared").await;
    let explicit = engine
        .create_case_instance(CreateCaseInstance::by_key("owned").tenant_id("explicit"))
        .await
        .unwrap()
        .case_instance_id;

    let tenant = |record: arbor_storage::ExecutionRecord| record.tenant_id;
    assert_eq!(tenant(engine.execution(&owned).await.unwrap()).as_deref(), Some("owner"));
    assert_eq!(tenant(engine.execution(&shared).await.unwrap()).as_deref(), Some("provided"));
    assert_eq!(tenant(engine.execution(&explicit).await.unwrap()).as_deref(), Some("explicit"));
}

// ──────────────────────────────────────────────
// Atomicity
// ──────────────────────────────────────────────

#[tokio::test]
async fn failure_deep_in_cascade_rolls_back_whole_command() {
    let engine = engine();
    deploy(
        &engine,
        "broken",
        json!({
            "id": "plan", "type": "case_plan_model",
            "children": [
                { "id": "first", "type": "task" },
                { "id": "call", "type": "case_task", "called_element": "nowhere" }
            ]
        }),
    );

    let err = engine
        .create_case_instance(CreateCaseInstance::by_key("broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }), "{err}");
    assert!(engine.query(&all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn strict_history_failure_aborts_command() {
    let mut config = EngineConfig::default();
    config.history.fail_on_error = true;
    let engine = CaseEngine::builder(MemoryStorage::new())
        .config(config)
        .history(Arc::new(FailingHistory))
        .build();
    deploy(&engine, "shared", json!({ "id": "plan", "type": "case_plan_model" }));

    let err = engine
        .create_case_instance(CreateCaseInstance::by_key("shared"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::History(_)), "{err}");
    assert!(engine.query(&all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn lenient_history_failure_is_swallowed() {
    let engine = CaseEngine::builder(MemoryStorage::new())
        .history(Arc::new(FailingHistory))
        .build();
    deploy(&engine, "shared", json!({ "id": "plan", "type": "case_plan_model" }));

    let ci = create(&engine, "shared").await;
    assert_eq!(engine.execution(&ci).await.unwrap().state, Active);
}
