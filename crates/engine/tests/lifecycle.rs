//! Lifecycle and sentry cascade integration tests.
//!
//! Every test drives a [`CaseEngine`] over the in-memory backend and checks
//! committed state only.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use arbor_core::ExecutionState::*;
use arbor_engine::{
    CaseEngine, CreateCaseInstance, DefinitionCache, EngineConfig, EngineError, InMemoryHistory,
    HistoryEventKind, LoadingStrategy,
};
use arbor_storage::{ExecutionQuery, MemoryStorage};
use serde_json::json;

use common::{create, deploy, engine, node, shape, state};

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

/// `a` completes as soon as its sibling `b` completes.
fn exit_on_sibling() -> serde_json::Value {
    json!({
        "id": "plan", "type": "case_plan_model",
        "sentries": [
            { "id": "S1", "on_parts": [ { "source": "b", "standard_event": "complete" } ] }
        ],
        "children": [
            {
                "id": "a", "type": "task",
                "exit_criteria": [ { "sentry": "S1", "action": "complete" } ]
            },
            { "id": "b", "type": "task" }
        ]
    })
}

/// The plan completes once both tasks have completed.
fn join() -> serde_json::Value {
    json!({
        "id": "plan", "type": "case_plan_model",
        "sentries": [ { "id": "S1", "on_parts": [
            { "source": "a", "standard_event": "complete" },
            { "source": "b", "standard_event": "complete" }
        ] } ],
        "exit_criteria": [ { "sentry": "S1", "action": "complete" } ],
        "children": [
            { "id": "a", "type": "task" },
            { "id": "b", "type": "task" }
        ]
    })
}

/// A sentry chain across two levels: `x` completing starts milestone `y`
/// inside the auto-completing stage, the stage completing makes `wrap`
/// occur, and `wrap` occurring completes the plan.
fn staged() -> serde_json::Value {
    json!({
        "id": "plan", "type": "case_plan_model",
        "sentries": [
            {
                "id": "after_stage",
                "on_parts": [ { "source": "stage", "standard_event": "complete" } ]
            },
            { "id": "after_wrap", "on_parts": [ { "source": "wrap", "standard_event": "occur" } ] }
        ],
        "exit_criteria": [ { "sentry": "after_wrap", "action": "complete" } ],
        "children": [
            {
                "id": "stage", "type": "stage", "auto_complete": true,
                "sentries": [
                    {
                        "id": "after_x",
                        "on_parts": [ { "source": "x", "standard_event": "complete" } ]
                    }
                ],
                "children": [
                    { "id": "x", "type": "task" },
                    { "id": "y", "type": "milestone", "entry_criteria": ["after_x"] }
                ]
            },
            { "id": "wrap", "type": "milestone", "entry_criteria": ["after_stage"] }
        ]
    })
}

fn sequence() -> serde_json::Value {
    json!({
        "id": "plan", "type": "case_plan_model",
        "sentries": [
            { "id": "after_a", "on_parts": [ { "source": "a", "standard_event": "complete" } ] },
            { "id": "after_b", "on_parts": [ { "source": "b", "standard_event": "complete" } ] }
        ],
        "children": [
            { "id": "a", "type": "task" },
            { "id": "b", "type": "task", "entry_criteria": ["after_a"] },
            { "id": "done", "type": "milestone", "entry_criteria": ["after_b"] }
        ]
    })
}

// ──────────────────────────────────────────────
// Creation
// ──────────────────────────────────────────────

#[tokio::test]
async fn new_instance_activates_children_without_entry_criteria() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let created = engine
        .create_case_instance(CreateCaseInstance::by_key("seq").business_key("order-7"))
        .await
        .unwrap();
    let ci = created.case_instance_id;

    let root = engine.execution(&ci).await.unwrap();
    assert!(root.is_case_instance());
    assert_eq!(root.state, Active);
    assert_eq!(root.business_key.as_deref(), Some("order-7"));

    assert_eq!(state(&engine, &ci, "a").await, Active);
    assert_eq!(state(&engine, &ci, "b").await, Available);
    assert_eq!(state(&engine, &ci, "done").await, Available);

    let a = node(&engine, &ci, "a").await;
    assert_eq!(a.parent_id.as_deref(), Some(ci.as_str()));
    assert_eq!(a.case_instance_id, ci);
    assert_eq!(created.report.inserted.executions, 4);
    assert_eq!(created.report.inserted.sentry_parts, 2);
}

#[tokio::test]
async fn unknown_definition_key_is_not_found() {
    let engine = engine();
    let err = engine
        .create_case_instance(CreateCaseInstance::by_key("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }), "{err}");
}

// ──────────────────────────────────────────────
// Sentry cascades
// ──────────────────────────────────────────────

#[tokio::test]
async fn sibling_completion_completes_exit_gated_node_in_same_command() {
    let engine = engine();
    deploy(&engine, "exit", exit_on_sibling());
    let ci = create(&engine, "exit").await;
    let b = node(&engine, &ci, "b").await;

    let report = engine.complete(&b.id).await.unwrap();

    assert_eq!(state(&engine, &ci, "a").await, Completed);
    assert_eq!(state(&engine, &ci, "b").await, Completed);
    assert_eq!(report.queued, 1);
    // complete(b), fireExit(a), complete(a)
    assert_eq!(report.performed, 3);
}

#[tokio::test]
async fn entry_criteria_chain_through_milestone() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;

    let a = node(&engine, &ci, "a").await;
    engine.complete(&a.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "b").await, Active);
    assert_eq!(state(&engine, &ci, "done").await, Available);

    let b = node(&engine, &ci, "b").await;
    engine.complete(&b.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "done").await, Completed);
}

#[tokio::test]
async fn starting_a_gated_node_by_hand_is_rejected() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;
    let b = node(&engine, &ci, "b").await;

    let err = engine.start(&b.id).await.unwrap_err();
    assert!(
        matches!(err, EngineError::SentryNotSatisfied { criterion: "entry", .. }),
        "{err}"
    );
    assert_eq!(state(&engine, &ci, "b").await, Available);
}

#[tokio::test]
async fn join_completes_plan_when_both_parts_are_satisfied() {
    let engine = engine();
    deploy(&engine, "join", join());
    let ci = create(&engine, "join").await;

    let a = node(&engine, &ci, "a").await;
    engine.complete(&a.id).await.unwrap();
    assert!(!engine.is_sentry_satisfied(&ci, "S1").await.unwrap());
    assert_eq!(engine.execution(&ci).await.unwrap().state, Active);

    let b = node(&engine, &ci, "b").await;
    engine.complete(&b.id).await.unwrap();
    assert_eq!(engine.execution(&ci).await.unwrap().state, Completed);
    // Firing consumed the sentry.
    assert!(!engine.is_sentry_satisfied(&ci, "S1").await.unwrap());
}

#[tokio::test]
async fn fired_sentry_parts_are_reset_but_partial_ones_are_kept() {
    let engine = engine();
    deploy(&engine, "join", join());
    let ci = create(&engine, "join").await;

    let a = node(&engine, &ci, "a").await;
    engine.complete(&a.id).await.unwrap();
    let parts = engine.sentry_parts(&ci).await.unwrap();
    assert_eq!(parts.iter().filter(|p| p.satisfied).count(), 1);

    let b = node(&engine, &ci, "b").await;
    let report = engine.complete(&b.id).await.unwrap();
    assert!(report.updated.sentry_parts >= 2);
    let parts = engine.sentry_parts(&ci).await.unwrap();
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().all(|p| !p.satisfied));

    deploy(&engine, "exit", exit_on_sibling());
    let ci = create(&engine, "exit").await;
    let b = node(&engine, &ci, "b").await;
    engine.complete(&b.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "a").await, Completed);
    assert!(engine
        .sentry_parts(&ci)
        .await
        .unwrap()
        .iter()
        .all(|p| !p.satisfied));
}

#[tokio::test]
async fn exit_criterion_ignores_node_that_never_started() {
    let engine = engine();
    deploy(
        &engine,
        "late",
        json!({
            "id": "plan", "type": "case_plan_model",
            "sentries": [
                {
                    "id": "after_c",
                    "on_parts": [ { "source": "c", "standard_event": "complete" } ]
                },
                { "id": "S1", "on_parts": [ { "source": "b", "standard_event": "complete" } ] }
            ],
            "children": [
                {
                    "id": "a", "type": "task", "entry_criteria": ["after_c"],
                    "exit_criteria": [ { "sentry": "S1" } ]
                },
                { "id": "b", "type": "task" },
                { "id": "c", "type": "task" }
            ]
        }),
    );
    let ci = create(&engine, "late").await;
    assert_eq!(state(&engine, &ci, "a").await, Available);

    let b = node(&engine, &ci, "b").await;
    let report = engine.complete(&b.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "a").await, Available);
    assert_eq!(report.queued, 0);

    // `a` can still enter later, and the exit sentry that fired while it
    // was waiting does not take it down.
    let c = node(&engine, &ci, "c").await;
    engine.complete(&c.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "a").await, Active);
}

#[tokio::test]
async fn cascade_across_levels_stays_within_depth_times_sentries() {
    let engine = engine();
    deploy(&engine, "staged", staged());
    let ci = create(&engine, "staged").await;
    assert_eq!(state(&engine, &ci, "stage").await, Active);
    assert_eq!(state(&engine, &ci, "x").await, Active);
    assert_eq!(state(&engine, &ci, "y").await, Available);

    let tree = engine.tree(&ci).await.unwrap();
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for record in &tree {
        let depth = record
            .parent_id
            .as_deref()
            .and_then(|parent| depths.get(parent))
            .map_or(1, |d| d + 1);
        depths.insert(record.id.as_str(), depth);
    }
    let depth = depths.values().copied().max().unwrap();
    let sentries = engine.sentry_parts(&ci).await.unwrap().len();
    assert_eq!((depth, sentries), (3, 3));

    let x = node(&engine, &ci, "x").await;
    let report = engine.complete(&x.id).await.unwrap();

    assert!(
        report.queued <= depth * sentries,
        "queued {} follow-ups for depth {depth} and {sentries} sentries",
        report.queued
    );
    assert!(report.performed < EngineConfig::default().execution.max_operations_per_command);
    let tree = shape(&engine, &ci).await;
    assert_eq!(tree.len(), 5);
    assert!(tree.iter().all(|(_, state)| *state == Completed), "{tree:?}");
}

#[tokio::test]
async fn completing_exit_criterion_gates_manual_complete() {
    let engine = engine();
    deploy(&engine, "join", join());
    let ci = create(&engine, "join").await;

    let err = engine.complete(&ci).await.unwrap_err();
    assert!(
        matches!(err, EngineError::SentryNotSatisfied { criterion: "completing exit", .. }),
        "{err}"
    );
}

// ──────────────────────────────────────────────
// State machine
// ──────────────────────────────────────────────

#[tokio::test]
async fn invalid_transition_names_node_and_state() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;
    let b = node(&engine, &ci, "b").await;

    let err = engine.complete(&b.id).await.unwrap_err();
    match err {
        EngineError::InvalidTransition {
            execution_id,
            state,
            ..
        } => {
            assert_eq!(execution_id, b.id);
            assert_eq!(state, Available);
        }
        other => panic!("expected InvalidTransition, got {other}"),
    }
}

#[tokio::test]
async fn case_instance_cannot_be_started_again() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;
    let err = engine.start(&ci).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }), "{err}");
}

#[tokio::test]
async fn manual_activation_waits_in_enabled() {
    let engine = engine();
    deploy(
        &engine,
        "manual",
        json!({
            "id": "plan", "type": "case_plan_model",
            "children": [ { "id": "review", "type": "human_task", "manual_activation": true } ]
        }),
    );
    let ci = create(&engine, "manual").await;
    let review = node(&engine, &ci, "review").await;
    assert_eq!(review.state, Enabled);

    engine.disable(&review.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "review").await, Disabled);
    engine.reenable(&review.id).await.unwrap();
    engine.manual_start(&review.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "review").await, Active);
}

#[tokio::test]
async fn suspend_and_resume_propagate_to_children() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;

    engine.suspend(&ci).await.unwrap();
    assert!(shape(&engine, &ci)
        .await
        .iter()
        .all(|(_, state)| *state == Suspended));

    engine.resume(&ci).await.unwrap();
    assert_eq!(engine.execution(&ci).await.unwrap().state, Active);
    assert_eq!(state(&engine, &ci, "a").await, Active);
    assert_eq!(state(&engine, &ci, "b").await, Available);
}

#[tokio::test]
async fn terminating_the_plan_terminates_open_children() {
    let engine = engine();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;
    let a = node(&engine, &ci, "a").await;
    engine.complete(&a.id).await.unwrap();

    engine.terminate(&ci).await.unwrap();
    assert_eq!(state(&engine, &ci, "a").await, Completed);
    assert_eq!(state(&engine, &ci, "b").await, Terminated);
    assert_eq!(state(&engine, &ci, "done").await, Terminated);

    let b = node(&engine, &ci, "b").await;
    assert_eq!(b.previous_state, Some(Active));
}

#[tokio::test]
async fn stage_auto_completes_when_required_children_finish() {
    let engine = engine();
    deploy(
        &engine,
        "stage",
        json!({
            "id": "plan", "type": "case_plan_model",
            "children": [ {
                "id": "stage", "type": "stage", "auto_complete": true,
                "children": [
                    { "id": "must", "type": "task", "required": true },
                    { "id": "may", "type": "task", "manual_activation": true }
                ]
            } ]
        }),
    );
    let ci = create(&engine, "stage").await;
    assert_eq!(state(&engine, &ci, "stage").await, Active);

    let must = node(&engine, &ci, "must").await;
    engine.complete(&must.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "stage").await, Active);

    let may = node(&engine, &ci, "may").await;
    engine.disable(&may.id).await.unwrap();
    assert_eq!(state(&engine, &ci, "stage").await, Completed);
}

// ──────────────────────────────────────────────
// Deletion
// ──────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_nodes_parts_and_variables() {
    let engine = engine();
    deploy(&engine, "join", join());
    let ci = engine
        .create_case_instance(CreateCaseInstance::by_key("join").variable("amount", json!(10)))
        .await
        .unwrap()
        .case_instance_id;
    for activity in ["a", "b"] {
        let id = node(&engine, &ci, activity).await.id;
        engine.complete(&id).await.unwrap();
    }
    assert_eq!(engine.execution(&ci).await.unwrap().state, Completed);

    let report = engine.delete_case_instance(&ci).await.unwrap();
    assert_eq!(report.deleted.executions, 3);
    assert_eq!(report.deleted.sentry_parts, 2);
    assert_eq!(report.deleted.executions + report.deleted.sentry_parts, 5);
    assert_eq!(report.deleted.variables, 1);

    assert!(engine.case_variables(&ci).await.unwrap().is_empty());
    assert!(engine.sentry_parts(&ci).await.unwrap().is_empty());
    let all = engine.query(&ExecutionQuery::builder().build()).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn active_instance_cannot_be_deleted() {
    let engine = engine();
    deploy(&engine, "join", join());
    let ci = create(&engine, "join").await;
    let err = engine.delete_case_instance(&ci).await.unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed { .. }), "{err}");
    assert_eq!(engine.tree(&ci).await.unwrap().len(), 3);
}

// ──────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────

#[tokio::test]
async fn prefetch_and_lazy_loading_see_the_same_tree() {
    let storage = MemoryStorage::new();
    let definitions = Arc::new(DefinitionCache::new());
    let build = |loading: LoadingStrategy| {
        let mut config = EngineConfig::default();
        config.tree.loading = loading;
        CaseEngine::builder(storage.clone())
            .config(config)
            .definitions(definitions.clone())
            .build()
    };
    let prefetch = build(LoadingStrategy::Prefetch);
    let lazy = build(LoadingStrategy::Lazy);
    deploy(&prefetch, "seq", sequence());

    let ci = create(&prefetch, "seq").await;
    assert_eq!(prefetch.tree(&ci).await.unwrap(), lazy.tree(&ci).await.unwrap());

    let a = node(&lazy, &ci, "a").await;
    let lazy_report = lazy.complete(&a.id).await.unwrap();
    assert_eq!(prefetch.tree(&ci).await.unwrap(), lazy.tree(&ci).await.unwrap());
    assert_eq!(state(&prefetch, &ci, "b").await, Active);

    let b = node(&prefetch, &ci, "b").await;
    let prefetch_report = prefetch.complete(&b.id).await.unwrap();
    assert_eq!(prefetch.tree(&ci).await.unwrap(), lazy.tree(&ci).await.unwrap());
    assert!(lazy_report.storage_reads > 0);
    assert!(prefetch_report.storage_reads > 0);
}

#[tokio::test]
async fn operation_budget_aborts_the_command() {
    let mut config = EngineConfig::default();
    config.execution.max_operations_per_command = 4;
    let engine = common::engine_with(config);
    deploy(&engine, "seq", sequence());

    let err = engine
        .create_case_instance(CreateCaseInstance::by_key("seq"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::CascadeLimitExceeded { limit: 4, .. }),
        "{err}"
    );
    let all = engine.query(&ExecutionQuery::builder().build()).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn history_records_every_node_created() {
    let history = Arc::new(InMemoryHistory::new());
    let engine = CaseEngine::builder(MemoryStorage::new())
        .history(history.clone())
        .build();
    deploy(&engine, "seq", sequence());
    let ci = create(&engine, "seq").await;

    let created: Vec<_> = history
        .events()
        .into_iter()
        .filter(|e| e.kind == HistoryEventKind::ExecutionCreated)
        .collect();
    assert_eq!(created.len(), 4);
    assert!(created.iter().all(|e| e.case_instance_id == ci));
    assert_eq!(created[0].execution_id, ci);
}
