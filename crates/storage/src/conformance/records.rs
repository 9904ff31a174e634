//! Record-level conformance tests: insert, select and delete of each table.

use std::future::Future;

use super::{make_execution, make_sentry_part, make_variable, seed_tree, TestResult};
use crate::{ArborStorage, RecordKind, StorageError};

pub(super) async fn run_record_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "records",
        "insert_execution_starts_at_revision_1",
        insert_execution_starts_at_revision_1(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "duplicate_execution_insert_rejected",
        duplicate_execution_insert_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "missing_execution_selects_none",
        missing_execution_selects_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "missing_execution_get_not_found",
        missing_execution_get_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "children_selected_by_parent",
        children_selected_by_parent(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "tree_selected_by_case_instance",
        tree_selected_by_case_instance(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "sentry_parts_selected_by_owner_and_instance",
        sentry_parts_selected_by_owner_and_instance(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "variables_selected_by_scope_and_instance",
        variables_selected_by_scope_and_instance(factory).await,
    ));
    results.push(TestResult::from_result(
        "records",
        "delete_removes_every_kind",
        delete_removes_every_kind(factory).await,
    ));

    results
}

async fn insert_execution_starts_at_revision_1<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &[]).await?;
    let record = storage
        .get_execution("ci-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if record.revision != 1 {
        return Err(format!("expected revision 1, got {}", record.revision));
    }
    if !record.is_case_instance() || record.case_instance_id != "ci-1" {
        return Err(format!("root links wrong: {record:?}"));
    }
    Ok(())
}

async fn duplicate_execution_insert_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &[]).await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage
        .insert_execution(&mut snap, make_execution("ci-1", None, "ci-1"))
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { kind, id }) => {
            if kind != RecordKind::Execution || id != "ci-1" {
                return Err(format!("wrong AlreadyExists payload: {kind}/{id}"));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected AlreadyExists, got: {e}")),
        Ok(()) => Err("duplicate insert should fail".to_string()),
    }
}

async fn missing_execution_selects_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let found = storage
        .select_execution(&mut snap, "nope")
        .await
        .map_err(|e| format!("select: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;
    if found.is_some() {
        return Err("expected None for a missing execution".to_string());
    }
    Ok(())
}

async fn missing_execution_get_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_execution("nope").await {
        Err(StorageError::NotFound { kind, .. }) if kind == RecordKind::Execution => Ok(()),
        Err(e) => Err(format!("expected NotFound, got: {e}")),
        Ok(_) => Err("expected NotFound, got a record".to_string()),
    }
}

async fn children_selected_by_parent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a", "b"]).await?;
    seed_tree(&storage, "ci-2", &["c"]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let children = storage
        .select_child_executions(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select children: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;

    let mut ids: Vec<String> = children.into_iter().map(|r| r.id).collect();
    ids.sort();
    if ids != ["a", "b"] {
        return Err(format!("expected children [a, b], got {ids:?}"));
    }
    Ok(())
}

async fn tree_selected_by_case_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a", "b"]).await?;
    seed_tree(&storage, "ci-2", &["c"]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let tree = storage
        .select_executions_by_case_instance(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select tree: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;

    if tree.len() != 3 {
        return Err(format!("expected 3 nodes, got {}", tree.len()));
    }
    let roots = tree.iter().filter(|r| r.is_case_instance()).count();
    if roots != 1 {
        return Err(format!("expected exactly one root, got {roots}"));
    }
    Ok(())
}

async fn sentry_parts_selected_by_owner_and_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["stage"]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    for (id, owner) in [("p1", "ci-1"), ("p2", "ci-1"), ("p3", "stage")] {
        storage
            .insert_sentry_part(&mut snap, make_sentry_part(id, owner, "ci-1"))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let owned = storage
        .select_sentry_parts_by_execution(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select by owner: {e}"))?;
    let all = storage
        .select_sentry_parts_by_case_instance(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select by instance: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;

    if owned.len() != 2 || all.len() != 3 {
        return Err(format!(
            "expected 2 owned / 3 total parts, got {} / {}",
            owned.len(),
            all.len()
        ));
    }
    if owned.iter().any(|p| p.revision != 1) {
        return Err("inserted parts should be at revision 1".to_string());
    }
    Ok(())
}

async fn variables_selected_by_scope_and_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a"]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_variable(&mut snap, make_variable("v1", "amount", "ci-1", "ci-1"))
        .await
        .map_err(|e| format!("insert v1: {e}"))?;
    storage
        .insert_variable(&mut snap, make_variable("v2", "note", "a", "ci-1"))
        .await
        .map_err(|e| format!("insert v2: {e}"))?;
    let local = storage
        .select_variables_by_scope(&mut snap, "a")
        .await
        .map_err(|e| format!("select by scope: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if local.len() != 1 || local[0].name != "note" {
        return Err(format!("expected only 'note' on scope a, got {local:?}"));
    }
    let all = storage
        .list_variables("ci-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if all.len() != 2 {
        return Err(format!("expected 2 variables, got {}", all.len()));
    }
    Ok(())
}

async fn delete_removes_every_kind<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a"]).await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_sentry_part(&mut snap, make_sentry_part("p1", "ci-1", "ci-1"))
        .await
        .map_err(|e| format!("insert part: {e}"))?;
    storage
        .insert_variable(&mut snap, make_variable("v1", "amount", "a", "ci-1"))
        .await
        .map_err(|e| format!("insert variable: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .delete_variable(&mut snap, "v1", 1)
        .await
        .map_err(|e| format!("delete variable: {e}"))?;
    storage
        .delete_sentry_part(&mut snap, "p1", 1)
        .await
        .map_err(|e| format!("delete part: {e}"))?;
    storage
        .delete_execution(&mut snap, "a", 1)
        .await
        .map_err(|e| format!("delete a: {e}"))?;
    storage
        .delete_execution(&mut snap, "ci-1", 1)
        .await
        .map_err(|e| format!("delete root: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit delete: {e}"))?;

    let parts = storage
        .list_sentry_parts("ci-1")
        .await
        .map_err(|e| format!("list parts: {e}"))?;
    let vars = storage
        .list_variables("ci-1")
        .await
        .map_err(|e| format!("list variables: {e}"))?;
    if !parts.is_empty() || !vars.is_empty() {
        return Err("parts or variables survived delete".to_string());
    }
    if storage.get_execution("a").await.is_ok() || storage.get_execution("ci-1").await.is_ok() {
        return Err("executions survived delete".to_string());
    }
    Ok(())
}
