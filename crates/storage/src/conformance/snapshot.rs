//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! visible through it, and discarded on abort.

use std::future::Future;

use super::{make_execution, make_variable, seed_tree, TestResult};
use crate::{ArborStorage, ExecutionQuery};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_insert_invisible_to_get",
        uncommitted_insert_invisible_to_get(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_insert_invisible_to_query",
        uncommitted_insert_invisible_to_query(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "own_writes_visible_through_snapshot",
        own_writes_visible_through_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_update_invisible",
        uncommitted_update_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_inserts",
        abort_discards_inserts(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_deletes",
        abort_discards_deletes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "deleted_record_invisible_through_snapshot",
        deleted_record_invisible_through_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "sequential_snapshots_see_prior_commits",
        sequential_snapshots_see_prior_commits(factory).await,
    ));

    results
}

async fn uncommitted_insert_invisible_to_get<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_execution(&mut snap, make_execution("ci-1", None, "ci-1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    let visible = storage.get_execution("ci-1").await.is_ok();
    let _ = storage.abort_snapshot(snap).await;
    if visible {
        return Err("uncommitted execution visible outside the snapshot".to_string());
    }
    Ok(())
}

async fn uncommitted_insert_invisible_to_query<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_execution(&mut snap, make_execution("ci-1", None, "ci-1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    let found = storage
        .select_executions(&ExecutionQuery::default())
        .await
        .map_err(|e| format!("query: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;
    if !found.is_empty() {
        return Err(format!("query returned {} uncommitted rows", found.len()));
    }
    Ok(())
}

async fn own_writes_visible_through_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_execution(&mut snap, make_execution("ci-1", None, "ci-1"))
        .await
        .map_err(|e| format!("insert root: {e}"))?;
    storage
        .insert_execution(&mut snap, make_execution("a", Some("ci-1"), "ci-1"))
        .await
        .map_err(|e| format!("insert child: {e}"))?;
    storage
        .insert_variable(&mut snap, make_variable("v1", "x", "a", "ci-1"))
        .await
        .map_err(|e| format!("insert variable: {e}"))?;

    let root = storage
        .select_execution(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select root: {e}"))?;
    let children = storage
        .select_child_executions(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select children: {e}"))?;
    let vars = storage
        .select_variables_by_scope(&mut snap, "a")
        .await
        .map_err(|e| format!("select variables: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;

    if root.is_none() || children.len() != 1 || vars.len() != 1 {
        return Err(format!(
            "own writes not visible: root={} children={} vars={}",
            root.is_some(),
            children.len(),
            vars.len()
        ));
    }
    Ok(())
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a"]).await?;
    let mut record = storage
        .get_execution("a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    record.state = arbor_core::ExecutionState::Active;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_execution(&mut snap, record, 1)
        .await
        .map_err(|e| format!("update: {e}"))?;
    let outside = storage
        .get_execution("a")
        .await
        .map_err(|e| format!("get outside: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;

    if outside.state != arbor_core::ExecutionState::Available || outside.revision != 1 {
        return Err(format!(
            "uncommitted update leaked: state={} revision={}",
            outside.state, outside.revision
        ));
    }
    Ok(())
}

async fn abort_discards_inserts<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_execution(&mut snap, make_execution("ci-1", None, "ci-1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    if storage.get_execution("ci-1").await.is_ok() {
        return Err("aborted insert is visible".to_string());
    }
    Ok(())
}

async fn abort_discards_deletes<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .delete_execution(&mut snap, "a", 1)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    if storage.get_execution("a").await.is_err() {
        return Err("aborted delete removed the record".to_string());
    }
    Ok(())
}

async fn deleted_record_invisible_through_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a", "b"]).await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .delete_execution(&mut snap, "a", 1)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    let found = storage
        .select_execution(&mut snap, "a")
        .await
        .map_err(|e| format!("select: {e}"))?;
    let tree = storage
        .select_executions_by_case_instance(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select tree: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;
    if found.is_some() || tree.len() != 2 {
        return Err(format!(
            "deleted node still visible: found={} tree={}",
            found.is_some(),
            tree.len()
        ));
    }
    Ok(())
}

async fn sequential_snapshots_see_prior_commits<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let root = storage
        .select_execution(&mut snap, "ci-1")
        .await
        .map_err(|e| format!("select: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;
    match root {
        Some(r) if r.revision == 1 => Ok(()),
        Some(r) => Err(format!("expected revision 1, got {}", r.revision)),
        None => Err("committed root not visible to a later snapshot".to_string()),
    }
}
