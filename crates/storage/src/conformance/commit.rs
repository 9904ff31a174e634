//! Atomic commit conformance tests.
//!
//! A snapshot's writes become visible together, or (when the commit fails a
//! revision check) not at all.

use std::future::Future;

use super::{make_execution, make_sentry_part, make_variable, seed_tree, TestResult};
use crate::{ArborStorage, StorageError};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "commit",
        "multi_table_commit_visible_together",
        multi_table_commit_visible_together(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "conflicting_commit_writes_nothing",
        conflicting_commit_writes_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "concurrent_insert_of_same_id_rejected_at_commit",
        concurrent_insert_of_same_id_rejected_at_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "delete_of_concurrently_updated_record_rejected",
        delete_of_concurrently_updated_record_rejected(factory).await,
    ));

    results
}

async fn multi_table_commit_visible_together<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .insert_sentry_part(&mut snap, make_sentry_part("p1", "ci-1", "ci-1"))
        .await
        .map_err(|e| format!("insert part: {e}"))?;
    storage
        .insert_variable(&mut snap, make_variable("v1", "x", "a", "ci-1"))
        .await
        .map_err(|e| format!("insert variable: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    storage
        .get_execution("a")
        .await
        .map_err(|e| format!("child missing: {e}"))?;
    let parts = storage
        .list_sentry_parts("ci-1")
        .await
        .map_err(|e| format!("list parts: {e}"))?;
    let vars = storage
        .list_variables("ci-1")
        .await
        .map_err(|e| format!("list variables: {e}"))?;
    if parts.len() != 1 || vars.len() != 1 {
        return Err(format!(
            "expected 1 part and 1 variable, got {} and {}",
            parts.len(),
            vars.len()
        ));
    }
    Ok(())
}

/// Two snapshots load revision 1 of the same node. The first commits; the
/// second also inserted a sibling and must lose that insert along with its
/// stale update.
async fn conflicting_commit_writes_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a"]).await?;
    let record = storage
        .get_execution("a")
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut first = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin first: {e}"))?;
    let mut second = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin second: {e}"))?;

    storage
        .update_execution(&mut first, record.clone(), 1)
        .await
        .map_err(|e| format!("first update: {e}"))?;
    storage
        .commit_snapshot(first)
        .await
        .map_err(|e| format!("first commit: {e}"))?;

    let second_result: Result<(), StorageError> = async {
        storage
            .insert_execution(&mut second, make_execution("b", Some("ci-1"), "ci-1"))
            .await?;
        storage.update_execution(&mut second, record, 1).await?;
        Ok(())
    }
    .await;
    let outcome = match second_result {
        Ok(()) => storage.commit_snapshot(second).await,
        Err(e) => {
            let _ = storage.abort_snapshot(second).await;
            Err(e)
        }
    };

    match outcome {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        Err(e) => return Err(format!("expected ConcurrentConflict, got: {e}")),
        Ok(()) => return Err("stale snapshot committed".to_string()),
    }
    if storage.get_execution("b").await.is_ok() {
        return Err("insert from the failed snapshot is visible".to_string());
    }
    let stored = storage
        .get_execution("a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.revision != 2 {
        return Err(format!("expected revision 2, got {}", stored.revision));
    }
    Ok(())
}

async fn concurrent_insert_of_same_id_rejected_at_commit<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut first = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin first: {e}"))?;
    let mut second = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin second: {e}"))?;
    storage
        .insert_execution(&mut first, make_execution("ci-1", None, "ci-1"))
        .await
        .map_err(|e| format!("first insert: {e}"))?;

    let second_insert = storage
        .insert_execution(&mut second, make_execution("ci-1", None, "ci-1"))
        .await;
    storage
        .commit_snapshot(first)
        .await
        .map_err(|e| format!("first commit: {e}"))?;
    let outcome = match second_insert {
        Ok(()) => storage.commit_snapshot(second).await,
        Err(e) => {
            let _ = storage.abort_snapshot(second).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::AlreadyExists { .. }) | Err(StorageError::ConcurrentConflict { .. }) => {
            Ok(())
        }
        Err(e) => Err(format!("expected AlreadyExists, got: {e}")),
        Ok(()) => Err("second insert of the same id committed".to_string()),
    }
}

async fn delete_of_concurrently_updated_record_rejected<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a"]).await?;
    let record = storage
        .get_execution("a")
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut deleter = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin deleter: {e}"))?;
    let delete = storage.delete_execution(&mut deleter, "a", 1).await;

    let mut updater = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin updater: {e}"))?;
    storage
        .update_execution(&mut updater, record, 1)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(updater)
        .await
        .map_err(|e| format!("updater commit: {e}"))?;

    let outcome = match delete {
        Ok(()) => storage.commit_snapshot(deleter).await,
        Err(e) => {
            let _ = storage.abort_snapshot(deleter).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        Err(e) => return Err(format!("expected ConcurrentConflict, got: {e}")),
        Ok(()) => return Err("delete of a stale revision committed".to_string()),
    }
    storage
        .get_execution("a")
        .await
        .map_err(|e| format!("updated record was deleted: {e}"))?;
    Ok(())
}
