//! Revision check conformance tests.
//!
//! Every successful update increments the stored revision by exactly one;
//! an update or delete presenting any other revision is rejected.

use std::future::Future;

use arbor_core::ExecutionState;

use super::{make_sentry_part, make_variable, seed_tree, TestResult};
use crate::{ArborStorage, RecordKind, StorageError};

pub(super) async fn run_revision_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "revision",
        "update_increments_revision_by_one",
        update_increments_revision_by_one(factory).await,
    ));
    results.push(TestResult::from_result(
        "revision",
        "repeated_updates_in_one_snapshot",
        repeated_updates_in_one_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "revision",
        "stale_update_rejected",
        stale_update_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "revision",
        "stale_delete_rejected",
        stale_delete_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "revision",
        "update_missing_record_not_found",
        update_missing_record_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "revision",
        "sentry_part_revision_checked",
        sentry_part_revision_checked(factory).await,
    ));
    results.push(TestResult::from_result(
        "revision",
        "variable_revision_checked",
        variable_revision_checked(factory).await,
    ));

    results
}

async fn update_increments_revision_by_one<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_tree(&storage, "ci-1", &["a"]).await?;
    for expected in 1..=3 {
        let mut record = storage
            .get_execution("a")
            .await
            .map_err(|e| format!("get: {e}"))?;
        record.sequence_counter += 1;
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let new_revision = storage
            .update_execution(&mut snap, record, expected)
            .await
            .map_err(|e| format!("update at {expected}: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
        if new_revision != expected + 1 {
            return Err(format!(
                "expected revision {}, got {new_revision}",
                expected + 1
            ));
        }
    }
    let stored = storage
        .get_execution("a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.revision != 4 {
        return Err(format!("expected stored revision 4, got {}", stored.revision));
    }
    Ok(())
}

async fn repeated_updates_in_one_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let r2 = storage
        .update_execution(&mut snap, record.clone(), 1)
        .await
        .map_err(|e| format!("first update: {e}"))?;
    let r3 = storage
        .update_execution(&mut snap, record, r2)
        .await
        .map_err(|e| format!("second update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    if r3 != 3 {
        return Err(format!("expected revision 3, got {r3}"));
    }
    Ok(())
}

async fn stale_update_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
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
    record.state = ExecutionState::Active;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage.update_execution(&mut snap, record, 7).await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict {
            kind,
            id,
            expected_revision,
        }) => {
            if kind != RecordKind::Execution || id != "a" || expected_revision != 7 {
                return Err(format!("wrong conflict payload: {kind}/{id}@{expected_revision}"));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected ConcurrentConflict, got: {e}")),
        Ok(rev) => Err(format!("stale update succeeded with revision {rev}")),
    }
}

async fn stale_delete_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage.delete_execution(&mut snap, "a", 2).await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got: {e}")),
        Ok(()) => Err("stale delete succeeded".to_string()),
    }
}

async fn update_missing_record_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage
        .update_variable(&mut snap, make_variable("ghost", "x", "nowhere", "nowhere"), 1)
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { kind, .. }) if kind == RecordKind::Variable => Ok(()),
        Err(e) => Err(format!("expected NotFound, got: {e}")),
        Ok(_) => Err("update of a missing variable succeeded".to_string()),
    }
}

async fn sentry_part_revision_checked<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_sentry_part(&mut snap, make_sentry_part("p1", "ci-1", "ci-1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut part = make_sentry_part("p1", "ci-1", "ci-1");
    part.satisfied = true;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let rev = storage
        .update_sentry_part(&mut snap, part.clone(), 1)
        .await
        .map_err(|e| format!("update: {e}"))?;
    let stale = storage.update_sentry_part(&mut snap, part, 1).await;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if rev != 2 {
        return Err(format!("expected part revision 2, got {rev}"));
    }
    if !matches!(stale, Err(StorageError::ConcurrentConflict { .. })) {
        return Err(format!("stale part update not rejected: {stale:?}"));
    }
    let parts = storage
        .list_sentry_parts("ci-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if parts.len() != 1 || !parts[0].satisfied {
        return Err(format!("expected one satisfied part, got {parts:?}"));
    }
    Ok(())
}

async fn variable_revision_checked<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_variable(&mut snap, make_variable("v1", "amount", "ci-1", "ci-1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut var = make_variable("v1", "amount", "ci-1", "ci-1");
    var.value = serde_json::json!(100);
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_variable(&mut snap, var, 1)
        .await
        .map_err(|e| format!("update: {e}"))?;
    let stale_delete = storage.delete_variable(&mut snap, "v1", 1).await;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if !matches!(stale_delete, Err(StorageError::ConcurrentConflict { .. })) {
        return Err(format!("stale variable delete not rejected: {stale_delete:?}"));
    }
    let vars = storage
        .list_variables("ci-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if vars.len() != 1 || vars[0].value != serde_json::json!(100) || vars[0].revision != 2 {
        return Err(format!("unexpected variable state: {vars:?}"));
    }
    Ok(())
}
