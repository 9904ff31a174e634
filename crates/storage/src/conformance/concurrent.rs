use std::future::Future;
use std::sync::Arc;

use super::{make_execution, seed_tree, TestResult};
use crate::{ArborStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_exactly_one_wins",
        concurrent_updates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_different_trees_all_succeed",
        concurrent_updates_different_trees_all_succeed(factory).await,
    ));

    results
}

// ── Concurrent update: exactly one wins ─────────────────────────────────────

/// N tasks each open a snapshot and update the same node from revision 1.
/// Exactly one commit succeeds; the rest get ConcurrentConflict, either from
/// the update itself or from the commit.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_tree(storage.as_ref(), "ci-1", &["a"]).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let mut record = make_execution("a", Some("ci-1"), "ci-1");
            record.sequence_counter = i as i64 + 10;
            match s.update_execution(&mut snap, record, 1).await {
                Ok(_) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                    Err(e) => Err(e),
                },
                Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
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

async fn concurrent_updates_different_trees_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_tree(storage.as_ref(), &format!("ci-{i}"), &[]).await?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("ci-{i}");
            let mut snap = s.begin_snapshot().await?;
            let record = make_execution(&id, None, &id);
            s.update_execution(&mut snap, record, 1).await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }
    Ok(())
}
