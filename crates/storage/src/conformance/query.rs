//! `select_executions` conformance tests.

use std::future::Future;

use super::{make_execution, make_variable, TestResult};
use crate::{ArborStorage, ExecutionQuery};

pub(super) async fn run_query_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "query",
        "filter_by_case_instance_and_activity",
        filter_by_case_instance_and_activity(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "filter_by_tenant",
        filter_by_tenant(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "filter_by_business_key_and_variable",
        filter_by_business_key_and_variable(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "order_by_definition_key_desc",
        order_by_definition_key_desc(factory).await,
    ));

    results
}

/// Two trees: ci-1 (tenant t1, key "loan") and ci-2 (no tenant, key "claim").
async fn seed<S: ArborStorage>(storage: &S) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let mut r1 = make_execution("ci-1", None, "ci-1");
    r1.tenant_id = Some("t1".to_string());
    let mut c1 = make_execution("a", Some("ci-1"), "ci-1");
    c1.tenant_id = Some("t1".to_string());
    let mut r2 = make_execution("ci-2", None, "ci-2");
    r2.case_definition_key = "claim".to_string();
    r2.case_definition_id = "claim:1".to_string();
    for record in [r1, c1, r2] {
        storage
            .insert_execution(&mut snap, record)
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }
    storage
        .insert_variable(&mut snap, make_variable("v1", "amount", "ci-2", "ci-2"))
        .await
        .map_err(|e| format!("insert variable: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

fn ids(records: &[crate::ExecutionRecord]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

async fn filter_by_case_instance_and_activity<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage).await?;
    let query = ExecutionQuery::builder()
        .case_instance_id("ci-1")
        .activity_id("task")
        .build();
    let found = storage
        .select_executions(&query)
        .await
        .map_err(|e| format!("query: {e}"))?;
    if ids(&found) != ["a"] {
        return Err(format!("expected [a], got {:?}", ids(&found)));
    }
    Ok(())
}

async fn filter_by_tenant<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage).await?;
    let with = storage
        .select_executions(&ExecutionQuery::builder().tenant_id_in(["t1"]).build())
        .await
        .map_err(|e| format!("query: {e}"))?;
    let without = storage
        .select_executions(&ExecutionQuery::builder().without_tenant_id().build())
        .await
        .map_err(|e| format!("query: {e}"))?;
    if ids(&with) != ["a", "ci-1"] || ids(&without) != ["ci-2"] {
        return Err(format!(
            "tenant filter wrong: with={:?} without={:?}",
            ids(&with),
            ids(&without)
        ));
    }
    Ok(())
}

async fn filter_by_business_key_and_variable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage).await?;
    let by_key = storage
        .select_executions(&ExecutionQuery::builder().business_key("bk-ci-1").build())
        .await
        .map_err(|e| format!("query: {e}"))?;
    let by_var = storage
        .select_executions(
            &ExecutionQuery::builder()
                .variable_value_equals("amount", serde_json::json!(42))
                .build(),
        )
        .await
        .map_err(|e| format!("query: {e}"))?;
    if ids(&by_key) != ["ci-1"] || ids(&by_var) != ["ci-2"] {
        return Err(format!(
            "expected [ci-1] / [ci-2], got {:?} / {:?}",
            ids(&by_key),
            ids(&by_var)
        ));
    }
    Ok(())
}

async fn order_by_definition_key_desc<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage).await?;
    let query = ExecutionQuery::builder()
        .order_by_definition_key()
        .desc()
        .order_by_execution_id()
        .build();
    let found = storage
        .select_executions(&query)
        .await
        .map_err(|e| format!("query: {e}"))?;
    if ids(&found) != ["a", "ci-1", "ci-2"] {
        return Err(format!("unexpected order {:?}", ids(&found)));
    }
    Ok(())
}
