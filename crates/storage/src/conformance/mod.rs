//! Conformance test suite for `ArborStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `ArborStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Records**: insert/select of executions, sentry parts and variables
//! - **Snapshot isolation**: uncommitted writes invisible, committed writes visible
//! - **Revision checks**: +1 per update, stale updates and deletes rejected
//! - **Atomic commit**: all-or-nothing semantics for multi-record snapshots
//! - **Queries**: `select_executions` criteria and ordering
//! - **Concurrency**: racing snapshots on one record, exactly one wins
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use arbor_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod query;
mod records;
mod revision;
mod snapshot;

use std::fmt;
use std::future::Future;

use arbor_core::{ActivityType, DefinitionKind, ExecutionState, Transition};

use crate::record::{ExecutionRecord, SentryPartRecord, SentryPartType, VariableRecord};
use crate::ArborStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "records", "snapshot", "revision").
    pub category: String,
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ArborStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(records::run_record_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(revision::run_revision_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(query::run_query_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────
//
// Public so backend crates and engine tests can seed fixtures the same way.

/// A `loan:1` node: the root is an active `plan`, children are available
/// `task`s.
pub fn make_execution(
    id: &str,
    parent_id: Option<&str>,
    case_instance_id: &str,
) -> ExecutionRecord {
    let is_root = parent_id.is_none();
    ExecutionRecord {
        id: id.to_string(),
        revision: 0,
        parent_id: parent_id.map(str::to_string),
        case_instance_id: case_instance_id.to_string(),
        case_definition_id: "loan:1".to_string(),
        case_definition_key: "loan".to_string(),
        kind: DefinitionKind::Case,
        business_key: is_root.then(|| format!("bk-{id}")),
        activity_id: if is_root { "plan" } else { "task" }.to_string(),
        activity_name: None,
        activity_type: if is_root {
            ActivityType::CasePlanModel
        } else {
            ActivityType::Task
        },
        activity_description: None,
        state: if is_root {
            ExecutionState::Active
        } else {
            ExecutionState::Available
        },
        previous_state: None,
        tenant_id: None,
        super_execution_id: None,
        sub_execution_id: None,
        super_case_execution_id: None,
        sub_case_instance_id: None,
        required: false,
        sequence_counter: 1,
    }
}

/// An unbound on-part of sentry `S1` listening for `task` completing.
pub fn make_sentry_part(
    id: &str,
    case_execution_id: &str,
    case_instance_id: &str,
) -> SentryPartRecord {
    SentryPartRecord {
        id: id.to_string(),
        revision: 0,
        sentry_id: "S1".to_string(),
        case_execution_id: case_execution_id.to_string(),
        case_instance_id: case_instance_id.to_string(),
        part_type: SentryPartType::OnPart,
        source_activity_id: Some("task".to_string()),
        source_execution_id: None,
        standard_event: Some(Transition::Complete),
        variable_name: None,
        variable_event: None,
        satisfied: false,
    }
}

pub fn make_variable(
    id: &str,
    name: &str,
    scope_id: &str,
    case_instance_id: &str,
) -> VariableRecord {
    VariableRecord {
        id: id.to_string(),
        revision: 0,
        name: name.to_string(),
        value: serde_json::json!(42),
        scope_id: scope_id.to_string(),
        case_instance_id: case_instance_id.to_string(),
        sequence_counter: 1,
    }
}

/// Insert a root and its children in one committed snapshot.
async fn seed_tree<S: ArborStorage>(
    storage: &S,
    root: &str,
    children: &[&str],
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_execution(&mut snap, make_execution(root, None, root))
        .await
        .map_err(|e| format!("insert root: {e}"))?;
    for child in children {
        storage
            .insert_execution(&mut snap, make_execution(child, Some(root), root))
            .await
            .map_err(|e| format!("insert {child}: {e}"))?;
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}
