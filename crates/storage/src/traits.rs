use async_trait::async_trait;

use crate::error::StorageError;
use crate::query::ExecutionQuery;
use crate::record::{ExecutionRecord, SentryPartRecord, VariableRecord};

/// The persistence collaborator of the Arbor engine.
///
/// An `ArborStorage` implementation durably stores execution tree nodes,
/// sentry parts and variables, and supports an optimistic revision check on
/// every update and delete.
///
/// ## Snapshot Semantics
///
/// All reads and writes made on behalf of one engine command go through a
/// `Snapshot`, the backend's transaction type. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call select/insert/update/delete methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// Writes made inside a snapshot are visible to reads through the same
/// snapshot and invisible to everyone else until commit. Dropping a snapshot
/// without committing discards its writes.
///
/// ## Revision Checks
///
/// Records carry a `revision` that starts at 1 on insert. `update_*` and
/// `delete_*` take the revision the caller loaded; the backend applies them
/// as `... WHERE id = ? AND revision = ?`. A mismatch, whether detected
/// immediately or at commit, is reported as
/// `StorageError::ConcurrentConflict` and the commit writes nothing.
#[async_trait]
pub trait ArborStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all of its writes durable at once.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all writes.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Executions (within snapshot) ─────────────────────────────────────────

    async fn select_execution(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
    ) -> Result<Option<ExecutionRecord>, StorageError>;

    /// Every node of one tree, root included. Used by the prefetch strategy.
    async fn select_executions_by_case_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        case_instance_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    async fn select_child_executions(
        &self,
        snapshot: &mut Self::Snapshot,
        parent_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn insert_execution(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ExecutionRecord,
    ) -> Result<(), StorageError>;

    /// Replace a node if its stored revision equals `expected_revision`.
    /// Returns the new revision (`expected_revision + 1`).
    async fn update_execution(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ExecutionRecord,
        expected_revision: i64,
    ) -> Result<i64, StorageError>;

    async fn delete_execution(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError>;

    // ── Sentry parts (within snapshot) ───────────────────────────────────────

    async fn select_sentry_parts_by_execution(
        &self,
        snapshot: &mut Self::Snapshot,
        case_execution_id: &str,
    ) -> Result<Vec<SentryPartRecord>, StorageError>;

    async fn select_sentry_parts_by_case_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        case_instance_id: &str,
    ) -> Result<Vec<SentryPartRecord>, StorageError>;

    async fn insert_sentry_part(
        &self,
        snapshot: &mut Self::Snapshot,
        record: SentryPartRecord,
    ) -> Result<(), StorageError>;

    async fn update_sentry_part(
        &self,
        snapshot: &mut Self::Snapshot,
        record: SentryPartRecord,
        expected_revision: i64,
    ) -> Result<i64, StorageError>;

    async fn delete_sentry_part(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError>;

    // ── Variables (within snapshot) ──────────────────────────────────────────

    async fn select_variables_by_scope(
        &self,
        snapshot: &mut Self::Snapshot,
        scope_id: &str,
    ) -> Result<Vec<VariableRecord>, StorageError>;

    async fn select_variables_by_case_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        case_instance_id: &str,
    ) -> Result<Vec<VariableRecord>, StorageError>;

    async fn insert_variable(
        &self,
        snapshot: &mut Self::Snapshot,
        record: VariableRecord,
    ) -> Result<(), StorageError>;

    async fn update_variable(
        &self,
        snapshot: &mut Self::Snapshot,
        record: VariableRecord,
        expected_revision: i64,
    ) -> Result<i64, StorageError>;

    async fn delete_variable(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot, committed data only) ─────────────

    /// Returns `Err(StorageError::NotFound)` if the execution does not exist.
    async fn get_execution(&self, id: &str) -> Result<ExecutionRecord, StorageError>;

    async fn select_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    async fn list_sentry_parts(
        &self,
        case_instance_id: &str,
    ) -> Result<Vec<SentryPartRecord>, StorageError>;

    async fn list_variables(
        &self,
        case_instance_id: &str,
    ) -> Result<Vec<VariableRecord>, StorageError>;
}
