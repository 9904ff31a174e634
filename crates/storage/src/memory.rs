//! In-memory reference backend.
//!
//! Committed data lives in three tables behind one mutex. A snapshot keeps
//! its own write overlay plus the revision each touched record had in the
//! committed tables when the snapshot first touched it. Every write is
//! checked against the snapshot's view immediately, and commit re-checks the
//! remembered revisions against the committed tables under the lock before
//! applying the overlay, so a commit is all-or-nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::query::ExecutionQuery;
use crate::record::{ExecutionRecord, RecordKind, SentryPartRecord, VariableRecord};
use crate::traits::ArborStorage;

trait Versioned: Clone {
    const KIND: RecordKind;
    fn id(&self) -> &str;
    fn revision(&self) -> i64;
    fn set_revision(&mut self, revision: i64);
}

macro_rules! versioned {
    ($ty:ty, $kind:expr) => {
        impl Versioned for $ty {
            const KIND: RecordKind = $kind;
            fn id(&self) -> &str {
                &self.id
            }
            fn revision(&self) -> i64 {
                self.revision
            }
            fn set_revision(&mut self, revision: i64) {
                self.revision = revision;
            }
        }
    };
}

versioned!(ExecutionRecord, RecordKind::Execution);
versioned!(SentryPartRecord, RecordKind::SentryPart);
versioned!(VariableRecord, RecordKind::Variable);

type Table<R> = BTreeMap<String, R>;

#[derive(Debug, Default)]
struct Tables {
    executions: Table<ExecutionRecord>,
    sentry_parts: Table<SentryPartRecord>,
    variables: Table<VariableRecord>,
}

// ── Snapshot overlay ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Overlay<R> {
    /// `None` marks a delete.
    writes: BTreeMap<String, Option<R>>,
    /// Committed revision at first touch; `None` if the record did not exist.
    base: BTreeMap<String, Option<i64>>,
}

impl<R> Default for Overlay<R> {
    fn default() -> Self {
        Overlay {
            writes: BTreeMap::new(),
            base: BTreeMap::new(),
        }
    }
}

impl<R: Versioned> Overlay<R> {
    fn current(&self, committed: &Table<R>, id: &str) -> Option<R> {
        match self.writes.get(id) {
            Some(write) => write.clone(),
            None => committed.get(id).cloned(),
        }
    }

    fn remember_base(&mut self, committed: &Table<R>, id: &str) {
        self.base
            .entry(id.to_string())
            .or_insert_with(|| committed.get(id).map(Versioned::revision));
    }

    fn insert(&mut self, committed: &Table<R>, mut record: R) -> Result<(), StorageError> {
        let id = record.id().to_string();
        if self.current(committed, &id).is_some() {
            return Err(StorageError::AlreadyExists { kind: R::KIND, id });
        }
        self.remember_base(committed, &id);
        record.set_revision(1);
        self.writes.insert(id, Some(record));
        Ok(())
    }

    fn update(
        &mut self,
        committed: &Table<R>,
        mut record: R,
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let id = record.id().to_string();
        let current = self
            .current(committed, &id)
            .ok_or_else(|| StorageError::NotFound {
                kind: R::KIND,
                id: id.clone(),
            })?;
        if current.revision() != expected_revision {
            return Err(StorageError::ConcurrentConflict {
                kind: R::KIND,
                id,
                expected_revision,
            });
        }
        self.remember_base(committed, &id);
        let revision = expected_revision + 1;
        record.set_revision(revision);
        self.writes.insert(id, Some(record));
        Ok(revision)
    }

    fn delete(
        &mut self,
        committed: &Table<R>,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError> {
        let current = self
            .current(committed, id)
            .ok_or_else(|| StorageError::NotFound {
                kind: R::KIND,
                id: id.to_string(),
            })?;
        if current.revision() != expected_revision {
            return Err(StorageError::ConcurrentConflict {
                kind: R::KIND,
                id: id.to_string(),
                expected_revision,
            });
        }
        self.remember_base(committed, id);
        self.writes.insert(id.to_string(), None);
        Ok(())
    }

    fn select<P>(&self, committed: &Table<R>, predicate: P) -> Vec<R>
    where
        P: Fn(&R) -> bool,
    {
        let mut out: Vec<R> = committed
            .iter()
            .filter(|(id, _)| !self.writes.contains_key(*id))
            .map(|(_, r)| r)
            .chain(self.writes.values().flatten())
            .filter(|r| predicate(*r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    fn validate(&self, committed: &Table<R>) -> Result<(), StorageError> {
        for (id, base) in &self.base {
            let now = committed.get(id).map(Versioned::revision);
            if now == *base {
                continue;
            }
            return Err(match base {
                None => StorageError::AlreadyExists {
                    kind: R::KIND,
                    id: id.clone(),
                },
                Some(expected_revision) => StorageError::ConcurrentConflict {
                    kind: R::KIND,
                    id: id.clone(),
                    expected_revision: *expected_revision,
                },
            });
        }
        Ok(())
    }

    fn apply(self, committed: &mut Table<R>) {
        for (id, write) in self.writes {
            match write {
                Some(record) => {
                    committed.insert(id, record);
                }
                None => {
                    committed.remove(&id);
                }
            }
        }
    }
}

/// Transaction handle of [`MemoryStorage`].
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    executions: Overlay<ExecutionRecord>,
    sentry_parts: Overlay<SentryPartRecord>,
    variables: Overlay<VariableRecord>,
}

impl MemorySnapshot {
    /// Number of records this snapshot has written (inserts, updates and deletes).
    pub fn pending_writes(&self) -> usize {
        self.executions.writes.len() + self.sentry_parts.writes.len() + self.variables.writes.len()
    }
}

// ── Storage ──────────────────────────────────────────────────────────────────

/// Thread-safe in-memory storage. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl ArborStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        snapshot.executions.validate(&tables.executions)?;
        snapshot.sentry_parts.validate(&tables.sentry_parts)?;
        snapshot.variables.validate(&tables.variables)?;

        snapshot.executions.apply(&mut tables.executions);
        snapshot.sentry_parts.apply(&mut tables.sentry_parts);
        snapshot.variables.apply(&mut tables.variables);
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    // ── Executions ───────────────────────────────────────────────────────────

    async fn select_execution(
        &self,
        snapshot: &mut MemorySnapshot,
        id: &str,
    ) -> Result<Option<ExecutionRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot.executions.current(&tables.executions, id))
    }

    async fn select_executions_by_case_instance(
        &self,
        snapshot: &mut MemorySnapshot,
        case_instance_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot
            .executions
            .select(&tables.executions, |r| r.case_instance_id == case_instance_id))
    }

    async fn select_child_executions(
        &self,
        snapshot: &mut MemorySnapshot,
        parent_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot
            .executions
            .select(&tables.executions, |r| r.parent_id.as_deref() == Some(parent_id)))
    }

    async fn insert_execution(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ExecutionRecord,
    ) -> Result<(), StorageError> {
        let tables = self.lock()?;
        snapshot.executions.insert(&tables.executions, record)
    }

    async fn update_execution(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ExecutionRecord,
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let tables = self.lock()?;
        snapshot
            .executions
            .update(&tables.executions, record, expected_revision)
    }

    async fn delete_execution(
        &self,
        snapshot: &mut MemorySnapshot,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError> {
        let tables = self.lock()?;
        snapshot
            .executions
            .delete(&tables.executions, id, expected_revision)
    }

    // ── Sentry parts ─────────────────────────────────────────────────────────

    async fn select_sentry_parts_by_execution(
        &self,
        snapshot: &mut MemorySnapshot,
        case_execution_id: &str,
    ) -> Result<Vec<SentryPartRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot
            .sentry_parts
            .select(&tables.sentry_parts, |r| r.case_execution_id == case_execution_id))
    }

    async fn select_sentry_parts_by_case_instance(
        &self,
        snapshot: &mut MemorySnapshot,
        case_instance_id: &str,
    ) -> Result<Vec<SentryPartRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot
            .sentry_parts
            .select(&tables.sentry_parts, |r| r.case_instance_id == case_instance_id))
    }

    async fn insert_sentry_part(
        &self,
        snapshot: &mut MemorySnapshot,
        record: SentryPartRecord,
    ) -> Result<(), StorageError> {
        let tables = self.lock()?;
        snapshot.sentry_parts.insert(&tables.sentry_parts, record)
    }

    async fn update_sentry_part(
        &self,
        snapshot: &mut MemorySnapshot,
        record: SentryPartRecord,
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let tables = self.lock()?;
        snapshot
            .sentry_parts
            .update(&tables.sentry_parts, record, expected_revision)
    }

    async fn delete_sentry_part(
        &self,
        snapshot: &mut MemorySnapshot,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError> {
        let tables = self.lock()?;
        snapshot
            .sentry_parts
            .delete(&tables.sentry_parts, id, expected_revision)
    }

    // ── Variables ────────────────────────────────────────────────────────────

    async fn select_variables_by_scope(
        &self,
        snapshot: &mut MemorySnapshot,
        scope_id: &str,
    ) -> Result<Vec<VariableRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot
            .variables
            .select(&tables.variables, |r| r.scope_id == scope_id))
    }

    async fn select_variables_by_case_instance(
        &self,
        snapshot: &mut MemorySnapshot,
        case_instance_id: &str,
    ) -> Result<Vec<VariableRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(snapshot
            .variables
            .select(&tables.variables, |r| r.case_instance_id == case_instance_id))
    }

    async fn insert_variable(
        &self,
        snapshot: &mut MemorySnapshot,
        record: VariableRecord,
    ) -> Result<(), StorageError> {
        let tables = self.lock()?;
        snapshot.variables.insert(&tables.variables, record)
    }

    async fn update_variable(
        &self,
        snapshot: &mut MemorySnapshot,
        record: VariableRecord,
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let tables = self.lock()?;
        snapshot
            .variables
            .update(&tables.variables, record, expected_revision)
    }

    async fn delete_variable(
        &self,
        snapshot: &mut MemorySnapshot,
        id: &str,
        expected_revision: i64,
    ) -> Result<(), StorageError> {
        let tables = self.lock()?;
        snapshot
            .variables
            .delete(&tables.variables, id, expected_revision)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    async fn get_execution(&self, id: &str) -> Result<ExecutionRecord, StorageError> {
        let tables = self.lock()?;
        tables
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind: RecordKind::Execution,
                id: id.to_string(),
            })
    }

    async fn select_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let tables = self.lock()?;
        let locals = |scope_id: &str| -> Vec<VariableRecord> {
            tables
                .variables
                .values()
                .filter(|v| v.scope_id == scope_id)
                .cloned()
                .collect()
        };
        let mut out: Vec<ExecutionRecord> = tables
            .executions
            .values()
            .filter(|r| query.matches(r, &locals))
            .cloned()
            .collect();
        query.apply_ordering(&mut out);
        Ok(out)
    }

    async fn list_sentry_parts(
        &self,
        case_instance_id: &str,
    ) -> Result<Vec<SentryPartRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .sentry_parts
            .values()
            .filter(|r| r.case_instance_id == case_instance_id)
            .cloned()
            .collect())
    }

    async fn list_variables(
        &self,
        case_instance_id: &str,
    ) -> Result<Vec<VariableRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .variables
            .values()
            .filter(|r| r.case_instance_id == case_instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::{make_execution, run_conformance_suite};

    #[tokio::test]
    async fn memory_storage_passes_conformance() {
        let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
        assert!(report.failed == 0, "{report}");
        assert!(report.total > 20);
    }

    #[tokio::test]
    async fn writes_in_one_snapshot_are_read_back_through_it() {
        let storage = MemoryStorage::new();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .insert_execution(&mut snap, make_execution("root", None, "root"))
            .await
            .unwrap();
        storage
            .insert_execution(&mut snap, make_execution("child", Some("root"), "root"))
            .await
            .unwrap();
        let children = storage
            .select_child_executions(&mut snap, "root")
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(snap.pending_writes(), 2);
        assert!(storage.get_execution("root").await.is_err());
        storage.commit_snapshot(snap).await.unwrap();
        assert_eq!(storage.get_execution("child").await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn stale_commit_writes_nothing() {
        let storage = MemoryStorage::new();
        let mut setup = storage.begin_snapshot().await.unwrap();
        storage
            .insert_execution(&mut setup, make_execution("root", None, "root"))
            .await
            .unwrap();
        storage.commit_snapshot(setup).await.unwrap();

        let mut first = storage.begin_snapshot().await.unwrap();
        let mut second = storage.begin_snapshot().await.unwrap();
        let record = storage.get_execution("root").await.unwrap();
        storage
            .update_execution(&mut first, record.clone(), 1)
            .await
            .unwrap();
        storage
            .insert_execution(&mut second, make_execution("other", Some("root"), "root"))
            .await
            .unwrap();
        storage.update_execution(&mut second, record, 1).await.unwrap();

        storage.commit_snapshot(first).await.unwrap();
        let err = storage.commit_snapshot(second).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert!(storage.get_execution("other").await.is_err());
        assert_eq!(storage.get_execution("root").await.unwrap().revision, 2);
    }
}
