//! Write staging shared by the execution tree, the sentry part registry and
//! the variable store.
//!
//! Records are loaded into an arena and mutated in place. Nothing reaches
//! the storage snapshot until the command flushes, at which point each
//! component hands back a [`Pending`] batch.

use arbor_storage::{ExecutionRecord, SentryPartRecord, VariableRecord};

pub(crate) trait Revisioned: Clone {
    fn id(&self) -> &str;
    fn revision(&self) -> i64;
}

macro_rules! revisioned {
    ($($record:ty),*) => {
        $(impl Revisioned for $record {
            fn id(&self) -> &str {
                &self.id
            }

            fn revision(&self) -> i64 {
                self.revision
            }
        })*
    };
}

revisioned!(ExecutionRecord, SentryPartRecord, VariableRecord);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Persist {
    /// Created in this command; inserted on flush.
    New,
    /// Loaded and untouched.
    Clean,
    /// Loaded and modified; updated on flush against the loaded revision.
    Dirty,
    /// Loaded and deleted; deleted on flush against the loaded revision.
    Deleted,
    /// Created and deleted in the same command; never written.
    Discarded,
}

#[derive(Debug, Clone)]
pub(crate) struct Staged<R> {
    pub record: R,
    pub persist: Persist,
    /// Orders inserts by creation and deletes by deletion.
    pub seq: u64,
}

impl<R: Revisioned> Staged<R> {
    pub fn loaded(record: R) -> Self {
        Staged {
            record,
            persist: Persist::Clean,
            seq: 0,
        }
    }

    pub fn created(record: R, seq: u64) -> Self {
        Staged {
            record,
            persist: Persist::New,
            seq,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.persist, Persist::Deleted | Persist::Discarded)
    }

    /// Mark for update. New records stay inserts.
    pub fn touch(&mut self) {
        if self.persist == Persist::Clean {
            self.persist = Persist::Dirty;
        }
    }

    pub fn delete(&mut self, seq: u64) {
        self.persist = match self.persist {
            Persist::New | Persist::Discarded => Persist::Discarded,
            _ => Persist::Deleted,
        };
        self.seq = seq;
    }
}

/// Writes a component wants applied to the snapshot.
#[derive(Debug)]
pub(crate) struct Pending<R> {
    pub inserts: Vec<R>,
    /// Record and the revision it was loaded at.
    pub updates: Vec<(R, i64)>,
    pub deletes: Vec<(String, i64)>,
}

impl<R: Revisioned> Pending<R> {
    pub fn collect<'a>(entries: impl Iterator<Item = &'a Staged<R>>) -> Self
    where
        R: 'a,
    {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for entry in entries {
            match entry.persist {
                Persist::New => inserts.push(entry),
                Persist::Dirty => updates.push(entry),
                Persist::Deleted => deletes.push(entry),
                Persist::Clean | Persist::Discarded => {}
            }
        }
        inserts.sort_by_key(|e| e.seq);
        updates.sort_by(|a, b| a.record.id().cmp(b.record.id()));
        deletes.sort_by_key(|e| e.seq);
        Pending {
            inserts: inserts.into_iter().map(|e| e.record.clone()).collect(),
            updates: updates
                .into_iter()
                .map(|e| (e.record.clone(), e.record.revision()))
                .collect(),
            deletes: deletes
                .into_iter()
                .map(|e| (e.record.id().to_string(), e.record.revision()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variable(id: &str) -> VariableRecord {
        VariableRecord {
            id: id.to_string(),
            revision: 3,
            name: "x".to_string(),
            value: json!(1),
            scope_id: "ci-1".to_string(),
            case_instance_id: "ci-1".to_string(),
            sequence_counter: 1,
        }
    }

    #[test]
    fn created_then_deleted_is_never_written() {
        let mut entry = Staged::created(variable("v1"), 1);
        entry.touch();
        entry.delete(2);
        let pending = Pending::collect([&entry].into_iter());
        assert!(pending.inserts.is_empty());
        assert!(pending.updates.is_empty());
        assert!(pending.deletes.is_empty());
    }

    #[test]
    fn updates_and_deletes_use_loaded_revision() {
        let mut updated = Staged::loaded(variable("v1"));
        updated.record.value = json!(2);
        updated.touch();
        let mut deleted = Staged::loaded(variable("v2"));
        deleted.delete(7);
        let untouched = Staged::loaded(variable("v3"));

        let pending = Pending::collect([&updated, &deleted, &untouched].into_iter());
        assert_eq!(pending.updates.len(), 1);
        assert_eq!(pending.updates[0].1, 3);
        assert_eq!(pending.deletes, vec![("v2".to_string(), 3)]);
    }

    #[test]
    fn inserts_keep_creation_order() {
        let second = Staged::created(variable("a"), 2);
        let first = Staged::created(variable("b"), 1);
        let pending = Pending::collect([&second, &first].into_iter());
        let ids: Vec<_> = pending.inserts.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
