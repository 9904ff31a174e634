//! Variable scope store and the variable listener chain.
//!
//! Each execution is a variable scope. The store only knows local
//! variables; hierarchical lookup walks the execution tree and lives in the
//! command context. Every mutation runs the listeners in [`LISTENER_ORDER`].

use std::collections::{BTreeMap, HashMap, HashSet};

use arbor_core::VariableTransition;
use arbor_storage::{ArborStorage, VariableRecord};
use serde::Serialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::staging::{Pending, Staged};
use crate::tree::Session;

// ──────────────────────────────────────────────
// Listener chain
// ──────────────────────────────────────────────

/// A change to one variable, as seen by listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableEvent {
    pub transition: VariableTransition,
    pub scope_id: String,
    pub case_instance_id: String,
    pub name: String,
    /// `None` for deletes.
    pub value: Option<Value>,
    /// `None` for creates.
    pub previous_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

/// User code notified of every variable change inside the command.
/// Returning an error aborts the command.
pub trait VariableListener: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, event: &VariableEvent) -> Result<(), ListenerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStage {
    /// Stage the record write.
    Persistence,
    /// Bump the owning execution's counter and stamp the variable.
    SequenceCounter,
    History,
    /// Custom [`VariableListener`]s, in registration order.
    Invocation,
    /// Variable on-parts and if-parts of containers in the scope's subtree.
    OnPart,
}

pub const LISTENER_ORDER: [ListenerStage; 5] = [
    ListenerStage::Persistence,
    ListenerStage::SequenceCounter,
    ListenerStage::History,
    ListenerStage::Invocation,
    ListenerStage::OnPart,
];

// ──────────────────────────────────────────────
// Store
// ──────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct VariableStore {
    loaded: HashSet<String>,
    /// scope id → name → variable id
    scopes: HashMap<String, BTreeMap<String, String>>,
    records: HashMap<String, Staged<VariableRecord>>,
    next_seq: u64,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        scope_id: &str,
    ) -> Result<(), EngineError> {
        if self.loaded.contains(scope_id) {
            return Ok(());
        }
        session.reads += 1;
        let records = session
            .storage
            .select_variables_by_scope(&mut session.snapshot, scope_id)
            .await?;
        self.loaded.insert(scope_id.to_string());
        let names = self.scopes.entry(scope_id.to_string()).or_default();
        for record in records {
            if names.insert(record.name.clone(), record.id.clone()).is_some() {
                return Err(EngineError::inconsistent(
                    scope_id,
                    format!("variable {} stored twice", record.name),
                ));
            }
            self.records.insert(record.id.clone(), Staged::loaded(record));
        }
        Ok(())
    }

    pub fn init_scope(&mut self, scope_id: &str) {
        self.loaded.insert(scope_id.to_string());
        self.scopes.entry(scope_id.to_string()).or_default();
    }

    pub fn get_local(&self, scope_id: &str, name: &str) -> Option<&VariableRecord> {
        self.scopes
            .get(scope_id)
            .and_then(|names| names.get(name))
            .and_then(|id| self.records.get(id))
            .filter(|r| r.is_live())
            .map(|r| &r.record)
    }

    /// Local variables of a loaded scope, by name.
    pub fn locals(&self, scope_id: &str) -> BTreeMap<String, Value> {
        self.scopes
            .get(scope_id)
            .map(|names| {
                names
                    .values()
                    .filter_map(|id| self.records.get(id))
                    .filter(|r| r.is_live())
                    .map(|r| (r.record.name.clone(), r.record.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stage a create or update. Returns the event transition and the value
    /// being replaced.
    pub fn stage_set(
        &mut self,
        scope_id: &str,
        case_instance_id: &str,
        name: &str,
        value: Value,
    ) -> (VariableTransition, Option<Value>) {
        let existing = self
            .scopes
            .get(scope_id)
            .and_then(|names| names.get(name))
            .cloned()
            .filter(|id| self.records.get(id).is_some_and(|r| r.is_live()));
        if let Some(id) = existing {
            if let Some(entry) = self.records.get_mut(&id) {
                let previous = std::mem::replace(&mut entry.record.value, value);
                entry.touch();
                return (VariableTransition::Update, Some(previous));
            }
        }

        self.next_seq += 1;
        let record = VariableRecord {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            name: name.to_string(),
            value,
            scope_id: scope_id.to_string(),
            case_instance_id: case_instance_id.to_string(),
            sequence_counter: 0,
        };
        self.scopes
            .entry(scope_id.to_string())
            .or_default()
            .insert(name.to_string(), record.id.clone());
        self.records
            .insert(record.id.clone(), Staged::created(record, self.next_seq));
        (VariableTransition::Create, None)
    }

    /// Stage a delete. Returns the removed value, or `None` when the scope
    /// has no such local variable.
    pub fn stage_remove(&mut self, scope_id: &str, name: &str) -> Option<Value> {
        let id = self.scopes.get_mut(scope_id)?.remove(name)?;
        self.next_seq += 1;
        let seq = self.next_seq;
        let entry = self.records.get_mut(&id)?;
        entry.delete(seq);
        Some(entry.record.value.clone())
    }

    pub fn stamp(&mut self, scope_id: &str, name: &str, sequence_counter: i64) {
        let id = self
            .scopes
            .get(scope_id)
            .and_then(|names| names.get(name))
            .cloned();
        if let Some(entry) = id.and_then(|id| self.records.get_mut(&id)) {
            entry.record.sequence_counter = sequence_counter;
            entry.touch();
        }
    }

    /// Stage deletion of every local variable of a scope. Not routed
    /// through listeners: the scope itself is going away.
    pub fn remove_scope(&mut self, scope_id: &str) -> usize {
        let Some(names) = self.scopes.remove(scope_id) else {
            return 0;
        };
        let mut removed = 0;
        for id in names.into_values() {
            self.next_seq += 1;
            let seq = self.next_seq;
            if let Some(entry) = self.records.get_mut(&id) {
                if entry.is_live() {
                    entry.delete(seq);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn take_pending(&self) -> Pending<VariableRecord> {
        Pending::collect(self.records.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_storage::conformance::make_variable;
    use arbor_storage::MemoryStorage;
    use serde_json::json;

    #[test]
    fn listener_order_is_fixed() {
        assert_eq!(LISTENER_ORDER[0], ListenerStage::Persistence);
        assert_eq!(LISTENER_ORDER[4], ListenerStage::OnPart);
    }

    #[test]
    fn set_creates_then_updates() {
        let mut store = VariableStore::new();
        store.init_scope("ci-1");
        let (first, previous) = store.stage_set("ci-1", "ci-1", "amount", json!(10));
        assert_eq!(first, VariableTransition::Create);
        assert_eq!(previous, None);

        let (second, previous) = store.stage_set("ci-1", "ci-1", "amount", json!(20));
        assert_eq!(second, VariableTransition::Update);
        assert_eq!(previous, Some(json!(10)));
        assert_eq!(store.get_local("ci-1", "amount").unwrap().value, json!(20));

        let pending = store.take_pending();
        assert_eq!(pending.inserts.len(), 1);
        assert!(pending.updates.is_empty());
    }

    #[tokio::test]
    async fn remove_loaded_variable_stages_delete() {
        let storage = MemoryStorage::new();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .insert_variable(&mut snap, make_variable("v1", "amount", "a", "ci-1"))
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let mut session = Session::begin(&storage).await.unwrap();
        let mut store = VariableStore::new();
        store.load(&mut session, "a").await.unwrap();
        assert_eq!(store.locals("a").get("amount"), Some(&json!(42)));
        assert_eq!(store.stage_remove("a", "amount"), Some(json!(42)));
        assert_eq!(store.stage_remove("a", "amount"), None);
        assert!(store.get_local("a", "amount").is_none());
        assert_eq!(store.take_pending().deletes, vec![("v1".to_string(), 1)]);
    }

    #[test]
    fn remove_scope_counts_live_variables() {
        let mut store = VariableStore::new();
        store.init_scope("a");
        store.stage_set("a", "ci-1", "x", json!(1));
        store.stage_set("a", "ci-1", "y", json!(2));
        store.stage_remove("a", "y");
        assert_eq!(store.remove_scope("a"), 1);
        assert_eq!(store.remove_scope("a"), 0);
    }
}
