//! Execution tree manager.
//!
//! An explicit arena of [`ExecutionRecord`]s keyed by id, filled from the
//! command's storage snapshot on demand. Two loading strategies produce the
//! same tree:
//!
//! - **prefetch**: the first access to a case instance selects every node
//!   of that instance, then wires parent/child lists in one pass.
//! - **lazy**: each node and each child list is selected the first time it
//!   is touched, then memoized.
//!
//! Child lists are ordered by id for loaded nodes, followed by nodes created
//! in this command in creation order.

use std::collections::{HashMap, HashSet};

use arbor_storage::{ArborStorage, ExecutionRecord};

use crate::config::LoadingStrategy;
use crate::error::EngineError;
use crate::staging::{Pending, Staged};

/// A command's handle on its storage snapshot.
pub(crate) struct Session<'s, S: ArborStorage> {
    pub storage: &'s S,
    pub snapshot: S::Snapshot,
    /// Storage selects issued through this session.
    pub reads: usize,
}

impl<'s, S: ArborStorage> Session<'s, S> {
    pub async fn begin(storage: &'s S) -> Result<Self, EngineError> {
        let snapshot = storage.begin_snapshot().await?;
        Ok(Session {
            storage,
            snapshot,
            reads: 0,
        })
    }
}

struct TreeNode {
    entry: Staged<ExecutionRecord>,
    /// `None` until the child list has been loaded.
    children: Option<Vec<String>>,
}

pub(crate) struct ExecutionTree {
    strategy: LoadingStrategy,
    nodes: HashMap<String, TreeNode>,
    prefetched: HashSet<String>,
    next_seq: u64,
}

impl ExecutionTree {
    pub fn new(strategy: LoadingStrategy) -> Self {
        ExecutionTree {
            strategy,
            nodes: HashMap::new(),
            prefetched: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(|n| n.entry.is_live())
    }

    pub fn get(&self, id: &str) -> Result<&ExecutionRecord, EngineError> {
        self.nodes
            .get(id)
            .filter(|n| n.entry.is_live())
            .map(|n| &n.entry.record)
            .ok_or_else(|| EngineError::not_found("execution", id))
    }

    /// Mutable access; the node is written back on flush.
    pub fn get_mut(&mut self, id: &str) -> Result<&mut ExecutionRecord, EngineError> {
        let node = self
            .nodes
            .get_mut(id)
            .filter(|n| n.entry.is_live())
            .ok_or_else(|| EngineError::not_found("execution", id))?;
        node.entry.touch();
        Ok(&mut node.entry.record)
    }

    /// Make sure `id` is in the arena.
    pub async fn load<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        id: &str,
    ) -> Result<(), EngineError> {
        if self.nodes.contains_key(id) {
            return self.get(id).map(|_| ());
        }
        session.reads += 1;
        let record = session
            .storage
            .select_execution(&mut session.snapshot, id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", id))?;
        match self.strategy {
            LoadingStrategy::Prefetch => {
                let case_instance_id = record.case_instance_id.clone();
                self.prefetch(session, &case_instance_id).await?;
                if !self.nodes.contains_key(id) {
                    return Err(EngineError::inconsistent(
                        id,
                        format!("not returned with case instance {case_instance_id}"),
                    ));
                }
            }
            LoadingStrategy::Lazy => {
                check_root_link(&record)?;
                if let Some(parent) = record.parent_id.as_deref().and_then(|p| self.nodes.get(p)) {
                    if parent.entry.record.case_instance_id != record.case_instance_id {
                        return Err(EngineError::inconsistent(
                            &record.id,
                            "parent belongs to another case instance",
                        ));
                    }
                }
                self.nodes.insert(
                    record.id.clone(),
                    TreeNode {
                        entry: Staged::loaded(record),
                        children: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn prefetch<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        case_instance_id: &str,
    ) -> Result<(), EngineError> {
        if !self.prefetched.insert(case_instance_id.to_string()) {
            return Ok(());
        }
        session.reads += 1;
        let records = session
            .storage
            .select_executions_by_case_instance(&mut session.snapshot, case_instance_id)
            .await?;

        let ids: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let count = ids.len();
        if !ids.contains(case_instance_id) {
            return Err(EngineError::inconsistent(
                case_instance_id,
                "case instance has no root execution",
            ));
        }
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for record in &records {
            check_root_link(record)?;
            if let Some(parent) = record.parent_id.as_deref() {
                if !ids.contains(parent) {
                    return Err(EngineError::inconsistent(
                        &record.id,
                        format!("parent {parent} is not part of case instance {case_instance_id}"),
                    ));
                }
                children
                    .entry(parent.to_string())
                    .or_default()
                    .push(record.id.clone());
            }
        }
        for record in records {
            if self.nodes.contains_key(&record.id) {
                continue;
            }
            let mut kids = children.remove(&record.id).unwrap_or_default();
            kids.sort();
            self.nodes.insert(
                record.id.clone(),
                TreeNode {
                    entry: Staged::loaded(record),
                    children: Some(kids),
                },
            );
        }
        tracing::debug!(case_instance_id, nodes = count, "execution tree prefetched");
        Ok(())
    }

    /// Child ids of a loaded node, loading them first if needed.
    pub async fn load_children<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        id: &str,
    ) -> Result<Vec<String>, EngineError> {
        self.load(session, id).await?;
        if let Some(children) = self.nodes.get(id).and_then(|n| n.children.as_ref()) {
            return Ok(self.live(children));
        }

        session.reads += 1;
        let records = session
            .storage
            .select_child_executions(&mut session.snapshot, id)
            .await?;
        let case_instance_id = self.get(id)?.case_instance_id.clone();
        let mut list = Vec::with_capacity(records.len());
        for record in records {
            if record.case_instance_id != case_instance_id {
                return Err(EngineError::inconsistent(
                    &record.id,
                    "child belongs to another case instance",
                ));
            }
            list.push(record.id.clone());
            self.nodes.entry(record.id.clone()).or_insert(TreeNode {
                entry: Staged::loaded(record),
                children: None,
            });
        }
        list.sort();
        let mut created: Vec<(u64, String)> = self
            .nodes
            .values()
            .filter(|n| {
                n.entry.persist == crate::staging::Persist::New
                    && n.entry.record.parent_id.as_deref() == Some(id)
            })
            .map(|n| (n.entry.seq, n.entry.record.id.clone()))
            .collect();
        created.sort();
        list.extend(created.into_iter().map(|(_, id)| id));

        if let Some(node) = self.nodes.get_mut(id) {
            node.children = Some(list.clone());
        }
        Ok(self.live(&list))
    }

    /// `id` followed by all its descendants, depth-first pre-order.
    pub async fn load_subtree<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            let children = self.load_children(session, &next).await?;
            out.push(next);
            stack.extend(children.into_iter().rev());
        }
        Ok(out)
    }

    /// `id` followed by its ancestors up to the root.
    pub async fn load_ancestors<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(next) = current {
            self.load(session, &next).await?;
            current = self.get(&next)?.parent_id.clone();
            if chain.contains(&next) {
                return Err(EngineError::inconsistent(&next, "parent chain loops"));
            }
            chain.push(next);
        }
        Ok(chain)
    }

    pub async fn find_root<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        case_instance_id: &str,
    ) -> Result<&ExecutionRecord, EngineError> {
        self.load(session, case_instance_id).await?;
        let root = self.get(case_instance_id)?;
        if !root.is_case_instance() {
            return Err(EngineError::inconsistent(
                case_instance_id,
                "case instance id does not name a root execution",
            ));
        }
        Ok(root)
    }

    /// Stage a new node. A child is appended to its parent's child list,
    /// which must already be loaded.
    pub fn insert(&mut self, record: ExecutionRecord) -> Result<(), EngineError> {
        if self.nodes.contains_key(&record.id) {
            return Err(EngineError::inconsistent(&record.id, "execution staged twice"));
        }
        match record.parent_id.as_deref() {
            Some(parent_id) => {
                let parent = self
                    .nodes
                    .get_mut(parent_id)
                    .ok_or_else(|| EngineError::not_found("execution", parent_id))?;
                if parent.entry.record.case_instance_id != record.case_instance_id {
                    return Err(EngineError::inconsistent(
                        &record.id,
                        "child must share its parent's case instance",
                    ));
                }
                parent
                    .children
                    .as_mut()
                    .ok_or_else(|| EngineError::inconsistent(parent_id, "children not loaded"))?
                    .push(record.id.clone());
            }
            None => {
                check_root_link(&record)?;
                self.prefetched.insert(record.case_instance_id.clone());
            }
        }
        self.next_seq += 1;
        self.nodes.insert(
            record.id.clone(),
            TreeNode {
                entry: Staged::created(record, self.next_seq),
                children: Some(Vec::new()),
            },
        );
        Ok(())
    }

    /// Stage deletion of a single node. Callers delete descendants first.
    pub fn delete(&mut self, id: &str) -> Result<(), EngineError> {
        let live_children = self
            .nodes
            .get(id)
            .and_then(|n| n.children.as_ref())
            .map(|c| self.live(c).len())
            .unwrap_or(0);
        if live_children > 0 {
            return Err(EngineError::inconsistent(id, "deleted before its children"));
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let node = self
            .nodes
            .get_mut(id)
            .filter(|n| n.entry.is_live())
            .ok_or_else(|| EngineError::not_found("execution", id))?;
        node.entry.delete(seq);
        Ok(())
    }

    pub fn take_pending(&self) -> Pending<ExecutionRecord> {
        Pending::collect(self.nodes.values().map(|n| &n.entry))
    }

    fn live(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| self.contains(id))
            .cloned()
            .collect()
    }
}

fn check_root_link(record: &ExecutionRecord) -> Result<(), EngineError> {
    let is_root = record.parent_id.is_none();
    let names_itself = record.id == record.case_instance_id;
    if is_root != names_itself {
        return Err(EngineError::inconsistent(
            &record.id,
            "only the root execution may carry its own id as case instance id",
        ));
    }
    Ok(())
}
