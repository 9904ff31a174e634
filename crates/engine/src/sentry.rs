//! Sentry part registry.
//!
//! Parts are owned by the container execution that declares the sentry and
//! are loaded once per container per command, grouped by sentry id. A sentry
//! is satisfied when its group is non-empty and every part in it is
//! satisfied. The verdict is cached per sentry until one of its parts is
//! marked or the sentry is reset; adding a part leaves the cached verdict
//! alone. A sentry's parts are reset when it fires.

use std::collections::{BTreeMap, HashMap, HashSet};

use arbor_core::{Transition, VariableTransition};
use arbor_storage::{ArborStorage, SentryPartRecord, SentryPartType};

use crate::error::EngineError;
use crate::staging::{Pending, Staged};
use crate::tree::Session;

#[derive(Default)]
pub(crate) struct SentryPartRegistry {
    loaded: HashSet<String>,
    /// container id → sentry id → part ids
    groups: HashMap<String, BTreeMap<String, Vec<String>>>,
    parts: HashMap<String, Staged<SentryPartRecord>>,
    verdicts: HashMap<(String, String), bool>,
    next_seq: u64,
}

impl SentryPartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load<S: ArborStorage>(
        &mut self,
        session: &mut Session<'_, S>,
        container_id: &str,
    ) -> Result<(), EngineError> {
        if self.loaded.contains(container_id) {
            return Ok(());
        }
        session.reads += 1;
        let records = session
            .storage
            .select_sentry_parts_by_execution(&mut session.snapshot, container_id)
            .await?;
        self.loaded.insert(container_id.to_string());
        let groups = self.groups.entry(container_id.to_string()).or_default();
        for record in records {
            groups
                .entry(record.sentry_id.clone())
                .or_default()
                .push(record.id.clone());
            self.parts
                .insert(record.id.clone(), Staged::loaded(record));
        }
        Ok(())
    }

    /// Register a container created in this command; there is nothing to
    /// load for it.
    pub fn init_container(&mut self, container_id: &str) {
        self.loaded.insert(container_id.to_string());
        self.groups.entry(container_id.to_string()).or_default();
    }

    pub fn has_parts(&self, container_id: &str) -> bool {
        self.groups
            .get(container_id)
            .is_some_and(|g| g.values().any(|ids| ids.iter().any(|id| self.is_live(id))))
    }

    pub fn add_part(&mut self, record: SentryPartRecord) {
        self.next_seq += 1;
        self.groups
            .entry(record.case_execution_id.clone())
            .or_default()
            .entry(record.sentry_id.clone())
            .or_default()
            .push(record.id.clone());
        self.parts
            .insert(record.id.clone(), Staged::created(record, self.next_seq));
    }

    pub fn find_parts(&self, container_id: &str, sentry_id: &str) -> Vec<&SentryPartRecord> {
        self.group(container_id, sentry_id)
            .iter()
            .filter_map(|id| self.parts.get(id))
            .filter(|p| p.is_live())
            .map(|p| &p.record)
            .collect()
    }

    /// Conjunction over the sentry's parts; an empty sentry is unsatisfied.
    pub fn is_satisfied(&mut self, container_id: &str, sentry_id: &str) -> bool {
        let key = (container_id.to_string(), sentry_id.to_string());
        if let Some(verdict) = self.verdicts.get(&key) {
            return *verdict;
        }
        let parts = self.find_parts(container_id, sentry_id);
        let verdict = !parts.is_empty() && parts.iter().all(|p| p.satisfied);
        self.verdicts.insert(key, verdict);
        verdict
    }

    /// The unsatisfied if-part of a sentry whose other parts are all
    /// satisfied. That is the only moment an if-part is worth evaluating.
    pub fn pending_if_part(&self, container_id: &str, sentry_id: &str) -> Option<String> {
        let parts = self.find_parts(container_id, sentry_id);
        let mut pending = None;
        for part in parts {
            match (part.part_type, part.satisfied) {
                (_, true) => {}
                (SentryPartType::IfPart, false) if pending.is_none() => {
                    pending = Some(part.id.clone())
                }
                _ => return None,
            }
        }
        pending
    }

    pub fn mark_satisfied(&mut self, part_id: &str) -> Result<(), EngineError> {
        let part = self.live_part_mut(part_id)?;
        if part.record.satisfied {
            return Ok(());
        }
        part.record.satisfied = true;
        part.touch();
        let key = (
            part.record.case_execution_id.clone(),
            part.record.sentry_id.clone(),
        );
        self.verdicts.remove(&key);
        Ok(())
    }

    /// Stage an update of every part of the sentry, satisfied or not, so two
    /// commands that both touch the sentry conflict on commit.
    pub fn force_update(&mut self, container_id: &str, sentry_id: &str) {
        let ids = self.group(container_id, sentry_id).to_vec();
        for id in ids {
            if let Some(part) = self.parts.get_mut(&id) {
                part.touch();
            }
        }
    }

    /// Unsatisfy the parts of a sentry that just fired, so it only fires
    /// again once its parts are satisfied anew.
    pub fn reset_sentry(&mut self, container_id: &str, sentry_id: &str) -> usize {
        let ids = self.group(container_id, sentry_id).to_vec();
        let mut reset = 0;
        for id in ids {
            if let Some(part) = self.parts.get_mut(&id) {
                if part.is_live() && part.record.satisfied {
                    part.record.satisfied = false;
                    part.touch();
                    reset += 1;
                }
            }
        }
        self.verdicts.remove(&(container_id.to_string(), sentry_id.to_string()));
        reset
    }

    /// Bind on-parts listening to `activity_id` to the execution just
    /// created for it.
    pub fn bind_source(&mut self, container_id: &str, activity_id: &str, execution_id: &str) {
        for id in self.all_ids(container_id) {
            if let Some(part) = self.parts.get_mut(&id) {
                let record = &part.record;
                if record.part_type == SentryPartType::OnPart
                    && record.source_activity_id.as_deref() == Some(activity_id)
                    && record.source_execution_id.as_deref() != Some(execution_id)
                {
                    part.record.source_execution_id = Some(execution_id.to_string());
                    part.touch();
                }
            }
        }
    }

    /// Execution ids on-parts of the container are bound to.
    pub fn bound_sources(&self, container_id: &str) -> Vec<String> {
        let mut sources: Vec<String> = self
            .all_ids(container_id)
            .iter()
            .filter_map(|id| self.parts.get(id))
            .filter(|p| p.is_live())
            .filter_map(|p| p.record.source_execution_id.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// On-parts of the container waiting for `event` from this source:
    /// bound parts match the execution, unbound parts match the activity.
    /// Returns `(part id, sentry id)` pairs.
    pub fn matching_on_parts(
        &self,
        container_id: &str,
        source_execution_id: &str,
        source_activity_id: &str,
        event: Transition,
    ) -> Vec<(String, String)> {
        self.live_parts(container_id)
            .filter(|p| p.part_type == SentryPartType::OnPart && p.standard_event == Some(event))
            .filter(|p| match p.source_execution_id.as_deref() {
                Some(bound) => bound == source_execution_id,
                None => p.source_activity_id.as_deref() == Some(source_activity_id),
            })
            .map(|p| (p.id.clone(), p.sentry_id.clone()))
            .collect()
    }

    pub fn matching_variable_on_parts(
        &self,
        container_id: &str,
        variable_name: &str,
        event: VariableTransition,
    ) -> Vec<(String, String, bool)> {
        self.live_parts(container_id)
            .filter(|p| {
                p.part_type == SentryPartType::VariableOnPart
                    && p.variable_event == Some(event)
                    && p.variable_name.as_deref() == Some(variable_name)
            })
            .map(|p| (p.id.clone(), p.sentry_id.clone(), p.satisfied))
            .collect()
    }

    /// Stage deletion of every part the container owns.
    pub fn remove_container(&mut self, container_id: &str) -> usize {
        let mut removed = 0;
        for id in self.all_ids(container_id) {
            self.next_seq += 1;
            let seq = self.next_seq;
            if let Some(part) = self.parts.get_mut(&id) {
                if part.is_live() {
                    part.delete(seq);
                    removed += 1;
                }
            }
        }
        self.verdicts.retain(|(container, _), _| container != container_id);
        removed
    }

    pub fn take_pending(&self) -> Pending<SentryPartRecord> {
        Pending::collect(self.parts.values())
    }

    fn group(&self, container_id: &str, sentry_id: &str) -> &[String] {
        self.groups
            .get(container_id)
            .and_then(|g| g.get(sentry_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn all_ids(&self, container_id: &str) -> Vec<String> {
        self.groups
            .get(container_id)
            .map(|g| g.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn live_parts<'a>(&'a self, container_id: &str) -> impl Iterator<Item = &'a SentryPartRecord> {
        self.all_ids(container_id)
            .into_iter()
            .filter_map(move |id| self.parts.get(&id))
            .filter(|p| p.is_live())
            .map(|p| &p.record)
    }

    fn is_live(&self, part_id: &str) -> bool {
        self.parts.get(part_id).is_some_and(|p| p.is_live())
    }

    fn live_part_mut(
        &mut self,
        part_id: &str,
    ) -> Result<&mut Staged<SentryPartRecord>, EngineError> {
        self.parts
            .get_mut(part_id)
            .filter(|p| p.is_live())
            .ok_or_else(|| EngineError::not_found("sentry part", part_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_storage::conformance::make_sentry_part;
    use arbor_storage::MemoryStorage;

    fn part(id: &str, sentry: &str, satisfied: bool) -> SentryPartRecord {
        let mut record = make_sentry_part(id, "ci-1", "ci-1");
        record.sentry_id = sentry.to_string();
        record.satisfied = satisfied;
        record
    }

    #[test]
    fn empty_sentry_is_unsatisfied() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        assert!(!registry.is_satisfied("ci-1", "S1"));
    }

    #[test]
    fn conjunction_over_parts() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        registry.add_part(part("p1", "S1", true));
        registry.add_part(part("p2", "S1", false));
        assert!(!registry.is_satisfied("ci-1", "S1"));
        registry.mark_satisfied("p2").unwrap();
        assert!(registry.is_satisfied("ci-1", "S1"));
    }

    #[test]
    fn cached_verdict_survives_add_part_but_not_reset() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        registry.add_part(part("p1", "S1", true));
        assert!(registry.is_satisfied("ci-1", "S1"));

        registry.add_part(part("p2", "S1", false));
        assert!(registry.is_satisfied("ci-1", "S1"));

        assert_eq!(registry.reset_sentry("ci-1", "S1"), 1);
        assert!(!registry.is_satisfied("ci-1", "S1"));
    }

    #[test]
    fn reset_sentry_leaves_other_sentries_alone() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        registry.add_part(part("p1", "S1", true));
        registry.add_part(part("p2", "S2", true));
        assert!(registry.is_satisfied("ci-1", "S2"));

        assert_eq!(registry.reset_sentry("ci-1", "S1"), 1);
        assert!(!registry.is_satisfied("ci-1", "S1"));
        assert!(registry.is_satisfied("ci-1", "S2"));
        assert_eq!(registry.reset_sentry("ci-1", "S1"), 0);
    }

    #[tokio::test]
    async fn freshly_loaded_registry_recomputes() {
        let storage = MemoryStorage::new();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .insert_sentry_part(&mut snap, part("p1", "S1", true))
            .await
            .unwrap();
        storage
            .insert_sentry_part(&mut snap, part("p2", "S1", false))
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let mut session = Session::begin(&storage).await.unwrap();
        let mut registry = SentryPartRegistry::new();
        registry.load(&mut session, "ci-1").await.unwrap();
        registry.load(&mut session, "ci-1").await.unwrap();
        assert_eq!(session.reads, 1);
        assert!(!registry.is_satisfied("ci-1", "S1"));
        assert!(registry.take_pending().updates.is_empty());
    }

    #[test]
    fn bound_parts_match_execution_unbound_match_activity() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        registry.add_part(part("p1", "S1", false));
        registry.add_part(part("p2", "S2", false));
        registry.bind_source("ci-1", "task", "exec-1");

        let matched = registry.matching_on_parts("ci-1", "exec-1", "task", Transition::Complete);
        assert_eq!(matched.len(), 2);
        assert!(registry
            .matching_on_parts("ci-1", "exec-2", "task", Transition::Complete)
            .is_empty());
        assert!(registry
            .matching_on_parts("ci-1", "exec-1", "task", Transition::Start)
            .is_empty());
    }

    #[test]
    fn pending_if_part_waits_for_other_parts() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        registry.add_part(part("on", "S1", false));
        let mut if_part = part("if", "S1", false);
        if_part.part_type = SentryPartType::IfPart;
        if_part.source_activity_id = None;
        if_part.standard_event = None;
        registry.add_part(if_part);

        assert_eq!(registry.pending_if_part("ci-1", "S1"), None);
        registry.mark_satisfied("on").unwrap();
        assert_eq!(registry.pending_if_part("ci-1", "S1").as_deref(), Some("if"));
    }

    #[test]
    fn remove_container_skips_unwritten_parts() {
        let mut registry = SentryPartRegistry::new();
        registry.init_container("ci-1");
        registry.add_part(part("p1", "S1", false));
        assert_eq!(registry.remove_container("ci-1"), 1);
        let pending = registry.take_pending();
        assert!(pending.inserts.is_empty() && pending.deletes.is_empty());
        assert!(!registry.has_parts("ci-1"));
    }
}
