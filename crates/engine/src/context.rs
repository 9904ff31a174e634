//! Command context and atomic operation executor.
//!
//! One context exists per command. It owns the storage snapshot, the arena
//! of loaded executions, sentry parts and variables, the FIFO operation
//! queue and the history events collected so far. Operations mutate the
//! arena only; everything is written to the snapshot in one flush right
//! before commit, so a failing operation leaves storage untouched.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use arbor_core::{
    ActivityDefinition, ActivityType, CaseDefinition, DefinitionKind, ExecutionState, ExitAction,
    SentryDeclaration, Transition, VariableTransition,
};
use arbor_storage::{ArborStorage, ExecutionRecord, SentryPartRecord, SentryPartType};
use serde::Serialize;
use serde_json::Value;

use crate::engine::Services;
use crate::error::EngineError;
use crate::history::{HistoryEvent, HistoryEventKind};
use crate::operation::{AtomicOperation, FollowUps};
use crate::sentry::SentryPartRegistry;
use crate::tenant::{resolve_tenant_id, TenantContext};
use crate::tree::{ExecutionTree, Session};
use crate::variables::{ListenerStage, VariableEvent, VariableStore, LISTENER_ORDER};

// ──────────────────────────────────────────────
// Report
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub executions: usize,
    pub sentry_parts: usize,
    pub variables: usize,
}

impl RecordCounts {
    pub fn total(&self) -> usize {
        self.executions + self.sentry_parts + self.variables
    }
}

/// What a committed command did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    /// Atomic operations executed, the command's own included.
    pub performed: usize,
    /// Follow-ups that went through the FIFO queue.
    pub queued: usize,
    pub inserted: RecordCounts,
    pub updated: RecordCounts,
    pub deleted: RecordCounts,
    pub storage_reads: usize,
    pub history_events: usize,
}

// ──────────────────────────────────────────────
// Context
// ──────────────────────────────────────────────

pub(crate) struct CommandContext<'e, S: ArborStorage> {
    session: Session<'e, S>,
    services: &'e Services,
    tree: ExecutionTree,
    parts: SentryPartRegistry,
    variables: VariableStore,
    queue: VecDeque<AtomicOperation>,
    history: Vec<HistoryEvent>,
    performed: usize,
    queued: usize,
    /// `(container, sentry)` pairs fired by this command. Their parts are
    /// reset, but criteria checked later in the command still see them
    /// satisfied.
    fired: HashSet<(String, String)>,
}

impl<'e, S: ArborStorage> CommandContext<'e, S> {
    pub async fn begin(storage: &'e S, services: &'e Services) -> Result<Self, EngineError> {
        Ok(CommandContext {
            session: Session::begin(storage).await?,
            services,
            tree: ExecutionTree::new(services.config.tree.loading),
            parts: SentryPartRegistry::new(),
            variables: VariableStore::new(),
            queue: VecDeque::new(),
            history: Vec::new(),
            performed: 0,
            queued: 0,
            fired: HashSet::new(),
        })
    }

    // ── Execution loop ──────────────────────────────────────────────────────

    /// Run `op`, then drain the queue.
    pub async fn perform(&mut self, op: AtomicOperation) -> Result<(), EngineError> {
        self.perform_sync(op).await?;
        while let Some(next) = self.queue.pop_front() {
            self.perform_sync(next).await?;
        }
        Ok(())
    }

    /// Run `op` and its inline follow-ups now; queued follow-ups wait for
    /// the next [`perform`](Self::perform).
    pub async fn perform_sync(&mut self, op: AtomicOperation) -> Result<(), EngineError> {
        let limit = self.services.config.execution.max_operations_per_command;
        let mut stack = vec![op];
        while let Some(op) = stack.pop() {
            if self.performed >= limit {
                return Err(EngineError::CascadeLimitExceeded {
                    limit,
                    last_operation: op.to_string(),
                });
            }
            self.performed += 1;
            tracing::debug!(operation = %op, execution_id = op.execution_id(), "performing");
            let follow = self.execute(op).await?;
            for queued in follow.queued {
                self.queued += 1;
                self.queue.push_back(queued);
            }
            stack.extend(follow.inline.into_iter().rev());
        }
        Ok(())
    }

    async fn execute(&mut self, op: AtomicOperation) -> Result<FollowUps, EngineError> {
        match op {
            AtomicOperation::InitializeContainer { execution_id } => {
                self.initialize_container(&execution_id).await
            }
            AtomicOperation::CreateChild {
                parent_id,
                activity_id,
            } => self.create_child(&parent_id, &activity_id).await,
            AtomicOperation::Transition {
                execution_id,
                transition,
            } => self.transition(&execution_id, transition).await,
            AtomicOperation::FireEntryCriteria { execution_id } => {
                self.fire_entry(&execution_id).await
            }
            AtomicOperation::FireExitCriteria { execution_id } => {
                self.fire_exit(&execution_id).await
            }
            AtomicOperation::EvaluateSentries { container_id } => {
                self.evaluate_sentries(&container_id).await
            }
            AtomicOperation::AutoComplete { execution_id } => {
                self.auto_complete(&execution_id).await
            }
            AtomicOperation::SetVariable {
                scope_id,
                name,
                value,
            } => self.set_variable(&scope_id, &name, value).await,
            AtomicOperation::RemoveVariable { scope_id, name } => {
                self.remove_variable(&scope_id, &name).await
            }
            AtomicOperation::DeleteCaseInstance {
                case_instance_id,
                cascaded,
            } => self.delete_case_instance(&case_instance_id, cascaded).await,
        }
    }

    // ── Commit / abort ──────────────────────────────────────────────────────

    /// Commit on success, abort on failure.
    pub async fn finish<T>(
        self,
        outcome: Result<T, EngineError>,
        command: &str,
    ) -> Result<(T, ExecutionReport), EngineError> {
        match outcome {
            Ok(value) => Ok((value, self.commit().await?)),
            Err(err) => {
                tracing::warn!(command, error = %err, "command aborted");
                self.abort().await;
                Err(err)
            }
        }
    }

    pub async fn commit(mut self) -> Result<ExecutionReport, EngineError> {
        let mut report = match self.flush().await {
            Ok(report) => report,
            Err(err) => {
                self.abort().await;
                return Err(err);
            }
        };
        let events = std::mem::take(&mut self.history);
        report.history_events = events.len();
        let fail_on_error = self.services.config.history.fail_on_error;
        let handler = self.services.history.clone();

        if fail_on_error && !events.is_empty() {
            if let Err(err) = handler.handle_events(&events).await {
                self.abort().await;
                return Err(err.into());
            }
        }
        let Session {
            storage, snapshot, ..
        } = self.session;
        storage.commit_snapshot(snapshot).await?;

        if !fail_on_error && !events.is_empty() {
            if let Err(err) = handler.handle_events(&events).await {
                tracing::warn!(error = %err, events = events.len(), "history events dropped");
            }
        }
        Ok(report)
    }

    pub async fn abort(self) {
        let Session {
            storage, snapshot, ..
        } = self.session;
        if let Err(err) = storage.abort_snapshot(snapshot).await {
            tracing::warn!(error = %err, "snapshot abort failed");
        }
    }

    async fn flush(&mut self) -> Result<ExecutionReport, EngineError> {
        let executions = self.tree.take_pending();
        let parts = self.parts.take_pending();
        let variables = self.variables.take_pending();
        let report = ExecutionReport {
            performed: self.performed,
            queued: self.queued,
            inserted: RecordCounts {
                executions: executions.inserts.len(),
                sentry_parts: parts.inserts.len(),
                variables: variables.inserts.len(),
            },
            updated: RecordCounts {
                executions: executions.updates.len(),
                sentry_parts: parts.updates.len(),
                variables: variables.updates.len(),
            },
            deleted: RecordCounts {
                executions: executions.deletes.len(),
                sentry_parts: parts.deletes.len(),
                variables: variables.deletes.len(),
            },
            storage_reads: self.session.reads,
            history_events: 0,
        };

        let storage = self.session.storage;
        let snap = &mut self.session.snapshot;
        for record in executions.inserts {
            storage.insert_execution(snap, record).await?;
        }
        for record in parts.inserts {
            storage.insert_sentry_part(snap, record).await?;
        }
        for record in variables.inserts {
            storage.insert_variable(snap, record).await?;
        }
        for (record, revision) in executions.updates {
            storage.update_execution(snap, record, revision).await?;
        }
        for (record, revision) in parts.updates {
            storage.update_sentry_part(snap, record, revision).await?;
        }
        for (record, revision) in variables.updates {
            storage.update_variable(snap, record, revision).await?;
        }
        for (id, revision) in variables.deletes {
            storage.delete_variable(snap, &id, revision).await?;
        }
        for (id, revision) in parts.deletes {
            storage.delete_sentry_part(snap, &id, revision).await?;
        }
        for (id, revision) in executions.deletes {
            storage.delete_execution(snap, &id, revision).await?;
        }
        Ok(report)
    }

    // ── Reads used by engine commands ───────────────────────────────────────

    pub async fn load(&mut self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        self.tree.load(&mut self.session, execution_id).await?;
        Ok(self.tree.get(execution_id)?.clone())
    }

    /// Nearest definition of `name`, walking from the execution to the root.
    pub async fn get_variable(
        &mut self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        for scope in self.tree.load_ancestors(&mut self.session, execution_id).await? {
            self.variables.load(&mut self.session, &scope).await?;
            if let Some(variable) = self.variables.get_local(&scope, name) {
                return Ok(Some(variable.value.clone()));
            }
        }
        Ok(None)
    }

    /// All variables visible from the execution; nearer scopes win.
    pub async fn visible_variables(
        &mut self,
        execution_id: &str,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let chain = self.tree.load_ancestors(&mut self.session, execution_id).await?;
        let mut merged = BTreeMap::new();
        for scope in chain.iter().rev() {
            self.variables.load(&mut self.session, scope).await?;
            merged.extend(self.variables.locals(scope));
        }
        Ok(merged)
    }

    pub async fn local_variables(
        &mut self,
        execution_id: &str,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        self.tree.load(&mut self.session, execution_id).await?;
        self.variables.load(&mut self.session, execution_id).await?;
        Ok(self.variables.locals(execution_id))
    }

    /// The execution id followed by its ancestors up to the root.
    pub async fn ancestors(&mut self, execution_id: &str) -> Result<Vec<String>, EngineError> {
        self.tree.load_ancestors(&mut self.session, execution_id).await
    }

    pub async fn find_root(
        &mut self,
        case_instance_id: &str,
    ) -> Result<ExecutionRecord, EngineError> {
        Ok(self
            .tree
            .find_root(&mut self.session, case_instance_id)
            .await?
            .clone())
    }

    /// The node and its descendants, depth-first pre-order.
    pub async fn subtree(
        &mut self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let ids = self.tree.load_subtree(&mut self.session, execution_id).await?;
        ids.iter()
            .map(|id| self.tree.get(id).cloned())
            .collect()
    }

    pub async fn children(
        &mut self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let ids = self.tree.load_children(&mut self.session, execution_id).await?;
        ids.iter()
            .map(|id| self.tree.get(id).cloned())
            .collect()
    }

    pub async fn is_sentry_satisfied(
        &mut self,
        container_id: &str,
        sentry_id: &str,
    ) -> Result<bool, EngineError> {
        self.tree.load(&mut self.session, container_id).await?;
        self.sentry_satisfied(container_id, sentry_id).await
    }

    // ── Instance creation ───────────────────────────────────────────────────

    /// Stage a new root execution. The caller follows up with
    /// `InitializeContainer`.
    pub async fn create_root(
        &mut self,
        definition: &CaseDefinition,
        business_key: Option<String>,
        explicit_tenant: Option<&str>,
        super_execution: Option<&ExecutionRecord>,
        variables: &BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        let context = TenantContext {
            definition,
            variables,
            super_execution,
        };
        let tenant_id = resolve_tenant_id(
            explicit_tenant,
            &context,
            self.services.tenant_provider.as_deref(),
        )
        .await?;

        let plan = definition.plan_model();
        let id = uuid::Uuid::new_v4().to_string();
        let (super_execution_id, super_case_execution_id) = match super_execution {
            Some(caller) if caller.kind == DefinitionKind::Case => (None, Some(caller.id.clone())),
            Some(caller) => (Some(caller.id.clone()), None),
            None => (None, None),
        };
        let record = ExecutionRecord {
            id: id.clone(),
            revision: 1,
            parent_id: None,
            case_instance_id: id.clone(),
            case_definition_id: definition.id().to_string(),
            case_definition_key: definition.key().to_string(),
            kind: definition.kind(),
            business_key,
            activity_id: plan.id.clone(),
            activity_name: plan.name.clone(),
            activity_type: plan.activity_type,
            activity_description: plan.description.clone(),
            state: ExecutionState::Active,
            previous_state: None,
            tenant_id,
            super_execution_id,
            sub_execution_id: None,
            super_case_execution_id,
            sub_case_instance_id: None,
            required: plan.required,
            sequence_counter: 1,
        };
        tracing::info!(
            case_instance_id = %id,
            definition_id = %definition.id(),
            tenant_id = record.tenant_id.as_deref().unwrap_or(""),
            "case instance created"
        );
        self.push_history(execution_event(
            &record,
            HistoryEventKind::ExecutionCreated,
            Some(Transition::Create),
        ));
        self.tree.insert(record)?;
        self.parts.init_container(&id);
        self.variables.init_scope(&id);
        Ok(id)
    }

    async fn initialize_container(&mut self, execution_id: &str) -> Result<FollowUps, EngineError> {
        let record = self.load(execution_id).await?;
        let definition = self.definition(&record)?;
        let activity = activity_of(&definition, &record)?;
        if !activity.activity_type.is_container() {
            return Err(EngineError::precondition(
                execution_id,
                "initialize",
                format!("{} is not a container", activity.activity_type.as_str()),
            ));
        }

        self.parts.load(&mut self.session, execution_id).await?;
        if !self.parts.has_parts(execution_id) {
            for sentry in &activity.sentries {
                for part in sentry_parts(&record, sentry) {
                    self.parts.add_part(part);
                }
            }
        }

        let mut follow = FollowUps::none();
        follow.inline = activity
            .children
            .iter()
            .map(|child| AtomicOperation::CreateChild {
                parent_id: execution_id.to_string(),
                activity_id: child.id.clone(),
            })
            .collect();
        follow.inline.push(AtomicOperation::EvaluateSentries {
            container_id: execution_id.to_string(),
        });
        if activity.children.is_empty() && activity.auto_complete {
            follow.queued.push(AtomicOperation::AutoComplete {
                execution_id: execution_id.to_string(),
            });
        }
        Ok(follow)
    }

    async fn create_child(
        &mut self,
        parent_id: &str,
        activity_id: &str,
    ) -> Result<FollowUps, EngineError> {
        let parent = self.load(parent_id).await?;
        let definition = self.definition(&parent)?;
        let activity = definition
            .activity(activity_id)
            .ok_or_else(|| EngineError::MissingActivity {
                definition_id: definition.id().to_string(),
                activity_id: activity_id.to_string(),
            })?;
        if definition.parent_activity(activity_id).map(|p| p.id.as_str())
            != Some(parent.activity_id.as_str())
        {
            return Err(EngineError::precondition(
                parent_id,
                "create",
                format!("{activity_id} is not a child of {}", parent.activity_id),
            ));
        }
        self.tree.load_children(&mut self.session, parent_id).await?;

        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            parent_id: Some(parent.id.clone()),
            case_instance_id: parent.case_instance_id.clone(),
            case_definition_id: parent.case_definition_id.clone(),
            case_definition_key: parent.case_definition_key.clone(),
            kind: parent.kind,
            business_key: None,
            activity_id: activity.id.clone(),
            activity_name: activity.name.clone(),
            activity_type: activity.activity_type,
            activity_description: activity.description.clone(),
            state: ExecutionState::Available,
            previous_state: None,
            tenant_id: parent.tenant_id.clone(),
            super_execution_id: None,
            sub_execution_id: None,
            super_case_execution_id: None,
            sub_case_instance_id: None,
            required: activity.required,
            sequence_counter: parent.sequence_counter,
        };
        let child_id = record.id.clone();
        self.push_history(execution_event(
            &record,
            HistoryEventKind::ExecutionCreated,
            Some(Transition::Create),
        ));
        self.tree.insert(record)?;
        self.parts.init_container(&child_id);
        self.variables.init_scope(&child_id);
        self.parts.load(&mut self.session, parent_id).await?;
        self.parts.bind_source(parent_id, activity_id, &child_id);
        tracing::debug!(execution_id = %child_id, parent_id, activity_id, "child created");

        let mut follow = self.notify_parent(&child_id, Transition::Create).await?;
        follow.queued.push(AtomicOperation::FireEntryCriteria {
            execution_id: child_id,
        });
        Ok(follow)
    }

    async fn start_called_instance(
        &mut self,
        caller_id: &str,
        called_element: Option<&str>,
    ) -> Result<String, EngineError> {
        let key = called_element.ok_or_else(|| {
            EngineError::precondition(caller_id, "start", "no called element")
        })?;
        let definition = self.services.definitions.latest_by_key(key)?;
        let caller = self.load(caller_id).await?;
        let business_key = self.load(&caller.case_instance_id).await?.business_key;
        let sub_id = self
            .create_root(&definition, business_key, None, Some(&caller), &BTreeMap::new())
            .await?;

        let node = self.tree.get_mut(caller_id)?;
        match definition.kind() {
            DefinitionKind::Case => node.sub_case_instance_id = Some(sub_id.clone()),
            DefinitionKind::Process => node.sub_execution_id = Some(sub_id.clone()),
        }
        let mut event = execution_event(node, HistoryEventKind::SubInstanceCreated, None);
        event.sub_instance_id = Some(sub_id.clone());
        self.push_history(event);
        tracing::debug!(
            execution_id = caller_id,
            sub_instance_id = %sub_id,
            key,
            "sub-instance started"
        );
        Ok(sub_id)
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    async fn transition(
        &mut self,
        execution_id: &str,
        transition: Transition,
    ) -> Result<FollowUps, EngineError> {
        let record = self.load(execution_id).await?;
        let definition = self.definition(&record)?;
        let activity = activity_of(&definition, &record)?;
        let target = transition
            .target(record.state, record.previous_state)
            .ok_or_else(|| EngineError::InvalidTransition {
                execution_id: execution_id.to_string(),
                transition,
                state: record.state,
            })?;
        check_activity_kind(&record, activity, transition)?;

        let scope = sentry_scope_id(&record).to_string();
        if transition.is_entry()
            && record.state == ExecutionState::Available
            && activity.has_entry_criteria()
            && self
                .first_satisfied(&scope, &activity.entry_criteria)
                .await?
                .is_none()
        {
            return Err(EngineError::SentryNotSatisfied {
                execution_id: execution_id.to_string(),
                transition,
                criterion: "entry",
            });
        }
        if transition == Transition::Complete {
            let completing: Vec<String> =
                activity.completing_exit_criteria().map(str::to_string).collect();
            if !completing.is_empty() && self.first_satisfied(&scope, &completing).await?.is_none()
            {
                return Err(EngineError::SentryNotSatisfied {
                    execution_id: execution_id.to_string(),
                    transition,
                    criterion: "completing exit",
                });
            }
        }

        let updated = {
            let node = self.tree.get_mut(execution_id)?;
            node.previous_state = Some(record.state);
            node.state = target;
            node.clone()
        };
        tracing::debug!(
            execution_id,
            transition = %transition,
            from = %record.state,
            to = %target,
            "transition"
        );
        self.push_history(execution_event(
            &updated,
            HistoryEventKind::ExecutionUpdated,
            Some(transition),
        ));

        let mut follow = FollowUps::none();
        let is_container = activity.activity_type.is_container();
        match transition {
            Transition::Start | Transition::ManualStart => {
                if is_container {
                    follow.inline.push(AtomicOperation::InitializeContainer {
                        execution_id: execution_id.to_string(),
                    });
                }
                if activity.activity_type.calls_definition() {
                    let sub_id = self
                        .start_called_instance(execution_id, activity.called_element.as_deref())
                        .await?;
                    follow
                        .inline
                        .push(AtomicOperation::InitializeContainer { execution_id: sub_id });
                }
            }
            Transition::Complete
            | Transition::Terminate
            | Transition::Exit
            | Transition::ParentTerminate => {
                if is_container {
                    for child in self.children(execution_id).await? {
                        if !child.state.is_terminal() {
                            follow.inline.push(AtomicOperation::transition(
                                child.id,
                                Transition::ParentTerminate,
                            ));
                        }
                    }
                }
                if let Some(sub_id) = sub_instance_id(&record) {
                    let sub = self.load(sub_id).await?;
                    if !sub.state.is_terminal() {
                        let stop = if sub.state == ExecutionState::Active {
                            Transition::Terminate
                        } else {
                            Transition::Exit
                        };
                        follow.inline.push(AtomicOperation::transition(sub.id, stop));
                    }
                }
                if transition == Transition::Complete {
                    if let Some(caller) = super_execution_id(&record) {
                        follow
                            .queued
                            .push(AtomicOperation::transition(caller, Transition::Complete));
                    }
                }
            }
            Transition::Suspend | Transition::ParentSuspend => {
                if is_container {
                    for child in self.children(execution_id).await? {
                        if !child.state.is_terminal() && child.state != ExecutionState::Suspended {
                            follow.inline.push(AtomicOperation::transition(
                                child.id,
                                Transition::ParentSuspend,
                            ));
                        }
                    }
                }
            }
            Transition::Resume | Transition::ParentResume => {
                if is_container {
                    for child in self.children(execution_id).await? {
                        if child.state == ExecutionState::Suspended {
                            follow.inline.push(AtomicOperation::transition(
                                child.id,
                                Transition::ParentResume,
                            ));
                        }
                    }
                }
            }
            Transition::Create
            | Transition::Enable
            | Transition::Disable
            | Transition::Reenable
            | Transition::Occur => {}
        }

        if let Some(parent_id) = record.parent_id.as_deref() {
            follow.extend(self.notify_parent(execution_id, transition).await?);
            if target.is_terminal() || target == ExecutionState::Disabled {
                let parent = self.load(parent_id).await?;
                if activity_of(&definition, &parent)?.auto_complete {
                    follow.queued.push(AtomicOperation::AutoComplete {
                        execution_id: parent_id.to_string(),
                    });
                }
            }
        }
        Ok(follow)
    }

    /// Deliver a child's standard event to its container: satisfy the
    /// matching on-parts and fire whatever sentries that completes.
    async fn notify_parent(
        &mut self,
        child_id: &str,
        event: Transition,
    ) -> Result<FollowUps, EngineError> {
        let child = self.tree.get(child_id)?.clone();
        let Some(parent_id) = child.parent_id.as_deref() else {
            return Ok(FollowUps::none());
        };
        let parent = self.load(parent_id).await?;
        if parent.state.is_terminal() {
            return Ok(FollowUps::none());
        }
        self.parts.load(&mut self.session, parent_id).await?;
        self.check_bound_sources(&parent).await?;

        let matched = self
            .parts
            .matching_on_parts(parent_id, child_id, &child.activity_id, event);
        if matched.is_empty() {
            return Ok(FollowUps::none());
        }
        let mut affected = BTreeSet::new();
        for (part_id, sentry_id) in matched {
            self.parts.mark_satisfied(&part_id)?;
            affected.insert(sentry_id);
        }
        for sentry_id in &affected {
            self.parts.force_update(parent_id, sentry_id);
        }
        let mut satisfied = BTreeSet::new();
        for sentry_id in affected {
            if self.sentry_satisfied(parent_id, &sentry_id).await? {
                satisfied.insert(sentry_id);
            }
        }
        tracing::debug!(
            container_id = parent_id,
            source = child_id,
            event = %event,
            satisfied = ?satisfied,
            "on-parts notified"
        );
        self.fire_sentries(parent_id, &satisfied).await
    }

    /// Queue exit criteria of active nodes first, then entry criteria of
    /// available nodes, gated by one of `satisfied`. Those are the
    /// container's children, plus the container itself when it is the active
    /// case instance. The fired sentries' parts are reset.
    async fn fire_sentries(
        &mut self,
        container_id: &str,
        satisfied: &BTreeSet<String>,
    ) -> Result<FollowUps, EngineError> {
        let mut follow = FollowUps::none();
        if satisfied.is_empty() {
            return Ok(follow);
        }
        let container = self.load(container_id).await?;
        let definition = self.definition(&container)?;
        self.parts.load(&mut self.session, container_id).await?;
        for sentry_id in satisfied {
            let reset = self.parts.reset_sentry(container_id, sentry_id);
            self.fired.insert((container_id.to_string(), sentry_id.clone()));
            tracing::debug!(container_id, sentry_id = %sentry_id, reset, "sentry fired");
        }

        for child in self.children(container_id).await? {
            let activity = activity_of(&definition, &child)?;
            let exits = activity
                .exit_criteria
                .iter()
                .any(|c| satisfied.contains(&c.sentry));
            let enters = activity.entry_criteria.iter().any(|s| satisfied.contains(s));
            if exits && child.state == ExecutionState::Active {
                follow.queued.push(AtomicOperation::FireExitCriteria {
                    execution_id: child.id,
                });
            } else if enters && child.state == ExecutionState::Available {
                follow.queued.push(AtomicOperation::FireEntryCriteria {
                    execution_id: child.id,
                });
            }
        }
        if container.is_case_instance() && container.state == ExecutionState::Active {
            let own = activity_of(&definition, &container)?
                .exit_criteria
                .iter()
                .any(|c| satisfied.contains(&c.sentry));
            if own {
                follow.queued.push(AtomicOperation::FireExitCriteria {
                    execution_id: container.id,
                });
            }
        }
        Ok(follow)
    }

    async fn fire_exit(&mut self, execution_id: &str) -> Result<FollowUps, EngineError> {
        let record = self.load(execution_id).await?;
        if record.state != ExecutionState::Active {
            tracing::debug!(execution_id, state = %record.state, "exit criterion skipped");
            return Ok(FollowUps::none());
        }
        let definition = self.definition(&record)?;
        let activity = activity_of(&definition, &record)?;
        let scope = sentry_scope_id(&record).to_string();

        let mut action = None;
        for criterion in &activity.exit_criteria {
            if self.sentry_satisfied(&scope, &criterion.sentry).await? {
                action = Some(criterion.action);
                break;
            }
        }
        let Some(action) = action else {
            return Ok(FollowUps::none());
        };
        let transition = match action {
            ExitAction::Complete => Transition::Complete,
            ExitAction::Exit => Transition::Exit,
        };
        Ok(FollowUps {
            inline: vec![AtomicOperation::transition(execution_id, transition)],
            queued: Vec::new(),
        })
    }

    async fn fire_entry(&mut self, execution_id: &str) -> Result<FollowUps, EngineError> {
        let record = self.load(execution_id).await?;
        if record.state != ExecutionState::Available {
            return Ok(FollowUps::none());
        }
        let definition = self.definition(&record)?;
        let activity = activity_of(&definition, &record)?;
        if activity.has_entry_criteria() {
            let scope = sentry_scope_id(&record).to_string();
            if self
                .first_satisfied(&scope, &activity.entry_criteria)
                .await?
                .is_none()
            {
                return Ok(FollowUps::none());
            }
        }
        let transition = if activity.activity_type == ActivityType::Milestone {
            Transition::Occur
        } else if activity.manual_activation {
            Transition::Enable
        } else {
            Transition::Start
        };
        Ok(FollowUps {
            inline: vec![AtomicOperation::transition(execution_id, transition)],
            queued: Vec::new(),
        })
    }

    async fn evaluate_sentries(&mut self, container_id: &str) -> Result<FollowUps, EngineError> {
        let container = self.load(container_id).await?;
        if container.state.is_terminal() {
            return Ok(FollowUps::none());
        }
        let definition = self.definition(&container)?;
        let activity = activity_of(&definition, &container)?;
        self.parts.load(&mut self.session, container_id).await?;

        let mut satisfied = BTreeSet::new();
        for sentry in activity.sentries.iter().filter(|s| s.if_part.is_some()) {
            if self.sentry_satisfied(container_id, &sentry.id).await? {
                satisfied.insert(sentry.id.clone());
            }
        }
        self.fire_sentries(container_id, &satisfied).await
    }

    async fn auto_complete(&mut self, execution_id: &str) -> Result<FollowUps, EngineError> {
        let record = self.load(execution_id).await?;
        if record.state != ExecutionState::Active {
            return Ok(FollowUps::none());
        }
        let definition = self.definition(&record)?;
        let activity = activity_of(&definition, &record)?;
        if !activity.auto_complete {
            return Ok(FollowUps::none());
        }
        for child in self.children(execution_id).await? {
            let settled = child.state.is_terminal() || child.state == ExecutionState::Disabled;
            if !settled || (child.required && !child.state.is_terminal()) {
                return Ok(FollowUps::none());
            }
        }
        let completing: Vec<String> =
            activity.completing_exit_criteria().map(str::to_string).collect();
        let scope = sentry_scope_id(&record).to_string();
        if !completing.is_empty() && self.first_satisfied(&scope, &completing).await?.is_none() {
            return Ok(FollowUps::none());
        }
        tracing::debug!(execution_id, "container auto-completes");
        Ok(FollowUps {
            inline: vec![AtomicOperation::transition(execution_id, Transition::Complete)],
            queued: Vec::new(),
        })
    }

    // ── Sentries ────────────────────────────────────────────────────────────

    async fn first_satisfied(
        &mut self,
        container_id: &str,
        sentries: &[String],
    ) -> Result<Option<String>, EngineError> {
        for sentry_id in sentries {
            if self.sentry_satisfied(container_id, sentry_id).await? {
                return Ok(Some(sentry_id.clone()));
            }
        }
        Ok(None)
    }

    /// Registry verdict, evaluating the if-part first when it is the only
    /// part left unsatisfied.
    async fn sentry_satisfied(
        &mut self,
        container_id: &str,
        sentry_id: &str,
    ) -> Result<bool, EngineError> {
        let key = (container_id.to_string(), sentry_id.to_string());
        if self.fired.contains(&key) {
            return Ok(true);
        }
        self.parts.load(&mut self.session, container_id).await?;
        if self.parts.is_satisfied(container_id, sentry_id) {
            return Ok(true);
        }
        let Some(if_part_id) = self.parts.pending_if_part(container_id, sentry_id) else {
            return Ok(false);
        };
        let container = self.load(container_id).await?;
        let definition = self.definition(&container)?;
        let condition = activity_of(&definition, &container)?
            .sentry(sentry_id)
            .and_then(|s| s.if_part.clone())
            .ok_or_else(|| {
                EngineError::inconsistent(
                    container_id,
                    format!("if-part of sentry {sentry_id} has no declared condition"),
                )
            })?;
        let scope = self.visible_variables(container_id).await?;
        let holds = condition.evaluate(&|name: &str| scope.get(name).cloned());
        tracing::debug!(container_id, sentry_id, holds, "if-part evaluated");
        if holds {
            self.parts.mark_satisfied(&if_part_id)?;
        }
        Ok(self.parts.is_satisfied(container_id, sentry_id))
    }

    /// Every on-part binding of the container must point at an execution of
    /// the same case instance.
    async fn check_bound_sources(
        &mut self,
        container: &ExecutionRecord,
    ) -> Result<(), EngineError> {
        for source_id in self.parts.bound_sources(&container.id) {
            let source = match self.load(&source_id).await {
                Ok(source) => source,
                Err(EngineError::NotFound { .. }) => {
                    return Err(EngineError::inconsistent(
                        &container.id,
                        format!("on-part bound to missing execution {source_id}"),
                    ))
                }
                Err(err) => return Err(err),
            };
            if source.case_instance_id != container.case_instance_id {
                return Err(EngineError::inconsistent(
                    &container.id,
                    format!("on-part bound to execution {source_id} of another case instance"),
                ));
            }
        }
        Ok(())
    }

    // ── Variables ───────────────────────────────────────────────────────────

    async fn set_variable(
        &mut self,
        scope_id: &str,
        name: &str,
        value: Value,
    ) -> Result<FollowUps, EngineError> {
        let scope = self.load(scope_id).await?;
        self.variables.load(&mut self.session, scope_id).await?;
        let previous_value = self
            .variables
            .get_local(scope_id, name)
            .map(|v| v.value.clone());
        let event = VariableEvent {
            transition: if previous_value.is_some() {
                VariableTransition::Update
            } else {
                VariableTransition::Create
            },
            scope_id: scope_id.to_string(),
            case_instance_id: scope.case_instance_id,
            name: name.to_string(),
            value: Some(value),
            previous_value,
        };
        self.run_listeners(&event).await
    }

    async fn remove_variable(
        &mut self,
        scope_id: &str,
        name: &str,
    ) -> Result<FollowUps, EngineError> {
        let scope = self.load(scope_id).await?;
        self.variables.load(&mut self.session, scope_id).await?;
        let previous_value = self
            .variables
            .get_local(scope_id, name)
            .map(|v| v.value.clone())
            .ok_or_else(|| EngineError::not_found("variable", format!("{scope_id}.{name}")))?;
        let event = VariableEvent {
            transition: VariableTransition::Delete,
            scope_id: scope_id.to_string(),
            case_instance_id: scope.case_instance_id,
            name: name.to_string(),
            value: None,
            previous_value: Some(previous_value),
        };
        self.run_listeners(&event).await
    }

    async fn run_listeners(&mut self, event: &VariableEvent) -> Result<FollowUps, EngineError> {
        let mut follow = FollowUps::none();
        for stage in LISTENER_ORDER {
            match stage {
                ListenerStage::Persistence => match event.transition {
                    VariableTransition::Delete => {
                        self.variables.stage_remove(&event.scope_id, &event.name);
                    }
                    VariableTransition::Create | VariableTransition::Update => {
                        self.variables.stage_set(
                            &event.scope_id,
                            &event.case_instance_id,
                            &event.name,
                            event.value.clone().unwrap_or(Value::Null),
                        );
                    }
                },
                ListenerStage::SequenceCounter => {
                    let node = self.tree.get_mut(&event.scope_id)?;
                    node.sequence_counter += 1;
                    let counter = node.sequence_counter;
                    if event.transition != VariableTransition::Delete {
                        self.variables.stamp(&event.scope_id, &event.name, counter);
                    }
                }
                ListenerStage::History => {
                    let kind = match event.transition {
                        VariableTransition::Create => HistoryEventKind::VariableCreated,
                        VariableTransition::Update => HistoryEventKind::VariableUpdated,
                        VariableTransition::Delete => HistoryEventKind::VariableDeleted,
                    };
                    let mut history =
                        HistoryEvent::new(kind, &event.scope_id, &event.case_instance_id);
                    history.variable_name = Some(event.name.clone());
                    history.value = event.value.clone();
                    self.push_history(history);
                }
                ListenerStage::Invocation => {
                    if self.services.config.execution.invoke_custom_variable_listeners {
                        for listener in &self.services.listeners {
                            listener.notify(event).map_err(|err| EngineError::Listener {
                                listener: listener.name().to_string(),
                                variable: event.name.clone(),
                                message: err.0,
                            })?;
                        }
                    }
                }
                ListenerStage::OnPart => follow.extend(self.variable_on_parts(event).await?),
            }
        }
        tracing::debug!(
            scope_id = %event.scope_id,
            variable = %event.name,
            transition = event.transition.as_str(),
            "variable listeners ran"
        );
        Ok(follow)
    }

    /// Satisfy variable on-parts of containers in the scope's subtree and
    /// re-check if-parts that read the variable. An on-part is skipped when
    /// a scope between its container and the changed scope holds its own
    /// variable of that name.
    async fn variable_on_parts(&mut self, event: &VariableEvent) -> Result<FollowUps, EngineError> {
        let mut follow = FollowUps::none();
        for container_id in self.tree.load_subtree(&mut self.session, &event.scope_id).await? {
            let container = self.tree.get(&container_id)?.clone();
            if !container.activity_type.is_container() || container.state.is_terminal() {
                continue;
            }
            self.parts.load(&mut self.session, &container_id).await?;
            if !self.parts.has_parts(&container_id) {
                continue;
            }

            let mut affected = BTreeSet::new();
            let matched =
                self.parts
                    .matching_variable_on_parts(&container_id, &event.name, event.transition);
            if !matched.is_empty()
                && !self
                    .is_shadowed(&container_id, &event.scope_id, &event.name)
                    .await?
            {
                for (part_id, sentry_id, satisfied) in matched {
                    if !satisfied {
                        self.parts.mark_satisfied(&part_id)?;
                    }
                    affected.insert(sentry_id);
                }
                for sentry_id in &affected {
                    self.parts.force_update(&container_id, sentry_id);
                }
            }

            let definition = self.definition(&container)?;
            for sentry in &activity_of(&definition, &container)?.sentries {
                let reads = sentry
                    .if_part
                    .as_ref()
                    .is_some_and(|c| c.variables().contains(&event.name.as_str()));
                if reads {
                    affected.insert(sentry.id.clone());
                }
            }

            let mut satisfied = BTreeSet::new();
            for sentry_id in affected {
                if self.sentry_satisfied(&container_id, &sentry_id).await? {
                    satisfied.insert(sentry_id);
                }
            }
            follow.extend(self.fire_sentries(&container_id, &satisfied).await?);
        }
        Ok(follow)
    }

    async fn is_shadowed(
        &mut self,
        container_id: &str,
        changed_scope_id: &str,
        name: &str,
    ) -> Result<bool, EngineError> {
        let mut current = container_id.to_string();
        while current != changed_scope_id {
            self.variables.load(&mut self.session, &current).await?;
            if self.variables.get_local(&current, name).is_some() {
                return Ok(true);
            }
            current = self.tree.get(&current)?.parent_id.clone().ok_or_else(|| {
                EngineError::inconsistent(container_id, "changed scope is not an ancestor")
            })?;
        }
        Ok(false)
    }

    // ── Deletion ────────────────────────────────────────────────────────────

    async fn delete_case_instance(
        &mut self,
        case_instance_id: &str,
        cascaded: bool,
    ) -> Result<FollowUps, EngineError> {
        let root = self
            .tree
            .find_root(&mut self.session, case_instance_id)
            .await?
            .clone();
        if !root.state.is_terminal() {
            return Err(EngineError::precondition(
                case_instance_id,
                "delete",
                format!("case instance is {}", root.state),
            ));
        }
        if !cascaded && super_execution_id(&root).is_some() {
            return Err(EngineError::precondition(
                case_instance_id,
                "delete",
                "a sub-instance is deleted together with its caller",
            ));
        }

        let order = self
            .tree
            .load_subtree(&mut self.session, case_instance_id)
            .await?;
        let mut follow = FollowUps::none();
        let (mut variables, mut parts) = (0, 0);
        for id in order.iter().rev() {
            let record = self.tree.get(id)?.clone();
            for sub_id in [&record.sub_case_instance_id, &record.sub_execution_id]
                .into_iter()
                .flatten()
            {
                follow.inline.push(AtomicOperation::DeleteCaseInstance {
                    case_instance_id: sub_id.clone(),
                    cascaded: true,
                });
            }
            self.variables.load(&mut self.session, id).await?;
            variables += self.variables.remove_scope(id);
            self.parts.load(&mut self.session, id).await?;
            parts += self.parts.remove_container(id);
            self.tree.delete(id)?;
            self.push_history(execution_event(&record, HistoryEventKind::ExecutionRemoved, None));
        }
        tracing::info!(
            case_instance_id,
            executions = order.len(),
            sentry_parts = parts,
            variables,
            "case instance deleted"
        );
        Ok(follow)
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn definition(&self, record: &ExecutionRecord) -> Result<Arc<CaseDefinition>, EngineError> {
        self.services.definitions.get(&record.case_definition_id)
    }

    fn push_history(&mut self, event: HistoryEvent) {
        if self.services.config.history.enabled {
            self.history.push(event);
        }
    }
}

fn activity_of<'d>(
    definition: &'d CaseDefinition,
    record: &ExecutionRecord,
) -> Result<&'d ActivityDefinition, EngineError> {
    definition
        .activity(&record.activity_id)
        .ok_or_else(|| EngineError::MissingActivity {
            definition_id: definition.id().to_string(),
            activity_id: record.activity_id.clone(),
        })
}

/// Node owning the sentries this node's criteria refer to.
fn sentry_scope_id(record: &ExecutionRecord) -> &str {
    record.parent_id.as_deref().unwrap_or(&record.id)
}

fn sub_instance_id(record: &ExecutionRecord) -> Option<&str> {
    record
        .sub_case_instance_id
        .as_deref()
        .or(record.sub_execution_id.as_deref())
}

fn super_execution_id(record: &ExecutionRecord) -> Option<String> {
    record
        .super_case_execution_id
        .clone()
        .or_else(|| record.super_execution_id.clone())
}

fn check_activity_kind(
    record: &ExecutionRecord,
    activity: &ActivityDefinition,
    transition: Transition,
) -> Result<(), EngineError> {
    let milestone = activity.activity_type == ActivityType::Milestone;
    let reason = match transition {
        Transition::Occur if !milestone => Some("only milestones occur"),
        Transition::Start | Transition::ManualStart | Transition::Complete | Transition::Terminate
            if milestone =>
        {
            Some("milestones can only occur")
        }
        Transition::Enable
        | Transition::Disable
        | Transition::Reenable
        | Transition::Start
        | Transition::ManualStart
        | Transition::Occur
            if record.is_case_instance() =>
        {
            Some("a case instance is created active")
        }
        _ => None,
    };
    match reason {
        Some(reason) => Err(EngineError::precondition(
            &record.id,
            transition.as_str(),
            reason,
        )),
        None => Ok(()),
    }
}

fn sentry_parts(container: &ExecutionRecord, sentry: &SentryDeclaration) -> Vec<SentryPartRecord> {
    let part = |part_type: SentryPartType| SentryPartRecord {
        id: uuid::Uuid::new_v4().to_string(),
        revision: 1,
        sentry_id: sentry.id.clone(),
        case_execution_id: container.id.clone(),
        case_instance_id: container.case_instance_id.clone(),
        part_type,
        source_activity_id: None,
        source_execution_id: None,
        standard_event: None,
        variable_name: None,
        variable_event: None,
        satisfied: false,
    };
    let mut parts = Vec::with_capacity(sentry.part_count());
    for on_part in &sentry.on_parts {
        let mut record = part(SentryPartType::OnPart);
        record.source_activity_id = Some(on_part.source.clone());
        record.standard_event = Some(on_part.standard_event);
        parts.push(record);
    }
    for variable_on_part in &sentry.variable_on_parts {
        let mut record = part(SentryPartType::VariableOnPart);
        record.variable_name = Some(variable_on_part.variable_name.clone());
        record.variable_event = Some(variable_on_part.variable_event);
        parts.push(record);
    }
    if sentry.if_part.is_some() {
        parts.push(part(SentryPartType::IfPart));
    }
    parts
}

fn execution_event(
    record: &ExecutionRecord,
    kind: HistoryEventKind,
    transition: Option<Transition>,
) -> HistoryEvent {
    let mut event = HistoryEvent::new(kind, &record.id, &record.case_instance_id);
    event.activity_id = Some(record.activity_id.clone());
    event.tenant_id = record.tenant_id.clone();
    event.state = Some(record.state);
    event.transition = transition;
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::definitions::DefinitionCache;
    use crate::history::NoopHistory;
    use arbor_storage::MemoryStorage;
    use serde_json::json;

    fn services(config: EngineConfig) -> Services {
        let definition = json!({
            "id": "join:1", "key": "join",
            "plan_model": {
                "id": "plan", "type": "case_plan_model",
                "sentries": [ { "id": "S1", "on_parts": [
                    { "source": "a", "standard_event": "complete" },
                    { "source": "b", "standard_event": "complete" }
                ] } ],
                "exit_criteria": [ { "sentry": "S1", "action": "complete" } ],
                "children": [
                    { "id": "a", "type": "task" },
                    { "id": "b", "type": "task" }
                ]
            }
        });
        let definitions = Arc::new(DefinitionCache::new());
        definitions
            .deploy(CaseDefinition::from_json(&definition.to_string()).unwrap())
            .unwrap();
        Services {
            config,
            definitions,
            history: Arc::new(NoopHistory),
            tenant_provider: None,
            listeners: Vec::new(),
        }
    }

    async fn create(
        storage: &MemoryStorage,
        services: &Services,
    ) -> (String, Vec<ExecutionRecord>) {
        let definition = services.definitions.latest_by_key("join").unwrap();
        let mut ctx = CommandContext::begin(storage, services).await.unwrap();
        let id = ctx
            .create_root(&definition, None, None, None, &BTreeMap::new())
            .await
            .unwrap();
        ctx.perform(AtomicOperation::InitializeContainer {
            execution_id: id.clone(),
        })
        .await
        .unwrap();
        let children = ctx.children(&id).await.unwrap();
        ctx.commit().await.unwrap();
        (id, children)
    }

    #[tokio::test]
    async fn perform_sync_leaves_queued_follow_ups_for_perform() {
        let storage = MemoryStorage::new();
        let services = services(EngineConfig::default());
        let definition = services.definitions.latest_by_key("join").unwrap();
        let mut ctx = CommandContext::begin(&storage, &services).await.unwrap();
        let id = ctx
            .create_root(&definition, None, None, None, &BTreeMap::new())
            .await
            .unwrap();

        ctx.perform_sync(AtomicOperation::InitializeContainer {
            execution_id: id.clone(),
        })
        .await
        .unwrap();
        let states: Vec<_> = ctx.children(&id).await.unwrap().iter().map(|c| c.state).collect();
        assert_eq!(states, vec![ExecutionState::Available; 2]);
        assert_eq!(ctx.queue.len(), 2);

        ctx.perform(AtomicOperation::EvaluateSentries {
            container_id: id.clone(),
        })
        .await
        .unwrap();
        assert!(ctx.queue.is_empty());
        let states: Vec<_> = ctx.children(&id).await.unwrap().iter().map(|c| c.state).collect();
        assert_eq!(states, vec![ExecutionState::Active; 2]);
        ctx.abort().await;
    }

    #[tokio::test]
    async fn concurrent_satisfaction_of_one_sentry_conflicts() {
        let storage = MemoryStorage::new();
        let services = services(EngineConfig::default());
        let (root, children) = create(&storage, &services).await;
        let by_activity = |activity: &str| {
            children
                .iter()
                .find(|c| c.activity_id == activity)
                .map(|c| c.id.clone())
                .unwrap()
        };

        let mut first = CommandContext::begin(&storage, &services).await.unwrap();
        let mut second = CommandContext::begin(&storage, &services).await.unwrap();
        first
            .perform(AtomicOperation::transition(by_activity("a"), Transition::Complete))
            .await
            .unwrap();
        second
            .perform(AtomicOperation::transition(by_activity("b"), Transition::Complete))
            .await
            .unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_conflict(), "{err}");

        // Only the first command is visible; the sentry is half satisfied.
        let parts = storage.list_sentry_parts(&root).await.unwrap();
        assert_eq!(parts.iter().filter(|p| p.satisfied).count(), 1);
        let root = storage.get_execution(&root).await.unwrap();
        assert_eq!(root.state, ExecutionState::Active);
    }

    #[tokio::test]
    async fn budget_stops_a_runaway_command() {
        let storage = MemoryStorage::new();
        let mut config = EngineConfig::default();
        config.execution.max_operations_per_command = 3;
        let services = services(config);
        let definition = services.definitions.latest_by_key("join").unwrap();
        let mut ctx = CommandContext::begin(&storage, &services).await.unwrap();
        let id = ctx
            .create_root(&definition, None, None, None, &BTreeMap::new())
            .await
            .unwrap();
        let err = ctx
            .perform(AtomicOperation::InitializeContainer { execution_id: id })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CascadeLimitExceeded { limit: 3, .. }
        ));
        ctx.abort().await;
    }
}
