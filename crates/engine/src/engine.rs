//! The case engine: command entry points.
//!
//! Every mutating method is one command. It opens a storage snapshot,
//! performs its atomic operation with every follow-up it cascades into,
//! and commits. Any error aborts the snapshot, so either the whole cascade
//! is persisted or nothing is.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_core::{CaseDefinition, Transition};
use arbor_storage::{
    ArborStorage, ExecutionQuery, ExecutionRecord, SentryPartRecord, VariableRecord,
};
use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::context::{CommandContext, ExecutionReport};
use crate::definitions::DefinitionCache;
use crate::error::EngineError;
use crate::history::{HistoryEventHandler, NoopHistory};
use crate::operation::AtomicOperation;
use crate::tenant::TenantIdProvider;
use crate::variables::VariableListener;

/// Collaborators shared by every command of one engine.
pub(crate) struct Services {
    pub config: EngineConfig,
    pub definitions: Arc<DefinitionCache>,
    pub history: Arc<dyn HistoryEventHandler>,
    pub tenant_provider: Option<Arc<dyn TenantIdProvider>>,
    pub listeners: Vec<Arc<dyn VariableListener>>,
}

// ──────────────────────────────────────────────
// Builder
// ──────────────────────────────────────────────

pub struct CaseEngineBuilder<S: ArborStorage> {
    storage: S,
    config: EngineConfig,
    definitions: Option<Arc<DefinitionCache>>,
    history: Option<Arc<dyn HistoryEventHandler>>,
    tenant_provider: Option<Arc<dyn TenantIdProvider>>,
    listeners: Vec<Arc<dyn VariableListener>>,
}

impl<S: ArborStorage> CaseEngineBuilder<S> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a definition cache between engines. A fresh cache is created
    /// otherwise.
    pub fn definitions(mut self, definitions: Arc<DefinitionCache>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn history(mut self, handler: Arc<dyn HistoryEventHandler>) -> Self {
        self.history = Some(handler);
        self
    }

    pub fn tenant_provider(mut self, provider: Arc<dyn TenantIdProvider>) -> Self {
        self.tenant_provider = Some(provider);
        self
    }

    /// Listeners are invoked in registration order.
    pub fn listener(mut self, listener: Arc<dyn VariableListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> CaseEngine<S> {
        CaseEngine {
            storage: self.storage,
            services: Services {
                config: self.config,
                definitions: self.definitions.unwrap_or_default(),
                history: self.history.unwrap_or_else(|| Arc::new(NoopHistory)),
                tenant_provider: self.tenant_provider,
                listeners: self.listeners,
            },
        }
    }
}

// ──────────────────────────────────────────────
// Instance creation request
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum DefinitionRef {
    Id(String),
    Key(String),
}

/// Parameters of [`CaseEngine::create_case_instance`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateCaseInstance {
    definition: DefinitionRef,
    business_key: Option<String>,
    tenant_id: Option<String>,
    variables: BTreeMap<String, Value>,
}

impl CreateCaseInstance {
    /// Latest deployed version of the definition key.
    pub fn by_key(key: impl Into<String>) -> Self {
        Self::new(DefinitionRef::Key(key.into()))
    }

    pub fn by_id(definition_id: impl Into<String>) -> Self {
        Self::new(DefinitionRef::Id(definition_id.into()))
    }

    fn new(definition: DefinitionRef) -> Self {
        CreateCaseInstance {
            definition,
            business_key: None,
            tenant_id: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set on the case instance before its plan items are created.
    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseInstanceCreated {
    pub case_instance_id: String,
    pub report: ExecutionReport,
}

// ──────────────────────────────────────────────
// Engine
// ──────────────────────────────────────────────

pub struct CaseEngine<S: ArborStorage> {
    storage: S,
    services: Services,
}

impl<S: ArborStorage> CaseEngine<S> {
    pub fn builder(storage: S) -> CaseEngineBuilder<S> {
        CaseEngineBuilder {
            storage,
            config: EngineConfig::default(),
            definitions: None,
            history: None,
            tenant_provider: None,
            listeners: Vec::new(),
        }
    }

    pub fn new(storage: S) -> Self {
        Self::builder(storage).build()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn definitions(&self) -> &Arc<DefinitionCache> {
        &self.services.definitions
    }

    pub fn deploy(&self, definition: CaseDefinition) -> Result<Arc<CaseDefinition>, EngineError> {
        self.services.definitions.deploy(definition)
    }

    async fn context(&self) -> Result<CommandContext<'_, S>, EngineError> {
        CommandContext::begin(&self.storage, &self.services).await
    }

    async fn run(&self, op: AtomicOperation) -> Result<ExecutionReport, EngineError> {
        let command = op.to_string();
        let mut ctx = self.context().await?;
        let outcome = ctx.perform(op).await;
        let ((), report) = ctx.finish(outcome, &command).await?;
        tracing::debug!(
            command = %command,
            performed = report.performed,
            queued = report.queued,
            "command committed"
        );
        Ok(report)
    }

    // ── Instances ───────────────────────────────────────────────────────────

    pub async fn create_case_instance(
        &self,
        request: CreateCaseInstance,
    ) -> Result<CaseInstanceCreated, EngineError> {
        let definition = match &request.definition {
            DefinitionRef::Id(id) => self.services.definitions.get(id)?,
            DefinitionRef::Key(key) => self.services.definitions.latest_by_key(key)?,
        };
        let mut ctx = self.context().await?;
        let outcome = instantiate(&mut ctx, &definition, request).await;
        let (case_instance_id, report) = ctx.finish(outcome, "createCaseInstance").await?;
        Ok(CaseInstanceCreated {
            case_instance_id,
            report,
        })
    }

    /// Delete a terminal case instance, its sentry parts, its variables and
    /// any sub-instances it called.
    pub async fn delete_case_instance(
        &self,
        case_instance_id: &str,
    ) -> Result<ExecutionReport, EngineError> {
        self.run(AtomicOperation::DeleteCaseInstance {
            case_instance_id: case_instance_id.to_string(),
            cascaded: false,
        })
        .await
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// Fire any lifecycle transition on a node.
    pub async fn transition(
        &self,
        execution_id: &str,
        transition: Transition,
    ) -> Result<ExecutionReport, EngineError> {
        self.run(AtomicOperation::transition(execution_id, transition))
            .await
    }

    pub async fn manual_start(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::ManualStart).await
    }

    pub async fn start(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Start).await
    }

    pub async fn enable(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Enable).await
    }

    pub async fn disable(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Disable).await
    }

    pub async fn reenable(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Reenable).await
    }

    pub async fn complete(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Complete).await
    }

    pub async fn occur(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Occur).await
    }

    pub async fn terminate(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Terminate).await
    }

    pub async fn exit(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Exit).await
    }

    pub async fn suspend(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Suspend).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        self.transition(execution_id, Transition::Resume).await
    }

    // ── Variables ───────────────────────────────────────────────────────────

    /// Set a variable local to the execution.
    pub async fn set_variable(
        &self,
        execution_id: &str,
        name: &str,
        value: Value,
    ) -> Result<ExecutionReport, EngineError> {
        self.run(AtomicOperation::SetVariable {
            scope_id: execution_id.to_string(),
            name: name.to_string(),
            value,
        })
        .await
    }

    /// Set a variable on `scope_id`, which must be the execution itself or
    /// one of its ancestors.
    pub async fn set_variable_in(
        &self,
        execution_id: &str,
        scope_id: &str,
        name: &str,
        value: Value,
    ) -> Result<ExecutionReport, EngineError> {
        let mut ctx = self.context().await?;
        let outcome = async {
            let ancestors = ctx.ancestors(execution_id).await?;
            if !ancestors.iter().any(|id| id == scope_id) {
                return Err(EngineError::precondition(
                    execution_id,
                    "setVariable",
                    format!("{scope_id} is not an ancestor scope"),
                ));
            }
            ctx.perform(AtomicOperation::SetVariable {
                scope_id: scope_id.to_string(),
                name: name.to_string(),
                value,
            })
            .await
        }
        .await;
        let ((), report) = ctx.finish(outcome, "setVariable").await?;
        Ok(report)
    }

    pub async fn remove_variable(
        &self,
        execution_id: &str,
        name: &str,
    ) -> Result<ExecutionReport, EngineError> {
        self.run(AtomicOperation::RemoveVariable {
            scope_id: execution_id.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Nearest variable of that name, walking up from the execution.
    pub async fn get_variable(
        &self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        let mut ctx = self.context().await?;
        let outcome = ctx.get_variable(execution_id, name).await;
        ctx.abort().await;
        outcome
    }

    pub async fn get_variable_local(
        &self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self.local_variables(execution_id).await?.remove(name))
    }

    /// Every variable visible from the execution; nearer scopes override.
    pub async fn variables(
        &self,
        execution_id: &str,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut ctx = self.context().await?;
        let outcome = ctx.visible_variables(execution_id).await;
        ctx.abort().await;
        outcome
    }

    pub async fn local_variables(
        &self,
        execution_id: &str,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut ctx = self.context().await?;
        let outcome = ctx.local_variables(execution_id).await;
        ctx.abort().await;
        outcome
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub async fn execution(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        Ok(self.storage.get_execution(execution_id).await?)
    }

    pub async fn query(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRecord>, EngineError> {
        Ok(self.storage.select_executions(query).await?)
    }

    /// A committed case instance, depth-first from the root.
    pub async fn tree(&self, case_instance_id: &str) -> Result<Vec<ExecutionRecord>, EngineError> {
        let mut ctx = self.context().await?;
        let outcome = async {
            ctx.find_root(case_instance_id).await?;
            ctx.subtree(case_instance_id).await
        }
        .await;
        ctx.abort().await;
        outcome
    }

    pub async fn sentry_parts(
        &self,
        case_instance_id: &str,
    ) -> Result<Vec<SentryPartRecord>, EngineError> {
        Ok(self.storage.list_sentry_parts(case_instance_id).await?)
    }

    pub async fn case_variables(
        &self,
        case_instance_id: &str,
    ) -> Result<Vec<VariableRecord>, EngineError> {
        Ok(self.storage.list_variables(case_instance_id).await?)
    }

    /// Whether a sentry of the container is satisfied right now, if-part
    /// included.
    pub async fn is_sentry_satisfied(
        &self,
        container_id: &str,
        sentry_id: &str,
    ) -> Result<bool, EngineError> {
        let mut ctx = self.context().await?;
        let outcome = ctx.is_sentry_satisfied(container_id, sentry_id).await;
        ctx.abort().await;
        outcome
    }
}

async fn instantiate<S: ArborStorage>(
    ctx: &mut CommandContext<'_, S>,
    definition: &CaseDefinition,
    request: CreateCaseInstance,
) -> Result<String, EngineError> {
    let CreateCaseInstance {
        business_key,
        tenant_id,
        variables,
        ..
    } = request;
    let id = ctx
        .create_root(definition, business_key, tenant_id.as_deref(), None, &variables)
        .await?;
    for (name, value) in variables {
        ctx.perform_sync(AtomicOperation::SetVariable {
            scope_id: id.clone(),
            name,
            value,
        })
        .await?;
    }
    ctx.perform(AtomicOperation::InitializeContainer {
        execution_id: id.clone(),
    })
    .await?;
    Ok(id)
}
