//! Immutable case/process definitions.
//!
//! A definition is a tree of [`ActivityDefinition`]s rooted at the plan
//! model. Containers (the plan model and stages) declare sentries; their
//! children reference those sentries from entry and exit criteria. The
//! plan model's own exit criteria reference sentries declared on itself.
//!
//! Definitions are validated on construction (see [`crate::validate`]) and
//! indexed by activity id so the engine can resolve an activity, its
//! container and the sentry scope in constant time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::DefinitionError;
use crate::state::Transition;
use crate::validate;

// ──────────────────────────────────────────────
// Activity model
// ──────────────────────────────────────────────

/// Whether a definition describes a case (CMMN) or a process (BPMN).
///
/// The engine runs both on the same execution tree; the kind only decides
/// which pair of cross-tree links a sub-instance uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    #[default]
    Case,
    Process,
}

impl DefinitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DefinitionKind::Case => "case",
            DefinitionKind::Process => "process",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    CasePlanModel,
    Stage,
    Task,
    HumanTask,
    CaseTask,
    ProcessTask,
    Milestone,
}

impl ActivityType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::CasePlanModel => "case_plan_model",
            ActivityType::Stage => "stage",
            ActivityType::Task => "task",
            ActivityType::HumanTask => "human_task",
            ActivityType::CaseTask => "case_task",
            ActivityType::ProcessTask => "process_task",
            ActivityType::Milestone => "milestone",
        }
    }

    /// Containers own child activities and sentry declarations.
    pub fn is_container(self) -> bool {
        matches!(self, ActivityType::CasePlanModel | ActivityType::Stage)
    }

    /// Activities that spawn a sub-instance when started.
    pub fn calls_definition(self) -> bool {
        matches!(self, ActivityType::CaseTask | ActivityType::ProcessTask)
    }
}

/// What an exit criterion does to its node once the sentry is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    /// Terminate the node (`exit`).
    #[default]
    Exit,
    /// Complete the node. A node with completing exit criteria can only be
    /// completed once one of them is satisfied.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCriterion {
    pub sentry: String,
    #[serde(default)]
    pub action: ExitAction,
}

/// Variable event a variable on-part listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableTransition {
    Create,
    Update,
    Delete,
}

impl VariableTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableTransition::Create => "create",
            VariableTransition::Update => "update",
            VariableTransition::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnPartDeclaration {
    /// Activity id of a sibling whose lifecycle event satisfies this part.
    pub source: String,
    pub standard_event: Transition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableOnPartDeclaration {
    pub variable_name: String,
    pub variable_event: VariableTransition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentryDeclaration {
    pub id: String,
    #[serde(default)]
    pub on_parts: Vec<OnPartDeclaration>,
    #[serde(default)]
    pub if_part: Option<Condition>,
    #[serde(default)]
    pub variable_on_parts: Vec<VariableOnPartDeclaration>,
}

impl SentryDeclaration {
    pub fn part_count(&self) -> usize {
        self.on_parts.len() + self.variable_on_parts.len() + usize::from(self.if_part.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub children: Vec<ActivityDefinition>,
    #[serde(default)]
    pub sentries: Vec<SentryDeclaration>,
    #[serde(default)]
    pub entry_criteria: Vec<String>,
    #[serde(default)]
    pub exit_criteria: Vec<ExitCriterion>,
    #[serde(default)]
    pub manual_activation: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub auto_complete: bool,
    /// Definition key started by case and process tasks.
    #[serde(default)]
    pub called_element: Option<String>,
}

impl ActivityDefinition {
    pub fn new(id: impl Into<String>, activity_type: ActivityType) -> Self {
        ActivityDefinition {
            id: id.into(),
            name: None,
            activity_type,
            description: None,
            children: Vec::new(),
            sentries: Vec::new(),
            entry_criteria: Vec::new(),
            exit_criteria: Vec::new(),
            manual_activation: false,
            required: false,
            auto_complete: false,
            called_element: None,
        }
    }

    pub fn sentry(&self, sentry_id: &str) -> Option<&SentryDeclaration> {
        self.sentries.iter().find(|s| s.id == sentry_id)
    }

    pub fn has_entry_criteria(&self) -> bool {
        !self.entry_criteria.is_empty()
    }

    /// Sentry ids of exit criteria that complete rather than terminate.
    pub fn completing_exit_criteria(&self) -> impl Iterator<Item = &str> {
        self.exit_criteria
            .iter()
            .filter(|c| c.action == ExitAction::Complete)
            .map(|c| c.sentry.as_str())
    }
}

// ──────────────────────────────────────────────
// Case definition
// ──────────────────────────────────────────────

/// Position of an activity inside the plan model tree.
#[derive(Debug, Clone)]
struct ActivityLocation {
    /// Child indices from the plan model down to the activity.
    path: Vec<usize>,
    parent: Option<String>,
}

/// Serialized shape of a [`CaseDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDefinitionModel {
    pub id: String,
    pub key: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub kind: DefinitionKind,
    pub plan_model: ActivityDefinition,
}

fn default_version() -> u32 {
    1
}

/// A validated, indexed, immutable definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CaseDefinitionModel", into = "CaseDefinitionModel")]
pub struct CaseDefinition {
    model: CaseDefinitionModel,
    index: HashMap<String, ActivityLocation>,
}

impl CaseDefinition {
    /// Validate and index a definition model.
    pub fn new(model: CaseDefinitionModel) -> Result<Self, DefinitionError> {
        let mut index = HashMap::new();
        index_activity(&model.plan_model, Vec::new(), None, &mut index)?;
        let definition = CaseDefinition { model, index };
        validate::validate_definition(&definition)?;
        Ok(definition)
    }

    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        let model: CaseDefinitionModel =
            serde_json::from_str(json).map_err(|e| DefinitionError::Parse {
                message: e.to_string(),
            })?;
        CaseDefinition::new(model)
    }

    pub fn id(&self) -> &str {
        &self.model.id
    }

    pub fn key(&self) -> &str {
        &self.model.key
    }

    pub fn version(&self) -> u32 {
        self.model.version
    }

    pub fn name(&self) -> Option<&str> {
        self.model.name.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.model.tenant_id.as_deref()
    }

    pub fn kind(&self) -> DefinitionKind {
        self.model.kind
    }

    pub fn plan_model(&self) -> &ActivityDefinition {
        &self.model.plan_model
    }

    pub fn model(&self) -> &CaseDefinitionModel {
        &self.model
    }

    pub fn activity(&self, activity_id: &str) -> Option<&ActivityDefinition> {
        let location = self.index.get(activity_id)?;
        let mut current = &self.model.plan_model;
        for &i in &location.path {
            current = current.children.get(i)?;
        }
        Some(current)
    }

    /// The container that directly owns `activity_id`, `None` for the plan model.
    pub fn parent_activity(&self, activity_id: &str) -> Option<&ActivityDefinition> {
        let parent_id = self.index.get(activity_id)?.parent.as_deref()?;
        self.activity(parent_id)
    }

    /// Container whose sentry declarations the criteria of `activity_id`
    /// reference: the parent container, or the plan model itself.
    pub fn sentry_scope(&self, activity_id: &str) -> Option<&ActivityDefinition> {
        match self.parent_activity(activity_id) {
            Some(parent) => Some(parent),
            None if activity_id == self.model.plan_model.id => Some(&self.model.plan_model),
            None => None,
        }
    }

    pub fn activity_ids(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }
}

impl TryFrom<CaseDefinitionModel> for CaseDefinition {
    type Error = DefinitionError;

    fn try_from(model: CaseDefinitionModel) -> Result<Self, Self::Error> {
        CaseDefinition::new(model)
    }
}

impl From<CaseDefinition> for CaseDefinitionModel {
    fn from(def: CaseDefinition) -> Self {
        def.model
    }
}

fn index_activity(
    activity: &ActivityDefinition,
    path: Vec<usize>,
    parent: Option<&str>,
    index: &mut HashMap<String, ActivityLocation>,
) -> Result<(), DefinitionError> {
    if index.contains_key(&activity.id) {
        return Err(DefinitionError::DuplicateActivity {
            activity_id: activity.id.clone(),
        });
    }
    index.insert(
        activity.id.clone(),
        ActivityLocation {
            path: path.clone(),
            parent: parent.map(str::to_owned),
        },
    );
    for (i, child) in activity.children.iter().enumerate() {
        let mut child_path = path.clone();
        child_path.push(i);
        index_activity(child, child_path, Some(&activity.id), index)?;
    }
    Ok(())
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
