use std::fmt;

use arbor_core::{
    ActivityType, DefinitionKind, ExecutionState, Transition, VariableTransition,
};
use serde::{Deserialize, Serialize};

/// The three record tables a backend stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Execution,
    SentryPart,
    Variable,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Execution => "execution",
            RecordKind::SentryPart => "sentry part",
            RecordKind::Variable => "variable",
        })
    }
}

/// A persisted execution tree node.
///
/// The root of a tree has `parent_id == None` and `id == case_instance_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub revision: i64,
    pub parent_id: Option<String>,
    pub case_instance_id: String,
    pub case_definition_id: String,
    pub case_definition_key: String,
    pub kind: DefinitionKind,
    pub business_key: Option<String>,
    pub activity_id: String,
    pub activity_name: Option<String>,
    pub activity_type: ActivityType,
    pub activity_description: Option<String>,
    pub state: ExecutionState,
    pub previous_state: Option<ExecutionState>,
    pub tenant_id: Option<String>,
    pub super_execution_id: Option<String>,
    pub sub_execution_id: Option<String>,
    pub super_case_execution_id: Option<String>,
    pub sub_case_instance_id: Option<String>,
    pub required: bool,
    pub sequence_counter: i64,
}

impl ExecutionRecord {
    pub fn is_case_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentryPartType {
    IfPart,
    OnPart,
    VariableOnPart,
}

/// One condition contributing to a sentry, owned by the container execution
/// that declares the sentry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentryPartRecord {
    pub id: String,
    pub revision: i64,
    pub sentry_id: String,
    pub case_execution_id: String,
    pub case_instance_id: String,
    pub part_type: SentryPartType,
    /// Activity id of the on-part source, known from the definition.
    pub source_activity_id: Option<String>,
    /// Execution bound to the on-part once the source node exists.
    pub source_execution_id: Option<String>,
    pub standard_event: Option<Transition>,
    pub variable_name: Option<String>,
    pub variable_event: Option<VariableTransition>,
    pub satisfied: bool,
}

/// A variable stored on one execution scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub id: String,
    pub revision: i64,
    pub name: String,
    pub value: serde_json::Value,
    pub scope_id: String,
    pub case_instance_id: String,
    pub sequence_counter: i64,
}
