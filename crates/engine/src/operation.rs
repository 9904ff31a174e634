//! Atomic operations.
//!
//! An operation applies one step to the execution tree and returns the
//! operations that must run next. Inline follow-ups run immediately after
//! the operation, depth-first, before anything already queued. Queued
//! follow-ups go to the back of the command's FIFO queue; sentry cascades
//! are always queued.

use std::fmt;

use arbor_core::Transition;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum AtomicOperation {
    /// Create the sentry parts of a container that just became active, then
    /// its children.
    InitializeContainer { execution_id: String },
    CreateChild {
        parent_id: String,
        activity_id: String,
    },
    Transition {
        execution_id: String,
        transition: Transition,
    },
    /// Activate an available node if it has no entry criteria or one of
    /// them is satisfied.
    FireEntryCriteria { execution_id: String },
    /// Exit (or complete) a node whose exit criterion is satisfied.
    FireExitCriteria { execution_id: String },
    /// Evaluate the if-part sentries of a container and fire those that
    /// hold.
    EvaluateSentries { container_id: String },
    /// Complete an `auto_complete` container once nothing inside it can
    /// still make progress.
    AutoComplete { execution_id: String },
    SetVariable {
        scope_id: String,
        name: String,
        value: Value,
    },
    RemoveVariable { scope_id: String, name: String },
    /// Delete a terminal case instance with all its parts and variables.
    /// `cascaded` is set for sub-instances removed with their caller.
    DeleteCaseInstance {
        case_instance_id: String,
        cascaded: bool,
    },
}

impl AtomicOperation {
    pub fn transition(execution_id: impl Into<String>, transition: Transition) -> Self {
        AtomicOperation::Transition {
            execution_id: execution_id.into(),
            transition,
        }
    }

    /// The execution the operation is performed on.
    pub fn execution_id(&self) -> &str {
        match self {
            AtomicOperation::InitializeContainer { execution_id }
            | AtomicOperation::Transition { execution_id, .. }
            | AtomicOperation::FireEntryCriteria { execution_id }
            | AtomicOperation::FireExitCriteria { execution_id }
            | AtomicOperation::AutoComplete { execution_id } => execution_id,
            AtomicOperation::CreateChild { parent_id, .. } => parent_id,
            AtomicOperation::EvaluateSentries { container_id } => container_id,
            AtomicOperation::SetVariable { scope_id, .. }
            | AtomicOperation::RemoveVariable { scope_id, .. } => scope_id,
            AtomicOperation::DeleteCaseInstance {
                case_instance_id, ..
            } => case_instance_id,
        }
    }
}

impl fmt::Display for AtomicOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicOperation::InitializeContainer { execution_id } => {
                write!(f, "initialize({execution_id})")
            }
            AtomicOperation::CreateChild {
                parent_id,
                activity_id,
            } => write!(f, "create({parent_id}/{activity_id})"),
            AtomicOperation::Transition {
                execution_id,
                transition,
            } => write!(f, "{transition}({execution_id})"),
            AtomicOperation::FireEntryCriteria { execution_id } => {
                write!(f, "fireEntry({execution_id})")
            }
            AtomicOperation::FireExitCriteria { execution_id } => {
                write!(f, "fireExit({execution_id})")
            }
            AtomicOperation::EvaluateSentries { container_id } => {
                write!(f, "evaluateSentries({container_id})")
            }
            AtomicOperation::AutoComplete { execution_id } => {
                write!(f, "autoComplete({execution_id})")
            }
            AtomicOperation::SetVariable { scope_id, name, .. } => {
                write!(f, "setVariable({scope_id}.{name})")
            }
            AtomicOperation::RemoveVariable { scope_id, name } => {
                write!(f, "removeVariable({scope_id}.{name})")
            }
            AtomicOperation::DeleteCaseInstance {
                case_instance_id, ..
            } => write!(f, "delete({case_instance_id})"),
        }
    }
}

/// What an operation asks the executor to run next.
#[derive(Debug, Default)]
pub(crate) struct FollowUps {
    pub inline: Vec<AtomicOperation>,
    pub queued: Vec<AtomicOperation>,
}

impl FollowUps {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, other: FollowUps) {
        self.inline.extend(other.inline);
        self.queued.extend(other.queued);
    }
}
