use arbor_core::{DefinitionError, ExecutionState, Transition};
use arbor_storage::StorageError;

use crate::history::HistoryError;
use crate::tenant::TenantProviderError;

/// Errors raised while running a command. Any of them aborts the command's
/// snapshot, so nothing the command staged becomes visible.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transition is not allowed from the node's current state.
    #[error("cannot {transition} execution {execution_id} in state {state}")]
    InvalidTransition {
        execution_id: String,
        transition: Transition,
        state: ExecutionState,
    },

    /// A transition or command precondition other than the state table.
    #[error("cannot {operation} execution {execution_id}: {reason}")]
    PreconditionFailed {
        execution_id: String,
        operation: String,
        reason: String,
    },

    #[error("cannot {transition} execution {execution_id}: no {criterion} criterion is satisfied")]
    SentryNotSatisfied {
        execution_id: String,
        transition: Transition,
        criterion: &'static str,
    },

    #[error("activity {activity_id} not found in definition {definition_id}")]
    MissingActivity {
        definition_id: String,
        activity_id: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Persisted records disagree with each other (dangling parent, part
    /// bound to a missing source, node outside its case instance).
    #[error("referential inconsistency at {execution_id}: {message}")]
    ReferentialInconsistency {
        execution_id: String,
        message: String,
    },

    #[error("optimistic lock conflict: {0}")]
    Conflict(StorageError),

    #[error("variable listener {listener} failed on {variable}: {message}")]
    Listener {
        listener: String,
        variable: String,
        message: String,
    },

    #[error(transparent)]
    TenantProvider(#[from] TenantProviderError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("cascade exceeded {limit} atomic operations (last: {last_operation})")]
    CascadeLimitExceeded {
        limit: usize,
        last_operation: String,
    },

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub(crate) fn not_found(kind: &str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub(crate) fn precondition(
        execution_id: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EngineError::PreconditionFailed {
            execution_id: execution_id.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn inconsistent(
        execution_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::ReferentialInconsistency {
            execution_id: execution_id.into(),
            message: message.into(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ConcurrentConflict { .. } => EngineError::Conflict(err),
            StorageError::NotFound { kind, id } => EngineError::NotFound {
                kind: kind.to_string(),
                id,
            },
            other => EngineError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_storage::RecordKind;

    #[test]
    fn storage_conflict_maps_to_conflict() {
        let err: EngineError = StorageError::ConcurrentConflict {
            kind: RecordKind::Execution,
            id: "a".to_string(),
            expected_revision: 3,
        }
        .into();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected revision 3"));
    }

    #[test]
    fn storage_not_found_keeps_kind() {
        let err: EngineError = StorageError::NotFound {
            kind: RecordKind::SentryPart,
            id: "p1".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "sentry part not found: p1");
    }

    #[test]
    fn invalid_transition_message() {
        let err = EngineError::InvalidTransition {
            execution_id: "x".to_string(),
            transition: Transition::ManualStart,
            state: ExecutionState::Available,
        };
        assert_eq!(
            err.to_string(),
            "cannot manualStart execution x in state available"
        );
    }
}
