use crate::record::RecordKind;

/// All errors that can be returned by an ArborStorage implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency conflict: the stored revision of the record no
    /// longer matches the revision the caller loaded.
    #[error("concurrent modification of {kind} {id}: expected revision {expected_revision}")]
    ConcurrentConflict {
        kind: RecordKind,
        id: String,
        expected_revision: i64,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: RecordKind, id: String },

    /// A backend-specific storage error (connection, serialization, poisoning).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::ConcurrentConflict { .. })
    }
}
