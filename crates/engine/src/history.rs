//! History event sink.
//!
//! The engine collects one [`HistoryEvent`] per node and variable change
//! while a command runs and hands the batch to a [`HistoryEventHandler`]
//! once. Handler failures are logged and swallowed unless
//! `history.fail_on_error` is set, in which case the batch is delivered
//! before commit and a failure aborts the command.

use std::fmt;
use std::sync::Mutex;

use arbor_core::{ExecutionState, Transition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    Handler(String),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Handler(msg) => write!(f, "history handler error: {}", msg),
        }
    }
}

impl std::error::Error for HistoryError {}

// ──────────────────────────────────────────────
// Events
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventKind {
    ExecutionCreated,
    ExecutionUpdated,
    ExecutionRemoved,
    SubInstanceCreated,
    VariableCreated,
    VariableUpdated,
    VariableDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub kind: HistoryEventKind,
    pub execution_id: String,
    pub case_instance_id: String,
    pub activity_id: Option<String>,
    pub tenant_id: Option<String>,
    pub state: Option<ExecutionState>,
    pub transition: Option<Transition>,
    pub variable_name: Option<String>,
    pub value: Option<serde_json::Value>,
    /// For `sub_instance_created`: the id of the new sub-instance root.
    pub sub_instance_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl HistoryEvent {
    pub(crate) fn new(
        kind: HistoryEventKind,
        execution_id: impl Into<String>,
        case_instance_id: impl Into<String>,
    ) -> Self {
        HistoryEvent {
            kind,
            execution_id: execution_id.into(),
            case_instance_id: case_instance_id.into(),
            activity_id: None,
            tenant_id: None,
            state: None,
            transition: None,
            variable_name: None,
            value: None,
            sub_instance_id: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

// ──────────────────────────────────────────────
// Trait
// ──────────────────────────────────────────────

/// Receives the history events of one committed (or committing) command.
#[async_trait]
pub trait HistoryEventHandler: Send + Sync {
    async fn handle_events(&self, events: &[HistoryEvent]) -> Result<(), HistoryError>;
}

/// Discards every event. Used when history is disabled.
pub struct NoopHistory;

#[async_trait]
impl HistoryEventHandler for NoopHistory {
    async fn handle_events(&self, _events: &[HistoryEvent]) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Keeps every event in memory, in delivery order.
#[derive(Default)]
pub struct InMemoryHistory {
    events: Mutex<Vec<HistoryEvent>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HistoryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryEventHandler for InMemoryHistory {
    async fn handle_events(&self, events: &[HistoryEvent]) -> Result<(), HistoryError> {
        let mut stored = self
            .events
            .lock()
            .map_err(|e| HistoryError::Handler(format!("lock poisoned: {e}")))?;
        stored.extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_history_appends_batches() {
        let history = InMemoryHistory::new();
        let first = HistoryEvent::new(HistoryEventKind::ExecutionCreated, "ci-1", "ci-1");
        let second = HistoryEvent::new(HistoryEventKind::ExecutionUpdated, "ci-1", "ci-1");
        history.handle_events(&[first]).await.unwrap();
        history.handle_events(&[second]).await.unwrap();

        let kinds: Vec<_> = history.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                HistoryEventKind::ExecutionCreated,
                HistoryEventKind::ExecutionUpdated
            ]
        );
    }

    #[test]
    fn event_serializes_timestamp_as_rfc3339() {
        let event = HistoryEvent::new(HistoryEventKind::VariableCreated, "a", "ci-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "variable_created");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
