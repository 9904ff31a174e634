//! Execution lifecycle states and the transitions between them.
//!
//! A node starts `available` (children) or `active` (case instance roots)
//! and ends in one of the two terminal states, `completed` or `terminated`.
//! Each [`Transition`] doubles as the *standard event* emitted to sentry
//! on-parts when the transition fires.

use std::fmt;

use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// States
// ──────────────────────────────────────────────

/// Lifecycle state of an execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Available,
    Enabled,
    Disabled,
    Active,
    Suspended,
    Completed,
    Terminated,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 7] = [
        ExecutionState::Available,
        ExecutionState::Enabled,
        ExecutionState::Disabled,
        ExecutionState::Active,
        ExecutionState::Suspended,
        ExecutionState::Completed,
        ExecutionState::Terminated,
    ];

    /// `completed` and `terminated` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Available => "available",
            ExecutionState::Enabled => "enabled",
            ExecutionState::Disabled => "disabled",
            ExecutionState::Active => "active",
            ExecutionState::Suspended => "suspended",
            ExecutionState::Completed => "completed",
            ExecutionState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionState> {
        ExecutionState::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────────────────────────────────
// Transitions / standard events
// ──────────────────────────────────────────────

/// A lifecycle transition. The serialized name is the CMMN standard event
/// that on-parts listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transition {
    Create,
    Enable,
    Disable,
    Reenable,
    Start,
    ManualStart,
    Complete,
    Occur,
    Terminate,
    Exit,
    ParentTerminate,
    Suspend,
    ParentSuspend,
    Resume,
    ParentResume,
}

impl Transition {
    pub const ALL: [Transition; 15] = [
        Transition::Create,
        Transition::Enable,
        Transition::Disable,
        Transition::Reenable,
        Transition::Start,
        Transition::ManualStart,
        Transition::Complete,
        Transition::Occur,
        Transition::Terminate,
        Transition::Exit,
        Transition::ParentTerminate,
        Transition::Suspend,
        Transition::ParentSuspend,
        Transition::Resume,
        Transition::ParentResume,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Create => "create",
            Transition::Enable => "enable",
            Transition::Disable => "disable",
            Transition::Reenable => "reenable",
            Transition::Start => "start",
            Transition::ManualStart => "manualStart",
            Transition::Complete => "complete",
            Transition::Occur => "occur",
            Transition::Terminate => "terminate",
            Transition::Exit => "exit",
            Transition::ParentTerminate => "parentTerminate",
            Transition::Suspend => "suspend",
            Transition::ParentSuspend => "parentSuspend",
            Transition::Resume => "resume",
            Transition::ParentResume => "parentResume",
        }
    }

    pub fn parse(s: &str) -> Option<Transition> {
        Transition::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Transitions that move a node into `active`, `enabled` or (for
    /// milestones) straight to `completed` on entry. These are the ones an
    /// entry criterion gates.
    pub fn is_entry(self) -> bool {
        matches!(
            self,
            Transition::Enable | Transition::Start | Transition::ManualStart | Transition::Occur
        )
    }

    /// Resolve the target state of this transition from `current`.
    ///
    /// `previous` is the state recorded before the node was suspended; it is
    /// only consulted by `resume` / `parentResume`. Returns `None` when the
    /// transition is not allowed from `current`.
    pub fn target(
        self,
        current: ExecutionState,
        previous: Option<ExecutionState>,
    ) -> Option<ExecutionState> {
        use ExecutionState::*;

        if current.is_terminal() {
            return None;
        }
        match (self, current) {
            (Transition::Create, _) => None,
            (Transition::Enable, Available) => Some(Enabled),
            (Transition::Disable, Available | Enabled) => Some(Disabled),
            (Transition::Reenable, Disabled) => Some(Enabled),
            (Transition::Start, Available) => Some(Active),
            (Transition::ManualStart, Enabled) => Some(Active),
            (Transition::Complete, Active) => Some(Completed),
            (Transition::Occur, Available) => Some(Completed),
            (Transition::Terminate, Active) => Some(Terminated),
            (Transition::Exit | Transition::ParentTerminate, _) => Some(Terminated),
            (Transition::Suspend | Transition::ParentSuspend, Suspended) => None,
            (Transition::Suspend | Transition::ParentSuspend, _) => Some(Suspended),
            (Transition::Resume | Transition::ParentResume, Suspended) => {
                match previous {
                    Some(prev) if prev != Suspended && !prev.is_terminal() => Some(prev),
                    _ => Some(Active),
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
