//! arbor-core: case definition model for the Arbor execution engine.
//!
//! Provides the immutable, validated definition tree that execution nodes
//! reference, the lifecycle state machine shared by every node, and the
//! declarative conditions used by sentry if-parts.
//!
//! # Public API
//!
//! - [`CaseDefinition`] -- validated, indexed definition (parse with
//!   [`CaseDefinition::from_json`])
//! - [`ActivityDefinition`], [`SentryDeclaration`] -- plan model building blocks
//! - [`ExecutionState`], [`Transition`] -- lifecycle states and standard events
//! - [`Condition`] -- if-part expressions
//! - [`DefinitionError`] -- parse and validation failures

pub mod condition;
pub mod definition;
pub mod error;
pub mod state;
mod validate;

// ── Convenience re-exports ───────────────────────────────────────────

pub use condition::Condition;
pub use definition::{
    ActivityDefinition, ActivityType, CaseDefinition, CaseDefinitionModel, DefinitionKind,
    ExitAction, ExitCriterion, OnPartDeclaration, SentryDeclaration, VariableOnPartDeclaration,
    VariableTransition,
};
pub use error::DefinitionError;
pub use state::{ExecutionState, Transition};
