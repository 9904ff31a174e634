//! arbor-engine: executes case instances as trees of plan item executions.
//!
//! A command (create an instance, fire a transition, set a variable, delete
//! an instance) runs inside one storage snapshot. The command's atomic
//! operation may cascade through sentries into further operations; they are
//! performed through a FIFO queue owned by the command and committed
//! together.
//!
//! # Public API
//!
//! - [`CaseEngine`] -- command entry points, built with [`CaseEngine::builder`]
//! - [`EngineConfig`] -- TOML configuration (tree loading, history, budget)
//! - [`DefinitionCache`] -- deployed definitions, latest version by key
//! - [`HistoryEventHandler`], [`TenantIdProvider`], [`VariableListener`] --
//!   extension points
//! - [`ExecutionReport`] -- what a committed command did
//! - [`EngineError`] -- every failure a command can report

pub mod config;
mod context;
pub mod definitions;
mod engine;
pub mod error;
pub mod history;
pub mod operation;
mod sentry;
mod staging;
pub mod tenant;
mod tree;
pub mod variables;

// ── Convenience re-exports ───────────────────────────────────────────

pub use config::{
    ConfigError, EngineConfig, ExecutionConfig, HistoryConfig, LoadingStrategy, TreeConfig,
};
pub use context::{ExecutionReport, RecordCounts};
pub use definitions::{DefinitionCache, DefinitionSource};
pub use engine::{CaseEngine, CaseEngineBuilder, CaseInstanceCreated, CreateCaseInstance};
pub use error::EngineError;
pub use history::{
    HistoryError, HistoryEvent, HistoryEventHandler, HistoryEventKind, InMemoryHistory,
    NoopHistory,
};
pub use operation::AtomicOperation;
pub use tenant::{StaticTenantIdProvider, TenantContext, TenantIdProvider, TenantProviderError};
pub use variables::{
    ListenerError, ListenerStage, VariableEvent, VariableListener, LISTENER_ORDER,
};
