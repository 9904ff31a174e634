pub mod conformance;
mod error;
mod memory;
mod query;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use query::{
    Direction, ExecutionQuery, ExecutionQueryBuilder, QueryOrdering, QueryProperty,
    VariablePredicate,
};
pub use record::{ExecutionRecord, RecordKind, SentryPartRecord, SentryPartType, VariableRecord};
pub use traits::ArborStorage;
