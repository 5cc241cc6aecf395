pub mod checkpoint;
pub mod engine;
pub mod executor;
pub mod merge;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod router;
pub mod source;
pub mod validator;

pub use checkpoint::{
    CheckpointStore, ExecutionLease, MemoryCheckpointBackend, SqliteCheckpointBackend,
};
pub use engine::WorkflowEngine;
pub use executor::{GroupExecutor, GroupOutcome};
pub use plan::{compile, ExecutionPlan, PlanGroup};
pub use progress::ProgressEmitter;
pub use router::{route, Route};
pub use source::{DirectorySchemaSource, PlanCache, StaticSchemaSource};
pub use validator::validate;
