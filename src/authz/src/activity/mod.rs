//! Activity engine: sequencing, dependency ordering, persistence and
//! replication of mutations

pub mod completion;
pub mod dependency;
pub mod engine;
pub mod persist;

pub use completion::CompletionState;
pub use engine::{ActivityEngine, ActivityState, FaultRecord};
