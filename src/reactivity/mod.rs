// ============================================================================
// spark-state - Reactivity Module
// Event broadcast, batching, value merging and the task scheduler
// ============================================================================

pub mod batching;
pub mod engine;
pub mod merge;
pub mod scheduler;

pub use batching::{BatchOp, Deferred};
pub use engine::{Event, EventEngine, Release, Subscription};
pub use merge::{deep_merge, is_equal, merge_payload};
pub use scheduler::{Scheduler, TaskId, TaskOptions, TaskOutput};
