// ============================================================================
// spark-state - Core Module
// Identity, errors, the Watchable trait and the Runtime
// ============================================================================

pub mod error;
pub mod id;
pub mod runtime;
pub mod types;

pub use error::StateError;
pub use id::{IdGenerator, WatchableId};
pub use runtime::{ErrorHandler, Runtime, RuntimeConfig, RuntimeRef, RuntimeStats};
pub use types::{WatchFn, Watchable, WatchableKind};
