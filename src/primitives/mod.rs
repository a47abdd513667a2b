// ============================================================================
// spark-state - Primitives Module
// State, Computed and Action
// ============================================================================

pub mod action;
pub mod computed;
pub mod state;
pub mod watchable;

pub use action::{Action, ActionOptions};
pub use computed::Computed;
pub use state::State;
pub use watchable::Fetcher;
