// ============================================================================
// spark-state - Errors
// ============================================================================
//
// Only configuration problems are returned as hard errors from constructors.
// Lookup misses and rejected writes are logged and recovered where they
// happen; they never surface here.
// ============================================================================

use super::id::WatchableId;

/// Errors surfaced by the runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("collection name cannot be empty")]
    MissingCollectionName,

    #[error("collection '{0}' needs a primary key")]
    MissingPrimaryKey(String),

    #[error("action name cannot be empty")]
    MissingActionName,

    #[error("action '{action}' failed")]
    Action {
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("compute for watchable {id} failed")]
    Compute {
        id: WatchableId,
        #[source]
        source: anyhow::Error,
    },

    #[error("value conversion failed: {0}")]
    Conversion(#[from] serde_json::Error),

    #[error("runtime has been killed")]
    RuntimeKilled,
}

impl StateError {
    /// True for errors raised while validating construction arguments.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCollectionName | Self::MissingPrimaryKey(_) | Self::MissingActionName
        )
    }
}
