// ============================================================================
// spark-state - Collections Module
// Keyed record stores with groups and selectors
// ============================================================================
//
// A Collection owns its data instances, groups and selectors. Each of those
// is a watchable in its own right:
//
// 1. DataInstance: one record, a State guarded by the primary key
// 2. Group: ordered subset of keys, valued as the array of their records
// 3. Selector: pointer at one key, valued as that record or a default
// ============================================================================

pub mod collection;
pub mod data;
pub mod group;
pub mod selector;

pub use collection::{Collection, CollectionConfig, CollectionKey, ProvisionalValue};
pub use data::DataInstance;
pub use group::Group;
pub use selector::{Selector, SelectorOptions};
