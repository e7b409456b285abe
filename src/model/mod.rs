//! Entity model shared by both replicas.
//!
//! Collections own items through the item's `collection_id`. Both are plain immutable values:
//! changes are expressed with `with_*` builders that return a new value.

/// Collection and item definitions
mod types;

pub use types::*;
