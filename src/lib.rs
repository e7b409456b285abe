//! Replica reconciliation engine.
//!
//! Keeps two independently writable replicas of the same collections/items dataset in step.
//! The `migration` module holds the engine itself (conflict resolution, deduplication,
//! transactions, progress tracking and the orchestrator), `model` holds the entity values and
//! `persistence` the repository port the engine reads from and writes to.

/// Collection and item value types
pub mod model;
/// Reconciliation engine
pub mod migration;
/// Repository port and the in-memory adapter
pub mod persistence;
/// Formatting helpers
pub mod utils;

pub use migration::*;
pub use model::*;
pub use persistence::{InMemoryRepository, ReplicaRepository, RepositoryError, ReplicaSnapshot};
