//! Persistence port consumed by the reconciliation engine.
//!
//! The engine never talks to a store directly. Each replica is reached through a
//! `ReplicaRepository`, which a device-local database or a remote API adapter implements.
//! `InMemoryRepository` is the adapter shipped with the crate; it can be loaded from and saved
//! to a JSON snapshot file.

/// Repository trait, errors and the in-memory adapter
mod repositories;

pub use repositories::*;
