//! Replica Migration Module
//!
//! This module provides the reconciliation engine that keeps a local and a cloud replica of the same dataset in step.
//! It is composed of several submodules, each responsible for a specific aspect of a migration run:
//!
//! - `orchestrator`: The main entry point and coordinator for migration runs. It wires together all services below.
//! - `conflict_resolver`: Decides the surviving value when both replicas hold differing versions of an entity.
//! - `deduplication`: Collapses repeated identifiers and turns insert collisions into updates.
//! - `transaction_manager`: Runs persistence calls with timeouts, rollbacks and bulk (all-or-nothing) semantics.
//! - `progress_tracker`: Tracks phases and per-operation outcomes, and broadcasts progress events.
//! - `data_cleaner`: Optional post-migration cleanup of look-alike, invalid and orphaned entities.
//! - `events`: Defines the migration phases and progress event types.
//! - `config`: Migration direction and run configuration.
//! - `types`: Error and result types shared by the engine.
//!
//! The orchestrator reads both replicas through the `ReplicaRepository` port, plans the writes, and executes them
//! batch by batch inside transactions. Progress tracking is integrated so callers can observe a run while it happens.

/// Migration direction and run configuration
pub mod config;
/// Conflict resolution strategies
pub mod conflict_resolver;
/// Post-migration data cleanup
pub mod data_cleaner;
/// Deduplication of colliding identifiers
pub mod deduplication;
/// Migration phases and progress events
pub mod events;
/// Main coordinator for migration runs
pub mod orchestrator;
/// Tracks migration progress and statistics
pub mod progress_tracker;
/// Timeouts, rollbacks and bulk transactions
pub mod transaction_manager;
/// Errors and results
pub mod types;

pub use config::{CleanupConfig, MigrationConfig, MigrationDirection};
pub use conflict_resolver::{ConflictResolver, ConflictStrategy, ManualResolver, Resolution};
pub use data_cleaner::{CleanupPlan, CleanupReport, DataCleaner};
pub use deduplication::{DeduplicationService, DuplicateStats, SaveOutcome};
pub use events::{MigrationPhase, ProgressEvent, ProgressEventKind};
pub use orchestrator::*;
pub use progress_tracker::{ProgressStatistics, ProgressTracker};
pub use transaction_manager::{
    OperationKind, OperationRecord, PlannedOperation, RollbackAction, TransactionManager, TransactionState,
    TransactionStep,
};
pub use types::{MigrationError, MigrationResult};
