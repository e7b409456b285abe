//! Progress events emitted during a migration run.
//!
//! This module defines the phases a run walks through and the immutable `ProgressEvent` values
//! the progress tracker broadcasts. Events decouple the orchestrator from whoever displays
//! progress: a CLI, a UI layer or a test can subscribe without the engine knowing about it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Phases of a migration run, in their usual order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationPhase {
    Initializing,
    Validating,
    PreparingData,
    MigratingCollections,
    MigratingItems,
    ResolvingConflicts,
    Finalizing,
    Cleanup,
    Completed,
    Failed,
}

impl MigrationPhase {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Completed | MigrationPhase::Failed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MigrationPhase::Initializing => "initializing",
            MigrationPhase::Validating => "validating",
            MigrationPhase::PreparingData => "preparing-data",
            MigrationPhase::MigratingCollections => "migrating-collections",
            MigrationPhase::MigratingItems => "migrating-items",
            MigrationPhase::ResolvingConflicts => "resolving-conflicts",
            MigrationPhase::Finalizing => "finalizing",
            MigrationPhase::Cleanup => "cleanup",
            MigrationPhase::Completed => "completed",
            MigrationPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a progress event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressEventKind {
    /// A phase has begun
    PhaseStarted,
    /// A phase has ended
    PhaseCompleted,
    /// An entity was written successfully
    OperationSucceeded,
    /// An entity could not be written
    OperationFailed,
    /// Two replica versions of the same entity were reconciled
    ConflictResolved,
    /// Something worth surfacing that did not fail the entity (integrity findings, verification)
    Warning,
    /// The run finished
    MigrationCompleted,
    /// The run aborted
    MigrationFailed,
}

/// An immutable progress notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub phase: MigrationPhase,
    pub message: String,
    pub percentage: Option<f64>,
    pub entity_id: Option<String>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressEventKind, phase: MigrationPhase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
            percentage: None,
            entity_id: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }
}
