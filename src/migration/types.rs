use crate::migration::config::MigrationDirection;
use crate::persistence::RepositoryError;
use crate::utils::percentage;

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Errors raised while reconciling replicas
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
	#[error("Validation error: {0}")]
	Validation(String),

	#[error("Repository error: {0}")]
	Repository(#[from] RepositoryError),

	#[error("Transaction timed out after {0:?}")]
	Timeout(Duration),

	#[error("Fatal error: {0}")]
	Fatal(String),

	#[error("A migration is already in progress")]
	AlreadyRunning,

	#[error("Rollback error: {0}")]
	Rollback(String),
}

impl MigrationError {
	/// Timed-out writes may still have been applied by the replica.
	pub fn is_ambiguous(&self) -> bool {
		matches!(self, MigrationError::Timeout(_))
	}
}

/// Outcome of one orchestrator run, handed to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
	pub direction: MigrationDirection,
	pub migrated_collections: usize,
	pub migrated_items: usize,
	pub conflicts_resolved: usize,
	pub errors: usize,
	#[serde(with = "duration_millis")]
	pub duration: Duration,
	pub error_messages: Vec<String>,
	/// Items whose owning collection is missing after the run.
	pub inconsistencies: Vec<String>,
	/// Set when the run aborted before reaching the integrity pass.
	pub fatal_error: Option<String>,
	pub statistics: BTreeMap<String, serde_json::Value>,
}

impl MigrationResult {
	pub fn new(direction: MigrationDirection) -> Self {
		Self {
			direction,
			migrated_collections: 0,
			migrated_items: 0,
			conflicts_resolved: 0,
			errors: 0,
			duration: Duration::ZERO,
			error_messages: Vec::new(),
			inconsistencies: Vec::new(),
			fatal_error: None,
			statistics: BTreeMap::new(),
		}
	}

	/// Result of a run that could not get past its setup.
	pub fn fatal(direction: MigrationDirection, error: &MigrationError, duration: Duration) -> Self {
		let mut result = Self::new(direction);
		result.errors = 1;
		result.fatal_error = Some(error.to_string());
		result.error_messages.push(error.to_string());
		result.duration = duration;
		result
	}

	pub fn record_error(&mut self, message: impl Into<String>) {
		self.errors += 1;
		self.error_messages.push(message.into());
	}

	pub fn migrated_total(&self) -> usize {
		self.migrated_collections + self.migrated_items
	}

	/// Share of attempted entity migrations that succeeded, in percent.
	pub fn success_rate(&self) -> f64 {
		let migrated = self.migrated_total();
		let attempted = migrated + self.errors;
		if attempted == 0 {
			return 100.0;
		}
		percentage(migrated, attempted)
	}

	pub fn is_success(&self) -> bool {
		self.fatal_error.is_none() && self.errors == 0 && self.inconsistencies.is_empty()
	}

	/// Get a human-readable summary of the run
	pub fn summary(&self) -> String {
		format!(
			"{} migration in {:?}: {} collections, {} items, {} conflicts, {} errors{}",
			self.direction,
			self.duration,
			self.migrated_collections,
			self.migrated_items,
			self.conflicts_resolved,
			self.errors,
			if self.inconsistencies.is_empty() {
				String::new()
			} else {
				format!(" ({} inconsistencies)", self.inconsistencies.len())
			}
		)
	}
}

mod duration_millis {
	use serde::Serializer;
	use std::time::Duration;

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(duration.as_millis() as u64)
	}
}
