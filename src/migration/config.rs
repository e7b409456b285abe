use crate::migration::conflict_resolver::ConflictStrategy;
use crate::migration::types::MigrationError;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Which replica feeds which
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationDirection {
	/// Local replica is the source of truth, results are written to the cloud only
	LocalToCloud,
	/// Cloud replica is the source of truth, results are written locally only
	CloudToLocal,
	/// Both replicas are written until they converge
	Bidirectional,
}

impl std::fmt::Display for MigrationDirection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			MigrationDirection::LocalToCloud => write!(f, "local-to-cloud"),
			MigrationDirection::CloudToLocal => write!(f, "cloud-to-local"),
			MigrationDirection::Bidirectional => write!(f, "bidirectional"),
		}
	}
}

impl std::str::FromStr for MigrationDirection {
	type Err = MigrationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"local-to-cloud" | "up" => Ok(MigrationDirection::LocalToCloud),
			"cloud-to-local" | "down" => Ok(MigrationDirection::CloudToLocal),
			"bidirectional" | "both" => Ok(MigrationDirection::Bidirectional),
			other => Err(MigrationError::Validation(format!(
				"Unknown migration direction: {}",
				other
			))),
		}
	}
}

/// Options for one migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MigrationConfig {
	pub conflict_strategy: ConflictStrategy,
	/// Delete the source replica's data once a directional run finished without errors
	pub delete_source_after_success: bool,
	/// Ceiling applied to every single write
	pub transaction_timeout_secs: u64,
	/// Number of entities written per batch
	pub batch_size: usize,
	/// Run the data cleaner over the written replicas after a clean run
	pub run_cleanup: bool,
	pub cleanup: CleanupConfig,
}

impl Default for MigrationConfig {
	fn default() -> Self {
		Self {
			conflict_strategy: ConflictStrategy::SmartMerge,
			delete_source_after_success: false,
			transaction_timeout_secs: 30,
			batch_size: 50,
			run_cleanup: false,
			cleanup: CleanupConfig::default(),
		}
	}
}

impl MigrationConfig {
	pub fn transaction_timeout(&self) -> Duration {
		Duration::from_secs(self.transaction_timeout_secs)
	}

	pub fn validate(&self) -> Result<(), MigrationError> {
		if self.batch_size == 0 {
			return Err(MigrationError::Validation(
				"batch size must be at least 1".to_string(),
			));
		}
		if self.transaction_timeout_secs == 0 {
			return Err(MigrationError::Validation(
				"transaction timeout must be at least one second".to_string(),
			));
		}
		self.cleanup.validate()
	}

	/// Load a configuration from a JSON file. Missing fields take their defaults.
	pub async fn load(path: &Path) -> Result<Self, MigrationError> {
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			MigrationError::Validation(format!("Failed to read config {:?}: {}", path, e))
		})?;

		let config: Self = serde_json::from_str(&content).map_err(|e| {
			MigrationError::Validation(format!("Failed to parse config {:?}: {}", path, e))
		})?;
		config.validate()?;

		info!("Loaded migration config from {:?}", path);
		Ok(config)
	}
}

/// Ten years
pub const MAX_FUTURE_TOLERANCE_HOURS: i64 = 87_600;
/// A hundred years
pub const MAX_ARCHIVE_AFTER_DAYS: i64 = 36_500;

/// Options for the post-run data cleaner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanupConfig {
	pub max_name_length: usize,
	/// Creation timestamps further in the future than this are implausible
	pub future_tolerance_hours: i64,
	/// Report entities older than this many days as archive candidates
	pub archive_after_days: Option<i64>,
	/// Only report, never delete
	pub dry_run: bool,
}

impl CleanupConfig {
	pub fn validate(&self) -> Result<(), MigrationError> {
		if !(0..=MAX_FUTURE_TOLERANCE_HOURS).contains(&self.future_tolerance_hours) {
			return Err(MigrationError::Validation(format!(
				"future tolerance must be between 0 and {} hours",
				MAX_FUTURE_TOLERANCE_HOURS
			)));
		}
		if let Some(days) = self.archive_after_days {
			if !(1..=MAX_ARCHIVE_AFTER_DAYS).contains(&days) {
				return Err(MigrationError::Validation(format!(
					"archive threshold must be between 1 and {} days",
					MAX_ARCHIVE_AFTER_DAYS
				)));
			}
		}
		Ok(())
	}
}

impl Default for CleanupConfig {
	fn default() -> Self {
		Self {
			max_name_length: crate::model::MAX_NAME_LENGTH,
			future_tolerance_hours: 24,
			archive_after_days: None,
			dry_run: false,
		}
	}
}
