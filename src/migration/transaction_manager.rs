//! Guarded execution of persistence calls.
//!
//! Every write the engine performs runs inside a transaction: a timeout ceiling, an optional
//! rollback run when the write fails, and tracking of how many transactions are in flight. Bulk
//! transactions run an ordered list of steps and undo the completed ones in reverse order when a
//! step fails.
//!
//! A timed-out future is dropped, but the replica call it was waiting on may still complete on
//! the other end. `verify_operation` exists so callers can settle such ambiguous outcomes later.

use crate::migration::types::MigrationError;
use crate::model::{Collection, EntityKind, Item};
use crate::persistence::{ReplicaRepository, RepositoryError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default ceiling for a single transaction.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of operation records kept for diagnostics.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
	Running,
	Committed,
	RolledBack,
	/// Timed out; rolled back where a rollback was registered
	TimedOut,
}

/// Kind of write recorded in the operation history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
	Create,
	Update,
	Delete,
}

/// How to undo a recorded write
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackAction {
	/// Undo a creation
	Delete { kind: EntityKind, id: String },
	/// Undo an update or a deletion of a collection
	RestoreCollection(Collection),
	/// Undo an update or a deletion of an item
	RestoreItem(Item),
	/// Nothing to undo
	None,
}

/// A write a bulk step is about to perform
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
	pub operation: OperationKind,
	pub entity_kind: EntityKind,
	pub entity_id: String,
	/// Replica the write goes to
	pub replica: String,
	pub rollback: RollbackAction,
}

/// One write recorded in the bounded operation history.
///
/// Records are added when their transaction starts and discarded when it rolls back.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
	pub transaction_id: u64,
	pub operation: OperationKind,
	pub entity_kind: EntityKind,
	pub entity_id: String,
	/// Replica the write went to
	pub replica: String,
	pub rollback: RollbackAction,
	pub timestamp: DateTime<Utc>,
}

/// One step of a bulk transaction: the work and how to undo it.
pub struct TransactionStep<'a, T> {
	name: String,
	operation: Option<PlannedOperation>,
	execute: Box<dyn FnOnce() -> BoxFuture<'a, Result<T, MigrationError>> + Send + 'a>,
	rollback: Box<dyn FnOnce() -> BoxFuture<'a, Result<(), MigrationError>> + Send + 'a>,
}

impl<'a, T> TransactionStep<'a, T> {
	pub fn new<E, EFut, R, RFut>(name: impl Into<String>, execute: E, rollback: R) -> Self
	where
		E: FnOnce() -> EFut + Send + 'a,
		EFut: Future<Output = Result<T, MigrationError>> + Send + 'a,
		R: FnOnce() -> RFut + Send + 'a,
		RFut: Future<Output = Result<(), MigrationError>> + Send + 'a,
	{
		Self {
			name: name.into(),
			operation: None,
			execute: Box::new(move || execute().boxed()),
			rollback: Box::new(move || rollback().boxed()),
		}
	}

	/// Record `operation` in the history for as long as the transaction stands.
	pub fn with_operation(mut self, operation: PlannedOperation) -> Self {
		self.operation = Some(operation);
		self
	}
}

/// Decrements the in-flight counter when dropped, including when the transaction future is
/// cancelled.
struct InFlight<'a> {
	id: u64,
	active: &'a AtomicUsize,
	state: TransactionState,
}

impl<'a> InFlight<'a> {
	fn begin(id: u64, active: &'a AtomicUsize) -> Self {
		active.fetch_add(1, Ordering::SeqCst);
		debug!("Transaction {} {:?}", id, TransactionState::Running);
		Self {
			id,
			active,
			state: TransactionState::Running,
		}
	}

	fn finish(&mut self, state: TransactionState) {
		self.state = state;
	}
}

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		self.active.fetch_sub(1, Ordering::SeqCst);
		debug!("Transaction {} {:?}", self.id, self.state);
	}
}

/// Runs persistence calls with timeout, rollback and in-flight tracking.
///
/// Transactions share nothing but the append-only operation history; the manager is meant to be
/// shared behind an `Arc` and called concurrently.
#[derive(Debug)]
pub struct TransactionManager {
	timeout: Duration,
	history_limit: usize,
	history: Mutex<VecDeque<OperationRecord>>,
	active: AtomicUsize,
	next_id: AtomicU64,
}

impl Default for TransactionManager {
	fn default() -> Self {
		Self::new(DEFAULT_TRANSACTION_TIMEOUT)
	}
}

impl TransactionManager {
	pub fn new(timeout: Duration) -> Self {
		Self::with_history_limit(timeout, DEFAULT_HISTORY_LIMIT)
	}

	pub fn with_history_limit(timeout: Duration, history_limit: usize) -> Self {
		Self {
			timeout,
			history_limit: history_limit.max(1),
			history: Mutex::new(VecDeque::new()),
			active: AtomicUsize::new(0),
			next_id: AtomicU64::new(1),
		}
	}

	fn history(&self) -> MutexGuard<'_, VecDeque<OperationRecord>> {
		self.history
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn begin(&self) -> InFlight<'_> {
		InFlight::begin(self.next_id.fetch_add(1, Ordering::SeqCst), &self.active)
	}

	/// Run `op` under the default timeout ceiling.
	pub async fn execute_transaction<T, F, Fut>(&self, op: F) -> Result<T, MigrationError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, MigrationError>>,
	{
		self.execute_transaction_with_timeout(self.timeout, op).await
	}

	/// Run `op` under `timeout`. Errors from `op` are returned unchanged.
	pub async fn execute_transaction_with_timeout<T, F, Fut>(
		&self,
		timeout: Duration,
		op: F,
	) -> Result<T, MigrationError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, MigrationError>>,
	{
		let mut tx = self.begin();

		match tokio::time::timeout(timeout, op()).await {
			Ok(Ok(value)) => {
				tx.finish(TransactionState::Committed);
				Ok(value)
			}
			Ok(Err(e)) => {
				tx.finish(TransactionState::RolledBack);
				Err(e)
			}
			Err(_) => {
				warn!("Transaction {} timed out after {:?}", tx.id, timeout);
				tx.finish(TransactionState::TimedOut);
				Err(MigrationError::Timeout(timeout))
			}
		}
	}

	/// Run `op`; when it fails or times out, run `rollback` before returning the original error.
	///
	/// A failing rollback is logged and never replaces the original error.
	pub async fn execute_with_rollback<T, F, Fut, R, RFut>(
		&self,
		op: F,
		rollback: R,
	) -> Result<T, MigrationError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, MigrationError>>,
		R: FnOnce() -> RFut,
		RFut: Future<Output = Result<(), MigrationError>>,
	{
		match self.execute_transaction(op).await {
			Ok(value) => Ok(value),
			Err(original) => {
				debug!("Transaction failed ({}), rolling back", original);
				if let Err(rollback_error) = rollback().await {
					error!(
						"Rollback failed after \"{}\": {}",
						original, rollback_error
					);
				}
				Err(original)
			}
		}
	}

	/// Run `steps` in order as one transaction.
	///
	/// If step `k` fails, the rollbacks of steps `0..k` run in reverse order and step `k`'s
	/// error is returned. Steps after `k` never run. Each step is subject to the timeout ceiling;
	/// when step `k` times out its own rollback runs first, since its write may still land.
	///
	/// Planned operations of the steps enter the history when the transaction starts and are
	/// discarded again if it rolls back.
	pub async fn execute_bulk_transaction<'a, T>(
		&self,
		steps: Vec<TransactionStep<'a, T>>,
	) -> Result<Vec<T>, MigrationError> {
		self.execute_bulk_transaction_with_timeout(self.timeout, steps)
			.await
	}

	/// Same as `execute_bulk_transaction`, with `timeout` as the per-step ceiling.
	pub async fn execute_bulk_transaction_with_timeout<'a, T>(
		&self,
		timeout: Duration,
		steps: Vec<TransactionStep<'a, T>>,
	) -> Result<Vec<T>, MigrationError> {
		let mut tx = self.begin();
		{
			let mut history = self.history();
			for operation in steps.iter().filter_map(|step| step.operation.clone()) {
				self.push_record(&mut history, tx.id, operation);
			}
		}
		let mut completed: Vec<(String, Box<dyn FnOnce() -> BoxFuture<'a, Result<(), MigrationError>> + Send + 'a>)> =
			Vec::with_capacity(steps.len());
		let mut results = Vec::with_capacity(steps.len());

		for (index, step) in steps.into_iter().enumerate() {
			let TransactionStep {
				name,
				execute,
				rollback,
				..
			} = step;

			let outcome = match tokio::time::timeout(timeout, execute()).await {
				Ok(outcome) => outcome,
				Err(_) => Err(MigrationError::Timeout(timeout)),
			};

			match outcome {
				Ok(value) => {
					results.push(value);
					completed.push((name, rollback));
				}
				Err(e) => {
					warn!(
						"Bulk transaction {} failed at step {} ({}): {}, rolling back {} steps",
						tx.id,
						index,
						name,
						e,
						completed.len()
					);
					if e.is_ambiguous() {
						if let Err(rollback_error) = rollback().await {
							error!("Rollback of timed-out step {} failed: {}", name, rollback_error);
						}
					}
					for (done_name, undo) in completed.into_iter().rev() {
						if let Err(rollback_error) = undo().await {
							error!("Rollback of step {} failed: {}", done_name, rollback_error);
						}
					}
					self.discard(tx.id);
					tx.finish(if e.is_ambiguous() {
						TransactionState::TimedOut
					} else {
						TransactionState::RolledBack
					});
					return Err(e);
				}
			}
		}

		tx.finish(TransactionState::Committed);
		Ok(results)
	}

	/// Number of transactions currently in flight.
	pub fn active_transactions_count(&self) -> usize {
		self.active.load(Ordering::SeqCst)
	}

	/// Rollback registered for a write of the given kind.
	///
	/// Creations are undone by deleting the identifier. Updates and deletions need the previous
	/// value, so they are undone with `RollbackAction::None` unless `previous` is supplied.
	pub fn rollback_for(
		operation: OperationKind,
		kind: EntityKind,
		id: &str,
		previous: Option<RollbackAction>,
	) -> RollbackAction {
		match operation {
			OperationKind::Create => RollbackAction::Delete {
				kind,
				id: id.to_string(),
			},
			OperationKind::Update | OperationKind::Delete => previous.unwrap_or(RollbackAction::None),
		}
	}

	/// Append to the operation history, evicting the oldest record past the limit.
	fn push_record(
		&self,
		history: &mut VecDeque<OperationRecord>,
		transaction_id: u64,
		planned: PlannedOperation,
	) {
		while history.len() >= self.history_limit {
			history.pop_front();
		}
		history.push_back(OperationRecord {
			transaction_id,
			operation: planned.operation,
			entity_kind: planned.entity_kind,
			entity_id: planned.entity_id,
			replica: planned.replica,
			rollback: planned.rollback,
			timestamp: Utc::now(),
		});
	}

	/// Drop the records of a rolled back transaction.
	fn discard(&self, transaction_id: u64) {
		self.history()
			.retain(|record| record.transaction_id != transaction_id);
	}

	/// Recorded operations, oldest first.
	pub fn operation_history(&self) -> Vec<OperationRecord> {
		self.history().iter().cloned().collect()
	}

	/// Apply a rollback action against a replica.
	///
	/// Undoing a creation that never landed is not an error.
	pub async fn apply_rollback(
		repo: &dyn ReplicaRepository,
		action: &RollbackAction,
	) -> Result<(), MigrationError> {
		match action {
			RollbackAction::Delete { kind, id } => {
				let deleted = match kind {
					EntityKind::Collection => repo.delete_collection(id).await,
					EntityKind::Item => repo.delete_item(id).await,
				};
				match deleted {
					Ok(()) => {}
					Err(RepositoryError::NotFound(_)) => {
						debug!("{} {} already absent on {}", kind, id, repo.name())
					}
					Err(e) => return Err(e.into()),
				}
			}
			RollbackAction::RestoreCollection(collection) => {
				if repo.get_collection_by_id(&collection.id).await?.is_some() {
					repo.update_collection(collection).await?
				} else {
					repo.save_collection(collection).await?
				}
			}
			RollbackAction::RestoreItem(item) => {
				if repo.verify_exists(&item.id).await? {
					repo.update_item(item).await?
				} else {
					repo.add_item(item).await?
				}
			}
			RollbackAction::None => {}
		}
		debug!("Applied rollback {:?} on {}", action, repo.name());
		Ok(())
	}

	/// Check whether a write actually landed in the replica.
	pub async fn verify_operation(
		&self,
		repo: &dyn ReplicaRepository,
		entity_id: &str,
	) -> Result<bool, MigrationError> {
		let exists = repo.verify_exists(entity_id).await?;
		debug!(
			"Verified {} on {}: {}",
			entity_id,
			repo.name(),
			if exists { "present" } else { "absent" }
		);
		Ok(exists)
	}
}
