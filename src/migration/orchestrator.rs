//! Migration orchestrator and integration point for all reconciliation services.
//!
//! This module defines the `MigrationOrchestrator`, which coordinates everything involved in
//! bringing the local and cloud replicas in step. A run:
//! - fetches both replicas and deduplicates each snapshot
//! - pairs entities by identifier and plans one task per identifier that needs writing
//! - copies one-sided collections and items, then resolves conflicting ones
//! - executes every task as a bulk transaction, batch by batch, continuing past failures
//! - verifies ambiguous (timed-out) writes and checks that every item still has its collection
//! - optionally deletes the source replica and runs the data cleaner
//!
//! Progress is reported through the shared `ProgressTracker`; the outcome is always returned as a
//! `MigrationResult`, fatal failures included.

use crate::migration::config::{MigrationConfig, MigrationDirection};
use crate::migration::conflict_resolver::{ConflictResolver, Resolution};
use crate::migration::data_cleaner::DataCleaner;
use crate::migration::deduplication::{DeduplicationService, SaveOutcome};
use crate::migration::events::MigrationPhase;
use crate::migration::progress_tracker::ProgressTracker;
use crate::migration::transaction_manager::{
    OperationKind, PlannedOperation, RollbackAction, TransactionManager, TransactionStep,
};
use crate::migration::types::{MigrationError, MigrationResult};
use crate::model::{Collection, Entity, EntityKind, EntityRecord, Item};
use crate::persistence::{ReplicaRepository, RepositoryError};

use futures::future::{join_all, try_join_all};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One of the two replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaSide {
    Local,
    Cloud,
}

impl ReplicaSide {
    fn writable(self, direction: MigrationDirection) -> bool {
        match direction {
            MigrationDirection::Bidirectional => true,
            MigrationDirection::LocalToCloud => self == ReplicaSide::Cloud,
            MigrationDirection::CloudToLocal => self == ReplicaSide::Local,
        }
    }

    fn targets(direction: MigrationDirection) -> Vec<ReplicaSide> {
        [ReplicaSide::Local, ReplicaSide::Cloud]
            .into_iter()
            .filter(|side| side.writable(direction))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum WriteAction {
    Insert,
    /// Overwrite; `previous` is what the replica held before
    Update { previous: EntityRecord },
}

#[derive(Debug, Clone)]
struct PlannedWrite {
    target: ReplicaSide,
    record: EntityRecord,
    action: WriteAction,
}

/// All writes needed for one identifier. Executed atomically.
#[derive(Debug, Clone)]
struct MigrationTask {
    id: String,
    kind: EntityKind,
    /// Owning collection for items, own id for collections
    group: String,
    conflict: bool,
    writes: Vec<PlannedWrite>,
}

#[derive(Debug, Default)]
struct MigrationPlan {
    collection_copies: Vec<MigrationTask>,
    item_copies: Vec<MigrationTask>,
    collection_conflicts: Vec<MigrationTask>,
    item_conflicts: Vec<MigrationTask>,
    /// Conflicts whose resolution already matches every writable side
    settled_conflicts: usize,
}

impl MigrationPlan {
    fn task_count(&self) -> usize {
        self.collection_copies.len()
            + self.item_copies.len()
            + self.collection_conflicts.len()
            + self.item_conflicts.len()
    }

    fn push(&mut self, task: MigrationTask) {
        match (task.kind, task.conflict) {
            (EntityKind::Collection, false) => self.collection_copies.push(task),
            (EntityKind::Item, false) => self.item_copies.push(task),
            (EntityKind::Collection, true) => self.collection_conflicts.push(task),
            (EntityKind::Item, true) => self.item_conflicts.push(task),
        }
    }
}

/// Both replica versions of one identifier
struct ReplicaPair<T> {
    id: String,
    local: Option<T>,
    cloud: Option<T>,
}

#[derive(Debug, Default)]
struct ReplicaData {
    collections: Vec<Collection>,
    items: Vec<Item>,
}

/// Per-run mutable bookkeeping
struct RunState {
    result: MigrationResult,
    /// (side, id) of writes that timed out
    ambiguous: Vec<(ReplicaSide, String)>,
}

/// Top-level coordinator of migration runs between a local and a cloud replica.
///
/// All collaborators are injected; the orchestrator holds no global state. Only one run per
/// orchestrator executes at a time: a second concurrent call returns a fatal result straight
/// away.
pub struct MigrationOrchestrator {
    local: Arc<dyn ReplicaRepository>,
    cloud: Arc<dyn ReplicaRepository>,
    resolver: ConflictResolver,
    dedup: DeduplicationService,
    transactions: Arc<TransactionManager>,
    progress: Arc<ProgressTracker>,
    run_lock: tokio::sync::Mutex<()>,
}

impl MigrationOrchestrator {
    pub fn new(local: Arc<dyn ReplicaRepository>, cloud: Arc<dyn ReplicaRepository>) -> Self {
        Self {
            local,
            cloud,
            resolver: ConflictResolver::new(),
            dedup: DeduplicationService::new(),
            transactions: Arc::new(TransactionManager::default()),
            progress: Arc::new(ProgressTracker::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_transaction_manager(mut self, transactions: Arc<TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn with_progress_tracker(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    pub fn transactions(&self) -> Arc<TransactionManager> {
        self.transactions.clone()
    }

    fn replica(&self, side: ReplicaSide) -> &dyn ReplicaRepository {
        match side {
            ReplicaSide::Local => self.local.as_ref(),
            ReplicaSide::Cloud => self.cloud.as_ref(),
        }
    }

    /// Run one migration. Never fails: errors are reported inside the result.
    pub async fn run_migration(
        &self,
        direction: MigrationDirection,
        config: &MigrationConfig,
    ) -> MigrationResult {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Rejected {} migration: another run is active", direction);
            return MigrationResult::fatal(direction, &MigrationError::AlreadyRunning, Duration::ZERO);
        };

        let started = Instant::now();
        info!(
            "Starting {} migration with {} conflict strategy",
            direction, config.conflict_strategy
        );
        self.progress.start();

        let mut run = RunState {
            result: MigrationResult::new(direction),
            ambiguous: Vec::new(),
        };

        if let Err(e) = self.prepare_and_migrate(direction, config, &mut run).await {
            error!("Migration aborted: {}", e);
            self.progress.fail(e.to_string());
            let mut result = MigrationResult::fatal(direction, &e, started.elapsed());
            result.statistics = run.result.statistics;
            return result;
        }

        self.progress.update_phase(MigrationPhase::Finalizing);
        self.verify_ambiguous_writes(&mut run).await;
        self.check_integrity(direction, &mut run).await;

        self.progress.update_phase(MigrationPhase::Cleanup);
        self.cleanup(direction, config, &mut run).await;

        let mut result = run.result;
        result.duration = started.elapsed();
        result.statistics.insert(
            "successRate".to_string(),
            json!(crate::utils::format_percentage(result.success_rate())),
        );
        result
            .statistics
            .insert("progress".to_string(), json!(self.progress.statistics()));

        let summary = result.summary();
        self.progress.complete(summary.clone());
        info!("{}", summary);
        result
    }

    /// Everything up to and including the conflict phase. Errors returned here are fatal.
    async fn prepare_and_migrate(
        &self,
        direction: MigrationDirection,
        config: &MigrationConfig,
        run: &mut RunState,
    ) -> Result<(), MigrationError> {
        self.progress.update_phase(MigrationPhase::Validating);
        config.validate()?;

        self.progress.update_phase(MigrationPhase::PreparingData);
        let (local, cloud) = self.fetch_replicas().await?;
        let stats = &mut run.result.statistics;
        stats.insert("direction".to_string(), json!(direction));
        stats.insert("strategy".to_string(), json!(config.conflict_strategy));
        stats.insert("localCollections".to_string(), json!(local.collections.len()));
        stats.insert("cloudCollections".to_string(), json!(cloud.collections.len()));
        stats.insert("localItems".to_string(), json!(local.items.len()));
        stats.insert("cloudItems".to_string(), json!(cloud.items.len()));

        let plan = self.plan(direction, config, local, cloud, run);
        info!(
            "Planned {} tasks: {} collection copies, {} item copies, {} collection conflicts, {} item conflicts",
            plan.task_count(),
            plan.collection_copies.len(),
            plan.item_copies.len(),
            plan.collection_conflicts.len(),
            plan.item_conflicts.len()
        );
        self.progress.set_total(plan.task_count());
        run.result.conflicts_resolved += plan.settled_conflicts;
        run.result
            .statistics
            .insert("plannedTasks".to_string(), json!(plan.task_count()));

        self.progress.update_phase(MigrationPhase::MigratingCollections);
        self.run_tasks(&plan.collection_copies, config, run).await;

        self.progress.update_phase(MigrationPhase::MigratingItems);
        self.run_tasks(&plan.item_copies, config, run).await;

        self.progress.update_phase(MigrationPhase::ResolvingConflicts);
        self.run_tasks(&plan.collection_conflicts, config, run).await;
        self.run_tasks(&plan.item_conflicts, config, run).await;

        Ok(())
    }

    async fn fetch_replicas(&self) -> Result<(ReplicaData, ReplicaData), MigrationError> {
        let fetch_collections = |side: ReplicaSide| async move {
            let repo = self.replica(side);
            repo.get_all_collections().await.map_err(|e| {
                MigrationError::Fatal(format!(
                    "Failed to fetch collections from {}: {}",
                    repo.name(),
                    e
                ))
            })
        };
        let (local_collections, cloud_collections) = futures::try_join!(
            fetch_collections(ReplicaSide::Local),
            fetch_collections(ReplicaSide::Cloud)
        )?;

        let collection_ids: BTreeSet<String> = local_collections
            .iter()
            .chain(cloud_collections.iter())
            .map(|c| c.id.clone())
            .collect();

        let (local_items, cloud_items) = futures::try_join!(
            self.fetch_items(ReplicaSide::Local, &collection_ids),
            self.fetch_items(ReplicaSide::Cloud, &collection_ids)
        )?;

        Ok((
            ReplicaData {
                collections: local_collections,
                items: local_items,
            },
            ReplicaData {
                collections: cloud_collections,
                items: cloud_items,
            },
        ))
    }

    /// Items of every known collection, fetched collection by collection.
    async fn fetch_items(
        &self,
        side: ReplicaSide,
        collection_ids: &BTreeSet<String>,
    ) -> Result<Vec<Item>, MigrationError> {
        let repo = self.replica(side);
        let partitions = try_join_all(collection_ids.iter().map(|id| async move {
            repo.get_items_by_collection_id(id).await.map_err(|e| {
                MigrationError::Fatal(format!(
                    "Failed to fetch items of collection {} from {}: {}",
                    id,
                    repo.name(),
                    e
                ))
            })
        }))
        .await?;
        Ok(partitions.into_iter().flatten().collect())
    }

    fn plan(
        &self,
        direction: MigrationDirection,
        config: &MigrationConfig,
        local: ReplicaData,
        cloud: ReplicaData,
        run: &mut RunState,
    ) -> MigrationPlan {
        let mut plan = MigrationPlan::default();
        let strategy = config.conflict_strategy;

        let local_collections = self.deduplicated(ReplicaSide::Local, local.collections, run);
        let cloud_collections = self.deduplicated(ReplicaSide::Cloud, cloud.collections, run);
        for pair in self.pair_up(local_collections, cloud_collections) {
            let task = plan_pair(pair, direction, |l: &Collection, c: &Collection| {
                self.resolver.resolve_collection(l, c, strategy)
            });
            match task {
                Some(task) if task.writes.is_empty() => plan.settled_conflicts += 1,
                Some(task) => plan.push(task),
                None => {}
            }
        }

        let local_items = self.deduplicated(ReplicaSide::Local, local.items, run);
        let cloud_items = self.deduplicated(ReplicaSide::Cloud, cloud.items, run);
        for pair in self.pair_up(local_items, cloud_items) {
            let task = plan_pair(pair, direction, |l: &Item, c: &Item| {
                self.resolver.resolve_item(l, c, strategy)
            });
            match task {
                Some(task) if task.writes.is_empty() => plan.settled_conflicts += 1,
                Some(task) => plan.push(task),
                None => {}
            }
        }

        // Items are written collection by collection.
        plan.item_copies
            .sort_by(|a, b| a.group.cmp(&b.group).then_with(|| a.id.cmp(&b.id)));
        plan.item_conflicts
            .sort_by(|a, b| a.group.cmp(&b.group).then_with(|| a.id.cmp(&b.id)));
        plan
    }

    fn deduplicated<T: Entity>(&self, side: ReplicaSide, entities: Vec<T>, run: &mut RunState) -> Vec<T> {
        let Some(first) = entities.first() else {
            return entities;
        };
        let stats = self.dedup.statistics(&entities);
        if stats.duplicates > 0 {
            warn!(
                "{} {} snapshot holds {} duplicate identifiers ({}%)",
                self.replica(side).name(),
                first.kind(),
                stats.duplicates,
                stats.duplicate_rate
            );
            run.result.statistics.insert(
                format!("duplicates.{:?}.{}", side, first.kind()).to_lowercase(),
                json!(stats),
            );
        }
        self.dedup.deduplicate(&entities)
    }

    /// Pair the two sides by identifier, sorted by identifier.
    fn pair_up<T: Entity>(&self, local: Vec<T>, cloud: Vec<T>) -> Vec<ReplicaPair<T>> {
        let local = local.into_iter().map(|e| ReplicaPair {
            id: e.id().to_string(),
            local: Some(e),
            cloud: None,
        });
        let cloud = cloud.into_iter().map(|e| ReplicaPair {
            id: e.id().to_string(),
            local: None,
            cloud: Some(e),
        });

        let mut pairs = self.dedup.merge_and_deduplicate(
            local.collect(),
            cloud.collect(),
            |pair| pair.id.clone(),
            |existing, incoming| ReplicaPair {
                id: existing.id,
                local: existing.local.or(incoming.local),
                cloud: existing.cloud.or(incoming.cloud),
            },
        );
        pairs.sort_by(|a, b| a.id.cmp(&b.id));
        pairs
    }

    async fn run_tasks(&self, tasks: &[MigrationTask], config: &MigrationConfig, run: &mut RunState) {
        let timeout = config.transaction_timeout();

        for (index, batch) in tasks.chunks(config.batch_size).enumerate() {
            debug!("Writing batch {} ({} tasks)", index + 1, batch.len());
            let outcomes = join_all(batch.iter().map(|task| self.execute_task(task, timeout))).await;

            for (task, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {
                        match task.kind {
                            EntityKind::Collection => run.result.migrated_collections += 1,
                            EntityKind::Item => run.result.migrated_items += 1,
                        }
                        if task.conflict {
                            run.result.conflicts_resolved += 1;
                            self.progress.record_conflict(
                                &task.id,
                                format!(
                                    "Resolved {} {} with {}",
                                    task.kind, task.id, config.conflict_strategy
                                ),
                            );
                        }
                        self.progress.record_success(
                            &task.id,
                            format!("Migrated {} {}", task.kind, task.id),
                        );
                    }
                    Err(e) => {
                        if e.is_ambiguous() {
                            run.ambiguous.extend(
                                task.writes
                                    .iter()
                                    .map(|w| (w.target, w.record.id().to_string())),
                            );
                        }
                        warn!("Failed to migrate {} {}: {}", task.kind, task.id, e);
                        run.result
                            .record_error(format!("{} {}: {}", task.kind, task.id, e));
                        self.progress.record_failure(&task.id, e.to_string());
                    }
                }
            }
        }
    }

    /// Run all writes of a task as one bulk transaction.
    ///
    /// Each step starts out with the rollback its planned write needs, so a write that times out
    /// midway is still undone. A completed write replaces it with the rollback it actually needs.
    async fn execute_task(&self, task: &MigrationTask, timeout: Duration) -> Result<(), MigrationError> {
        for write in &task.writes {
            write.record.validate().map_err(MigrationError::Validation)?;
        }

        let steps: Vec<_> = task
            .writes
            .iter()
            .map(|write| {
                let (operation, planned) = planned_rollback(write);
                let undo = Arc::new(Mutex::new(planned.clone()));
                let recorded = undo.clone();
                let target = write.target;
                let record = PlannedOperation {
                    operation,
                    entity_kind: write.record.kind(),
                    entity_id: write.record.id().to_string(),
                    replica: self.replica(target).name().to_string(),
                    rollback: planned,
                };
                TransactionStep::new(
                    format!("{:?} {} {}", target, write.record.kind(), write.record.id()),
                    move || async move {
                        let action = self.apply_write(write).await?;
                        *recorded.lock().unwrap_or_else(|p| p.into_inner()) = action;
                        Ok::<(), MigrationError>(())
                    },
                    move || async move {
                        let action = undo.lock().unwrap_or_else(|p| p.into_inner()).clone();
                        TransactionManager::apply_rollback(self.replica(target), &action).await
                    },
                )
                .with_operation(record)
            })
            .collect();

        self.transactions
            .execute_bulk_transaction_with_timeout(timeout, steps)
            .await
            .map(|_| ())
    }

    /// Perform one write and return how to undo it.
    async fn apply_write(&self, write: &PlannedWrite) -> Result<RollbackAction, MigrationError> {
        let repo = self.replica(write.target);

        let rollback = match (&write.record, &write.action) {
            (EntityRecord::Collection(collection), WriteAction::Insert) => {
                let outcome = self
                    .dedup
                    .save_with_deduplication(
                        collection.clone(),
                        move |c| async move { repo.save_collection(&c).await },
                        move |id| async move { repo.get_collection_by_id(&id).await },
                        move |c| async move { repo.update_collection(&c).await },
                    )
                    .await?;
                insert_outcome(outcome, EntityKind::Collection, &collection.id)
            }
            (EntityRecord::Item(item), WriteAction::Insert) => {
                let collection_id = item.collection_id.clone();
                let outcome = self
                    .dedup
                    .save_with_deduplication(
                        item.clone(),
                        move |i| async move { repo.add_item(&i).await },
                        move |id| async move {
                            let siblings = repo.get_items_by_collection_id(&collection_id).await?;
                            Ok::<_, RepositoryError>(siblings.into_iter().find(|i| i.id == id))
                        },
                        move |i| async move { repo.update_item(&i).await },
                    )
                    .await?;
                insert_outcome(outcome, EntityKind::Item, &item.id)
            }
            (EntityRecord::Collection(collection), WriteAction::Update { previous }) => {
                repo.update_collection(collection).await?;
                restore(previous)
            }
            (EntityRecord::Item(item), WriteAction::Update { previous }) => {
                repo.update_item(item).await?;
                restore(previous)
            }
        };

        Ok(rollback)
    }

    /// Settle timed-out writes by asking the replica whether they landed.
    async fn verify_ambiguous_writes(&self, run: &mut RunState) {
        if run.ambiguous.is_empty() {
            return;
        }

        let mut applied = Vec::new();
        let mut missing = Vec::new();
        for (side, id) in std::mem::take(&mut run.ambiguous) {
            match self.transactions.verify_operation(self.replica(side), &id).await {
                Ok(true) => applied.push(id),
                Ok(false) => missing.push(id),
                Err(e) => {
                    warn!("Could not verify {} on {:?}: {}", id, side, e);
                    missing.push(id);
                }
            }
        }

        for id in &applied {
            self.progress.warn(
                format!("Timed-out write of {} was applied after all", id),
                Some(id.as_str()),
            );
        }
        run.result
            .statistics
            .insert("timedOutWritesApplied".to_string(), json!(applied));
        run.result
            .statistics
            .insert("timedOutWritesMissing".to_string(), json!(missing));
    }

    /// Every item must point at a collection of the same replica. Reported, never repaired.
    async fn check_integrity(&self, direction: MigrationDirection, run: &mut RunState) {
        for side in ReplicaSide::targets(direction) {
            let repo = self.replica(side);
            let snapshot = futures::try_join!(repo.get_all_collections(), repo.get_all_items());
            let (collections, items) = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    run.result.record_error(format!(
                        "Integrity check of {} failed: {}",
                        repo.name(),
                        e
                    ));
                    continue;
                }
            };

            let known: HashSet<&str> = collections.iter().map(|c| c.id.as_str()).collect();
            for item in items
                .iter()
                .filter(|item| !known.contains(item.collection_id.as_str()))
            {
                let message = format!(
                    "Item {} on {} references missing collection {}",
                    item.id,
                    repo.name(),
                    item.collection_id
                );
                warn!("{}", message);
                self.progress.warn(message.clone(), Some(item.id.as_str()));
                run.result.inconsistencies.push(message);
            }
        }

        run.result.statistics.insert(
            "inconsistencies".to_string(),
            json!(run.result.inconsistencies.len()),
        );
    }

    async fn cleanup(&self, direction: MigrationDirection, config: &MigrationConfig, run: &mut RunState) {
        let clean_run = run.result.errors == 0 && run.result.inconsistencies.is_empty();

        if config.delete_source_after_success {
            let source = match direction {
                MigrationDirection::LocalToCloud => Some(ReplicaSide::Local),
                MigrationDirection::CloudToLocal => Some(ReplicaSide::Cloud),
                MigrationDirection::Bidirectional => None,
            };
            match source {
                Some(source) if clean_run => {
                    self.delete_source(source, config.transaction_timeout(), run).await
                }
                Some(_) => info!("Keeping source replica: the run was not clean"),
                None => debug!("Bidirectional runs have no source replica to delete"),
            }
        }

        if config.run_cleanup && clean_run {
            let cleaner = DataCleaner::new(config.cleanup.clone());
            for side in ReplicaSide::targets(direction) {
                match cleaner.clean(self.replica(side)).await {
                    Ok(report) => {
                        for error in &report.errors {
                            self.progress.warn(format!("Cleanup: {}", error), None);
                        }
                        run.result.statistics.insert(
                            format!("cleanup.{:?}", side).to_lowercase(),
                            json!(report),
                        );
                    }
                    Err(e) => self
                        .progress
                        .warn(format!("Cleanup of {:?} failed: {}", side, e), None),
                }
            }
        }
    }

    /// Delete everything from the source replica as one bulk transaction.
    async fn delete_source(&self, source: ReplicaSide, timeout: Duration, run: &mut RunState) {
        let repo = self.replica(source);
        let snapshot = futures::try_join!(repo.get_all_collections(), repo.get_all_items());
        let (collections, items) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                run.result
                    .record_error(format!("Could not read {} for deletion: {}", repo.name(), e));
                return;
            }
        };

        let deletion = |kind: EntityKind, id: &str, rollback: RollbackAction| PlannedOperation {
            operation: OperationKind::Delete,
            entity_kind: kind,
            entity_id: id.to_string(),
            replica: repo.name().to_string(),
            rollback,
        };
        let item_steps = items.into_iter().map(|item| {
            let id = item.id.clone();
            let record = deletion(EntityKind::Item, &id, RollbackAction::RestoreItem(item.clone()));
            TransactionStep::new(
                format!("delete item {}", id),
                move || async move { repo.delete_item(&id).await.map_err(MigrationError::from) },
                move || async move {
                    TransactionManager::apply_rollback(repo, &RollbackAction::RestoreItem(item)).await
                },
            )
            .with_operation(record)
        });
        let collection_steps = collections.into_iter().map(|collection| {
            let id = collection.id.clone();
            let record = deletion(
                EntityKind::Collection,
                &id,
                RollbackAction::RestoreCollection(collection.clone()),
            );
            TransactionStep::new(
                format!("delete collection {}", id),
                move || async move {
                    repo.delete_collection(&id)
                        .await
                        .map_err(MigrationError::from)
                },
                move || async move {
                    TransactionManager::apply_rollback(
                        repo,
                        &RollbackAction::RestoreCollection(collection),
                    )
                    .await
                },
            )
            .with_operation(record)
        });
        let steps: Vec<_> = item_steps.chain(collection_steps).collect();
        let count = steps.len();

        match self
            .transactions
            .execute_bulk_transaction_with_timeout(timeout, steps)
            .await
        {
            Ok(_) => {
                info!("Deleted {} entities from source replica {}", count, repo.name());
                run.result
                    .statistics
                    .insert("sourceEntitiesDeleted".to_string(), json!(count));
            }
            Err(e) => run.result.record_error(format!(
                "Deleting source replica {} failed and was rolled back: {}",
                repo.name(),
                e
            )),
        }
    }
}

fn insert_outcome<T>(outcome: SaveOutcome<T>, kind: EntityKind, id: &str) -> RollbackAction {
    match outcome {
        SaveOutcome::Inserted(_) => TransactionManager::rollback_for(OperationKind::Create, kind, id, None),
        // Someone else created it meanwhile; there is no earlier value of ours to restore.
        SaveOutcome::Updated(_) => RollbackAction::None,
    }
}

/// The operation a write performs and how to undo it, known before it runs.
fn planned_rollback(write: &PlannedWrite) -> (OperationKind, RollbackAction) {
    match &write.action {
        WriteAction::Insert => (
            OperationKind::Create,
            TransactionManager::rollback_for(
                OperationKind::Create,
                write.record.kind(),
                write.record.id(),
                None,
            ),
        ),
        WriteAction::Update { previous } => (OperationKind::Update, restore(previous)),
    }
}

fn restore(previous: &EntityRecord) -> RollbackAction {
    match previous {
        EntityRecord::Collection(c) => RollbackAction::RestoreCollection(c.clone()),
        EntityRecord::Item(i) => RollbackAction::RestoreItem(i.clone()),
    }
}

fn group_of(record: &EntityRecord) -> String {
    match record {
        EntityRecord::Collection(c) => c.id.clone(),
        EntityRecord::Item(i) => i.collection_id.clone(),
    }
}

/// Decide what has to be written for one identifier.
///
/// `None` when nothing needs doing. A conflict whose resolution already matches every writable
/// side comes back as a task without writes.
fn plan_pair<T, R>(pair: ReplicaPair<T>, direction: MigrationDirection, resolve: R) -> Option<MigrationTask>
where
    T: Entity + PartialEq + Into<EntityRecord>,
    R: Fn(&T, &T) -> Resolution<T>,
{
    let kind = pair.local.as_ref().or(pair.cloud.as_ref()).map(|e| e.kind())?;
    let insert = |target: ReplicaSide, entity: T| PlannedWrite {
        target,
        record: entity.into(),
        action: WriteAction::Insert,
    };

    let (conflict, writes) = match (pair.local, pair.cloud) {
        (Some(local), None) if ReplicaSide::Cloud.writable(direction) => {
            (false, vec![insert(ReplicaSide::Cloud, local)])
        }
        (None, Some(cloud)) if ReplicaSide::Local.writable(direction) => {
            (false, vec![insert(ReplicaSide::Local, cloud)])
        }
        (Some(local), Some(cloud)) if local != cloud => {
            let resolution = resolve(&local, &cloud);
            let primary = resolution.primary();
            let mut writes = Vec::new();

            for (side, current) in [(ReplicaSide::Local, &local), (ReplicaSide::Cloud, &cloud)] {
                if side.writable(direction) && primary != current {
                    writes.push(PlannedWrite {
                        target: side,
                        record: primary.clone().into(),
                        action: WriteAction::Update {
                            previous: current.clone().into(),
                        },
                    });
                }
            }
            if let Resolution::Duplicated { copy, .. } = &resolution {
                for side in ReplicaSide::targets(direction) {
                    writes.push(insert(side, copy.clone()));
                }
            }
            (true, writes)
        }
        _ => return None,
    };

    Some(MigrationTask {
        group: writes
            .first()
            .map(|w| group_of(&w.record))
            .unwrap_or_else(|| pair.id.clone()),
        id: pair.id,
        kind,
        conflict,
        writes,
    })
}
