use chrono::{DateTime, TimeZone, Utc};
use replica_sync::{
	Collection, ConflictResolver, ConflictStrategy, InMemoryRepository, Item, ManualResolver,
	MigrationConfig, MigrationDirection, MigrationOrchestrator, MigrationPhase, ProgressEventKind,
	ReplicaRepository, ReplicaSnapshot,
};
use std::sync::Arc;

fn at(secs: i64) -> DateTime<Utc> {
	Utc.timestamp_opt(secs, 0).single().unwrap()
}

fn replica(name: &str, collections: Vec<Collection>, items: Vec<Item>) -> Arc<InMemoryRepository> {
	Arc::new(InMemoryRepository::from_snapshot(
		name,
		ReplicaSnapshot { collections, items },
	))
}

#[tokio::test]
async fn bidirectional_run_converges_diverged_replicas() {
	let local = replica(
		"local",
		vec![
			Collection::new("books", "Books", at(0)),
			Collection::new("todo", "Todo", at(0)).with_updated_at(at(50)),
		],
		vec![
			Item::new("dune", "books", "Dune", at(1)).completed(at(40)),
			Item::new("milk", "todo", "Milk", at(2)).chosen_at(at(30)),
		],
	);
	let cloud = replica(
		"cloud",
		vec![
			Collection::new("todo", "Shared todo", at(0)).with_updated_at(at(10)),
			Collection::new("films", "Films", at(0)),
		],
		vec![
			Item::new("milk", "todo", "Oat milk", at(2)).chosen_at(at(60)),
			Item::new("alien", "films", "Alien", at(3)),
		],
	);

	let orchestrator = MigrationOrchestrator::new(local.clone(), cloud.clone());
	let result = orchestrator
		.run_migration(MigrationDirection::Bidirectional, &MigrationConfig::default())
		.await;

	assert!(result.is_success(), "{:?}", result.error_messages);
	assert_eq!(result.conflicts_resolved, 2);

	let snapshot = local.snapshot().await;
	assert_eq!(snapshot, cloud.snapshot().await);
	assert_eq!(snapshot.collections.len(), 3);
	assert_eq!(snapshot.items.len(), 3);

	// Local list is newer, cloud item is newer.
	let todo = local.get_collection_by_id("todo").await.unwrap().unwrap();
	assert_eq!(todo.name, "Todo");
	let milk = cloud.get_items_by_collection_id("todo").await.unwrap();
	assert_eq!(milk[0].title, "Oat milk");
}

#[tokio::test]
async fn progress_events_follow_the_run() {
	let local = replica(
		"local",
		vec![Collection::new("books", "Books", at(0))],
		vec![Item::new("dune", "books", "Dune", at(1))],
	);
	let cloud = replica("cloud", vec![], vec![]);
	let orchestrator = MigrationOrchestrator::new(local, cloud);
	let mut events = orchestrator.progress().subscribe();

	let result = orchestrator
		.run_migration(MigrationDirection::LocalToCloud, &MigrationConfig::default())
		.await;
	assert!(result.is_success());

	let mut phases = Vec::new();
	let mut last = None;
	while let Ok(event) = events.try_recv() {
		if event.kind == ProgressEventKind::PhaseStarted {
			phases.push(event.phase);
		}
		last = Some(event);
	}

	assert_eq!(
		phases,
		vec![
			MigrationPhase::Initializing,
			MigrationPhase::Validating,
			MigrationPhase::PreparingData,
			MigrationPhase::MigratingCollections,
			MigrationPhase::MigratingItems,
			MigrationPhase::ResolvingConflicts,
			MigrationPhase::Finalizing,
			MigrationPhase::Cleanup,
			MigrationPhase::Completed,
		]
	);
	let last = last.unwrap();
	assert_eq!(last.kind, ProgressEventKind::MigrationCompleted);
	assert_eq!(last.percentage, Some(100.0));

	let stats = orchestrator.progress().statistics();
	assert_eq!(stats.total, 2);
	assert_eq!(stats.successful, 2);
}

struct PreferCloudTitles;

impl ManualResolver for PreferCloudTitles {
	fn resolve_collection(&self, _local: &Collection, _remote: &Collection) -> Option<Collection> {
		None
	}

	fn resolve_item(&self, local: &Item, remote: &Item) -> Option<Item> {
		Some(local.with_title(remote.title.clone()))
	}
}

#[tokio::test]
async fn manual_resolver_decides_ask_user_conflicts() {
	let local = replica(
		"local",
		vec![Collection::new("books", "Books", at(0))],
		vec![Item::new("dune", "books", "Dune", at(1)).with_score(5.0)],
	);
	let cloud = replica(
		"cloud",
		vec![Collection::new("books", "Books", at(0))],
		vec![Item::new("dune", "books", "Dune Messiah", at(1))],
	);

	let orchestrator = MigrationOrchestrator::new(local.clone(), cloud.clone())
		.with_resolver(ConflictResolver::new().with_manual_resolver(Arc::new(PreferCloudTitles)));
	let config = MigrationConfig {
		conflict_strategy: ConflictStrategy::AskUser,
		..MigrationConfig::default()
	};

	let result = orchestrator
		.run_migration(MigrationDirection::Bidirectional, &config)
		.await;

	assert!(result.is_success());
	for repo in [&local, &cloud] {
		let items = repo.get_items_by_collection_id("books").await.unwrap();
		assert_eq!(items[0].title, "Dune Messiah");
		assert_eq!(items[0].score, 5.0);
	}
}

#[tokio::test]
async fn cleanup_runs_after_a_clean_migration() {
	let now = Utc::now();
	let local = replica(
		"local",
		vec![
			Collection::new("a", "Groceries", now),
			Collection::new("b", "groceries", now).with_updated_at(now + chrono::Duration::seconds(1)),
		],
		vec![],
	);
	let cloud = replica("cloud", vec![], vec![]);
	let orchestrator = MigrationOrchestrator::new(local, cloud.clone());
	let config = MigrationConfig {
		run_cleanup: true,
		..MigrationConfig::default()
	};

	let result = orchestrator
		.run_migration(MigrationDirection::LocalToCloud, &config)
		.await;

	assert!(result.is_success());
	assert!(result.statistics.contains_key("cleanup.cloud"));
	let remaining = cloud.snapshot().await.collections;
	assert_eq!(remaining.len(), 1);
	assert_eq!(remaining[0].id, "b");
}
