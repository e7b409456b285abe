use chrono::{Duration, Utc};
use replica_sync::{
	Collection, InMemoryRepository, Item, MigrationConfig, MigrationDirection, MigrationError,
	MigrationOrchestrator, ProgressEventKind, ReplicaRepository, ReplicaSnapshot,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	let mut filter =
		tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
	if let Ok(directive) = "replica_sync=info".parse::<tracing_subscriber::filter::Directive>() {
		filter = filter.add_directive(directive);
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Migration service failed: {}", e);
		std::process::exit(1);
	}
}

/// Usage: `replica-sync [local.json cloud.json [direction]]`
///
/// Without snapshot paths a small demo dataset is reconciled in memory. The run configuration is
/// read from the file named by `REPLICA_SYNC_CONFIG`, defaults otherwise.
async fn run() -> Result<(), MigrationError> {
	info!("Starting replica migration service");

	let config = match std::env::var("REPLICA_SYNC_CONFIG") {
		Ok(path) => MigrationConfig::load(Path::new(&path)).await?,
		Err(_) => MigrationConfig::default(),
	};

	let args: Vec<String> = std::env::args().skip(1).collect();
	let paths = match args.as_slice() {
		[local, cloud, ..] => Some((PathBuf::from(local), PathBuf::from(cloud))),
		_ => None,
	};
	let direction = match args.get(2) {
		Some(direction) => direction.parse()?,
		None => MigrationDirection::Bidirectional,
	};

	let (local, cloud) = match &paths {
		Some((local_path, cloud_path)) => (
			Arc::new(InMemoryRepository::load("local", local_path).await?),
			Arc::new(InMemoryRepository::load("cloud", cloud_path).await?),
		),
		None => {
			info!("No snapshots given, using demo replicas");
			demo_replicas()
		}
	};

	let orchestrator = MigrationOrchestrator::new(local.clone(), cloud.clone());

	let mut events = orchestrator.progress().subscribe();
	let listener = tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(event) => match event.kind {
					ProgressEventKind::OperationFailed | ProgressEventKind::Warning => {
						warn!("[{}] {}", event.phase, event.message)
					}
					ProgressEventKind::MigrationCompleted | ProgressEventKind::MigrationFailed => {
						info!("[{}] {}", event.phase, event.message);
						break;
					}
					ProgressEventKind::PhaseStarted if !event.phase.is_terminal() => info!(
						"[{}] {} ({:.1}%)",
						event.phase,
						event.message,
						event.percentage.unwrap_or_default()
					),
					_ => {}
				},
				Err(RecvError::Lagged(skipped)) => warn!("Progress listener skipped {} events", skipped),
				Err(RecvError::Closed) => break,
			}
		}
	});

	let result = orchestrator.run_migration(direction, &config).await;
	if listener.await.is_err() {
		warn!("Progress listener stopped unexpectedly");
	}

	info!("{}", result.summary());
	match serde_json::to_string_pretty(&result) {
		Ok(json) => info!("Migration result:\n{}", json),
		Err(e) => warn!("Could not serialize migration result: {}", e),
	}

	if let Some((local_path, cloud_path)) = &paths {
		local.snapshot().await.save(local_path).await?;
		cloud.snapshot().await.save(cloud_path).await?;
		info!("Saved replicas to {:?} and {:?}", local_path, cloud_path);
	} else {
		for repo in [&local, &cloud] {
			let snapshot = repo.snapshot().await;
			info!(
				"Replica {}: {} collections, {} items",
				repo.name(),
				snapshot.collections.len(),
				snapshot.items.len()
			);
		}
	}

	if let Some(fatal) = result.fatal_error {
		return Err(MigrationError::Fatal(fatal));
	}
	Ok(())
}

/// Two replicas that drifted apart: one-sided entities on each side and one conflicting list.
fn demo_replicas() -> (Arc<InMemoryRepository>, Arc<InMemoryRepository>) {
	let now = Utc::now();
	let yesterday = now - Duration::days(1);

	let local = ReplicaSnapshot {
		collections: vec![
			Collection::new("books", "Books", yesterday),
			Collection::new("groceries", "Groceries", yesterday).with_updated_at(yesterday),
		],
		items: vec![
			Item::new("dune", "books", "Dune", yesterday).completed(now),
			Item::new("milk", "groceries", "Milk", yesterday),
		],
	};
	let cloud = ReplicaSnapshot {
		collections: vec![
			Collection::new("groceries", "Groceries (shared)", yesterday).with_updated_at(now),
			Collection::new("films", "Films", yesterday),
		],
		items: vec![
			Item::new("alien", "films", "Alien", yesterday).with_score(4.5),
			Item::new("milk", "groceries", "Oat milk", yesterday).chosen_at(now),
		],
	};

	(
		Arc::new(InMemoryRepository::from_snapshot("local", local)),
		Arc::new(InMemoryRepository::from_snapshot("cloud", cloud)),
	)
}
