use crate::model::{Collection, Item};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors reported by a replica repository
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
	#[error("Entity already exists: {0}")]
	AlreadyExists(String),

	#[error("Entity not found: {0}")]
	NotFound(String),

	#[error("Storage error: {0}")]
	Io(String),

	#[error("Serialization error: {0}")]
	Serialization(String),
}

impl RepositoryError {
	/// Whether the failure means another entity already holds the identifier.
	pub fn is_collision(&self) -> bool {
		matches!(self, RepositoryError::AlreadyExists(_))
	}
}

/// Port through which the engine reads and writes one replica
#[async_trait::async_trait]
pub trait ReplicaRepository: Send + Sync {
	/// Name used in logs ("local", "cloud", ...).
	fn name(&self) -> &str;

	async fn get_all_collections(&self) -> Result<Vec<Collection>, RepositoryError>;
	async fn get_collection_by_id(&self, id: &str) -> Result<Option<Collection>, RepositoryError>;
	/// Insert a new collection; fails with `AlreadyExists` when the id is taken.
	async fn save_collection(&self, collection: &Collection) -> Result<(), RepositoryError>;
	async fn update_collection(&self, collection: &Collection) -> Result<(), RepositoryError>;
	async fn delete_collection(&self, id: &str) -> Result<(), RepositoryError>;

	async fn get_all_items(&self) -> Result<Vec<Item>, RepositoryError>;
	async fn get_items_by_collection_id(
		&self,
		collection_id: &str,
	) -> Result<Vec<Item>, RepositoryError>;
	/// Insert a new item; fails with `AlreadyExists` when the id is taken.
	async fn add_item(&self, item: &Item) -> Result<(), RepositoryError>;
	async fn update_item(&self, item: &Item) -> Result<(), RepositoryError>;
	async fn delete_item(&self, id: &str) -> Result<(), RepositoryError>;

	/// Whether a collection or item with this id is actually stored.
	async fn verify_exists(&self, id: &str) -> Result<bool, RepositoryError>;
}

/// Serialized form of a whole replica
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
	#[serde(default)]
	pub collections: Vec<Collection>,
	#[serde(default)]
	pub items: Vec<Item>,
}

impl ReplicaSnapshot {
	pub async fn load(path: &Path) -> Result<Self, RepositoryError> {
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			RepositoryError::Io(format!("Failed to read snapshot {:?}: {}", path, e))
		})?;

		serde_json::from_str(&content).map_err(|e| {
			RepositoryError::Serialization(format!("Failed to parse snapshot {:?}: {}", path, e))
		})
	}

	pub async fn save(&self, path: &Path) -> Result<(), RepositoryError> {
		let content = serde_json::to_string_pretty(self).map_err(|e| {
			RepositoryError::Serialization(format!("Failed to serialize snapshot: {}", e))
		})?;

		tokio::fs::write(path, content)
			.await
			.map_err(|e| RepositoryError::Io(format!("Failed to write snapshot {:?}: {}", path, e)))?;

		info!(
			"Snapshot saved: {} collections, {} items written to {:?}",
			self.collections.len(),
			self.items.len(),
			path
		);
		Ok(())
	}
}

#[derive(Default)]
struct ReplicaState {
	collections: HashMap<String, Collection>,
	items: HashMap<String, Item>,
}

/// In-memory implementation of ReplicaRepository
pub struct InMemoryRepository {
	name: String,
	state: RwLock<ReplicaState>,
}

impl InMemoryRepository {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			state: RwLock::new(ReplicaState::default()),
		}
	}

	/// Build a replica from a snapshot. Later duplicates of an id replace earlier ones.
	pub fn from_snapshot(name: impl Into<String>, snapshot: ReplicaSnapshot) -> Self {
		let state = ReplicaState {
			collections: snapshot
				.collections
				.into_iter()
				.map(|c| (c.id.clone(), c))
				.collect(),
			items: snapshot.items.into_iter().map(|i| (i.id.clone(), i)).collect(),
		};

		Self {
			name: name.into(),
			state: RwLock::new(state),
		}
	}

	pub async fn load(name: impl Into<String>, path: &Path) -> Result<Self, RepositoryError> {
		let snapshot = ReplicaSnapshot::load(path).await?;
		let name = name.into();
		info!(
			"Loaded replica {} from {:?}: {} collections, {} items",
			name,
			path,
			snapshot.collections.len(),
			snapshot.items.len()
		);
		Ok(Self::from_snapshot(name, snapshot))
	}

	/// Current contents, sorted by id so that equal replicas produce equal snapshots.
	pub async fn snapshot(&self) -> ReplicaSnapshot {
		let state = self.state.read().await;
		let mut collections: Vec<Collection> = state.collections.values().cloned().collect();
		collections.sort_by(|a, b| a.id.cmp(&b.id));
		let mut items: Vec<Item> = state.items.values().cloned().collect();
		items.sort_by(|a, b| a.id.cmp(&b.id));
		ReplicaSnapshot { collections, items }
	}
}

#[async_trait::async_trait]
impl ReplicaRepository for InMemoryRepository {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get_all_collections(&self) -> Result<Vec<Collection>, RepositoryError> {
		let state = self.state.read().await;
		Ok(state.collections.values().cloned().collect())
	}

	async fn get_collection_by_id(&self, id: &str) -> Result<Option<Collection>, RepositoryError> {
		Ok(self.state.read().await.collections.get(id).cloned())
	}

	async fn save_collection(&self, collection: &Collection) -> Result<(), RepositoryError> {
		let mut state = self.state.write().await;
		if state.collections.contains_key(&collection.id) {
			return Err(RepositoryError::AlreadyExists(collection.id.clone()));
		}
		debug!("[{}] Saving collection {}", self.name, collection.id);
		state
			.collections
			.insert(collection.id.clone(), collection.clone());
		Ok(())
	}

	async fn update_collection(&self, collection: &Collection) -> Result<(), RepositoryError> {
		let mut state = self.state.write().await;
		match state.collections.get_mut(&collection.id) {
			Some(existing) => {
				debug!("[{}] Updating collection {}", self.name, collection.id);
				*existing = collection.clone();
				Ok(())
			}
			None => Err(RepositoryError::NotFound(collection.id.clone())),
		}
	}

	async fn delete_collection(&self, id: &str) -> Result<(), RepositoryError> {
		let mut state = self.state.write().await;
		state
			.collections
			.remove(id)
			.map(|_| debug!("[{}] Deleted collection {}", self.name, id))
			.ok_or_else(|| RepositoryError::NotFound(id.to_string()))
	}

	async fn get_all_items(&self) -> Result<Vec<Item>, RepositoryError> {
		Ok(self.state.read().await.items.values().cloned().collect())
	}

	async fn get_items_by_collection_id(
		&self,
		collection_id: &str,
	) -> Result<Vec<Item>, RepositoryError> {
		let state = self.state.read().await;
		Ok(state
			.items
			.values()
			.filter(|item| item.collection_id == collection_id)
			.cloned()
			.collect())
	}

	async fn add_item(&self, item: &Item) -> Result<(), RepositoryError> {
		let mut state = self.state.write().await;
		if state.items.contains_key(&item.id) {
			return Err(RepositoryError::AlreadyExists(item.id.clone()));
		}
		debug!("[{}] Adding item {}", self.name, item.id);
		state.items.insert(item.id.clone(), item.clone());
		Ok(())
	}

	async fn update_item(&self, item: &Item) -> Result<(), RepositoryError> {
		let mut state = self.state.write().await;
		match state.items.get_mut(&item.id) {
			Some(existing) => {
				debug!("[{}] Updating item {}", self.name, item.id);
				*existing = item.clone();
				Ok(())
			}
			None => Err(RepositoryError::NotFound(item.id.clone())),
		}
	}

	async fn delete_item(&self, id: &str) -> Result<(), RepositoryError> {
		let mut state = self.state.write().await;
		state
			.items
			.remove(id)
			.map(|_| debug!("[{}] Deleted item {}", self.name, id))
			.ok_or_else(|| RepositoryError::NotFound(id.to_string()))
	}

	async fn verify_exists(&self, id: &str) -> Result<bool, RepositoryError> {
		let state = self.state.read().await;
		Ok(state.collections.contains_key(id) || state.items.contains_key(id))
	}
}
