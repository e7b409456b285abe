//! Types for the collections/items dataset held by each replica

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest collection name or item title accepted by `Entity::validate`.
pub const MAX_NAME_LENGTH: usize = 200;

/// Kind of entity stored in a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Collection,
    Item,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Collection => write!(f, "collection"),
            EntityKind::Item => write!(f, "item"),
        }
    }
}

/// A named collection of items.
///
/// `item_ids` is a denormalized view of the items pointing at this collection; the item's
/// `collection_id` is the authoritative link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    /// Identifier, unique within a replica.
    pub id: String,
    pub name: String,
    /// Free-form description, empty when unset.
    #[serde(default)]
    pub description: String,
    /// Type tag (for example "todo", "shopping").
    #[serde(default)]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub item_ids: Vec<String>,
}

impl Collection {
    /// Create a collection whose creation and update timestamps are both `created_at`.
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind: String::new(),
            created_at,
            updated_at: created_at,
            item_ids: Vec::new(),
        }
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn with_description(&self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self.clone()
        }
    }

    pub fn with_kind(&self, kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..self.clone()
        }
    }

    pub fn with_updated_at(&self, updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            ..self.clone()
        }
    }

    pub fn with_item_ids(&self, item_ids: Vec<String>) -> Self {
        Self {
            item_ids,
            ..self.clone()
        }
    }
}

/// A single entry of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    /// Identifier of the owning collection.
    pub collection_id: String,
    pub title: String,
    #[serde(default)]
    pub is_completed: bool,
    /// Ranking score maintained by the comparison algorithm.
    #[serde(default)]
    pub score: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time the item was picked in a comparison.
    #[serde(default)]
    pub last_chosen_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(
        id: impl Into<String>,
        collection_id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            collection_id: collection_id.into(),
            title: title.into(),
            is_completed: false,
            score: 0.0,
            created_at,
            completed_at: None,
            last_chosen_at: None,
        }
    }

    /// Timestamp representing how recent this item is.
    ///
    /// Completion time first, then the last comparison time, then creation time.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.last_chosen_at)
            .unwrap_or(self.created_at)
    }

    pub fn with_title(&self, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..self.clone()
        }
    }

    pub fn with_score(&self, score: f64) -> Self {
        Self {
            score,
            ..self.clone()
        }
    }

    /// Mark the item completed at the given instant.
    pub fn completed(&self, at: DateTime<Utc>) -> Self {
        Self {
            is_completed: true,
            completed_at: Some(at),
            ..self.clone()
        }
    }

    pub fn chosen_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_chosen_at: Some(at),
            ..self.clone()
        }
    }

    pub fn with_collection_id(&self, collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ..self.clone()
        }
    }
}

/// Behaviour shared by collections and items, used by the generic dedup and transaction code.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Timestamp used to decide which of two versions is more recent.
    fn recency(&self) -> DateTime<Utc>;

    fn kind(&self) -> EntityKind;

    /// Same value under another identifier.
    fn with_id(&self, id: String) -> Self;

    /// Structural checks applied before anything is written.
    fn validate(&self) -> Result<(), String>;
}

impl Entity for Collection {
    fn id(&self) -> &str {
        &self.id
    }

    fn recency(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Collection
    }

    fn with_id(&self, id: String) -> Self {
        Self { id, ..self.clone() }
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("collection has an empty identifier".to_string());
        }
        if self.name.trim().is_empty() {
            return Err(format!("collection {} has an empty name", self.id));
        }
        if self.name.chars().count() > MAX_NAME_LENGTH {
            return Err(format!(
                "collection {} name exceeds {} characters",
                self.id, MAX_NAME_LENGTH
            ));
        }
        if self.updated_at < self.created_at {
            return Err(format!(
                "collection {} was updated before it was created",
                self.id
            ));
        }
        Ok(())
    }
}

impl Entity for Item {
    fn id(&self) -> &str {
        &self.id
    }

    fn recency(&self) -> DateTime<Utc> {
        self.effective_timestamp()
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Item
    }

    fn with_id(&self, id: String) -> Self {
        Self { id, ..self.clone() }
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("item has an empty identifier".to_string());
        }
        if self.collection_id.trim().is_empty() {
            return Err(format!("item {} has no owning collection", self.id));
        }
        if self.title.trim().is_empty() {
            return Err(format!("item {} has an empty title", self.id));
        }
        if self.title.chars().count() > MAX_NAME_LENGTH {
            return Err(format!(
                "item {} title exceeds {} characters",
                self.id, MAX_NAME_LENGTH
            ));
        }
        if !self.score.is_finite() {
            return Err(format!("item {} has a non-finite score", self.id));
        }
        Ok(())
    }
}

/// A collection or an item, used where both kinds travel through the same pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "camelCase")]
pub enum EntityRecord {
    Collection(Collection),
    Item(Item),
}

impl EntityRecord {
    pub fn id(&self) -> &str {
        match self {
            EntityRecord::Collection(c) => &c.id,
            EntityRecord::Item(i) => &i.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Collection(_) => EntityKind::Collection,
            EntityRecord::Item(_) => EntityKind::Item,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            EntityRecord::Collection(c) => c.validate(),
            EntityRecord::Item(i) => i.validate(),
        }
    }
}

impl From<Collection> for EntityRecord {
    fn from(collection: Collection) -> Self {
        EntityRecord::Collection(collection)
    }
}

impl From<Item> for EntityRecord {
    fn from(item: Item) -> Self {
        EntityRecord::Item(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn moving_an_item_keeps_its_other_fields() {
        let item = Item::new("i1", "c1", "Milk", at(10)).with_score(2.0);
        let moved = item.with_collection_id("c2");

        assert_eq!(moved.collection_id, "c2");
        assert_eq!(moved.score, 2.0);
        assert_eq!(moved.with_collection_id("c1"), item);
    }

    #[test]
    fn effective_timestamp_prefers_completion_then_choice() {
        let item = Item::new("i1", "c1", "Milk", at(10));
        assert_eq!(item.effective_timestamp(), at(10));

        let chosen = item.chosen_at(at(20));
        assert_eq!(chosen.effective_timestamp(), at(20));

        let done = chosen.completed(at(15));
        assert_eq!(done.effective_timestamp(), at(15));
    }

    #[test]
    fn builders_leave_original_untouched() {
        let original = Collection::new("c1", "Groceries", at(0));
        let renamed = original.with_name("Food");
        assert_eq!(original.name, "Groceries");
        assert_eq!(renamed.name, "Food");
        assert_eq!(renamed.id, "c1");
    }

    #[test]
    fn validate_rejects_structurally_invalid_entities() {
        assert!(Collection::new("", "x", at(0)).validate().is_err());
        assert!(Collection::new("c1", "  ", at(0)).validate().is_err());
        assert!(
            Collection::new("c1", "x".repeat(MAX_NAME_LENGTH + 1), at(0))
                .validate()
                .is_err()
        );
        assert!(Item::new("i1", "c1", "", at(0)).validate().is_err());
        assert!(Item::new("i1", "c1", "ok", at(0)).validate().is_ok());
    }

    #[test]
    fn collection_serializes_camel_case() {
        let json = serde_json::to_value(Collection::new("c1", "Books", at(0))).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("itemIds").is_some());
    }
}
