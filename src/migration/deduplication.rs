//! Deduplication of colliding identifiers.
//!
//! The same rule is used everywhere an identifier shows up more than once: the most recent
//! version wins, and on an exact tie the version seen later wins. For single saves "later" is the
//! entity being saved, for sequences it is the later position in the input.

use crate::migration::types::MigrationError;
use crate::model::Entity;
use crate::persistence::RepositoryError;
use crate::utils::{format_percentage, percentage};

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::hash::Hash;
use tracing::{debug, warn};

/// How a deduplicated save ended
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome<T> {
    /// The entity was new and was inserted as is
    Inserted(T),
    /// The identifier existed; the winning version was written with an update
    Updated(T),
}

/// Duplicate statistics for a batch of entities
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateStats {
    pub total: usize,
    pub unique: usize,
    pub duplicates: usize,
    /// Percentage of duplicates with one decimal place
    pub duplicate_rate: String,
    pub duplicated_ids: BTreeSet<String>,
}

/// Stateless service; constructed and passed explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeduplicationService;

impl DeduplicationService {
    pub fn new() -> Self {
        Self
    }

    /// Pick between an earlier and a later version of the same identifier.
    pub fn pick<T: Entity>(earlier: T, later: T) -> T {
        if earlier.recency() > later.recency() {
            earlier
        } else {
            later
        }
    }

    /// One entity per distinct identifier, in first-appearance order.
    pub fn deduplicate<T: Entity>(&self, entities: &[T]) -> Vec<T> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut unique: Vec<T> = Vec::with_capacity(entities.len());

        for entity in entities {
            match positions.get(entity.id()) {
                Some(&index) => {
                    let kept = unique[index].clone();
                    unique[index] = Self::pick(kept, entity.clone());
                }
                None => {
                    positions.insert(entity.id(), unique.len());
                    unique.push(entity.clone());
                }
            }
        }

        if unique.len() < entities.len() {
            debug!(
                "Deduplicated {} entities down to {}",
                entities.len(),
                unique.len()
            );
        }
        unique
    }

    /// Insert `entity`, falling back to an update when the identifier is already taken.
    ///
    /// On a collision the existing version is fetched and the winner is written with `update`.
    /// If the existing version vanished in between (concurrent delete), the insert is retried
    /// once.
    pub async fn save_with_deduplication<T, Ins, InsFut, Fetch, FetchFut, Upd, UpdFut>(
        &self,
        entity: T,
        insert: Ins,
        fetch_existing: Fetch,
        update: Upd,
    ) -> Result<SaveOutcome<T>, MigrationError>
    where
        T: Entity,
        Ins: Fn(T) -> InsFut,
        InsFut: Future<Output = Result<(), RepositoryError>>,
        Fetch: FnOnce(String) -> FetchFut,
        FetchFut: Future<Output = Result<Option<T>, RepositoryError>>,
        Upd: FnOnce(T) -> UpdFut,
        UpdFut: Future<Output = Result<(), RepositoryError>>,
    {
        let id = entity.id().to_string();

        match insert(entity.clone()).await {
            Ok(()) => return Ok(SaveOutcome::Inserted(entity)),
            Err(e) if e.is_collision() => {
                debug!("{} {} already exists, merging with stored version", entity.kind(), id);
            }
            Err(e) => return Err(e.into()),
        }

        match fetch_existing(id.clone()).await? {
            Some(existing) => {
                let winner = Self::pick(existing, entity);
                update(winner.clone()).await?;
                Ok(SaveOutcome::Updated(winner))
            }
            None => {
                warn!(
                    "{} {} collided but could not be fetched, retrying insert",
                    entity.kind(),
                    id
                );
                insert(entity.clone()).await?;
                Ok(SaveOutcome::Inserted(entity))
            }
        }
    }

    /// Merge two sequences keyed by `key_of`, settling collisions with `resolve(existing, incoming)`.
    ///
    /// Order follows first appearance across `seq_a` then `seq_b`.
    pub fn merge_and_deduplicate<T, K, KeyFn, Resolve>(
        &self,
        seq_a: Vec<T>,
        seq_b: Vec<T>,
        key_of: KeyFn,
        mut resolve: Resolve,
    ) -> Vec<T>
    where
        K: Eq + Hash,
        KeyFn: Fn(&T) -> K,
        Resolve: FnMut(T, T) -> T,
    {
        let mut positions: HashMap<K, usize> = HashMap::new();
        let mut merged: Vec<Option<T>> = Vec::with_capacity(seq_a.len() + seq_b.len());

        for incoming in seq_a.into_iter().chain(seq_b) {
            let key = key_of(&incoming);
            match positions.get(&key) {
                Some(&index) => {
                    // Slots are only emptied right here and refilled immediately.
                    if let Some(existing) = merged[index].take() {
                        merged[index] = Some(resolve(existing, incoming));
                    }
                }
                None => {
                    positions.insert(key, merged.len());
                    merged.push(Some(incoming));
                }
            }
        }

        merged.into_iter().flatten().collect()
    }

    pub fn statistics<T: Entity>(&self, entities: &[T]) -> DuplicateStats {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for entity in entities {
            *counts.entry(entity.id()).or_default() += 1;
        }

        let total = entities.len();
        let unique = counts.len();
        let duplicates = total - unique;

        DuplicateStats {
            total,
            unique,
            duplicates,
            duplicate_rate: format_percentage(percentage(duplicates, total)),
            duplicated_ids: counts
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(id, _)| id.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Collection, Item};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn collection(id: &str, name: &str, updated: i64) -> Collection {
        Collection::new(id, name, at(0)).with_updated_at(at(updated))
    }

    #[test]
    fn deduplicate_keeps_most_recent() {
        let input = vec![
            collection("1", "old", 5),
            collection("2", "only", 1),
            collection("1", "new", 9),
            collection("1", "stale", 7),
        ];

        let output = DeduplicationService::new().deduplicate(&input);

        assert_eq!(output.len(), 2);
        assert_eq!(output[0].name, "new");
        assert_eq!(output[1].name, "only");
        for kept in &output {
            for candidate in input.iter().filter(|c| c.id == kept.id) {
                assert!(kept.updated_at >= candidate.updated_at);
            }
        }
    }

    #[test]
    fn deduplicate_tie_goes_to_later_entry() {
        let first = Item::new("i1", "c1", "first", at(0)).chosen_at(at(10));
        let second = Item::new("i1", "c1", "second", at(0)).chosen_at(at(10));

        let output = DeduplicationService::new().deduplicate(&[first, second]);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].title, "second");
    }

    #[test]
    fn statistics_report_duplicates() {
        let input = vec![
            collection("1", "A", 0),
            collection("1", "B", 0),
            collection("2", "C", 0),
        ];

        let stats = DeduplicationService::new().statistics(&input);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.unique, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.duplicate_rate, "33.3");
        assert_eq!(stats.duplicated_ids, BTreeSet::from(["1".to_string()]));
    }

    #[test]
    fn statistics_of_empty_batch() {
        let stats = DeduplicationService::new().statistics::<Collection>(&[]);
        assert_eq!(stats.duplicate_rate, "0.0");
    }

    #[test]
    fn merge_and_deduplicate_uses_resolver_for_collisions() {
        let a = vec![collection("1", "a1", 1), collection("2", "a2", 1)];
        let b = vec![collection("2", "b2", 3), collection("3", "b3", 1)];

        let merged = DeduplicationService::new().merge_and_deduplicate(
            a,
            b,
            |c| c.id.clone(),
            |existing, incoming| DeduplicationService::pick(existing, incoming),
        );

        let names: Vec<_> = merged.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a1", "b2", "b3"]);
    }

    #[tokio::test]
    async fn save_inserts_new_entity() {
        let stored = Mutex::new(Vec::new());
        let outcome = DeduplicationService::new()
            .save_with_deduplication(
                collection("1", "A", 1),
                |c| {
                    stored.lock().unwrap().push(c);
                    async { Ok(()) }
                },
                |_| async { Ok(None) },
                |_| async { Ok(()) },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, SaveOutcome::Inserted(_)));
        assert_eq!(stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_collision_updates_with_winner() {
        let updated = Mutex::new(None);
        let existing = collection("1", "stored", 9);
        let stored = existing.clone();

        let outcome = DeduplicationService::new()
            .save_with_deduplication(
                collection("1", "incoming", 5),
                |c| async move { Err(RepositoryError::AlreadyExists(c.id)) },
                move |_| async move { Ok(Some(stored)) },
                |c| {
                    *updated.lock().unwrap() = Some(c);
                    async { Ok(()) }
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, SaveOutcome::Updated(existing.clone()));
        assert_eq!(updated.lock().unwrap().as_ref(), Some(&existing));
    }

    #[tokio::test]
    async fn save_retries_insert_once_when_existing_vanished() {
        let attempts = Mutex::new(0);

        let outcome = DeduplicationService::new()
            .save_with_deduplication(
                collection("1", "A", 1),
                |c| {
                    let mut n = attempts.lock().unwrap();
                    *n += 1;
                    let result = if *n == 1 {
                        Err(RepositoryError::AlreadyExists(c.id))
                    } else {
                        Ok(())
                    };
                    async move { result }
                },
                |_| async { Ok(None) },
                |_| async { Ok(()) },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, SaveOutcome::Inserted(_)));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn save_gives_up_after_single_retry() {
        let attempts = Mutex::new(0);

        let result = DeduplicationService::new()
            .save_with_deduplication(
                collection("1", "A", 1),
                |c| {
                    *attempts.lock().unwrap() += 1;
                    async move { Err(RepositoryError::AlreadyExists(c.id)) }
                },
                |_| async { Ok(None) },
                |_| async { Ok(()) },
            )
            .await;

        assert!(matches!(result, Err(MigrationError::Repository(RepositoryError::AlreadyExists(_)))));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn save_propagates_other_errors() {
        let result = DeduplicationService::new()
            .save_with_deduplication(
                collection("1", "A", 1),
                |_| async { Err(RepositoryError::Io("offline".into())) },
                |_| async { Ok(None) },
                |_| async { Ok(()) },
            )
            .await;

        assert!(matches!(result, Err(MigrationError::Repository(RepositoryError::Io(_)))));
    }
}
