//! Heuristic cleanup run after a migration.
//!
//! Collections that look like the same list created twice (same normalized name, created the same
//! day) are collapsed onto the most recently updated one. Structurally invalid entities are
//! deleted, items pointing at unknown collections are only reported, and old entities can be
//! listed as archive candidates.

use crate::migration::config::CleanupConfig;
use crate::migration::types::MigrationError;
use crate::model::{Collection, Item};
use crate::persistence::ReplicaRepository;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// What the cleaner found
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPlan {
    /// Collections shadowed by a more recent look-alike, to delete
    pub duplicate_collections: Vec<String>,
    /// (id, reason) of collections to delete
    pub invalid_collections: Vec<(String, String)>,
    /// (id, reason) of items to delete
    pub invalid_items: Vec<(String, String)>,
    /// Items whose collection is unknown, for manual review
    pub orphaned_items: Vec<String>,
    /// Entities older than the archive threshold
    pub archive_candidates: Vec<String>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.duplicate_collections.is_empty()
            && self.invalid_collections.is_empty()
            && self.invalid_items.is_empty()
            && self.orphaned_items.is_empty()
            && self.archive_candidates.is_empty()
    }
}

/// What the cleaner did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub replica: String,
    pub plan: CleanupPlan,
    pub deleted_collections: usize,
    pub deleted_items: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DataCleaner {
    config: CleanupConfig,
}

impl DataCleaner {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    /// Latest plausible creation time, `None` when it lies beyond the representable range.
    fn future_limit(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_hours(self.config.future_tolerance_hours).and_then(|d| now.checked_add_signed(d))
    }

    fn invalid_collection_reason(&self, c: &Collection, future_limit: Option<DateTime<Utc>>) -> Option<String> {
        if c.id.trim().is_empty() {
            Some("empty identifier".to_string())
        } else if c.name.trim().is_empty() {
            Some("empty name".to_string())
        } else if c.name.chars().count() > self.config.max_name_length {
            Some(format!("name longer than {} characters", self.config.max_name_length))
        } else if future_limit.is_some_and(|limit| c.created_at > limit) {
            Some("created in the future".to_string())
        } else {
            None
        }
    }

    fn invalid_item_reason(&self, i: &Item, future_limit: Option<DateTime<Utc>>) -> Option<String> {
        if i.id.trim().is_empty() {
            Some("empty identifier".to_string())
        } else if i.title.trim().is_empty() {
            Some("empty title".to_string())
        } else if i.title.chars().count() > self.config.max_name_length {
            Some(format!("title longer than {} characters", self.config.max_name_length))
        } else if future_limit.is_some_and(|limit| i.created_at > limit) {
            Some("created in the future".to_string())
        } else {
            None
        }
    }

    /// Work out what to clean without touching any replica.
    pub fn analyze(&self, collections: &[Collection], items: &[Item], now: DateTime<Utc>) -> CleanupPlan {
        let mut plan = CleanupPlan::default();
        let future_limit = self.future_limit(now);

        let mut valid = Vec::new();
        for collection in collections {
            match self.invalid_collection_reason(collection, future_limit) {
                Some(reason) => plan.invalid_collections.push((collection.id.clone(), reason)),
                None => valid.push(collection),
            }
        }

        let groups = valid
            .iter()
            .copied()
            .into_group_map_by(|c| (normalize_name(&c.name), c.created_at.date_naive()));
        for (_, members) in groups.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
            if members.len() < 2 {
                continue;
            }
            // Most recently updated member survives; ties go to the greater id.
            if let Some(keeper) = members
                .iter()
                .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)))
            {
                plan.duplicate_collections.extend(
                    members
                        .iter()
                        .filter(|c| c.id != keeper.id)
                        .map(|c| c.id.clone()),
                );
            }
        }
        plan.duplicate_collections.sort();

        let doomed: HashSet<&str> = plan
            .duplicate_collections
            .iter()
            .map(String::as_str)
            .chain(plan.invalid_collections.iter().map(|(id, _)| id.as_str()))
            .collect();
        let known: HashSet<&str> = collections
            .iter()
            .map(|c| c.id.as_str())
            .filter(|id| !doomed.contains(id))
            .collect();

        let mut live_items = Vec::new();
        for item in items {
            match self.invalid_item_reason(item, future_limit) {
                Some(reason) => plan.invalid_items.push((item.id.clone(), reason)),
                None if !known.contains(item.collection_id.as_str()) => {
                    plan.orphaned_items.push(item.id.clone())
                }
                None => live_items.push(item),
            }
        }
        plan.orphaned_items.sort();

        let threshold = self
            .config
            .archive_after_days
            .and_then(Duration::try_days)
            .and_then(|age| now.checked_sub_signed(age));
        if let Some(threshold) = threshold {
            plan.archive_candidates = valid
                .iter()
                .filter(|c| !doomed.contains(c.id.as_str()) && c.created_at < threshold)
                .map(|c| c.id.clone())
                .chain(
                    live_items
                        .iter()
                        .filter(|i| i.created_at < threshold)
                        .map(|i| i.id.clone()),
                )
                .sorted()
                .collect();
        }

        plan
    }

    /// Analyze `repo` and delete duplicates and invalid entities unless running dry.
    pub async fn clean(&self, repo: &dyn ReplicaRepository) -> Result<CleanupReport, MigrationError> {
        let collections = repo.get_all_collections().await?;
        let items = repo.get_all_items().await?;
        let plan = self.analyze(&collections, &items, Utc::now());

        let mut report = CleanupReport {
            replica: repo.name().to_string(),
            dry_run: self.config.dry_run,
            ..CleanupReport::default()
        };
        if plan.is_empty() {
            info!("Nothing to clean on {}", repo.name());
            return Ok(report);
        }

        if !plan.orphaned_items.is_empty() {
            warn!(
                "{} orphaned items on {} need manual review",
                plan.orphaned_items.len(),
                repo.name()
            );
        }

        if !self.config.dry_run {
            let collection_ids = plan
                .duplicate_collections
                .iter()
                .chain(plan.invalid_collections.iter().map(|(id, _)| id));
            for id in collection_ids {
                match repo.delete_collection(id).await {
                    Ok(()) => report.deleted_collections += 1,
                    Err(e) => report.errors.push(format!("collection {}: {}", id, e)),
                }
            }
            for (id, _) in &plan.invalid_items {
                match repo.delete_item(id).await {
                    Ok(()) => report.deleted_items += 1,
                    Err(e) => report.errors.push(format!("item {}: {}", id, e)),
                }
            }
        }

        info!(
            "Cleanup of {}: {} collections and {} items deleted, {} orphans, {} archive candidates{}",
            repo.name(),
            report.deleted_collections,
            report.deleted_items,
            plan.orphaned_items.len(),
            plan.archive_candidates.len(),
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        report.plan = plan;
        Ok(report)
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace().join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryRepository, ReplicaSnapshot};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    const DAY: i64 = 86_400;

    #[test]
    fn look_alike_collections_keep_latest_update() {
        let collections = vec![
            Collection::new("a", "Groceries", at(100)).with_updated_at(at(200)),
            Collection::new("b", "  groceries ", at(500)).with_updated_at(at(900)),
            Collection::new("c", "Groceries", at(2 * DAY)),
        ];

        let plan = DataCleaner::default().analyze(&collections, &[], at(3 * DAY));
        assert_eq!(plan.duplicate_collections, vec!["a"]);
    }

    #[test]
    fn invalid_entities_are_flagged() {
        let collections = vec![
            Collection::new("ok", "Books", at(0)),
            Collection::new("blank", " ", at(0)),
            Collection::new("future", "Later", at(10 * DAY)),
        ];
        let items = vec![
            Item::new("i1", "ok", "", at(0)),
            Item::new("i2", "ok", "Dune", at(0)),
        ];

        let plan = DataCleaner::default().analyze(&collections, &items, at(DAY));

        let invalid: Vec<_> = plan.invalid_collections.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(invalid, vec!["blank", "future"]);
        assert_eq!(plan.invalid_items.len(), 1);
        assert_eq!(plan.invalid_items[0].0, "i1");
    }

    #[test]
    fn orphans_are_reported_not_deleted() {
        let collections = vec![Collection::new("c1", "Books", at(0))];
        let items = vec![
            Item::new("i1", "c1", "Dune", at(0)),
            Item::new("i2", "gone", "Emma", at(0)),
        ];

        let plan = DataCleaner::default().analyze(&collections, &items, at(DAY));
        assert_eq!(plan.orphaned_items, vec!["i2"]);
        assert!(plan.invalid_items.is_empty());
    }

    #[test]
    fn archive_candidates_need_a_threshold() {
        let collections = vec![Collection::new("old", "Old", at(0)), Collection::new("new", "New", at(40 * DAY))];

        let plan = DataCleaner::default().analyze(&collections, &[], at(41 * DAY));
        assert!(plan.archive_candidates.is_empty());

        let cleaner = DataCleaner::new(CleanupConfig {
            archive_after_days: Some(30),
            ..CleanupConfig::default()
        });
        let plan = cleaner.analyze(&collections, &[], at(41 * DAY));
        assert_eq!(plan.archive_candidates, vec!["old"]);
    }

    #[test]
    fn out_of_range_thresholds_are_skipped() {
        let collections = vec![Collection::new("c1", "Books", at(0))];
        let items = vec![Item::new("i1", "c1", "Dune", at(10 * DAY))];
        let cleaner = DataCleaner::new(CleanupConfig {
            future_tolerance_hours: i64::MAX,
            archive_after_days: Some(i64::MAX),
            ..CleanupConfig::default()
        });

        let plan = cleaner.analyze(&collections, &items, at(DAY));
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn clean_leaves_a_tidy_replica_alone() {
        let repo = InMemoryRepository::from_snapshot(
            "local",
            ReplicaSnapshot {
                collections: vec![Collection::new("c1", "Books", Utc::now())],
                items: vec![],
            },
        );

        let report = DataCleaner::default().clean(&repo).await.unwrap();
        assert_eq!(report.plan, CleanupPlan::default());
        assert_eq!(report.deleted_collections, 0);
        assert!(repo.verify_exists("c1").await.unwrap());
    }

    #[tokio::test]
    async fn clean_deletes_unless_dry_run() {
        let now = Utc::now();
        let snapshot = ReplicaSnapshot {
            collections: vec![
                Collection::new("a", "Todo", now),
                Collection::new("b", "todo", now).with_updated_at(now + Duration::seconds(5)),
            ],
            items: vec![Item::new("i1", "b", "", now)],
        };

        let dry = DataCleaner::new(CleanupConfig {
            dry_run: true,
            ..CleanupConfig::default()
        });
        let repo = InMemoryRepository::from_snapshot("local", snapshot.clone());
        let report = dry.clean(&repo).await.unwrap();
        assert_eq!(report.deleted_collections, 0);
        assert_eq!(repo.snapshot().await.collections.len(), 2);

        let repo = InMemoryRepository::from_snapshot("local", snapshot);
        let report = DataCleaner::default().clean(&repo).await.unwrap();
        assert_eq!(report.deleted_collections, 1);
        assert_eq!(report.deleted_items, 1);
        assert!(!repo.verify_exists("a").await.unwrap());
        assert!(repo.verify_exists("b").await.unwrap());
    }
}
