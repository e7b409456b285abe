//! Conflict resolution between the two replica versions of one entity.
//!
//! A conflict is the same identifier present on both sides with different values. The first
//! argument of every resolve call is the local version, the second the remote (incoming) one.
//! Every tie-break is side-stable so that resolving the same pair twice yields the same value.

use crate::model::{Collection, Entity, Item};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How a conflicting pair is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// Keep the local (first) version
    KeepLocal,
    /// Keep the remote (second) version
    KeepRemote,
    /// Most recent version wins, field-level merge on an exact tie
    SmartMerge,
    /// Keep the local version and store the remote one under a new identifier
    DuplicateBoth,
    /// Ask the injected `ManualResolver`, smart-merge when there is none or it declines
    AskUser,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictStrategy::KeepLocal => "keep-local",
            ConflictStrategy::KeepRemote => "keep-remote",
            ConflictStrategy::SmartMerge => "smart-merge",
            ConflictStrategy::DuplicateBoth => "duplicate-both",
            ConflictStrategy::AskUser => "ask-user",
        };
        f.write_str(name)
    }
}

/// Result of resolving one conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Single(T),
    /// `original` keeps the identifier, `copy` carries a freshly generated one
    Duplicated { original: T, copy: T },
}

impl<T> Resolution<T> {
    /// The value stored under the conflicting identifier.
    pub fn primary(&self) -> &T {
        match self {
            Resolution::Single(value) => value,
            Resolution::Duplicated { original, .. } => original,
        }
    }
}

/// Hook through which a caller (typically a UI) settles conflicts by hand.
///
/// Returning `None` declines, and the resolver falls back to smart-merge.
pub trait ManualResolver: Send + Sync {
    fn resolve_collection(&self, local: &Collection, remote: &Collection) -> Option<Collection>;
    fn resolve_item(&self, local: &Item, remote: &Item) -> Option<Item>;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Resolves conflicting collection and item pairs.
#[derive(Clone)]
pub struct ConflictResolver {
    clock: Clock,
    manual: Option<Arc<dyn ManualResolver>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("manual", &self.manual.is_some())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Utc::now),
            manual: None,
        }
    }

    /// Use `clock` for the "now" stamped on tie merges.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_manual_resolver(mut self, manual: Arc<dyn ManualResolver>) -> Self {
        self.manual = Some(manual);
        self
    }

    pub fn resolve_collection(
        &self,
        local: &Collection,
        remote: &Collection,
        strategy: ConflictStrategy,
    ) -> Resolution<Collection> {
        match strategy {
            ConflictStrategy::KeepLocal => Resolution::Single(local.clone()),
            ConflictStrategy::KeepRemote => Resolution::Single(remote.clone()),
            ConflictStrategy::SmartMerge => Resolution::Single(self.merge_collections(local, remote)),
            ConflictStrategy::DuplicateBoth => Resolution::Duplicated {
                original: local.clone(),
                copy: remote.with_id(duplicate_id(&remote.id)),
            },
            ConflictStrategy::AskUser => {
                match self
                    .manual
                    .as_ref()
                    .and_then(|manual| manual.resolve_collection(local, remote))
                {
                    Some(chosen) => Resolution::Single(chosen),
                    None => {
                        debug!(
                            "No manual decision for collection {}, using smart merge",
                            local.id
                        );
                        Resolution::Single(self.merge_collections(local, remote))
                    }
                }
            }
        }
    }

    pub fn resolve_item(
        &self,
        local: &Item,
        remote: &Item,
        strategy: ConflictStrategy,
    ) -> Resolution<Item> {
        match strategy {
            ConflictStrategy::KeepLocal => Resolution::Single(local.clone()),
            ConflictStrategy::KeepRemote => Resolution::Single(remote.clone()),
            ConflictStrategy::SmartMerge => Resolution::Single(merge_items(local, remote)),
            ConflictStrategy::DuplicateBoth => Resolution::Duplicated {
                original: local.clone(),
                copy: remote.with_id(duplicate_id(&remote.id)),
            },
            ConflictStrategy::AskUser => {
                match self
                    .manual
                    .as_ref()
                    .and_then(|manual| manual.resolve_item(local, remote))
                {
                    Some(chosen) => Resolution::Single(chosen),
                    None => {
                        debug!("No manual decision for item {}, using smart merge", local.id);
                        Resolution::Single(merge_items(local, remote))
                    }
                }
            }
        }
    }

    /// Later `updated_at` wins outright; an exact tie merges field by field.
    fn merge_collections(&self, local: &Collection, remote: &Collection) -> Collection {
        if local.updated_at > remote.updated_at {
            return local.clone();
        }
        if remote.updated_at > local.updated_at {
            return remote.clone();
        }

        // Never step back in time, whatever the clock says.
        let updated_at = (self.clock)().max(local.updated_at);

        Collection {
            id: local.id.clone(),
            name: prefer_non_empty(&remote.name, &local.name),
            description: prefer_non_empty(&remote.description, &local.description),
            kind: prefer_non_empty(&remote.kind, &local.kind),
            created_at: local.created_at.min(remote.created_at),
            updated_at,
            item_ids: union_ids(&local.item_ids, &remote.item_ids),
        }
    }
}

/// Later effective timestamp wins outright; an exact tie merges field by field.
fn merge_items(local: &Item, remote: &Item) -> Item {
    let local_ts = local.effective_timestamp();
    let remote_ts = remote.effective_timestamp();
    if local_ts > remote_ts {
        return local.clone();
    }
    if remote_ts > local_ts {
        return remote.clone();
    }

    Item {
        id: local.id.clone(),
        collection_id: prefer_non_empty(&remote.collection_id, &local.collection_id),
        title: prefer_non_empty(&remote.title, &local.title),
        is_completed: local.is_completed || remote.is_completed,
        score: local.score.max(remote.score),
        created_at: local.created_at.min(remote.created_at),
        completed_at: remote.completed_at.or(local.completed_at),
        last_chosen_at: local.last_chosen_at.max(remote.last_chosen_at),
    }
}

fn prefer_non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}

fn union_ids(first: &[String], second: &[String]) -> Vec<String> {
    let mut merged = first.to_vec();
    for id in second {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    merged
}

/// Fresh identifier for the copy made by `DuplicateBoth`.
pub fn duplicate_id(id: &str) -> String {
    let mut suffix = [0u8; 4];
    rand::rng().fill(&mut suffix);
    format!("{}-copy-{}", id, hex::encode(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn fixed_resolver() -> ConflictResolver {
        ConflictResolver::new().with_clock(|| at(1_000))
    }

    #[test]
    fn smart_merge_picks_newer_collection() {
        let local = Collection::new("c1", "Local name", at(0)).with_updated_at(at(10));
        let remote = Collection::new("c1", "Cloud name", at(0)).with_updated_at(at(20));

        let resolved = fixed_resolver().resolve_collection(&local, &remote, ConflictStrategy::SmartMerge);
        assert_eq!(resolved, Resolution::Single(remote.clone()));

        let reversed = fixed_resolver().resolve_collection(&remote, &local, ConflictStrategy::SmartMerge);
        assert_eq!(reversed, Resolution::Single(remote));
    }

    #[test]
    fn smart_merge_tie_merges_non_empty_fields() {
        let local = Collection::new("c1", "Groceries", at(5))
            .with_description("weekly")
            .with_updated_at(at(50))
            .with_item_ids(vec!["a".into(), "b".into()]);
        let remote = Collection::new("c1", "", at(3))
            .with_kind("shopping")
            .with_updated_at(at(50))
            .with_item_ids(vec!["b".into(), "c".into()]);

        let resolved = fixed_resolver().resolve_collection(&local, &remote, ConflictStrategy::SmartMerge);
        let merged = resolved.primary();

        assert_eq!(merged.name, "Groceries");
        assert_eq!(merged.description, "weekly");
        assert_eq!(merged.kind, "shopping");
        assert_eq!(merged.created_at, at(3));
        assert_eq!(merged.updated_at, at(1_000));
        assert_eq!(merged.item_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn tie_merge_never_moves_updated_at_backwards() {
        let local = Collection::new("c1", "A", at(0)).with_updated_at(at(5_000));
        let remote = local.with_description("x");

        let resolved = fixed_resolver().resolve_collection(&local, &remote, ConflictStrategy::SmartMerge);
        assert_eq!(resolved.primary().updated_at, at(5_000));
    }

    #[test]
    fn smart_merge_item_uses_effective_timestamp() {
        let local = Item::new("i1", "c1", "Read", at(0)).chosen_at(at(30));
        let remote = Item::new("i1", "c1", "Read book", at(0)).completed(at(20));

        let resolved = fixed_resolver().resolve_item(&local, &remote, ConflictStrategy::SmartMerge);
        assert_eq!(resolved, Resolution::Single(local));
    }

    #[test]
    fn item_missing_timestamps_fall_back_to_creation() {
        let older = Item::new("i1", "c1", "old", at(1));
        let newer = Item::new("i1", "c1", "new", at(2));

        let resolved = fixed_resolver().resolve_item(&newer, &older, ConflictStrategy::SmartMerge);
        assert_eq!(resolved.primary().title, "new");
    }

    #[test]
    fn item_tie_merges_fields() {
        let local = Item::new("i1", "c1", "Run", at(10))
            .with_score(1200.0)
            .chosen_at(at(40));
        let mut remote = Item::new("i1", "c1", "Run 5k", at(8)).with_score(1100.0);
        remote.last_chosen_at = Some(at(40));
        remote.is_completed = true;

        let resolved = fixed_resolver().resolve_item(&local, &remote, ConflictStrategy::SmartMerge);
        let merged = resolved.primary();

        assert_eq!(merged.score, 1200.0);
        assert!(merged.is_completed);
        assert_eq!(merged.created_at, at(8));
        assert_eq!(merged.title, "Run 5k");
        assert_eq!(merged.last_chosen_at, Some(at(40)));
    }

    #[test]
    fn keep_strategies_pick_sides() {
        let local = Item::new("i1", "c1", "L", at(0));
        let remote = Item::new("i1", "c1", "R", at(0));
        let resolver = fixed_resolver();

        assert_eq!(
            resolver.resolve_item(&local, &remote, ConflictStrategy::KeepLocal).primary().title,
            "L"
        );
        assert_eq!(
            resolver.resolve_item(&local, &remote, ConflictStrategy::KeepRemote).primary().title,
            "R"
        );
    }

    #[test]
    fn duplicate_both_keeps_both_versions() {
        let local = Collection::new("c1", "Mine", at(0));
        let remote = Collection::new("c1", "Theirs", at(0));

        match fixed_resolver().resolve_collection(&local, &remote, ConflictStrategy::DuplicateBoth) {
            Resolution::Duplicated { original, copy } => {
                assert_eq!(original, local);
                assert_eq!(copy.name, "Theirs");
                assert!(copy.id.starts_with("c1-copy-"));
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let local = Item::new("i1", "c1", "A", at(0)).with_score(3.0).chosen_at(at(9));
        let remote = Item::new("i1", "c1", "B", at(0)).with_score(4.0).chosen_at(at(9));
        let resolver = fixed_resolver();

        let first = resolver.resolve_item(&local, &remote, ConflictStrategy::SmartMerge);
        for _ in 0..10 {
            assert_eq!(
                resolver.resolve_item(&local, &remote, ConflictStrategy::SmartMerge),
                first
            );
        }
    }

    struct AlwaysLocal;

    impl ManualResolver for AlwaysLocal {
        fn resolve_collection(&self, local: &Collection, _remote: &Collection) -> Option<Collection> {
            Some(local.clone())
        }

        fn resolve_item(&self, _local: &Item, _remote: &Item) -> Option<Item> {
            None
        }
    }

    #[test]
    fn ask_user_consults_hook_then_falls_back() {
        let resolver = fixed_resolver().with_manual_resolver(Arc::new(AlwaysLocal));

        let local = Collection::new("c1", "Old", at(0)).with_updated_at(at(1));
        let remote = Collection::new("c1", "New", at(0)).with_updated_at(at(2));
        let chosen = resolver.resolve_collection(&local, &remote, ConflictStrategy::AskUser);
        assert_eq!(chosen.primary().name, "Old");

        let local_item = Item::new("i1", "c1", "old", at(1));
        let remote_item = Item::new("i1", "c1", "new", at(2));
        let merged = resolver.resolve_item(&local_item, &remote_item, ConflictStrategy::AskUser);
        assert_eq!(merged.primary().title, "new");
    }

    #[test]
    fn ask_user_without_hook_is_smart_merge() {
        let local = Collection::new("c1", "Old", at(0)).with_updated_at(at(1));
        let remote = Collection::new("c1", "New", at(0)).with_updated_at(at(2));
        let resolved = fixed_resolver().resolve_collection(&local, &remote, ConflictStrategy::AskUser);
        assert_eq!(resolved.primary().name, "New");
    }
}
