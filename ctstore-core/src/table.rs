//! Table descriptors.
//!
//! A [`Table`] is an immutable schema-level descriptor created once at
//! startup and shared by reference across every operation that targets the
//! logical table. It carries the storage mode (which physical stores the
//! table lives in), the table kind, and the short "initials" used when
//! composing cache keys.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which physical stores a table's data lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// Both stores, reconciled by the strong-consistency protocol.
    Default,
    /// Volatile cache only; the cache is the sole source of truth.
    CacheOnly,
    /// Persistent table store only; the cache is never touched.
    PersistentOnly,
}

/// Closed set of table shapes, dispatched by exhaustive matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Keyed record with individually addressable fields.
    Object,
    /// Keyed record cached as one opaque binary blob.
    FixedObject,
    /// Keyed numeric counter.
    Count,
    /// Ordered collection of items under one feed key.
    Feed,
    /// Feed whose items may be replaced in place.
    MutableFeed,
    /// Score-ordered feed; exists only in the cache.
    RankFeed,
}

impl TableKind {
    /// True for the item-key-ordered feed kinds.
    pub fn is_feed(self) -> bool {
        matches!(self, Self::Feed | Self::MutableFeed)
    }
}

/// Sort order for feed and rank-feed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedOrder {
    Ascending,
    Descending,
}

/// Immutable table descriptor.
///
/// `container_initial` and `table_initial` are short codes used to compose
/// cache keys; they must be unique within a deployment for the cache key
/// space to stay collision-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub container_name: String,
    pub container_initial: String,
    pub table_name: String,
    pub table_initial: String,
    pub storage_mode: StorageMode,
    pub kind: TableKind,
    /// Cap on cached items per feed key; 0 disables trimming.
    pub max_feed_size_in_cache: u64,
    pub order: FeedOrder,
}

impl Table {
    fn new(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        storage_mode: StorageMode,
        kind: TableKind,
        max_feed_size_in_cache: u64,
        order: FeedOrder,
    ) -> Arc<Self> {
        assert!(!container_name.is_empty(), "container name must not be empty");
        assert!(!table_name.is_empty(), "table name must not be empty");
        Arc::new(Self {
            container_name: container_name.to_string(),
            container_initial: container_initial.to_string(),
            table_name: table_name.to_string(),
            table_initial: table_initial.to_string(),
            storage_mode,
            kind,
            max_feed_size_in_cache,
            order,
        })
    }

    /// Define an object table.
    pub fn object(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        storage_mode: StorageMode,
    ) -> Arc<Self> {
        Self::new(
            container_name,
            container_initial,
            table_name,
            table_initial,
            storage_mode,
            TableKind::Object,
            0,
            FeedOrder::Ascending,
        )
    }

    /// Define a fixed-object table (cached as one opaque blob).
    pub fn fixed_object(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        storage_mode: StorageMode,
    ) -> Arc<Self> {
        Self::new(
            container_name,
            container_initial,
            table_name,
            table_initial,
            storage_mode,
            TableKind::FixedObject,
            0,
            FeedOrder::Ascending,
        )
    }

    /// Define a count table.
    pub fn count(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        storage_mode: StorageMode,
    ) -> Arc<Self> {
        Self::new(
            container_name,
            container_initial,
            table_name,
            table_initial,
            storage_mode,
            TableKind::Count,
            0,
            FeedOrder::Ascending,
        )
    }

    /// Define a feed table.
    ///
    /// Descending feeds are cache-only: the persistent row-key scan walks
    /// ascending item-key order and has no reverse form.
    pub fn feed(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        storage_mode: StorageMode,
        max_feed_size_in_cache: u64,
        order: FeedOrder,
    ) -> Arc<Self> {
        assert!(
            order == FeedOrder::Ascending || storage_mode == StorageMode::CacheOnly,
            "descending feeds must be cache-only"
        );
        Self::new(
            container_name,
            container_initial,
            table_name,
            table_initial,
            storage_mode,
            TableKind::Feed,
            max_feed_size_in_cache,
            order,
        )
    }

    /// Define a mutable feed table. Same order constraint as [`Table::feed`].
    pub fn mutable_feed(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        storage_mode: StorageMode,
        max_feed_size_in_cache: u64,
        order: FeedOrder,
    ) -> Arc<Self> {
        assert!(
            order == FeedOrder::Ascending || storage_mode == StorageMode::CacheOnly,
            "descending feeds must be cache-only"
        );
        Self::new(
            container_name,
            container_initial,
            table_name,
            table_initial,
            storage_mode,
            TableKind::MutableFeed,
            max_feed_size_in_cache,
            order,
        )
    }

    /// Define a rank-feed table. Rank feeds exist only in the cache; the
    /// persistent backend has no sorted-set equivalent.
    pub fn rank_feed(
        container_name: &str,
        container_initial: &str,
        table_name: &str,
        table_initial: &str,
        max_feed_size_in_cache: u64,
        order: FeedOrder,
    ) -> Arc<Self> {
        Self::new(
            container_name,
            container_initial,
            table_name,
            table_initial,
            StorageMode::CacheOnly,
            TableKind::RankFeed,
            max_feed_size_in_cache,
            order,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_constructors_set_kind() {
        let t = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        assert_eq!(t.kind, TableKind::Object);
        assert_eq!(t.storage_mode, StorageMode::Default);
        assert_eq!(t.max_feed_size_in_cache, 0);

        let f = Table::feed(
            "app",
            "a",
            "Posts",
            "o",
            StorageMode::Default,
            50,
            FeedOrder::Ascending,
        );
        assert_eq!(f.kind, TableKind::Feed);
        assert_eq!(f.max_feed_size_in_cache, 50);
        assert_eq!(f.order, FeedOrder::Ascending);
    }

    #[test]
    #[should_panic(expected = "descending feeds must be cache-only")]
    fn test_descending_feed_requires_cache_only() {
        Table::feed(
            "app",
            "a",
            "Posts",
            "o",
            StorageMode::Default,
            50,
            FeedOrder::Descending,
        );
    }

    #[test]
    fn test_rank_feed_is_cache_only() {
        let r = Table::rank_feed("app", "a", "Trending", "t", 100, FeedOrder::Descending);
        assert_eq!(r.storage_mode, StorageMode::CacheOnly);
        assert_eq!(r.kind, TableKind::RankFeed);
    }

    #[test]
    fn test_feed_kinds() {
        assert!(TableKind::Feed.is_feed());
        assert!(TableKind::MutableFeed.is_feed());
        assert!(!TableKind::RankFeed.is_feed());
        assert!(!TableKind::Object.is_feed());
    }

    #[test]
    #[should_panic(expected = "container name must not be empty")]
    fn test_empty_container_name_panics() {
        Table::object("", "a", "Profiles", "p", StorageMode::Default);
    }
}
