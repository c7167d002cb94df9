//! Operation builders.
//!
//! Operations are immutable value objects constructed through per-table-kind
//! factories. Factories validate required fields and clone the supplied
//! entity, so later caller-side mutation can never affect an in-flight
//! operation. Invalid construction is a programmer error and panics;
//! everything that can fail at runtime returns a `StoreResult` further down
//! the pipeline.

use crate::entity::{CountEntity, FeedEntity, ObjectEntity, RankFeedEntity, StoreEntity};
use crate::table::{StorageMode, Table, TableKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// OperationType stays serde-derived for observability payloads; Operation
// itself holds an Arc<Table> and is never serialized.

/// ETag wildcard: the precondition matches any stored ETag.
pub const ETAG_ANY: &str = "*";

/// Operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Delete,
    DeleteIfExists,
    Replace,
    InsertOrReplace,
    Merge,
    InsertOrMerge,
    Increment,
    InsertOrIncrement,
    /// Feed-only: insert or replace unless the item is the last item of the
    /// cached feed. Used by the consistency protocol so invalidating in
    /// place never disturbs the pagination boundary.
    InsertOrReplaceIfNotLast,
    /// Feed-only: insert only if the cached feed already has at least one
    /// member, so a cache miss never materializes a truncated feed prefix.
    InsertIfNotEmpty,
}

impl OperationType {
    /// True for the variants that create an entity where none existed.
    /// These have no cache pre-operation: there is nothing to invalidate.
    pub fn is_insert(self) -> bool {
        matches!(self, Self::Insert)
    }

    /// True for the delete variants.
    pub fn is_delete(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteIfExists)
    }
}

/// A single validated operation against one table row.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub table: Arc<Table>,
    pub op_type: OperationType,
    pub partition_key: String,
    pub key: String,
    pub item_key: Option<String>,
    pub entity: Option<StoreEntity>,
    /// ETag precondition; [`ETAG_ANY`] means unconditional.
    pub etag: String,
    /// Increment delta (count and rank-feed increments) or rank-feed score.
    pub score: f64,
}

fn require_nonempty(value: &str, what: &str) {
    assert!(!value.is_empty(), "{what} must not be empty");
}

fn require_kind(table: &Table, allowed: &[TableKind], what: &str) {
    assert!(
        allowed.contains(&table.kind),
        "{what} requires a {allowed:?} table, got {:?} ({})",
        table.kind,
        table.table_name
    );
}

fn require_cache_only(table: &Table, what: &str) {
    assert!(
        table.storage_mode == StorageMode::CacheOnly,
        "{what} requires a cache-only table ({})",
        table.table_name
    );
}

impl Operation {
    fn base(
        table: &Arc<Table>,
        op_type: OperationType,
        partition_key: &str,
        key: &str,
    ) -> Operation {
        require_nonempty(partition_key, "partition key");
        require_nonempty(key, "key");
        Operation {
            table: Arc::clone(table),
            op_type,
            partition_key: partition_key.to_string(),
            key: key.to_string(),
            item_key: None,
            entity: None,
            etag: ETAG_ANY.to_string(),
            score: 0.0,
        }
    }

    /// Clone this operation with a different operation type; used by the
    /// execution pipeline when synthesizing pre/post operations.
    pub fn with_op_type(&self, op_type: OperationType) -> Operation {
        let mut op = self.clone();
        op.op_type = op_type;
        op
    }

    /// Clone this operation with a different entity payload.
    pub fn with_entity(&self, entity: StoreEntity) -> Operation {
        let mut op = self.clone();
        op.entity = Some(entity);
        op
    }

    // ========================================================================
    // OBJECT / FIXED-OBJECT OPERATIONS
    // ========================================================================

    fn object_write(
        table: &Arc<Table>,
        op_type: OperationType,
        partition_key: &str,
        object_key: &str,
        entity: &ObjectEntity,
    ) -> Operation {
        require_kind(table, &[TableKind::Object, TableKind::FixedObject], "object operation");
        let mut op = Self::base(table, op_type, partition_key, object_key);
        if let Some(etag) = entity.core.etag.clone() {
            op.etag = etag;
        }
        let mut entity = entity.clone();
        entity.object_key = object_key.to_string();
        op.entity = Some(StoreEntity::Object(entity));
        op
    }

    pub fn insert_object(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
        entity: &ObjectEntity,
    ) -> Operation {
        Self::object_write(table, OperationType::Insert, partition_key, object_key, entity)
    }

    pub fn replace_object(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
        entity: &ObjectEntity,
    ) -> Operation {
        Self::object_write(table, OperationType::Replace, partition_key, object_key, entity)
    }

    pub fn insert_or_replace_object(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
        entity: &ObjectEntity,
    ) -> Operation {
        Self::object_write(
            table,
            OperationType::InsertOrReplace,
            partition_key,
            object_key,
            entity,
        )
    }

    pub fn merge_object(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
        entity: &ObjectEntity,
    ) -> Operation {
        require_kind(table, &[TableKind::Object], "merge");
        Self::object_write(table, OperationType::Merge, partition_key, object_key, entity)
    }

    pub fn insert_or_merge_object(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
        entity: &ObjectEntity,
    ) -> Operation {
        require_kind(table, &[TableKind::Object], "merge");
        Self::object_write(
            table,
            OperationType::InsertOrMerge,
            partition_key,
            object_key,
            entity,
        )
    }

    pub fn delete_object(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
        etag: &str,
    ) -> Operation {
        require_kind(table, &[TableKind::Object, TableKind::FixedObject], "object delete");
        require_nonempty(etag, "etag");
        let mut op = Self::base(table, OperationType::Delete, partition_key, object_key);
        op.etag = etag.to_string();
        op
    }

    pub fn delete_object_if_exists(
        table: &Arc<Table>,
        partition_key: &str,
        object_key: &str,
    ) -> Operation {
        require_kind(table, &[TableKind::Object, TableKind::FixedObject], "object delete");
        Self::base(table, OperationType::DeleteIfExists, partition_key, object_key)
    }

    // ========================================================================
    // COUNT OPERATIONS
    // ========================================================================

    fn count_write(
        table: &Arc<Table>,
        op_type: OperationType,
        partition_key: &str,
        count_key: &str,
        entity: &CountEntity,
    ) -> Operation {
        require_kind(table, &[TableKind::Count], "count operation");
        let mut op = Self::base(table, op_type, partition_key, count_key);
        if let Some(etag) = entity.core.etag.clone() {
            op.etag = etag;
        }
        let mut entity = entity.clone();
        entity.count_key = count_key.to_string();
        op.entity = Some(StoreEntity::Count(entity));
        op
    }

    pub fn insert_count(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
        value: f64,
    ) -> Operation {
        Self::count_write(
            table,
            OperationType::Insert,
            partition_key,
            count_key,
            &CountEntity::new(count_key, value),
        )
    }

    pub fn replace_count(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
        entity: &CountEntity,
    ) -> Operation {
        Self::count_write(table, OperationType::Replace, partition_key, count_key, entity)
    }

    pub fn insert_or_replace_count(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
        value: f64,
    ) -> Operation {
        Self::count_write(
            table,
            OperationType::InsertOrReplace,
            partition_key,
            count_key,
            &CountEntity::new(count_key, value),
        )
    }

    pub fn delete_count(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
        etag: &str,
    ) -> Operation {
        require_kind(table, &[TableKind::Count], "count delete");
        require_nonempty(etag, "etag");
        let mut op = Self::base(table, OperationType::Delete, partition_key, count_key);
        op.etag = etag.to_string();
        op
    }

    pub fn delete_count_if_exists(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
    ) -> Operation {
        require_kind(table, &[TableKind::Count], "count delete");
        Self::base(table, OperationType::DeleteIfExists, partition_key, count_key)
    }

    pub fn increment_count(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
        delta: f64,
    ) -> Operation {
        require_kind(table, &[TableKind::Count], "count increment");
        let mut op = Self::base(table, OperationType::Increment, partition_key, count_key);
        op.score = delta;
        op
    }

    pub fn insert_or_increment_count(
        table: &Arc<Table>,
        partition_key: &str,
        count_key: &str,
        delta: f64,
    ) -> Operation {
        require_kind(table, &[TableKind::Count], "count increment");
        let mut op = Self::base(table, OperationType::InsertOrIncrement, partition_key, count_key);
        op.score = delta;
        op
    }

    // ========================================================================
    // FEED OPERATIONS
    // ========================================================================

    fn feed_write(
        table: &Arc<Table>,
        op_type: OperationType,
        partition_key: &str,
        feed_key: &str,
        entity: &FeedEntity,
    ) -> Operation {
        assert!(table.kind.is_feed(), "feed operation requires a feed table");
        require_nonempty(&entity.item_key, "item key");
        let mut op = Self::base(table, op_type, partition_key, feed_key);
        if let Some(etag) = entity.core.etag.clone() {
            op.etag = etag;
        }
        let mut entity = entity.clone();
        entity.feed_key = feed_key.to_string();
        entity.cursor = entity.item_key.clone();
        op.item_key = Some(entity.item_key.clone());
        op.entity = Some(StoreEntity::Feed(entity));
        op
    }

    pub fn insert_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &FeedEntity,
    ) -> Operation {
        Self::feed_write(table, OperationType::Insert, partition_key, feed_key, entity)
    }

    pub fn replace_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &FeedEntity,
    ) -> Operation {
        Self::feed_write(table, OperationType::Replace, partition_key, feed_key, entity)
    }

    pub fn insert_or_replace_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &FeedEntity,
    ) -> Operation {
        Self::feed_write(
            table,
            OperationType::InsertOrReplace,
            partition_key,
            feed_key,
            entity,
        )
    }

    pub fn insert_or_replace_feed_item_if_not_last(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &FeedEntity,
    ) -> Operation {
        Self::feed_write(
            table,
            OperationType::InsertOrReplaceIfNotLast,
            partition_key,
            feed_key,
            entity,
        )
    }

    pub fn insert_feed_item_if_not_empty(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &FeedEntity,
    ) -> Operation {
        Self::feed_write(
            table,
            OperationType::InsertIfNotEmpty,
            partition_key,
            feed_key,
            entity,
        )
    }

    pub fn delete_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
        etag: &str,
    ) -> Operation {
        assert!(table.kind.is_feed(), "feed operation requires a feed table");
        require_nonempty(item_key, "item key");
        require_nonempty(etag, "etag");
        let mut op = Self::base(table, OperationType::Delete, partition_key, feed_key);
        op.item_key = Some(item_key.to_string());
        op.etag = etag.to_string();
        op
    }

    pub fn delete_feed_item_if_exists(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> Operation {
        assert!(table.kind.is_feed(), "feed operation requires a feed table");
        require_nonempty(item_key, "item key");
        let mut op = Self::base(table, OperationType::DeleteIfExists, partition_key, feed_key);
        op.item_key = Some(item_key.to_string());
        op
    }

    // ========================================================================
    // RANK-FEED OPERATIONS (cache-only)
    // ========================================================================

    fn rank_feed_base(
        table: &Arc<Table>,
        op_type: OperationType,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> Operation {
        require_kind(table, &[TableKind::RankFeed], "rank-feed operation");
        require_cache_only(table, "rank-feed operation");
        require_nonempty(item_key, "item key");
        let mut op = Self::base(table, op_type, partition_key, feed_key);
        op.item_key = Some(item_key.to_string());
        op
    }

    pub fn insert_rank_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &RankFeedEntity,
    ) -> Operation {
        let mut op = Self::rank_feed_base(
            table,
            OperationType::Insert,
            partition_key,
            feed_key,
            &entity.item_key,
        );
        op.score = entity.score;
        let mut entity = entity.clone();
        entity.feed_key = feed_key.to_string();
        op.entity = Some(StoreEntity::RankFeed(entity));
        op
    }

    pub fn insert_or_replace_rank_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        entity: &RankFeedEntity,
    ) -> Operation {
        let mut op = Self::rank_feed_base(
            table,
            OperationType::InsertOrReplace,
            partition_key,
            feed_key,
            &entity.item_key,
        );
        op.score = entity.score;
        let mut entity = entity.clone();
        entity.feed_key = feed_key.to_string();
        op.entity = Some(StoreEntity::RankFeed(entity));
        op
    }

    pub fn delete_rank_feed_item(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> Operation {
        Self::rank_feed_base(table, OperationType::Delete, partition_key, feed_key, item_key)
    }

    pub fn delete_rank_feed_item_if_exists(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> Operation {
        Self::rank_feed_base(
            table,
            OperationType::DeleteIfExists,
            partition_key,
            feed_key,
            item_key,
        )
    }

    pub fn increment_rank_feed_score(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
        delta: f64,
    ) -> Operation {
        let mut op =
            Self::rank_feed_base(table, OperationType::Increment, partition_key, feed_key, item_key);
        op.score = delta;
        op
    }

    pub fn insert_or_increment_rank_feed_score(
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
        delta: f64,
    ) -> Operation {
        let mut op = Self::rank_feed_base(
            table,
            OperationType::InsertOrIncrement,
            partition_key,
            feed_key,
            item_key,
        );
        op.score = delta;
        op
    }
}
