//! Top-level store facade.
//!
//! Writes dispatch to the execution manager; reads dispatch by storage mode
//! the same way. Default-mode reads are read-through: cache first, then the
//! persistent store when the cache misses or holds an invalidation marker,
//! followed by a best-effort cache repair. Repair only fires once a marker
//! has expired; an unexpired marker means a writer's protocol may still be
//! in flight and the reader must not race its post-phase.

use chrono::Utc;
use ctstore_core::{
    CacheFlags, CountEntity, EntityCore, FeedEntity, ObjectEntity, Operation, OperationResult,
    RankFeedEntity, StoreConfig, StoreResult, StorageMode, Table, TableKind, Transaction,
};
use std::sync::Arc;
use tracing::warn;

use crate::cache::CacheBackend;
use crate::clients::{CacheClient, PersistentClient};
use crate::manager::ExecutionManager;
use crate::persistent::PersistentBackend;

/// Dual-backend store over a persistent table store and a volatile cache.
pub struct CtStore<P: PersistentClient, C: CacheClient> {
    persistent: Arc<PersistentBackend<P>>,
    cache: Arc<CacheBackend<C>>,
    manager: ExecutionManager<P, C>,
}

impl<P: PersistentClient, C: CacheClient> CtStore<P, C> {
    pub fn new(persistent_client: Arc<P>, cache_client: Arc<C>, config: StoreConfig) -> Self {
        let persistent = Arc::new(PersistentBackend::new(persistent_client));
        let cache = Arc::new(CacheBackend::new(cache_client));
        let manager = ExecutionManager::new(Arc::clone(&persistent), Arc::clone(&cache), config);
        Self {
            persistent,
            cache,
            manager,
        }
    }

    // ========================================================================
    // Container administration
    // ========================================================================

    pub async fn create_container(&self, name: &str) -> StoreResult<bool> {
        self.persistent.create_container(name).await
    }

    pub async fn delete_container(&self, name: &str) -> StoreResult<bool> {
        self.persistent.delete_container(name).await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn execute(&self, op: &Operation) -> StoreResult<OperationResult> {
        self.manager.execute(op).await
    }

    pub async fn execute_transaction(
        &self,
        txn: &Transaction,
    ) -> StoreResult<Vec<OperationResult>> {
        self.manager.execute_transaction(txn).await
    }

    // ========================================================================
    // Object reads
    // ========================================================================

    pub async fn query_object(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        key: &str,
    ) -> StoreResult<Option<ObjectEntity>> {
        assert_eq!(table.kind, TableKind::Object, "query_object requires an object table");
        match table.storage_mode {
            StorageMode::CacheOnly => self.cache.read_object(table, partition_key, key).await,
            StorageMode::PersistentOnly => {
                self.persistent.read_object(table, partition_key, key).await
            }
            StorageMode::Default => {
                let cached = self.cache.read_object(table, partition_key, key).await?;
                if let Some(entity) = &cached {
                    if !is_invalid(&entity.core) {
                        return Ok(cached);
                    }
                }
                let fresh = self.persistent.read_object(table, partition_key, key).await?;
                let repair =
                    object_repair(table, partition_key, key, cached.as_ref(), fresh.as_ref());
                self.run_repair(repair).await;
                Ok(fresh)
            }
        }
    }

    /// Object read projected to the named fields. Unprojected fields come
    /// back absent and the typed accessors yield their default values. No
    /// cache repair fires from a partial read: the payload is incomplete.
    pub async fn query_partial_object(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        key: &str,
        fields: &[String],
    ) -> StoreResult<Option<ObjectEntity>> {
        assert_eq!(table.kind, TableKind::Object, "query_partial_object requires an object table");
        match table.storage_mode {
            StorageMode::CacheOnly => {
                self.cache
                    .read_partial_object(table, partition_key, key, fields)
                    .await
            }
            StorageMode::PersistentOnly => {
                self.persistent
                    .read_partial_object(table, partition_key, key, fields)
                    .await
            }
            StorageMode::Default => {
                let cached = self
                    .cache
                    .read_partial_object(table, partition_key, key, fields)
                    .await?;
                if let Some(entity) = &cached {
                    if !is_invalid(&entity.core) {
                        return Ok(cached);
                    }
                }
                self.persistent
                    .read_partial_object(table, partition_key, key, fields)
                    .await
            }
        }
    }

    pub async fn query_fixed_object(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        key: &str,
    ) -> StoreResult<Option<ObjectEntity>> {
        assert_eq!(
            table.kind,
            TableKind::FixedObject,
            "query_fixed_object requires a fixed-object table"
        );
        match table.storage_mode {
            StorageMode::CacheOnly => {
                self.cache.read_fixed_object(table, partition_key, key).await
            }
            StorageMode::PersistentOnly => {
                self.persistent.read_object(table, partition_key, key).await
            }
            StorageMode::Default => {
                let cached = self.cache.read_fixed_object(table, partition_key, key).await?;
                if let Some(entity) = &cached {
                    if !is_invalid(&entity.core) {
                        return Ok(cached);
                    }
                }
                let fresh = self.persistent.read_object(table, partition_key, key).await?;
                let repair =
                    object_repair(table, partition_key, key, cached.as_ref(), fresh.as_ref());
                self.run_repair(repair).await;
                Ok(fresh)
            }
        }
    }

    // ========================================================================
    // Count reads
    // ========================================================================

    pub async fn query_count(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        key: &str,
    ) -> StoreResult<Option<CountEntity>> {
        assert_eq!(table.kind, TableKind::Count, "query_count requires a count table");
        match table.storage_mode {
            StorageMode::CacheOnly => self.cache.read_count(table, partition_key, key).await,
            StorageMode::PersistentOnly => {
                self.persistent.read_count(table, partition_key, key).await
            }
            StorageMode::Default => {
                let cached = self.cache.read_count(table, partition_key, key).await?;
                if let Some(entity) = &cached {
                    if !is_invalid(&entity.core) {
                        return Ok(cached);
                    }
                }
                let fresh = self.persistent.read_count(table, partition_key, key).await?;
                let repair =
                    count_repair(table, partition_key, key, cached.as_ref(), fresh.as_ref());
                self.run_repair(repair).await;
                Ok(fresh)
            }
        }
    }

    // ========================================================================
    // Feed reads
    // ========================================================================

    /// One feed page of up to `limit` items starting after `cursor`.
    ///
    /// Default mode stitches cache and persistent store: invalid cached
    /// items are refreshed by point reads, a short cache page is extended by
    /// a persistent continuation read, and freshly fetched items are cached
    /// only when they genuinely continue an already-cached run (or the feed
    /// is read from its start into an empty cache). The continuation
    /// overshoots by one so the next paginator always finds its cursor item
    /// cached.
    pub async fn query_feed(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<FeedEntity>> {
        assert!(table.kind.is_feed(), "query_feed requires a feed table");
        if limit == 0 {
            return Ok(Vec::new());
        }
        match table.storage_mode {
            StorageMode::CacheOnly => {
                self.cache
                    .read_feed(table, partition_key, feed_key, cursor, limit)
                    .await
            }
            StorageMode::PersistentOnly => {
                self.persistent
                    .read_feed(table, partition_key, feed_key, cursor, limit)
                    .await
            }
            StorageMode::Default => {
                self.query_feed_stitched(table, partition_key, feed_key, cursor, limit)
                    .await
            }
        }
    }

    async fn query_feed_stitched(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<FeedEntity>> {
        let cached = self
            .cache
            .read_feed(table, partition_key, feed_key, cursor, limit)
            .await?;
        let cache_count = cached.len();
        let last_cached_key = cached.last().map(|e| e.item_key.clone());

        let mut results: Vec<FeedEntity> = Vec::with_capacity(limit + 1);
        let mut repairs: Vec<Operation> = Vec::new();
        let mut invalid_count = 0usize;

        for item in cached {
            if !is_invalid(&item.core) {
                results.push(item);
                continue;
            }
            invalid_count += 1;
            let fresh = self
                .persistent
                .read_feed_item(table, partition_key, feed_key, &item.item_key)
                .await?;
            match fresh {
                Some(fresh) => {
                    if is_expired(&item.core) {
                        let mut entity = fresh.clone();
                        entity.core.custom_etag = entity.core.etag.clone();
                        entity.core.etag = item.core.etag.clone();
                        repairs.push(Operation::replace_feed_item(
                            table,
                            partition_key,
                            feed_key,
                            &entity,
                        ));
                    }
                    results.push(fresh);
                }
                None => {
                    if is_expired(&item.core) {
                        if let Some(marker_etag) = &item.core.etag {
                            repairs.push(Operation::delete_feed_item(
                                table,
                                partition_key,
                                feed_key,
                                &item.item_key,
                                marker_etag,
                            ));
                        }
                    }
                }
            }
        }

        if cache_count < limit {
            let fetch = limit - cache_count + invalid_count + 1;
            let continuation_cursor = last_cached_key.as_deref().or(cursor);
            let fetched = self
                .persistent
                .read_feed(table, partition_key, feed_key, continuation_cursor, fetch)
                .await?;

            // Populate only a genuine continuation of a cached run, or a
            // from-the-start read into an empty cache. Anything else could
            // silently create a gap.
            let populate_continuation = cache_count > 0;
            let populate_start = cursor.is_none() && cache_count == 0;
            for item in fetched {
                if populate_continuation || populate_start {
                    let mut entity = item.clone();
                    entity.core.custom_etag = entity.core.etag.clone();
                    let op = if populate_continuation {
                        // Guards against racing a whole-feed eviction.
                        Operation::insert_feed_item_if_not_empty(
                            table,
                            partition_key,
                            feed_key,
                            &entity,
                        )
                    } else {
                        Operation::insert_or_replace_feed_item(
                            table,
                            partition_key,
                            feed_key,
                            &entity,
                        )
                    };
                    repairs.push(op);
                }
                results.push(item);
            }
        }

        self.run_repairs(repairs).await;
        results.truncate(limit);
        Ok(results)
    }

    pub async fn query_feed_item(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> StoreResult<Option<FeedEntity>> {
        assert!(table.kind.is_feed(), "query_feed_item requires a feed table");
        match table.storage_mode {
            StorageMode::CacheOnly => {
                self.cache
                    .read_feed_item(table, partition_key, feed_key, item_key)
                    .await
            }
            StorageMode::PersistentOnly => {
                self.persistent
                    .read_feed_item(table, partition_key, feed_key, item_key)
                    .await
            }
            StorageMode::Default => {
                let cached = self
                    .cache
                    .read_feed_item(table, partition_key, feed_key, item_key)
                    .await?;
                if let Some(entity) = &cached {
                    if !is_invalid(&entity.core) {
                        return Ok(cached);
                    }
                }
                let fresh = self
                    .persistent
                    .read_feed_item(table, partition_key, feed_key, item_key)
                    .await?;
                // Repair only an expired marker. A plain miss is never
                // populated: a lone item would materialize a gap.
                if let Some(marker) = &cached {
                    if is_expired(&marker.core) {
                        let repair = match &fresh {
                            Some(fresh) => {
                                let mut entity = fresh.clone();
                                entity.core.custom_etag = entity.core.etag.clone();
                                entity.core.etag = marker.core.etag.clone();
                                Some(Operation::replace_feed_item(
                                    table,
                                    partition_key,
                                    feed_key,
                                    &entity,
                                ))
                            }
                            None => marker.core.etag.as_ref().map(|etag| {
                                Operation::delete_feed_item(
                                    table,
                                    partition_key,
                                    feed_key,
                                    item_key,
                                    etag,
                                )
                            }),
                        };
                        self.run_repair(repair).await;
                    }
                }
                Ok(fresh)
            }
        }
    }

    // ========================================================================
    // Rank-feed reads (cache-only)
    // ========================================================================

    pub async fn query_rank_feed(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<RankFeedEntity>> {
        assert_eq!(table.kind, TableKind::RankFeed, "query_rank_feed requires a rank-feed table");
        self.cache
            .read_rank_feed(table, partition_key, feed_key, start, stop)
            .await
    }

    pub async fn query_rank_feed_score(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> StoreResult<Option<f64>> {
        assert_eq!(
            table.kind,
            TableKind::RankFeed,
            "query_rank_feed_score requires a rank-feed table"
        );
        self.cache
            .read_rank_feed_score(table, partition_key, feed_key, item_key)
            .await
    }

    pub async fn query_rank_feed_length(
        &self,
        table: &Arc<Table>,
        partition_key: &str,
        feed_key: &str,
    ) -> StoreResult<u64> {
        assert_eq!(
            table.kind,
            TableKind::RankFeed,
            "query_rank_feed_length requires a rank-feed table"
        );
        self.cache
            .read_rank_feed_length(table, partition_key, feed_key)
            .await
    }

    // ========================================================================
    // Repair plumbing
    // ========================================================================

    async fn run_repair(&self, repair: Option<Operation>) {
        if let Some(op) = repair {
            if let Err(err) = self.cache.execute(&op).await {
                warn!(table = %op.table.table_name, %err, "cache repair failed");
            }
        }
    }

    async fn run_repairs(&self, repairs: Vec<Operation>) {
        if repairs.is_empty() {
            return;
        }
        let refs: Vec<&Operation> = repairs.iter().collect();
        if let Err(err) = self.cache.execute_batch(&refs).await {
            warn!(%err, "cache repair batch failed");
        }
    }
}

fn is_invalid(core: &EntityCore) -> bool {
    core.cache_flags.contains(CacheFlags::INVALID)
}

/// A marker with no expiry is treated as already expired.
fn is_expired(core: &EntityCore) -> bool {
    core.cache_expiry.map_or(true, |t| t <= Utc::now())
}

/// Repair after an object read-through: insert on a clean miss, replace an
/// expired marker conditionally on its ETag, delete an expired marker whose
/// entity is gone from the source of truth. An unexpired marker is left
/// alone.
fn object_repair(
    table: &Arc<Table>,
    partition_key: &str,
    key: &str,
    cached: Option<&ObjectEntity>,
    fresh: Option<&ObjectEntity>,
) -> Option<Operation> {
    match (cached, fresh) {
        (None, Some(fresh)) => {
            let mut entity = fresh.clone();
            entity.core.custom_etag = entity.core.etag.clone();
            entity.core.etag = None;
            Some(Operation::insert_object(table, partition_key, key, &entity))
        }
        (Some(marker), Some(fresh)) if is_expired(&marker.core) => {
            let mut entity = fresh.clone();
            entity.core.custom_etag = entity.core.etag.clone();
            entity.core.etag = marker.core.etag.clone();
            Some(Operation::replace_object(table, partition_key, key, &entity))
        }
        (Some(marker), None) if is_expired(&marker.core) => marker
            .core
            .etag
            .as_ref()
            .map(|etag| Operation::delete_object(table, partition_key, key, etag)),
        _ => None,
    }
}

fn count_repair(
    table: &Arc<Table>,
    partition_key: &str,
    key: &str,
    cached: Option<&CountEntity>,
    fresh: Option<&CountEntity>,
) -> Option<Operation> {
    match (cached, fresh) {
        (None, Some(fresh)) => {
            let mut op = Operation::insert_count(table, partition_key, key, fresh.value);
            if let Some(entity) = &mut op.entity {
                entity.core_mut().custom_etag = fresh.core.etag.clone();
            }
            Some(op)
        }
        (Some(marker), Some(fresh)) if is_expired(&marker.core) => {
            let mut entity = fresh.clone();
            entity.core.custom_etag = entity.core.etag.clone();
            entity.core.etag = marker.core.etag.clone();
            Some(Operation::replace_count(table, partition_key, key, &entity))
        }
        (Some(marker), None) if is_expired(&marker.core) => marker
            .core
            .etag
            .as_ref()
            .map(|etag| Operation::delete_count(table, partition_key, key, etag)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn object_table() -> Arc<Table> {
        Table::object("app", "a", "Profiles", "p", StorageMode::Default)
    }

    fn marker(expired: bool) -> ObjectEntity {
        let mut entity = ObjectEntity::new("k");
        entity.core.cache_flags.insert(CacheFlags::INVALID);
        entity.core.etag = Some("marker-etag".to_string());
        entity.core.cache_expiry = Some(if expired {
            Utc::now() - Duration::seconds(5)
        } else {
            Utc::now() + Duration::seconds(300)
        });
        entity
    }

    fn fresh() -> ObjectEntity {
        let mut entity = ObjectEntity::new("k");
        entity.core.etag = Some("persisted-etag".to_string());
        entity
    }

    #[test]
    fn test_repair_inserts_on_clean_miss() {
        let t = object_table();
        let fresh = fresh();
        let op = object_repair(&t, "pk", "k", None, Some(&fresh)).unwrap();
        assert_eq!(op.op_type, ctstore_core::OperationType::Insert);
        assert_eq!(
            op.entity.unwrap().core().custom_etag.as_deref(),
            Some("persisted-etag")
        );
    }

    #[test]
    fn test_repair_replaces_expired_marker() {
        let t = object_table();
        let marker = marker(true);
        let fresh = fresh();
        let op = object_repair(&t, "pk", "k", Some(&marker), Some(&fresh)).unwrap();
        assert_eq!(op.op_type, ctstore_core::OperationType::Replace);
        // Precondition is the marker's ETag so a concurrent writer wins.
        assert_eq!(op.etag, "marker-etag");
    }

    #[test]
    fn test_repair_deletes_expired_marker_for_missing_entity() {
        let t = object_table();
        let marker = marker(true);
        let op = object_repair(&t, "pk", "k", Some(&marker), None).unwrap();
        assert_eq!(op.op_type, ctstore_core::OperationType::Delete);
        assert_eq!(op.etag, "marker-etag");
    }

    #[test]
    fn test_no_repair_while_marker_unexpired() {
        let t = object_table();
        let marker = marker(false);
        let fresh = fresh();
        assert!(object_repair(&t, "pk", "k", Some(&marker), Some(&fresh)).is_none());
        assert!(object_repair(&t, "pk", "k", Some(&marker), None).is_none());
    }

    #[test]
    fn test_no_repair_on_double_miss() {
        let t = object_table();
        assert!(object_repair(&t, "pk", "k", None, None).is_none());
    }

    #[test]
    fn test_missing_expiry_counts_as_expired() {
        let mut core = EntityCore::default();
        core.cache_flags.insert(CacheFlags::INVALID);
        assert!(is_expired(&core));
    }
}
