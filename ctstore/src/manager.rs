//! Execution manager.
//!
//! Dispatches operations and transactions by storage mode and drives the
//! strong-consistency protocol for Default-mode tables:
//!
//! 1. Pre-phase: mark the cache entry invalid with an expiry, via an upsert
//!    that never disturbs a feed's pagination boundary. Inserts skip this
//!    phase, there is nothing to invalidate yet.
//! 2. Commit: execute the real operation against the persistent store.
//! 3. On failure: best-effort rollback of the invalidation marker; the
//!    commit error is what propagates.
//! 4. On success: best-effort post-operation bringing the cache in line
//!    with the new persistent state.
//!
//! Pre- and post-phase cache failures are logged and swallowed; the cache
//! is allowed to stay stale and a later read-through repairs it. There is
//! no cross-operation lock: a concurrent reader may observe the invalidated
//! intermediate state, and the `Invalid` flag tells it to ask the source of
//! truth instead of blocking.

use chrono::{DateTime, Utc};
use ctstore_core::{
    CountEntity, FeedEntity, ObjectEntity, Operation, OperationResult, OperationType, StoreConfig,
    StoreEntity, StoreError, StoreResult, StorageMode, TableKind, Transaction, ETAG_ANY,
};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::CacheBackend;
use crate::clients::{CacheClient, PersistentClient};
use crate::persistent::PersistentBackend;

pub struct ExecutionManager<P: PersistentClient, C: CacheClient> {
    persistent: Arc<PersistentBackend<P>>,
    cache: Arc<CacheBackend<C>>,
    config: StoreConfig,
}

impl<P: PersistentClient, C: CacheClient> ExecutionManager<P, C> {
    pub fn new(
        persistent: Arc<PersistentBackend<P>>,
        cache: Arc<CacheBackend<C>>,
        config: StoreConfig,
    ) -> Self {
        Self {
            persistent,
            cache,
            config,
        }
    }

    pub async fn execute(&self, op: &Operation) -> StoreResult<OperationResult> {
        match op.table.storage_mode {
            StorageMode::CacheOnly => {
                let op = stamp_synthetic_etag(op);
                self.cache.execute(&op).await
            }
            StorageMode::PersistentOnly => {
                reject_cache_primitives(op)?;
                self.persistent.execute(op).await
            }
            StorageMode::Default => self.execute_strong(op).await,
        }
    }

    pub async fn execute_transaction(
        &self,
        txn: &Transaction,
    ) -> StoreResult<Vec<OperationResult>> {
        if txn.is_empty() {
            return Ok(Vec::new());
        }
        let split = txn.split_by_mode();
        if !split.cache_only.is_empty() {
            // The transaction invariant guarantees all-or-nothing modes.
            let stamped: Vec<Operation> =
                txn.operations().iter().map(stamp_synthetic_etag).collect();
            let refs: Vec<&Operation> = stamped.iter().collect();
            return self.cache.execute_batch(&refs).await;
        }
        self.execute_strong_transaction(txn).await
    }

    // ========================================================================
    // Strong protocol, single operation
    // ========================================================================

    async fn execute_strong(&self, op: &Operation) -> StoreResult<OperationResult> {
        reject_cache_primitives(op)?;

        let expiry = Utc::now() + self.expiry_window();
        let pre = pre_operation(op, expiry)?;
        let pre_result = match &pre {
            Some(pre_op) => match self.cache.execute(pre_op).await {
                Ok(result) => Some(result),
                Err(err) => {
                    warn!(table = %op.table.table_name, %err, "cache pre-operation failed");
                    None
                }
            },
            None => None,
        };

        match self.persistent.execute(op).await {
            Ok(result) => {
                if let Some(post) = post_operation(op, &result, pre_result.as_ref()) {
                    if let Err(err) = self.cache.execute(&post).await {
                        warn!(table = %op.table.table_name, %err, "cache post-operation failed");
                    }
                }
                Ok(result)
            }
            Err(commit_err) => {
                if let Some(rb) = rollback_operation(op, pre_result.as_ref()) {
                    if let Err(err) = self.cache.execute(&rb).await {
                        warn!(table = %op.table.table_name, %err, "cache rollback failed");
                    }
                }
                Err(commit_err)
            }
        }
    }

    // ========================================================================
    // Strong protocol, transaction
    // ========================================================================

    async fn execute_strong_transaction(
        &self,
        txn: &Transaction,
    ) -> StoreResult<Vec<OperationResult>> {
        for op in txn.operations() {
            reject_cache_primitives(op)?;
        }

        let expiry = Utc::now() + self.expiry_window();

        // Pre-ops aligned by index with the transaction's operations; None
        // for persistent-only members and inserts.
        let mut pre_ops: Vec<Option<Operation>> = Vec::with_capacity(txn.len());
        for op in txn.operations() {
            let pre = if op.table.storage_mode == StorageMode::Default {
                pre_operation(op, expiry)?
            } else {
                None
            };
            pre_ops.push(pre);
        }

        let mut pre_results: Vec<Option<OperationResult>> = vec![None; txn.len()];
        let live: Vec<(usize, &Operation)> = pre_ops
            .iter()
            .enumerate()
            .filter_map(|(i, pre)| pre.as_ref().map(|p| (i, p)))
            .collect();
        if !live.is_empty() {
            let refs: Vec<&Operation> = live.iter().map(|(_, p)| *p).collect();
            match self.cache.execute_batch(&refs).await {
                Ok(results) => {
                    for ((i, _), result) in live.iter().zip(results) {
                        pre_results[*i] = Some(result);
                    }
                }
                Err(err) => {
                    warn!(%err, "cache pre-phase batch failed");
                }
            }
        }

        let ops: Vec<&Operation> = txn.operations().iter().collect();
        match self.persistent.execute_batch(&ops).await {
            Ok(results) => {
                let posts: Vec<Operation> = txn
                    .operations()
                    .iter()
                    .zip(&results)
                    .zip(&pre_results)
                    .filter(|((op, _), _)| op.table.storage_mode == StorageMode::Default)
                    .filter_map(|((op, result), pre)| post_operation(op, result, pre.as_ref()))
                    .collect();
                if !posts.is_empty() {
                    let refs: Vec<&Operation> = posts.iter().collect();
                    if let Err(err) = self.cache.execute_batch(&refs).await {
                        warn!(%err, "cache post-phase batch failed");
                    }
                }
                Ok(results)
            }
            Err(commit_err) => {
                let rollbacks: Vec<Operation> = txn
                    .operations()
                    .iter()
                    .zip(&pre_results)
                    .filter(|(op, _)| op.table.storage_mode == StorageMode::Default)
                    .filter_map(|(op, pre)| rollback_operation(op, pre.as_ref()))
                    .collect();
                if !rollbacks.is_empty() {
                    let refs: Vec<&Operation> = rollbacks.iter().collect();
                    if let Err(err) = self.cache.execute_batch(&refs).await {
                        warn!(%err, "cache rollback batch failed");
                    }
                }
                Err(commit_err)
            }
        }
    }

    fn expiry_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.cache_expiry)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }
}

// ============================================================================
// Protocol operation synthesis
// ============================================================================

/// The two feed-only primitives exist for the protocol's own cache writes;
/// callers cannot route them through the persistent store.
fn reject_cache_primitives(op: &Operation) -> StoreResult<()> {
    if op.op_type == OperationType::InsertIfNotEmpty {
        return Err(StoreError::BadRequest {
            operation_index: 0,
            reason: "InsertIfNotEmpty is a cache-consistency primitive and requires a \
                     cache-only table"
                .to_string(),
        });
    }
    Ok(())
}

/// Clone with a fresh staged ETag on ETag-bearing entities; the cache is
/// the sole source of truth for cache-only tables and mints its own ETags.
fn stamp_synthetic_etag(op: &Operation) -> Operation {
    let mut op = op.clone();
    if let Some(entity) = &mut op.entity {
        if !matches!(entity, StoreEntity::RankFeed(_)) {
            entity.core_mut().custom_etag = Some(Uuid::new_v4().to_string());
        }
    }
    op
}

/// Invalidation marker for one operation's cache entry.
fn marker_entity(op: &Operation, expiry: DateTime<Utc>) -> StoreResult<StoreEntity> {
    let mut core = ctstore_core::EntityCore::default();
    core.cache_flags.insert(ctstore_core::CacheFlags::INVALID);
    core.cache_expiry = Some(expiry);
    core.custom_etag = Some(Uuid::new_v4().to_string());

    match op.table.kind {
        TableKind::Object | TableKind::FixedObject => Ok(StoreEntity::Object(ObjectEntity {
            object_key: op.key.clone(),
            core,
        })),
        TableKind::Count => Ok(StoreEntity::Count(CountEntity {
            count_key: op.key.clone(),
            value: 0.0,
            core,
        })),
        TableKind::Feed | TableKind::MutableFeed => {
            let item_key = op.item_key.clone().ok_or_else(|| {
                StoreError::unexpected("feed operation is missing its item key")
            })?;
            Ok(StoreEntity::Feed(FeedEntity {
                feed_key: op.key.clone(),
                cursor: item_key.clone(),
                item_key,
                core,
            }))
        }
        TableKind::RankFeed => Err(StoreError::unexpected(
            "rank feeds are cache-only and never reach the strong protocol",
        )),
    }
}

/// Pre-phase invalidation upsert, or `None` for inserts.
fn pre_operation(op: &Operation, expiry: DateTime<Utc>) -> StoreResult<Option<Operation>> {
    if op.op_type.is_insert() {
        return Ok(None);
    }
    let op_type = if op.table.kind.is_feed() {
        OperationType::InsertOrReplaceIfNotLast
    } else {
        OperationType::InsertOrReplace
    };
    let mut pre = op.with_op_type(op_type);
    pre.etag = ETAG_ANY.to_string();
    pre.entity = Some(marker_entity(op, expiry)?);
    pre.score = 0.0;
    Ok(Some(pre))
}

/// Rollback for a failed commit. Feeds cannot drop their marker without
/// breaking cursor contiguity, so they re-mark it already expired; other
/// kinds delete the marker conditionally on its captured ETag.
fn rollback_operation(op: &Operation, pre_result: Option<&OperationResult>) -> Option<Operation> {
    let pre_result = pre_result?;
    if pre_result.is_noop() {
        return None;
    }
    if op.table.kind.is_feed() {
        let expired = DateTime::<Utc>::UNIX_EPOCH;
        let mut rb = op.with_op_type(OperationType::InsertOrReplaceIfNotLast);
        rb.etag = ETAG_ANY.to_string();
        rb.entity = Some(marker_entity(op, expired).ok()?);
        rb.score = 0.0;
        Some(rb)
    } else {
        let etag = pre_result.etag.clone()?;
        let mut rb = op.with_op_type(OperationType::Delete);
        rb.etag = etag;
        rb.entity = None;
        rb.score = 0.0;
        Some(rb)
    }
}

/// Post-phase cache write after a successful commit, or `None` when the
/// cache cannot be brought in line safely (the marker then stands until a
/// read-through repairs it).
fn post_operation(
    op: &Operation,
    commit: &OperationResult,
    pre_result: Option<&OperationResult>,
) -> Option<Operation> {
    match op.op_type {
        OperationType::Insert => {
            let mut post = if op.table.kind.is_feed() {
                // A fresh item must not materialize a truncated feed prefix.
                op.with_op_type(OperationType::InsertIfNotEmpty)
            } else {
                op.clone()
            };
            post.etag = ETAG_ANY.to_string();
            if let Some(entity) = &mut post.entity {
                entity.core_mut().custom_etag = commit.etag.clone();
            }
            Some(post)
        }
        OperationType::Replace
        | OperationType::InsertOrReplace
        | OperationType::InsertOrReplaceIfNotLast => {
            // Replace conditionally on the marker's ETag; if the pre-phase
            // did not land there is nothing safe to replace.
            let marker_etag = pre_result?.etag.clone()?;
            let mut post = op.with_op_type(OperationType::Replace);
            post.etag = marker_etag;
            if let Some(entity) = &mut post.entity {
                entity.core_mut().custom_etag = commit.etag.clone();
            }
            Some(post)
        }
        // A merge payload is partial; writing it to the cache as the full
        // entity would drop fields. The marker stays and the next
        // read-through repairs from the source of truth.
        OperationType::Merge | OperationType::InsertOrMerge => None,
        OperationType::Delete | OperationType::DeleteIfExists => {
            let mut post = op.with_op_type(OperationType::DeleteIfExists);
            post.etag = ETAG_ANY.to_string();
            post.entity = None;
            Some(post)
        }
        OperationType::Increment | OperationType::InsertOrIncrement => {
            let marker_etag = pre_result?.etag.clone()?;
            let value = commit.value?;
            let mut entity = CountEntity::new(&op.key, value);
            entity.core.custom_etag = commit.etag.clone();
            let mut post = op.with_op_type(OperationType::Replace);
            post.etag = marker_etag;
            post.entity = Some(StoreEntity::Count(entity));
            post.score = 0.0;
            Some(post)
        }
        OperationType::InsertIfNotEmpty => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctstore_core::{CacheFlags, FeedOrder, Table};

    fn object_table() -> Arc<Table> {
        Table::object("app", "a", "Profiles", "p", StorageMode::Default)
    }

    fn feed_table() -> Arc<Table> {
        Table::feed(
            "app",
            "a",
            "Posts",
            "o",
            StorageMode::Default,
            20,
            FeedOrder::Ascending,
        )
    }

    fn count_table() -> Arc<Table> {
        Table::count("app", "a", "Likes", "l", StorageMode::Default)
    }

    #[test]
    fn test_insert_has_no_pre_operation() {
        let t = object_table();
        let op = Operation::insert_object(&t, "pk", "k", &ObjectEntity::new("k"));
        assert!(pre_operation(&op, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_pre_operation_marks_invalid_with_expiry() {
        let t = object_table();
        let op = Operation::replace_object(&t, "pk", "k", &ObjectEntity::new("k"));
        let expiry = Utc::now();
        let pre = pre_operation(&op, expiry).unwrap().unwrap();

        assert_eq!(pre.op_type, OperationType::InsertOrReplace);
        assert_eq!(pre.etag, ETAG_ANY);
        let core = pre.entity.as_ref().unwrap().core();
        assert!(core.cache_flags.contains(CacheFlags::INVALID));
        assert_eq!(core.cache_expiry, Some(expiry));
        assert!(core.custom_etag.is_some());
    }

    #[test]
    fn test_feed_pre_operation_uses_unless_last() {
        let t = feed_table();
        let entity = FeedEntity::new("feed", "item");
        let op = Operation::replace_feed_item(&t, "pk", "feed", &entity);
        let pre = pre_operation(&op, Utc::now()).unwrap().unwrap();
        assert_eq!(pre.op_type, OperationType::InsertOrReplaceIfNotLast);
        assert_eq!(pre.item_key.as_deref(), Some("item"));
    }

    #[test]
    fn test_rollback_deletes_marker_by_captured_etag() {
        let t = object_table();
        let op = Operation::replace_object(&t, "pk", "k", &ObjectEntity::new("k"));
        let pre_result = OperationResult::affected(Some("marker-etag".to_string()));
        let rb = rollback_operation(&op, Some(&pre_result)).unwrap();
        assert_eq!(rb.op_type, OperationType::Delete);
        assert_eq!(rb.etag, "marker-etag");
        assert!(rb.entity.is_none());
    }

    #[test]
    fn test_feed_rollback_remarks_already_expired() {
        let t = feed_table();
        let entity = FeedEntity::new("feed", "item");
        let op = Operation::replace_feed_item(&t, "pk", "feed", &entity);
        let pre_result = OperationResult::affected(Some("marker-etag".to_string()));
        let rb = rollback_operation(&op, Some(&pre_result)).unwrap();
        assert_eq!(rb.op_type, OperationType::InsertOrReplaceIfNotLast);
        let core = rb.entity.as_ref().unwrap().core();
        assert_eq!(core.cache_expiry, Some(DateTime::<Utc>::UNIX_EPOCH));
    }

    #[test]
    fn test_rollback_skipped_without_pre_result() {
        let t = object_table();
        let op = Operation::replace_object(&t, "pk", "k", &ObjectEntity::new("k"));
        assert!(rollback_operation(&op, None).is_none());
        assert!(rollback_operation(&op, Some(&OperationResult::noop())).is_none());
    }

    #[test]
    fn test_post_insert_stamps_committed_etag() {
        let t = object_table();
        let op = Operation::insert_object(&t, "pk", "k", &ObjectEntity::new("k"));
        let commit = OperationResult::affected(Some("persisted".to_string()));
        let post = post_operation(&op, &commit, None).unwrap();
        assert_eq!(post.op_type, OperationType::Insert);
        assert_eq!(
            post.entity.unwrap().core().custom_etag.as_deref(),
            Some("persisted")
        );
    }

    #[test]
    fn test_post_feed_insert_guards_against_truncated_prefix() {
        let t = feed_table();
        let entity = FeedEntity::new("feed", "item");
        let op = Operation::insert_feed_item(&t, "pk", "feed", &entity);
        let commit = OperationResult::affected(Some("persisted".to_string()));
        let post = post_operation(&op, &commit, None).unwrap();
        assert_eq!(post.op_type, OperationType::InsertIfNotEmpty);
    }

    #[test]
    fn test_post_replace_preconditions_on_marker() {
        let t = object_table();
        let op = Operation::replace_object(&t, "pk", "k", &ObjectEntity::new("k"));
        let commit = OperationResult::affected(Some("persisted".to_string()));
        let pre = OperationResult::affected(Some("marker-etag".to_string()));
        let post = post_operation(&op, &commit, Some(&pre)).unwrap();
        assert_eq!(post.op_type, OperationType::Replace);
        assert_eq!(post.etag, "marker-etag");

        // Without a landed marker the post-op is skipped.
        assert!(post_operation(&op, &commit, None).is_none());
    }

    #[test]
    fn test_post_merge_is_skipped() {
        let t = object_table();
        let op = Operation::merge_object(&t, "pk", "k", &ObjectEntity::new("k"));
        let commit = OperationResult::affected(Some("persisted".to_string()));
        let pre = OperationResult::affected(Some("marker-etag".to_string()));
        assert!(post_operation(&op, &commit, Some(&pre)).is_none());
    }

    #[test]
    fn test_post_increment_replaces_with_committed_value() {
        let t = count_table();
        let op = Operation::increment_count(&t, "pk", "k", 2.0);
        let commit = OperationResult::with_value(Some("persisted".to_string()), 7.0);
        let pre = OperationResult::affected(Some("marker-etag".to_string()));
        let post = post_operation(&op, &commit, Some(&pre)).unwrap();
        assert_eq!(post.op_type, OperationType::Replace);
        assert_eq!(post.etag, "marker-etag");
        let count = post.entity.unwrap();
        assert_eq!(count.as_count().unwrap().value, 7.0);
    }

    #[test]
    fn test_post_delete_is_tolerant() {
        let t = object_table();
        let op = Operation::delete_object(&t, "pk", "k", "v1");
        let commit = OperationResult::affected(None);
        let post = post_operation(&op, &commit, None).unwrap();
        assert_eq!(post.op_type, OperationType::DeleteIfExists);
        assert_eq!(post.etag, ETAG_ANY);
    }

    #[test]
    fn test_synthetic_etag_stamping() {
        let t = Table::object("app", "a", "Sessions", "e", StorageMode::CacheOnly);
        let op = Operation::insert_object(&t, "pk", "k", &ObjectEntity::new("k"));
        let stamped = stamp_synthetic_etag(&op);
        assert!(stamped
            .entity
            .as_ref()
            .unwrap()
            .core()
            .custom_etag
            .is_some());
        // The original operation is untouched.
        assert!(op.entity.as_ref().unwrap().core().custom_etag.is_none());
    }
}
