//! Cache-side execution and reads.
//!
//! Writes go through the script compiler so that a whole batch is applied
//! atomically with per-operation preconditions. Reads use the cache's native
//! value shapes directly: hashes for objects and counts, strings for fixed
//! objects, sorted sets for feeds and rank feeds.

use ctstore_core::{
    CountEntity, EntityCore, FeedEntity, FeedOrder, ObjectEntity, Operation, OperationResult,
    OperationType, RankFeedEntity, StoreError, StoreResult, Table, TableKind,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clients::{CacheClient, LexBound, ScriptValue};

use super::codec;
use super::keys::cache_key;
use super::script::{self, NOOP_SENTINEL};

/// Executes operations and reads against the volatile cache.
pub struct CacheBackend<C: CacheClient> {
    client: Arc<C>,
}

impl<C: CacheClient> CacheBackend<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn execute(&self, op: &Operation) -> StoreResult<OperationResult> {
        let mut results = self.execute_batch(&[op]).await?;
        results
            .pop()
            .ok_or_else(|| StoreError::unexpected("empty script result for single operation"))
    }

    /// Execute a batch atomically: either every operation applies or none
    /// does, and the error names the first operation whose precondition
    /// failed.
    pub async fn execute_batch(&self, ops: &[&Operation]) -> StoreResult<Vec<OperationResult>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let script = script::compile(ops)?;
        let values = self.client.run_script(&script).await?;
        decode_script_results(ops, &values)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn read_object(
        &self,
        table: &Table,
        partition_key: &str,
        key: &str,
    ) -> StoreResult<Option<ObjectEntity>> {
        let cache_key = cache_key(table, partition_key, key);
        let Some(map) = self.client.hash_get_all(&cache_key).await? else {
            return Ok(None);
        };
        let core = core_from_hash(partition_key, &map)?;
        Ok(Some(ObjectEntity {
            object_key: key.to_string(),
            core,
        }))
    }

    /// Object read limited to the named custom fields. Bookkeeping fields
    /// are always fetched alongside so the caller can still see markers and
    /// ETags.
    pub async fn read_partial_object(
        &self,
        table: &Table,
        partition_key: &str,
        key: &str,
        fields: &[String],
    ) -> StoreResult<Option<ObjectEntity>> {
        let cache_key = cache_key(table, partition_key, key);
        let mut wanted: Vec<String> = vec![
            codec::ETAG_FIELD.to_string(),
            codec::FLAGS_FIELD.to_string(),
            codec::EXPIRY_FIELD.to_string(),
        ];
        wanted.extend(fields.iter().cloned());
        let Some(map) = self.client.hash_get(&cache_key, &wanted).await? else {
            return Ok(None);
        };
        let core = core_from_hash(partition_key, &map)?;
        Ok(Some(ObjectEntity {
            object_key: key.to_string(),
            core,
        }))
    }

    pub async fn read_fixed_object(
        &self,
        table: &Table,
        partition_key: &str,
        key: &str,
    ) -> StoreResult<Option<ObjectEntity>> {
        let cache_key = cache_key(table, partition_key, key);
        let Some(bytes) = self.client.string_get(&cache_key).await? else {
            return Ok(None);
        };
        let (_, mut core) = codec::decode_entity(&bytes, false)?;
        core.partition_key = partition_key.to_string();
        Ok(Some(ObjectEntity {
            object_key: key.to_string(),
            core,
        }))
    }

    pub async fn read_count(
        &self,
        table: &Table,
        partition_key: &str,
        key: &str,
    ) -> StoreResult<Option<CountEntity>> {
        let cache_key = cache_key(table, partition_key, key);
        let Some(map) = self.client.hash_get_all(&cache_key).await? else {
            return Ok(None);
        };
        let value = match map.get(codec::VALUE_FIELD) {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::unexpected("malformed cached count value"))?;
                f64::from_le_bytes(arr)
            }
            None => 0.0,
        };
        let core = core_from_hash(partition_key, &map)?;
        Ok(Some(CountEntity {
            count_key: key.to_string(),
            value,
            core,
        }))
    }

    /// Page of a feed in iteration order, starting after `cursor` when one
    /// is given.
    pub async fn read_feed(
        &self,
        table: &Table,
        partition_key: &str,
        feed_key: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<FeedEntity>> {
        let cache_key = cache_key(table, partition_key, feed_key);
        let (min, max, reverse) = feed_page_bounds(table.order, cursor);
        let members = self
            .client
            .sorted_set_range_by_lex(&cache_key, &min, &max, limit, reverse)
            .await?;
        members
            .iter()
            .map(|m| feed_entity_from_member(partition_key, feed_key, m))
            .collect()
    }

    pub async fn read_feed_item(
        &self,
        table: &Table,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> StoreResult<Option<FeedEntity>> {
        let cache_key = cache_key(table, partition_key, feed_key);
        let (min, max) = item_probe_bounds(item_key);
        let members = self
            .client
            .sorted_set_range_by_lex(&cache_key, &min, &max, 1, false)
            .await?;
        match members.first() {
            Some(member) => Ok(Some(feed_entity_from_member(
                partition_key,
                feed_key,
                member,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn read_rank_feed(
        &self,
        table: &Table,
        partition_key: &str,
        feed_key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<RankFeedEntity>> {
        let cache_key = cache_key(table, partition_key, feed_key);
        let reverse = table.order == FeedOrder::Descending;
        let members = self
            .client
            .sorted_set_range_by_rank(&cache_key, start, stop, reverse)
            .await?;
        members
            .into_iter()
            .map(|(member, score)| {
                let item_key = String::from_utf8(member)
                    .map_err(|_| StoreError::unexpected("rank-feed member is not UTF-8"))?;
                let mut entity = RankFeedEntity::new(feed_key, item_key, score);
                entity.core.partition_key = partition_key.to_string();
                Ok(entity)
            })
            .collect()
    }

    pub async fn read_rank_feed_score(
        &self,
        table: &Table,
        partition_key: &str,
        feed_key: &str,
        item_key: &str,
    ) -> StoreResult<Option<f64>> {
        let cache_key = cache_key(table, partition_key, feed_key);
        self.client
            .sorted_set_score(&cache_key, item_key.as_bytes())
            .await
    }

    pub async fn read_rank_feed_length(
        &self,
        table: &Table,
        partition_key: &str,
        feed_key: &str,
    ) -> StoreResult<u64> {
        let cache_key = cache_key(table, partition_key, feed_key);
        self.client.sorted_set_length(&cache_key).await
    }
}

/// Lex bounds for one feed page. Ascending feeds walk up from just past the
/// cursor's members; descending feeds walk down from just before them.
fn feed_page_bounds(order: FeedOrder, cursor: Option<&str>) -> (LexBound, LexBound, bool) {
    match (order, cursor) {
        (FeedOrder::Ascending, None) => (LexBound::Min, LexBound::Max, false),
        (FeedOrder::Ascending, Some(c)) => {
            let mut after = c.as_bytes().to_vec();
            after.push(0x01);
            (LexBound::Inclusive(after), LexBound::Max, false)
        }
        (FeedOrder::Descending, None) => (LexBound::Min, LexBound::Max, true),
        (FeedOrder::Descending, Some(c)) => {
            let mut before = c.as_bytes().to_vec();
            before.push(0x00);
            (LexBound::Min, LexBound::Exclusive(before), true)
        }
    }
}

/// Lex bounds covering exactly the members of one item key.
fn item_probe_bounds(item_key: &str) -> (LexBound, LexBound) {
    let mut low = item_key.as_bytes().to_vec();
    low.push(0x00);
    let mut high = item_key.as_bytes().to_vec();
    high.push(0x01);
    (LexBound::Inclusive(low), LexBound::Exclusive(high))
}

fn feed_entity_from_member(
    partition_key: &str,
    feed_key: &str,
    member: &[u8],
) -> StoreResult<FeedEntity> {
    let (item_key, mut core) = codec::decode_entity(member, true)?;
    let item_key =
        item_key.ok_or_else(|| StoreError::unexpected("feed member is missing its item key"))?;
    core.partition_key = partition_key.to_string();
    Ok(FeedEntity {
        feed_key: feed_key.to_string(),
        cursor: item_key.clone(),
        item_key,
        core,
    })
}

/// Rebuild entity bookkeeping from the hash representation.
fn core_from_hash(
    partition_key: &str,
    map: &BTreeMap<String, Vec<u8>>,
) -> StoreResult<EntityCore> {
    let mut core = EntityCore {
        partition_key: partition_key.to_string(),
        ..Default::default()
    };
    for (name, bytes) in map {
        match name.as_str() {
            codec::ETAG_FIELD => {
                let etag = std::str::from_utf8(bytes)
                    .map_err(|_| StoreError::unexpected("cached etag is not UTF-8"))?;
                core.etag = Some(etag.to_string());
            }
            codec::FLAGS_FIELD => {
                let byte = bytes
                    .first()
                    .ok_or_else(|| StoreError::unexpected("empty cached flags field"))?;
                core.cache_flags = ctstore_core::CacheFlags::from_bits(*byte);
            }
            codec::EXPIRY_FIELD => {
                core.cache_expiry = Some(codec::decode_expiry(bytes)?);
            }
            codec::VALUE_FIELD => {}
            _ => {
                core.fields
                    .insert(name.clone(), codec::decode_field(bytes)?);
            }
        }
    }
    Ok(core)
}

/// Decode a script result array back into per-operation results.
///
/// Shape: `[Int(1), slot per action]` on success, `[Int(error_code),
/// Int(failure_code)]` on a failed condition where `error_code` is
/// `-(operation index + 1)`.
pub(crate) fn decode_script_results(
    ops: &[&Operation],
    values: &[ScriptValue],
) -> StoreResult<Vec<OperationResult>> {
    let status = values
        .first()
        .and_then(ScriptValue::as_int)
        .ok_or_else(|| StoreError::unexpected("script result missing status slot"))?;

    if status != 1 {
        if status >= 0 {
            return Err(StoreError::unexpected(format!(
                "script returned unknown status {status}"
            )));
        }
        let index = usize::try_from(-status - 1)
            .map_err(|_| StoreError::unexpected("script error code out of range"))?;
        let failure_code = values
            .get(1)
            .and_then(ScriptValue::as_int)
            .ok_or_else(|| StoreError::unexpected("script abort missing failure kind"))?;
        let kind = ctstore_core::FailureKind::from_code(failure_code).ok_or_else(|| {
            StoreError::unexpected(format!("script returned unknown failure kind {failure_code}"))
        })?;
        return Err(kind.to_error(index));
    }

    if values.len() != ops.len() + 1 {
        return Err(StoreError::unexpected(format!(
            "script returned {} slots for {} operations",
            values.len() - 1,
            ops.len()
        )));
    }
    ops.iter()
        .zip(&values[1..])
        .map(|(op, slot)| decode_slot(op, slot))
        .collect()
}

fn decode_slot(op: &Operation, slot: &ScriptValue) -> StoreResult<OperationResult> {
    let wrong_shape = || {
        StoreError::unexpected(format!(
            "script slot has wrong shape for {:?}: {slot:?}",
            op.op_type
        ))
    };

    match op.op_type {
        OperationType::DeleteIfExists => {
            let n = slot.as_int().ok_or_else(wrong_shape)?;
            if n > 0 {
                Ok(OperationResult {
                    etag: None,
                    entities_affected: n as u32,
                    value: None,
                })
            } else {
                Ok(OperationResult::noop())
            }
        }
        OperationType::Delete => {
            slot.as_int().ok_or_else(wrong_shape)?;
            Ok(OperationResult::affected(None))
        }
        OperationType::Increment | OperationType::InsertOrIncrement => {
            let data = slot.as_data().ok_or_else(wrong_shape)?;
            let text = std::str::from_utf8(data).map_err(|_| wrong_shape())?;
            if op.table.kind == TableKind::RankFeed {
                let score: f64 = text.parse().map_err(|_| wrong_shape())?;
                Ok(OperationResult::with_value(None, score))
            } else {
                // Counts return "value,etag" so one slot carries both.
                let (value, etag) = text.split_once(',').ok_or_else(wrong_shape)?;
                let value: f64 = value.parse().map_err(|_| wrong_shape())?;
                Ok(OperationResult::with_value(Some(etag.to_string()), value))
            }
        }
        OperationType::InsertOrReplaceIfNotLast | OperationType::InsertIfNotEmpty => {
            let data = slot.as_data().ok_or_else(wrong_shape)?;
            if data == NOOP_SENTINEL {
                return Ok(OperationResult::noop());
            }
            let etag = std::str::from_utf8(data).map_err(|_| wrong_shape())?;
            Ok(OperationResult::affected(Some(etag.to_string())))
        }
        OperationType::Insert
        | OperationType::Replace
        | OperationType::Merge
        | OperationType::InsertOrReplace
        | OperationType::InsertOrMerge => {
            if op.table.kind == TableKind::RankFeed {
                let data = slot.as_data().ok_or_else(wrong_shape)?;
                let text = std::str::from_utf8(data).map_err(|_| wrong_shape())?;
                let score: f64 = text.parse().map_err(|_| wrong_shape())?;
                return Ok(OperationResult::with_value(None, score));
            }
            let data = slot.as_data().ok_or_else(wrong_shape)?;
            let etag = std::str::from_utf8(data).map_err(|_| wrong_shape())?;
            Ok(OperationResult::affected(Some(etag.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctstore_core::{ObjectEntity, StorageMode};

    fn object_table() -> Arc<Table> {
        Table::object("app", "a", "Profiles", "p", StorageMode::Default)
    }

    fn count_table() -> Arc<Table> {
        Table::count("app", "a", "Likes", "l", StorageMode::Default)
    }

    #[test]
    fn test_decode_success_array() {
        let table = object_table();
        let op = Operation::insert_object(&table, "pk", "k", &ObjectEntity::new("k"));
        let values = vec![ScriptValue::Int(1), ScriptValue::Data(b"etag-1".to_vec())];
        let results = decode_script_results(&[&op], &values).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].etag.as_deref(), Some("etag-1"));
        assert_eq!(results[0].entities_affected, 1);
    }

    #[test]
    fn test_decode_abort_reconstructs_indexed_error() {
        let table = object_table();
        let op1 = Operation::insert_object(&table, "pk", "k1", &ObjectEntity::new("k1"));
        let op2 = Operation::insert_object(&table, "pk", "k2", &ObjectEntity::new("k2"));
        // Second operation's condition failed with a conflict.
        let values = vec![ScriptValue::Int(-2), ScriptValue::Int(1)];
        let err = decode_script_results(&[&op1, &op2], &values).unwrap_err();
        assert_eq!(err, StoreError::Conflict { operation_index: 1 });
    }

    #[test]
    fn test_decode_count_increment_composite() {
        let table = count_table();
        let op = Operation::increment_count(&table, "pk", "k", 2.0);
        let values = vec![
            ScriptValue::Int(1),
            ScriptValue::Data(b"7,etag-9".to_vec()),
        ];
        let results = decode_script_results(&[&op], &values).unwrap();
        assert_eq!(results[0].value, Some(7.0));
        assert_eq!(results[0].etag.as_deref(), Some("etag-9"));
    }

    #[test]
    fn test_decode_delete_if_exists_counts() {
        let table = object_table();
        let op = Operation::delete_object_if_exists(&table, "pk", "k");
        let hit = decode_script_results(&[&op], &[ScriptValue::Int(1), ScriptValue::Int(1)])
            .unwrap();
        assert_eq!(hit[0].entities_affected, 1);
        let miss = decode_script_results(&[&op], &[ScriptValue::Int(1), ScriptValue::Int(0)])
            .unwrap();
        assert!(miss[0].is_noop());
    }

    #[test]
    fn test_decode_guarded_feed_noop() {
        let table = Table::feed(
            "app",
            "a",
            "Posts",
            "o",
            StorageMode::Default,
            0,
            FeedOrder::Ascending,
        );
        let entity = FeedEntity::new("feed", "i1");
        let op = Operation::insert_feed_item_if_not_empty(&table, "pk", "feed", &entity);
        let values = vec![
            ScriptValue::Int(1),
            ScriptValue::Data(NOOP_SENTINEL.to_vec()),
        ];
        let results = decode_script_results(&[&op], &values).unwrap();
        assert!(results[0].is_noop());
    }

    #[test]
    fn test_decode_rejects_wrong_slot_count() {
        let table = object_table();
        let op = Operation::insert_object(&table, "pk", "k", &ObjectEntity::new("k"));
        let err = decode_script_results(&[&op], &[ScriptValue::Int(1)]).unwrap_err();
        assert!(matches!(err, StoreError::Unexpected { .. }));
    }

    #[test]
    fn test_feed_page_bounds_follow_order() {
        let (min, max, reverse) = feed_page_bounds(FeedOrder::Ascending, Some("c"));
        assert_eq!(min, LexBound::Inclusive(vec![b'c', 0x01]));
        assert_eq!(max, LexBound::Max);
        assert!(!reverse);

        let (min, max, reverse) = feed_page_bounds(FeedOrder::Descending, Some("c"));
        assert_eq!(min, LexBound::Min);
        assert_eq!(max, LexBound::Exclusive(vec![b'c', 0x00]));
        assert!(reverse);
    }

    #[test]
    fn test_item_probe_bounds_cover_only_that_key() {
        let (min, max) = item_probe_bounds("it");
        let member = codec::encode_entity(&EntityCore::default(), Some("it"));
        assert!(min.admits_from_below(&member));
        assert!(max.admits_from_above(&member));

        let other = codec::encode_entity(&EntityCore::default(), Some("it2"));
        assert!(!(min.admits_from_below(&other) && max.admits_from_above(&other)));
    }
}
