//! In-memory reference clients.
//!
//! Ship in the crate proper so embedders and tests can run the full store
//! without real backends. `MemoryPersistentClient` models the table store's
//! conditional writes and atomic batches over sorted rows;
//! `MemoryCacheClient` models the cache's hash / string / sorted-set values
//! and interprets compiled scripts with the same contract a wire client
//! must provide: conditions before any action, no partial effects.

use async_trait::async_trait;
use ctstore_core::{FieldValue, StoreError, StoreResult};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::codec;
use crate::cache::script::{Action, CacheScript, Check, Trim};
use crate::cache::NOOP_SENTINEL;
use crate::clients::{
    CacheClient, LexBound, PersistentClient, PersistentRow, PersistentWrite, ScriptValue,
    WriteKind,
};

// ============================================================================
// Persistent client
// ============================================================================

#[derive(Debug, Clone)]
struct StoredRow {
    etag: String,
    fields: BTreeMap<String, FieldValue>,
}

type Container = BTreeMap<(String, String), StoredRow>;

/// BTreeMap-backed persistent table store with conditional writes, atomic
/// batches and row-key-ordered range reads.
#[derive(Default)]
pub struct MemoryPersistentClient {
    containers: Mutex<HashMap<String, Container>>,
}

impl MemoryPersistentClient {
    pub fn new() -> Self {
        Self::default()
    }
}

fn etag_admits(precondition: &str, stored: &str) -> bool {
    precondition == ctstore_core::ETAG_ANY || precondition == stored
}

fn apply_write(
    container: &mut Container,
    write: &PersistentWrite,
    index: usize,
) -> StoreResult<Option<String>> {
    let key = (
        write.row.partition_key.clone(),
        write.row.row_key.clone(),
    );
    match &write.kind {
        WriteKind::Insert => {
            if container.contains_key(&key) {
                return Err(StoreError::Conflict {
                    operation_index: index,
                });
            }
            let etag = Uuid::new_v4().to_string();
            container.insert(
                key,
                StoredRow {
                    etag: etag.clone(),
                    fields: write.row.fields.clone(),
                },
            );
            Ok(Some(etag))
        }
        WriteKind::Replace { etag } | WriteKind::Merge { etag } => {
            let row = container.get_mut(&key).ok_or(StoreError::NotFound {
                operation_index: index,
            })?;
            if !etag_admits(etag, &row.etag) {
                return Err(StoreError::PreconditionFailed {
                    operation_index: index,
                });
            }
            if matches!(write.kind, WriteKind::Replace { .. }) {
                row.fields = write.row.fields.clone();
            } else {
                row.fields.extend(write.row.fields.clone());
            }
            row.etag = Uuid::new_v4().to_string();
            Ok(Some(row.etag.clone()))
        }
        WriteKind::InsertOrReplace | WriteKind::InsertOrMerge => {
            let etag = Uuid::new_v4().to_string();
            match container.get_mut(&key) {
                Some(row) => {
                    if matches!(write.kind, WriteKind::InsertOrReplace) {
                        row.fields = write.row.fields.clone();
                    } else {
                        row.fields.extend(write.row.fields.clone());
                    }
                    row.etag = etag.clone();
                }
                None => {
                    container.insert(
                        key,
                        StoredRow {
                            etag: etag.clone(),
                            fields: write.row.fields.clone(),
                        },
                    );
                }
            }
            Ok(Some(etag))
        }
        WriteKind::Delete { etag } => {
            let row = container.get(&key).ok_or(StoreError::NotFound {
                operation_index: index,
            })?;
            if !etag_admits(etag, &row.etag) {
                return Err(StoreError::PreconditionFailed {
                    operation_index: index,
                });
            }
            container.remove(&key);
            Ok(None)
        }
    }
}

#[async_trait]
impl PersistentClient for MemoryPersistentClient {
    async fn create_container(&self, name: &str) -> StoreResult<bool> {
        let mut containers = self.containers.lock().await;
        if containers.contains_key(name) {
            return Ok(false);
        }
        containers.insert(name.to_string(), Container::new());
        Ok(true)
    }

    async fn delete_container(&self, name: &str) -> StoreResult<bool> {
        Ok(self.containers.lock().await.remove(name).is_some())
    }

    async fn execute(&self, write: &PersistentWrite) -> StoreResult<Option<String>> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .entry(write.container.clone())
            .or_default();
        apply_write(container, write, 0)
    }

    async fn execute_batch(&self, writes: &[PersistentWrite]) -> StoreResult<Vec<Option<String>>> {
        let mut containers = self.containers.lock().await;
        let name = match writes.first() {
            Some(w) => w.container.clone(),
            None => return Ok(Vec::new()),
        };
        let container = containers.entry(name).or_default();
        // Apply to a copy so a mid-batch failure leaves nothing behind.
        let mut staged = container.clone();
        let mut etags = Vec::with_capacity(writes.len());
        for (index, write) in writes.iter().enumerate() {
            etags.push(apply_write(&mut staged, write, index)?);
        }
        *container = staged;
        Ok(etags)
    }

    async fn point_read(
        &self,
        container: &str,
        partition_key: &str,
        row_key: &str,
        projection: Option<&[String]>,
    ) -> StoreResult<Option<PersistentRow>> {
        let containers = self.containers.lock().await;
        let Some(container) = containers.get(container) else {
            return Ok(None);
        };
        let key = (partition_key.to_string(), row_key.to_string());
        Ok(container.get(&key).map(|row| {
            let fields = match projection {
                Some(names) => row
                    .fields
                    .iter()
                    .filter(|(name, _)| names.contains(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
                None => row.fields.clone(),
            };
            PersistentRow {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
                etag: Some(row.etag.clone()),
                fields,
            }
        }))
    }

    async fn range_read(
        &self,
        container: &str,
        partition_key: &str,
        start_row_key_exclusive: &str,
        end_row_key_exclusive: &str,
        limit: usize,
    ) -> StoreResult<Vec<PersistentRow>> {
        let containers = self.containers.lock().await;
        let Some(container) = containers.get(container) else {
            return Ok(Vec::new());
        };
        let start = (
            partition_key.to_string(),
            start_row_key_exclusive.to_string(),
        );
        let rows = container
            .range(start..)
            .filter(|((pk, rk), _)| {
                pk == partition_key
                    && rk.as_str() > start_row_key_exclusive
                    && rk.as_str() < end_row_key_exclusive
            })
            .take(limit)
            .map(|((pk, rk), row)| PersistentRow {
                partition_key: pk.clone(),
                row_key: rk.clone(),
                etag: Some(row.etag.clone()),
                fields: row.fields.clone(),
            })
            .collect();
        Ok(rows)
    }
}

// ============================================================================
// Cache client
// ============================================================================

#[derive(Debug, Clone)]
enum CacheValue {
    Hash(BTreeMap<String, Vec<u8>>),
    Blob(Vec<u8>),
    /// Sorted set: member bytes to score, iterated lexicographically.
    Zset(BTreeMap<Vec<u8>, f64>),
}

/// Hash / string / sorted-set value store with a script interpreter.
#[derive(Default)]
pub struct MemoryCacheClient {
    values: Mutex<HashMap<String, CacheValue>>,
}

impl MemoryCacheClient {
    pub fn new() -> Self {
        Self::default()
    }
}

type Values = HashMap<String, CacheValue>;

fn wrong_type(key: &str) -> StoreError {
    StoreError::unexpected(format!("cache key {key:?} holds a different value type"))
}

fn hash_of<'a>(values: &'a Values, key: &str) -> StoreResult<Option<&'a BTreeMap<String, Vec<u8>>>> {
    match values.get(key) {
        Some(CacheValue::Hash(map)) => Ok(Some(map)),
        Some(_) => Err(wrong_type(key)),
        None => Ok(None),
    }
}

fn blob_of<'a>(values: &'a Values, key: &str) -> StoreResult<Option<&'a Vec<u8>>> {
    match values.get(key) {
        Some(CacheValue::Blob(bytes)) => Ok(Some(bytes)),
        Some(_) => Err(wrong_type(key)),
        None => Ok(None),
    }
}

fn zset_of<'a>(values: &'a Values, key: &str) -> StoreResult<Option<&'a BTreeMap<Vec<u8>, f64>>> {
    match values.get(key) {
        Some(CacheValue::Zset(set)) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key)),
        None => Ok(None),
    }
}

fn zset_mut<'a>(values: &'a mut Values, key: &str) -> StoreResult<&'a mut BTreeMap<Vec<u8>, f64>> {
    match values
        .entry(key.to_string())
        .or_insert_with(|| CacheValue::Zset(BTreeMap::new()))
    {
        CacheValue::Zset(set) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

/// Member of `set` carrying `item_key`, found by prefix probe.
fn feed_member<'a>(
    set: &'a BTreeMap<Vec<u8>, f64>,
    item_key: &str,
) -> Option<&'a Vec<u8>> {
    let prefix = codec::member_prefix(item_key);
    set.range(prefix.clone()..)
        .next()
        .map(|(member, _)| member)
        .filter(|member| member.starts_with(&prefix))
}

/// Last member in the feed's iteration order, if any.
fn last_member(set: &BTreeMap<Vec<u8>, f64>, descending: bool) -> Option<&Vec<u8>> {
    if descending {
        set.keys().next()
    } else {
        set.keys().next_back()
    }
}

fn eval_check(values: &Values, check: &Check) -> StoreResult<bool> {
    match check {
        Check::HashMissing { key } => Ok(hash_of(values, key)?.is_none()),
        Check::HashExists { key } => Ok(hash_of(values, key)?.is_some()),
        Check::HashEtagMatches { key, expected } => Ok(hash_of(values, key)?
            .and_then(|map| map.get(codec::ETAG_FIELD))
            .is_some_and(|etag| etag.as_slice() == expected.as_bytes())),
        Check::StringMissing { key } => Ok(blob_of(values, key)?.is_none()),
        Check::StringExists { key } => Ok(blob_of(values, key)?.is_some()),
        Check::StringEtagMatches { key, expected } => match blob_of(values, key)? {
            Some(bytes) => Ok(codec::peek_etag(bytes, false)? == *expected),
            None => Ok(false),
        },
        Check::FeedItemMissing { key, item_key } => Ok(zset_of(values, key)?
            .and_then(|set| feed_member(set, item_key))
            .is_none()),
        Check::FeedItemExists { key, item_key } => Ok(zset_of(values, key)?
            .and_then(|set| feed_member(set, item_key))
            .is_some()),
        Check::FeedItemEtagMatches {
            key,
            item_key,
            expected,
        } => match zset_of(values, key)?.and_then(|set| feed_member(set, item_key)) {
            Some(member) => Ok(codec::peek_etag(member, true)? == *expected),
            None => Ok(false),
        },
        Check::RankFeedItemMissing { key, item_key } => Ok(zset_of(values, key)?
            .map_or(true, |set| !set.contains_key(item_key.as_bytes()))),
        Check::RankFeedItemExists { key, item_key } => Ok(zset_of(values, key)?
            .is_some_and(|set| set.contains_key(item_key.as_bytes()))),
    }
}

fn remove_feed_item(set: &mut BTreeMap<Vec<u8>, f64>, item_key: &str) -> bool {
    let prefix = codec::member_prefix(item_key);
    let existing: Vec<Vec<u8>> = set
        .range(prefix.clone()..)
        .take_while(|(member, _)| member.starts_with(&prefix))
        .map(|(member, _)| member.clone())
        .collect();
    let removed = !existing.is_empty();
    for member in existing {
        set.remove(&member);
    }
    removed
}

fn feed_set(
    values: &mut Values,
    key: &str,
    item_key: &str,
    value: &[u8],
) -> StoreResult<ScriptValue> {
    let etag = codec::peek_etag(value, true)?;
    let set = zset_mut(values, key)?;
    remove_feed_item(set, item_key);
    set.insert(value.to_vec(), 0.0);
    Ok(ScriptValue::Data(etag.into_bytes()))
}

fn run_action(values: &mut Values, action: &Action) -> StoreResult<ScriptValue> {
    match action {
        Action::HashReplace { key, fields, etag } => {
            let map: BTreeMap<String, Vec<u8>> = fields.iter().cloned().collect();
            values.insert(key.clone(), CacheValue::Hash(map));
            Ok(ScriptValue::Data(etag.clone().into_bytes()))
        }
        Action::HashMerge { key, fields, etag } => {
            match values
                .entry(key.clone())
                .or_insert_with(|| CacheValue::Hash(BTreeMap::new()))
            {
                CacheValue::Hash(map) => {
                    for (name, value) in fields {
                        map.insert(name.clone(), value.clone());
                    }
                }
                _ => return Err(wrong_type(key)),
            }
            Ok(ScriptValue::Data(etag.clone().into_bytes()))
        }
        Action::HashDelete { key } => {
            values.remove(key);
            Ok(ScriptValue::Int(1))
        }
        Action::HashDeleteIfExists { key } => {
            Ok(ScriptValue::Int(i64::from(values.remove(key).is_some())))
        }
        Action::HashIncrement {
            key,
            delta,
            etag,
            insert_if_missing,
        } => {
            if !values.contains_key(key) {
                if !insert_if_missing {
                    return Err(StoreError::unexpected(
                        "increment on a missing key slipped past its condition",
                    ));
                }
                values.insert(key.clone(), CacheValue::Hash(BTreeMap::new()));
            }
            let map = match values.get_mut(key) {
                Some(CacheValue::Hash(map)) => map,
                _ => return Err(wrong_type(key)),
            };
            let current = match map.get(codec::VALUE_FIELD) {
                Some(bytes) => {
                    let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        StoreError::unexpected("malformed cached count value")
                    })?;
                    f64::from_le_bytes(arr)
                }
                None => 0.0,
            };
            let next = current + delta;
            map.insert(codec::VALUE_FIELD.to_string(), next.to_le_bytes().to_vec());
            map.insert(codec::ETAG_FIELD.to_string(), etag.clone().into_bytes());
            map.entry(codec::FLAGS_FIELD.to_string()).or_insert(vec![0]);
            Ok(ScriptValue::Data(format!("{next},{etag}").into_bytes()))
        }
        Action::StringSet { key, value } => {
            let etag = codec::peek_etag(value, false)?;
            values.insert(key.clone(), CacheValue::Blob(value.clone()));
            Ok(ScriptValue::Data(etag.into_bytes()))
        }
        Action::StringDelete { key } => {
            values.remove(key);
            Ok(ScriptValue::Int(1))
        }
        Action::StringDeleteIfExists { key } => {
            Ok(ScriptValue::Int(i64::from(values.remove(key).is_some())))
        }
        Action::FeedSet {
            key,
            item_key,
            value,
        } => feed_set(values, key, item_key, value),
        Action::FeedSetUnlessLast {
            key,
            item_key,
            value,
            descending,
        } => {
            let set = zset_of(values, key)?;
            // An empty feed has no cached copy to invalidate; writing a
            // marker would materialize a fake one-item feed.
            let guard = match set.and_then(|set| last_member(set, *descending)) {
                Some(last) => codec::item_key_of_member(last)? == item_key,
                None => true,
            };
            if guard {
                return Ok(ScriptValue::Data(NOOP_SENTINEL.to_vec()));
            }
            feed_set(values, key, item_key, value)
        }
        Action::FeedSetIfNotEmpty {
            key,
            item_key,
            value,
        } => {
            let empty = zset_of(values, key)?.map_or(true, |set| set.is_empty());
            if empty {
                return Ok(ScriptValue::Data(NOOP_SENTINEL.to_vec()));
            }
            feed_set(values, key, item_key, value)
        }
        Action::FeedDelete { key, item_key } => {
            let set = zset_mut(values, key)?;
            remove_feed_item(set, item_key);
            Ok(ScriptValue::Int(1))
        }
        Action::FeedDeleteIfExists { key, item_key } => {
            let set = zset_mut(values, key)?;
            Ok(ScriptValue::Int(i64::from(remove_feed_item(set, item_key))))
        }
        Action::RankFeedSet {
            key,
            item_key,
            score,
        } => {
            let set = zset_mut(values, key)?;
            set.insert(item_key.clone().into_bytes(), *score);
            Ok(ScriptValue::Data(score.to_string().into_bytes()))
        }
        Action::RankFeedDelete { key, item_key } => {
            let set = zset_mut(values, key)?;
            set.remove(item_key.as_bytes());
            Ok(ScriptValue::Int(1))
        }
        Action::RankFeedDeleteIfExists { key, item_key } => {
            let set = zset_mut(values, key)?;
            Ok(ScriptValue::Int(i64::from(
                set.remove(item_key.as_bytes()).is_some(),
            )))
        }
        Action::RankFeedIncrement {
            key,
            item_key,
            delta,
            insert_if_missing,
        } => {
            let set = zset_mut(values, key)?;
            let member = item_key.as_bytes().to_vec();
            let current = match set.get(&member) {
                Some(score) => *score,
                None if *insert_if_missing => 0.0,
                None => {
                    return Err(StoreError::unexpected(
                        "rank-feed increment on a missing member slipped past its condition",
                    ))
                }
            };
            let next = current + delta;
            set.insert(member, next);
            Ok(ScriptValue::Data(next.to_string().into_bytes()))
        }
    }
}

fn run_trim(values: &mut Values, trim: &Trim) -> StoreResult<()> {
    let Some(CacheValue::Zset(set)) = values.get_mut(&trim.key) else {
        return Ok(());
    };
    let max = trim.max_size as usize;
    if set.len() <= max {
        return Ok(());
    }
    // Keep the first `max` members in the feed's iteration order.
    let mut ordered: Vec<Vec<u8>> = set.keys().cloned().collect();
    if trim.by_score {
        ordered.sort_by(|a, b| {
            let sa = set.get(a).copied().unwrap_or(0.0);
            let sb = set.get(b).copied().unwrap_or(0.0);
            sa.partial_cmp(&sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
    }
    if trim.descending {
        ordered.reverse();
    }
    for member in ordered.into_iter().skip(max) {
        set.remove(&member);
    }
    Ok(())
}

#[async_trait]
impl CacheClient for MemoryCacheClient {
    async fn run_script(&self, script: &CacheScript) -> StoreResult<Vec<ScriptValue>> {
        let mut values = self.values.lock().await;
        for condition in &script.conditions {
            if !eval_check(&values, &condition.check)? {
                return Ok(vec![
                    ScriptValue::Int(condition.error_code),
                    ScriptValue::Int(condition.failure.code()),
                ]);
            }
        }
        let mut out = Vec::with_capacity(script.actions.len() + 1);
        out.push(ScriptValue::Int(1));
        for action in &script.actions {
            out.push(run_action(&mut values, action)?);
        }
        for trim in &script.trims {
            run_trim(&mut values, trim)?;
        }
        Ok(out)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>> {
        let values = self.values.lock().await;
        Ok(hash_of(&values, key)?.cloned())
    }

    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
    ) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>> {
        let values = self.values.lock().await;
        Ok(hash_of(&values, key)?.map(|map| {
            map.iter()
                .filter(|(name, _)| fields.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        }))
    }

    async fn string_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let values = self.values.lock().await;
        Ok(blob_of(&values, key)?.cloned())
    }

    async fn sorted_set_score(&self, key: &str, member: &[u8]) -> StoreResult<Option<f64>> {
        let values = self.values.lock().await;
        Ok(zset_of(&values, key)?.and_then(|set| set.get(member).copied()))
    }

    async fn sorted_set_range_by_lex(
        &self,
        key: &str,
        min: &LexBound,
        max: &LexBound,
        limit: usize,
        reverse: bool,
    ) -> StoreResult<Vec<Vec<u8>>> {
        let values = self.values.lock().await;
        let Some(set) = zset_of(&values, key)? else {
            return Ok(Vec::new());
        };
        let admitted = set
            .keys()
            .filter(|m| min.admits_from_below(m) && max.admits_from_above(m));
        let out: Vec<Vec<u8>> = if reverse {
            let mut all: Vec<Vec<u8>> = admitted.cloned().collect();
            all.reverse();
            all.truncate(limit);
            all
        } else {
            admitted.take(limit).cloned().collect()
        };
        Ok(out)
    }

    async fn sorted_set_range_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> StoreResult<Vec<(Vec<u8>, f64)>> {
        let values = self.values.lock().await;
        let Some(set) = zset_of(&values, key)? else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(Vec<u8>, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        ordered.sort_by(|(ma, sa), (mb, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ma.cmp(mb))
        });
        if reverse {
            ordered.reverse();
        }
        let len = ordered.len() as i64;
        let normalize = |i: i64| -> i64 {
            if i < 0 {
                len + i
            } else {
                i
            }
        };
        let start = normalize(start).max(0);
        let stop = normalize(stop).min(len - 1);
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(ordered[start as usize..=stop as usize].to_vec())
    }

    async fn sorted_set_length(&self, key: &str) -> StoreResult<u64> {
        let values = self.values.lock().await;
        Ok(zset_of(&values, key)?.map_or(0, |set| set.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctstore_core::ETAG_ANY;

    fn write(row_key: &str, kind: WriteKind) -> PersistentWrite {
        PersistentWrite {
            container: "app".to_string(),
            row: PersistentRow {
                partition_key: "pk".to_string(),
                row_key: row_key.to_string(),
                etag: None,
                fields: BTreeMap::new(),
            },
            kind,
        }
    }

    #[tokio::test]
    async fn test_insert_then_conflict() {
        let client = MemoryPersistentClient::new();
        client.execute(&write("T:k", WriteKind::Insert)).await.unwrap();
        let err = client.execute(&write("T:k", WriteKind::Insert)).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { operation_index: 0 });
    }

    #[tokio::test]
    async fn test_replace_checks_etag() {
        let client = MemoryPersistentClient::new();
        let etag = client
            .execute(&write("T:k", WriteKind::Insert))
            .await
            .unwrap()
            .unwrap();

        let err = client
            .execute(&write(
                "T:k",
                WriteKind::Replace {
                    etag: "stale".to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PreconditionFailed { operation_index: 0 });

        let new_etag = client
            .execute(&write("T:k", WriteKind::Replace { etag }))
            .await
            .unwrap()
            .unwrap();
        assert!(!new_etag.is_empty());

        client
            .execute(&write(
                "T:k",
                WriteKind::Replace {
                    etag: ETAG_ANY.to_string(),
                },
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let client = MemoryPersistentClient::new();
        client.execute(&write("T:a", WriteKind::Insert)).await.unwrap();

        // Second write conflicts; the first must not land.
        let err = client
            .execute_batch(&[write("T:b", WriteKind::Insert), write("T:a", WriteKind::Insert)])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict { operation_index: 1 });
        assert!(client
            .point_read("app", "pk", "T:b", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_range_read_is_exclusive_and_ordered() {
        let client = MemoryPersistentClient::new();
        for key in ["F:f:a", "F:f:b", "F:f:c", "F:g:a", "G:f:a"] {
            client.execute(&write(key, WriteKind::Insert)).await.unwrap();
        }
        let rows = client
            .range_read("app", "pk", "F:f:", "F:f;", 10)
            .await
            .unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.row_key.as_str()).collect();
        assert_eq!(keys, vec!["F:f:a", "F:f:b", "F:f:c"]);

        let rows = client
            .range_read("app", "pk", "F:f:a", "F:f;", 1)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_key, "F:f:b");
    }

    #[tokio::test]
    async fn test_projection_filters_fields() {
        let client = MemoryPersistentClient::new();
        let mut w = write("T:k", WriteKind::Insert);
        w.row
            .fields
            .insert("A".to_string(), FieldValue::I64(1));
        w.row
            .fields
            .insert("B".to_string(), FieldValue::I64(2));
        client.execute(&w).await.unwrap();

        let row = client
            .point_read("app", "pk", "T:k", Some(&["A".to_string()]))
            .await
            .unwrap()
            .unwrap();
        assert!(row.fields.contains_key("A"));
        assert!(!row.fields.contains_key("B"));
        assert!(row.etag.is_some());
    }

    #[tokio::test]
    async fn test_script_conditions_run_before_actions() {
        use crate::cache::script::{CacheScript, Condition};
        use ctstore_core::FailureKind;

        let client = MemoryCacheClient::new();
        // Seed a hash so the missing-check fails.
        let seed = CacheScript {
            conditions: vec![],
            actions: vec![Action::HashReplace {
                key: "k".to_string(),
                fields: vec![(codec::ETAG_FIELD.to_string(), b"e1".to_vec())],
                etag: "e1".to_string(),
            }],
            trims: vec![],
        };
        client.run_script(&seed).await.unwrap();

        let script = CacheScript {
            conditions: vec![Condition {
                check: Check::HashMissing {
                    key: "k".to_string(),
                },
                error_code: -1,
                failure: FailureKind::Conflict,
            }],
            actions: vec![Action::HashDelete {
                key: "k".to_string(),
            }],
            trims: vec![],
        };
        let result = client.run_script(&script).await.unwrap();
        assert_eq!(result, vec![ScriptValue::Int(-1), ScriptValue::Int(1)]);
        // The action must not have run.
        assert!(client.hash_get_all("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_feed_set_unless_last_noops_on_last_and_empty() {
        let client = MemoryCacheClient::new();
        let entity = ctstore_core::EntityCore {
            custom_etag: Some("e".to_string()),
            ..Default::default()
        };
        let value_a = codec::encode_entity(&entity, Some("a"));
        let value_b = codec::encode_entity(&entity, Some("b"));

        // Empty feed: guarded set declines.
        let script = CacheScript {
            conditions: vec![],
            actions: vec![Action::FeedSetUnlessLast {
                key: "f".to_string(),
                item_key: "a".to_string(),
                value: value_a.clone(),
                descending: false,
            }],
            trims: vec![],
        };
        let result = client.run_script(&script).await.unwrap();
        assert_eq!(result[1], ScriptValue::Data(NOOP_SENTINEL.to_vec()));

        // Seed two items, then the guarded set succeeds for the non-last
        // and declines for the last.
        let seed = CacheScript {
            conditions: vec![],
            actions: vec![
                Action::FeedSet {
                    key: "f".to_string(),
                    item_key: "a".to_string(),
                    value: value_a.clone(),
                },
                Action::FeedSet {
                    key: "f".to_string(),
                    item_key: "b".to_string(),
                    value: value_b.clone(),
                },
            ],
            trims: vec![],
        };
        client.run_script(&seed).await.unwrap();

        let on_last = CacheScript {
            conditions: vec![],
            actions: vec![Action::FeedSetUnlessLast {
                key: "f".to_string(),
                item_key: "b".to_string(),
                value: value_b,
                descending: false,
            }],
            trims: vec![],
        };
        let result = client.run_script(&on_last).await.unwrap();
        assert_eq!(result[1], ScriptValue::Data(NOOP_SENTINEL.to_vec()));

        let on_first = CacheScript {
            conditions: vec![],
            actions: vec![Action::FeedSetUnlessLast {
                key: "f".to_string(),
                item_key: "a".to_string(),
                value: value_a,
                descending: false,
            }],
            trims: vec![],
        };
        let result = client.run_script(&on_first).await.unwrap();
        assert_ne!(result[1], ScriptValue::Data(NOOP_SENTINEL.to_vec()));
    }

    #[tokio::test]
    async fn test_trim_keeps_iteration_head() {
        let client = MemoryCacheClient::new();
        let entity = ctstore_core::EntityCore::default();
        let actions: Vec<Action> = ["a", "b", "c", "d"]
            .iter()
            .map(|ik| Action::FeedSet {
                key: "f".to_string(),
                item_key: ik.to_string(),
                value: codec::encode_entity(&entity, Some(ik)),
            })
            .collect();
        let script = CacheScript {
            conditions: vec![],
            actions,
            trims: vec![Trim {
                key: "f".to_string(),
                max_size: 2,
                descending: false,
                by_score: false,
            }],
        };
        client.run_script(&script).await.unwrap();

        let members = client
            .sorted_set_range_by_lex("f", &LexBound::Min, &LexBound::Max, 10, false)
            .await
            .unwrap();
        let keys: Vec<&str> = members
            .iter()
            .map(|m| codec::item_key_of_member(m).unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rank_feed_increment_and_rank_range() {
        let client = MemoryCacheClient::new();
        let script = CacheScript {
            conditions: vec![],
            actions: vec![
                Action::RankFeedIncrement {
                    key: "r".to_string(),
                    item_key: "x".to_string(),
                    delta: 3.0,
                    insert_if_missing: true,
                },
                Action::RankFeedIncrement {
                    key: "r".to_string(),
                    item_key: "y".to_string(),
                    delta: 1.0,
                    insert_if_missing: true,
                },
            ],
            trims: vec![],
        };
        let result = client.run_script(&script).await.unwrap();
        assert_eq!(result[1], ScriptValue::Data(b"3".to_vec()));

        assert_eq!(client.sorted_set_score("r", b"x").await.unwrap(), Some(3.0));
        assert_eq!(client.sorted_set_length("r").await.unwrap(), 2);

        let top = client
            .sorted_set_range_by_rank("r", 0, -1, true)
            .await
            .unwrap();
        assert_eq!(top[0].0, b"x".to_vec());
        assert_eq!(top[1].0, b"y".to_vec());
    }
}
