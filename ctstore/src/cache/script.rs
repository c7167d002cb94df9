//! Cache script compiler.
//!
//! The cache's native hash / string / sorted-set commands have no multi-key
//! transaction or precondition concept. To execute a batch of operations
//! with the same semantics the persistent backend provides, the compiler
//! translates every operation into a *condition* (a check that must hold or
//! the whole batch aborts with a negative error code unique to that
//! operation's position) and an *action* (the actual mutation). All
//! conditions run before any action, so the script can abort cleanly even
//! though the engine has no rollback. A trim step runs once per distinct
//! feed key touched by the batch.
//!
//! The compiled [`CacheScript`] is a structured program; rendering it to an
//! engine-specific script text (and guaranteeing single-round-trip atomic
//! evaluation) is the wire client's concern.

use ctstore_core::{
    CacheFlags, FailureKind, FeedOrder, Operation, OperationType, StoreError, StoreResult,
    StoreEntity, TableKind, ETAG_ANY,
};
use uuid::Uuid;

use super::codec;
use super::keys::cache_key;

/// Sentinel returned by the guarded feed actions when they decline to run.
pub const NOOP_SENTINEL: &[u8] = b"*noop*";

/// A pre-mutation check. Aborts the whole script with `error_code` when it
/// fails; `failure` pre-registers which error the decoder reconstructs.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub check: Check,
    /// Negative code, `-(operation index + 1)`.
    pub error_code: i64,
    pub failure: FailureKind,
}

/// The check itself, one per cache value shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    HashMissing { key: String },
    HashExists { key: String },
    /// The stored hash's ETag field equals `expected`.
    HashEtagMatches { key: String, expected: String },
    StringMissing { key: String },
    StringExists { key: String },
    /// The stored blob's ETag (embedded or derived) equals `expected`.
    StringEtagMatches { key: String, expected: String },
    FeedItemMissing { key: String, item_key: String },
    FeedItemExists { key: String, item_key: String },
    FeedItemEtagMatches { key: String, item_key: String, expected: String },
    RankFeedItemMissing { key: String, item_key: String },
    RankFeedItemExists { key: String, item_key: String },
}

/// A mutation. Every action produces exactly one slot in the script result
/// array, in operation order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Delete-then-set of the full hash value. Result: the new ETag.
    HashReplace {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
        etag: String,
    },
    /// Field-wise upsert preserving fields not named. Result: the new ETag.
    HashMerge {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
        etag: String,
    },
    /// Result: 1.
    HashDelete { key: String },
    /// Result: 1 if the key existed, else 0.
    HashDeleteIfExists { key: String },
    /// Add `delta` to the stored count and stamp a new ETag. Result: the
    /// composite `"value,etag"` string.
    HashIncrement {
        key: String,
        delta: f64,
        etag: String,
        insert_if_missing: bool,
    },
    /// Result: the blob's ETag (embedded or derived).
    StringSet { key: String, value: Vec<u8> },
    /// Result: 1.
    StringDelete { key: String },
    /// Result: 1 if the key existed, else 0.
    StringDeleteIfExists { key: String },
    /// Range-remove any member with this item key, then add. Result: the
    /// member's ETag.
    FeedSet {
        key: String,
        item_key: String,
        value: Vec<u8>,
    },
    /// [`Action::FeedSet`] unless the item is the last item of the cached
    /// feed in iteration order. Result: ETag, or the no-op sentinel.
    FeedSetUnlessLast {
        key: String,
        item_key: String,
        value: Vec<u8>,
        descending: bool,
    },
    /// [`Action::FeedSet`] only when the cached feed is non-empty. Result:
    /// ETag, or the no-op sentinel.
    FeedSetIfNotEmpty {
        key: String,
        item_key: String,
        value: Vec<u8>,
    },
    /// Result: 1.
    FeedDelete { key: String, item_key: String },
    /// Result: 1 if a member with the item key existed, else 0.
    FeedDeleteIfExists { key: String, item_key: String },
    /// Result: the new score as a decimal string.
    RankFeedSet {
        key: String,
        item_key: String,
        score: f64,
    },
    /// Result: 1.
    RankFeedDelete { key: String, item_key: String },
    /// Result: 1 if the member existed, else 0.
    RankFeedDeleteIfExists { key: String, item_key: String },
    /// Result: the post-increment score as a decimal string.
    RankFeedIncrement {
        key: String,
        item_key: String,
        delta: f64,
        insert_if_missing: bool,
    },
}

/// Post-action trim of one feed's cached size.
#[derive(Debug, Clone, PartialEq)]
pub struct Trim {
    pub key: String,
    pub max_size: u64,
    /// Iteration order of the feed; members beyond `max_size` in this order
    /// are removed.
    pub descending: bool,
    /// Rank feeds order by score; item-key feeds order lexicographically.
    pub by_score: bool,
}

/// A compiled, atomic cache program.
///
/// Contract with [`crate::clients::CacheClient::run_script`]: evaluate every
/// condition in order before running any action; on the first failing
/// condition return `[Int(error_code), Int(failure.code())]` with no
/// mutations applied. On success run all actions, then all trims, and
/// return `[Int(1), <one slot per action in order>]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheScript {
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub trims: Vec<Trim>,
}

/// Compile a batch of operations into one atomic script.
pub fn compile(ops: &[&Operation]) -> StoreResult<CacheScript> {
    let mut script = CacheScript::default();
    for (index, op) in ops.iter().enumerate() {
        let error_code = -((index as i64) + 1);
        compile_one(op, error_code, &mut script)?;
    }
    compile_trims(ops, &mut script);
    Ok(script)
}

fn compile_one(op: &Operation, error_code: i64, script: &mut CacheScript) -> StoreResult<()> {
    match op.table.kind {
        TableKind::Object | TableKind::Count => compile_hash_op(op, error_code, script),
        TableKind::FixedObject => compile_string_op(op, error_code, script),
        TableKind::Feed | TableKind::MutableFeed => compile_feed_op(op, error_code, script),
        TableKind::RankFeed => compile_rank_feed_op(op, error_code, script),
    }
}

/// The ETag an action stamps: the staged one when the pipeline already
/// assigned it, otherwise fresh.
fn staged_etag(op: &Operation) -> String {
    op.entity
        .as_ref()
        .and_then(|e| e.core().custom_etag.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn entity_of(op: &Operation) -> StoreResult<&StoreEntity> {
    op.entity
        .as_ref()
        .ok_or_else(|| StoreError::unexpected("operation is missing its entity payload"))
}

/// Hash fields for an object or count entity, special fields first.
fn hash_fields(op: &Operation, etag: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let entity = entity_of(op)?;
    let core = entity.core();
    let mut fields = vec![
        (codec::ETAG_FIELD.to_string(), etag.as_bytes().to_vec()),
        (
            codec::FLAGS_FIELD.to_string(),
            vec![core.cache_flags.bits()],
        ),
    ];
    if core.cache_flags.contains(CacheFlags::INVALID) {
        if let Some(expiry) = core.cache_expiry {
            fields.push((
                codec::EXPIRY_FIELD.to_string(),
                codec::encode_expiry(expiry).to_vec(),
            ));
        }
    }
    if let StoreEntity::Count(count) = entity {
        fields.push((
            codec::VALUE_FIELD.to_string(),
            count.value.to_le_bytes().to_vec(),
        ));
    }
    for (name, value) in &core.fields {
        fields.push((name.clone(), codec::encode_field(value)));
    }
    Ok(fields)
}

fn compile_hash_op(op: &Operation, error_code: i64, script: &mut CacheScript) -> StoreResult<()> {
    let key = cache_key(&op.table, &op.partition_key, &op.key);
    let push_cond = |script: &mut CacheScript, check: Check, failure: FailureKind| {
        script.conditions.push(Condition {
            check,
            error_code,
            failure,
        });
    };

    match op.op_type {
        OperationType::Insert => {
            push_cond(script, Check::HashMissing { key: key.clone() }, FailureKind::Conflict);
            let etag = staged_etag(op);
            let fields = hash_fields(op, &etag)?;
            script.actions.push(Action::HashReplace { key, fields, etag });
        }
        OperationType::Replace | OperationType::Merge => {
            push_cond(script, Check::HashExists { key: key.clone() }, FailureKind::NotFound);
            if op.etag != ETAG_ANY {
                push_cond(
                    script,
                    Check::HashEtagMatches {
                        key: key.clone(),
                        expected: op.etag.clone(),
                    },
                    FailureKind::PreconditionFailed,
                );
            }
            let etag = staged_etag(op);
            let fields = hash_fields(op, &etag)?;
            if op.op_type == OperationType::Replace {
                script.actions.push(Action::HashReplace { key, fields, etag });
            } else {
                script.actions.push(Action::HashMerge { key, fields, etag });
            }
        }
        OperationType::InsertOrReplace => {
            let etag = staged_etag(op);
            let fields = hash_fields(op, &etag)?;
            script.actions.push(Action::HashReplace { key, fields, etag });
        }
        OperationType::InsertOrMerge => {
            let etag = staged_etag(op);
            let fields = hash_fields(op, &etag)?;
            script.actions.push(Action::HashMerge { key, fields, etag });
        }
        OperationType::Delete => {
            push_cond(script, Check::HashExists { key: key.clone() }, FailureKind::NotFound);
            if op.etag != ETAG_ANY {
                push_cond(
                    script,
                    Check::HashEtagMatches {
                        key: key.clone(),
                        expected: op.etag.clone(),
                    },
                    FailureKind::PreconditionFailed,
                );
            }
            script.actions.push(Action::HashDelete { key });
        }
        OperationType::DeleteIfExists => {
            script.actions.push(Action::HashDeleteIfExists { key });
        }
        OperationType::Increment => {
            push_cond(script, Check::HashExists { key: key.clone() }, FailureKind::NotFound);
            script.actions.push(Action::HashIncrement {
                key,
                delta: op.score,
                etag: Uuid::new_v4().to_string(),
                insert_if_missing: false,
            });
        }
        OperationType::InsertOrIncrement => {
            script.actions.push(Action::HashIncrement {
                key,
                delta: op.score,
                etag: Uuid::new_v4().to_string(),
                insert_if_missing: true,
            });
        }
        OperationType::InsertOrReplaceIfNotLast | OperationType::InsertIfNotEmpty => {
            return Err(StoreError::unexpected(
                "feed-only operation on a non-feed table",
            ));
        }
    }
    Ok(())
}

fn compile_string_op(op: &Operation, error_code: i64, script: &mut CacheScript) -> StoreResult<()> {
    let key = cache_key(&op.table, &op.partition_key, &op.key);
    let push_cond = |script: &mut CacheScript, check: Check, failure: FailureKind| {
        script.conditions.push(Condition {
            check,
            error_code,
            failure,
        });
    };

    let encode = |op: &Operation| -> StoreResult<Vec<u8>> {
        let entity = entity_of(op)?;
        let mut core = entity.core().clone();
        core.custom_etag = Some(staged_etag(op));
        Ok(codec::encode_entity(&core, None))
    };

    match op.op_type {
        OperationType::Insert => {
            push_cond(script, Check::StringMissing { key: key.clone() }, FailureKind::Conflict);
            script.actions.push(Action::StringSet { key, value: encode(op)? });
        }
        OperationType::Replace => {
            push_cond(script, Check::StringExists { key: key.clone() }, FailureKind::NotFound);
            if op.etag != ETAG_ANY {
                push_cond(
                    script,
                    Check::StringEtagMatches {
                        key: key.clone(),
                        expected: op.etag.clone(),
                    },
                    FailureKind::PreconditionFailed,
                );
            }
            script.actions.push(Action::StringSet { key, value: encode(op)? });
        }
        OperationType::InsertOrReplace => {
            script.actions.push(Action::StringSet { key, value: encode(op)? });
        }
        OperationType::Delete => {
            push_cond(script, Check::StringExists { key: key.clone() }, FailureKind::NotFound);
            if op.etag != ETAG_ANY {
                push_cond(
                    script,
                    Check::StringEtagMatches {
                        key: key.clone(),
                        expected: op.etag.clone(),
                    },
                    FailureKind::PreconditionFailed,
                );
            }
            script.actions.push(Action::StringDelete { key });
        }
        OperationType::DeleteIfExists => {
            script.actions.push(Action::StringDeleteIfExists { key });
        }
        _ => {
            return Err(StoreError::unexpected(
                "operation type not supported for fixed-object tables",
            ));
        }
    }
    Ok(())
}

fn compile_feed_op(op: &Operation, error_code: i64, script: &mut CacheScript) -> StoreResult<()> {
    let key = cache_key(&op.table, &op.partition_key, &op.key);
    let item_key = op
        .item_key
        .clone()
        .ok_or_else(|| StoreError::unexpected("feed operation is missing its item key"))?;
    let push_cond = |script: &mut CacheScript, check: Check, failure: FailureKind| {
        script.conditions.push(Condition {
            check,
            error_code,
            failure,
        });
    };

    let encode = |op: &Operation, item_key: &str| -> StoreResult<Vec<u8>> {
        let entity = entity_of(op)?;
        let mut core = entity.core().clone();
        core.custom_etag = Some(staged_etag(op));
        Ok(codec::encode_entity(&core, Some(item_key)))
    };

    match op.op_type {
        OperationType::Insert => {
            push_cond(
                script,
                Check::FeedItemMissing {
                    key: key.clone(),
                    item_key: item_key.clone(),
                },
                FailureKind::Conflict,
            );
            let value = encode(op, &item_key)?;
            script.actions.push(Action::FeedSet { key, item_key, value });
        }
        OperationType::Replace => {
            push_cond(
                script,
                Check::FeedItemExists {
                    key: key.clone(),
                    item_key: item_key.clone(),
                },
                FailureKind::NotFound,
            );
            if op.etag != ETAG_ANY {
                push_cond(
                    script,
                    Check::FeedItemEtagMatches {
                        key: key.clone(),
                        item_key: item_key.clone(),
                        expected: op.etag.clone(),
                    },
                    FailureKind::PreconditionFailed,
                );
            }
            let value = encode(op, &item_key)?;
            script.actions.push(Action::FeedSet { key, item_key, value });
        }
        OperationType::InsertOrReplace => {
            let value = encode(op, &item_key)?;
            script.actions.push(Action::FeedSet { key, item_key, value });
        }
        OperationType::InsertOrReplaceIfNotLast => {
            let value = encode(op, &item_key)?;
            script.actions.push(Action::FeedSetUnlessLast {
                key,
                item_key,
                value,
                descending: op.table.order == FeedOrder::Descending,
            });
        }
        OperationType::InsertIfNotEmpty => {
            let value = encode(op, &item_key)?;
            script.actions.push(Action::FeedSetIfNotEmpty { key, item_key, value });
        }
        OperationType::Delete => {
            push_cond(
                script,
                Check::FeedItemExists {
                    key: key.clone(),
                    item_key: item_key.clone(),
                },
                FailureKind::NotFound,
            );
            if op.etag != ETAG_ANY {
                push_cond(
                    script,
                    Check::FeedItemEtagMatches {
                        key: key.clone(),
                        item_key: item_key.clone(),
                        expected: op.etag.clone(),
                    },
                    FailureKind::PreconditionFailed,
                );
            }
            script.actions.push(Action::FeedDelete { key, item_key });
        }
        OperationType::DeleteIfExists => {
            script.actions.push(Action::FeedDeleteIfExists { key, item_key });
        }
        _ => {
            return Err(StoreError::unexpected(
                "operation type not supported for feed tables",
            ));
        }
    }
    Ok(())
}

fn compile_rank_feed_op(
    op: &Operation,
    error_code: i64,
    script: &mut CacheScript,
) -> StoreResult<()> {
    let key = cache_key(&op.table, &op.partition_key, &op.key);
    let item_key = op
        .item_key
        .clone()
        .ok_or_else(|| StoreError::unexpected("rank-feed operation is missing its item key"))?;
    let push_cond = |script: &mut CacheScript, check: Check, failure: FailureKind| {
        script.conditions.push(Condition {
            check,
            error_code,
            failure,
        });
    };

    match op.op_type {
        OperationType::Insert => {
            push_cond(
                script,
                Check::RankFeedItemMissing {
                    key: key.clone(),
                    item_key: item_key.clone(),
                },
                FailureKind::Conflict,
            );
            script.actions.push(Action::RankFeedSet {
                key,
                item_key,
                score: op.score,
            });
        }
        OperationType::InsertOrReplace => {
            script.actions.push(Action::RankFeedSet {
                key,
                item_key,
                score: op.score,
            });
        }
        OperationType::Delete => {
            push_cond(
                script,
                Check::RankFeedItemExists {
                    key: key.clone(),
                    item_key: item_key.clone(),
                },
                FailureKind::NotFound,
            );
            script.actions.push(Action::RankFeedDelete { key, item_key });
        }
        OperationType::DeleteIfExists => {
            script.actions.push(Action::RankFeedDeleteIfExists { key, item_key });
        }
        OperationType::Increment => {
            push_cond(
                script,
                Check::RankFeedItemExists {
                    key: key.clone(),
                    item_key: item_key.clone(),
                },
                FailureKind::NotFound,
            );
            script.actions.push(Action::RankFeedIncrement {
                key,
                item_key,
                delta: op.score,
                insert_if_missing: false,
            });
        }
        OperationType::InsertOrIncrement => {
            script.actions.push(Action::RankFeedIncrement {
                key,
                item_key,
                delta: op.score,
                insert_if_missing: true,
            });
        }
        _ => {
            return Err(StoreError::unexpected(
                "operation type not supported for rank-feed tables",
            ));
        }
    }
    Ok(())
}

/// One trim per distinct feed key touched by the batch, after all actions.
fn compile_trims(ops: &[&Operation], script: &mut CacheScript) {
    for op in ops {
        let trimmable = matches!(
            op.table.kind,
            TableKind::Feed | TableKind::MutableFeed | TableKind::RankFeed
        );
        if !trimmable || op.table.max_feed_size_in_cache == 0 {
            continue;
        }
        let key = cache_key(&op.table, &op.partition_key, &op.key);
        if script.trims.iter().any(|t| t.key == key) {
            continue;
        }
        script.trims.push(Trim {
            key,
            max_size: op.table.max_feed_size_in_cache,
            descending: op.table.order == FeedOrder::Descending,
            by_score: op.table.kind == TableKind::RankFeed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctstore_core::{FeedEntity, ObjectEntity, StorageMode, Table};
    use std::sync::Arc;

    fn object_table() -> Arc<Table> {
        Table::object("app", "a", "Profiles", "p", StorageMode::Default)
    }

    fn feed_table(max: u64) -> Arc<Table> {
        Table::feed("app", "a", "Posts", "o", StorageMode::Default, max, FeedOrder::Ascending)
    }

    #[test]
    fn test_insert_compiles_conflict_condition() {
        let table = object_table();
        let op = Operation::insert_object(&table, "pk", "k1", &ObjectEntity::new("k1"));
        let script = compile(&[&op]).unwrap();

        assert_eq!(script.conditions.len(), 1);
        assert_eq!(script.conditions[0].error_code, -1);
        assert_eq!(script.conditions[0].failure, FailureKind::Conflict);
        assert!(matches!(script.conditions[0].check, Check::HashMissing { .. }));
        assert_eq!(script.actions.len(), 1);
    }

    #[test]
    fn test_replace_with_etag_compiles_two_conditions() {
        let table = object_table();
        let mut entity = ObjectEntity::new("k1");
        entity.core.etag = Some("v1".to_string());
        let op = Operation::replace_object(&table, "pk", "k1", &entity);
        let script = compile(&[&op]).unwrap();

        assert_eq!(script.conditions.len(), 2);
        assert_eq!(script.conditions[0].failure, FailureKind::NotFound);
        assert_eq!(script.conditions[1].failure, FailureKind::PreconditionFailed);
        // Both abort with this operation's code.
        assert!(script.conditions.iter().all(|c| c.error_code == -1));
    }

    #[test]
    fn test_wildcard_replace_skips_etag_condition() {
        let table = object_table();
        let op = Operation::replace_object(&table, "pk", "k1", &ObjectEntity::new("k1"));
        let script = compile(&[&op]).unwrap();
        assert_eq!(script.conditions.len(), 1);
        assert_eq!(script.conditions[0].failure, FailureKind::NotFound);
    }

    #[test]
    fn test_error_codes_are_per_position() {
        let table = object_table();
        let op1 = Operation::insert_object(&table, "pk", "k1", &ObjectEntity::new("k1"));
        let op2 = Operation::insert_object(&table, "pk", "k2", &ObjectEntity::new("k2"));
        let script = compile(&[&op1, &op2]).unwrap();
        assert_eq!(script.conditions[0].error_code, -1);
        assert_eq!(script.conditions[1].error_code, -2);
    }

    #[test]
    fn test_one_trim_per_feed_key() {
        let table = feed_table(10);
        let op1 = Operation::insert_or_replace_feed_item(
            &table,
            "pk",
            "feed",
            &FeedEntity::new("feed", "i1"),
        );
        let op2 = Operation::insert_or_replace_feed_item(
            &table,
            "pk",
            "feed",
            &FeedEntity::new("feed", "i2"),
        );
        let op3 = Operation::insert_or_replace_feed_item(
            &table,
            "pk",
            "other",
            &FeedEntity::new("other", "i1"),
        );
        let script = compile(&[&op1, &op2, &op3]).unwrap();
        assert_eq!(script.trims.len(), 2);
        assert_eq!(script.trims[0].max_size, 10);
        assert!(!script.trims[0].by_score);
    }

    #[test]
    fn test_uncapped_feed_compiles_no_trim() {
        let table = feed_table(0);
        let op = Operation::insert_or_replace_feed_item(
            &table,
            "pk",
            "feed",
            &FeedEntity::new("feed", "i1"),
        );
        let script = compile(&[&op]).unwrap();
        assert!(script.trims.is_empty());
    }

    #[test]
    fn test_staged_etag_is_reused() {
        let table = object_table();
        let mut entity = ObjectEntity::new("k1");
        entity.core.custom_etag = Some("staged-etag".to_string());
        let op = Operation::insert_or_replace_object(&table, "pk", "k1", &entity);
        let script = compile(&[&op]).unwrap();
        match &script.actions[0] {
            Action::HashReplace { etag, .. } => assert_eq!(etag, "staged-etag"),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
