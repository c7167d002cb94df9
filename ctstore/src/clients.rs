//! Collaborator client interfaces.
//!
//! CTStore talks to its two backing stores through these traits. The
//! concrete wire clients (network protocol, authentication, retries) live in
//! the composing application; the in-memory reference implementations in
//! [`crate::memory`] satisfy the same contracts for tests and embedding.

use async_trait::async_trait;
use ctstore_core::{FieldValue, StoreResult};
use std::collections::BTreeMap;

use crate::cache::script::CacheScript;

/// One row in the persistent table store.
///
/// Rows are addressed by `(partition_key, row_key)`; the row key is the
/// composite `tableName[:key][:itemKey]` built by the persistent backend so
/// that every entity for one partition sorts together with per-table
/// sub-ranges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistentRow {
    pub partition_key: String,
    pub row_key: String,
    /// Assigned by the store on every write; `None` on rows being written.
    pub etag: Option<String>,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Conditional-write primitive of the persistent store. An `etag` of `"*"`
/// means unconditional.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    Insert,
    Replace { etag: String },
    Merge { etag: String },
    InsertOrReplace,
    InsertOrMerge,
    Delete { etag: String },
}

/// One conditional write against the persistent store.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentWrite {
    pub container: String,
    pub row: PersistentRow,
    pub kind: WriteKind,
}

/// Client for the persistent table store.
///
/// Implementations map their wire errors onto the [`ctstore_core::StoreError`]
/// taxonomy (see [`crate::persistent::map_status`]) and, for batches, attach
/// the 0-based index of the failing write.
#[async_trait]
pub trait PersistentClient: Send + Sync {
    /// Create a container; returns false if it already existed.
    async fn create_container(&self, name: &str) -> StoreResult<bool>;

    /// Delete a container; returns false if it did not exist.
    async fn delete_container(&self, name: &str) -> StoreResult<bool>;

    /// Execute one conditional write. Returns the new ETag, or `None` for
    /// deletes.
    async fn execute(&self, write: &PersistentWrite) -> StoreResult<Option<String>>;

    /// Execute a batch of writes atomically. All writes share one container
    /// and one partition key. On failure the error carries the 0-based
    /// index of the failing write.
    async fn execute_batch(&self, writes: &[PersistentWrite]) -> StoreResult<Vec<Option<String>>>;

    /// Point read by partition key and row key. `projection` limits the
    /// custom fields returned; implementations must never treat it as
    /// "no fields".
    async fn point_read(
        &self,
        container: &str,
        partition_key: &str,
        row_key: &str,
        projection: Option<&[String]>,
    ) -> StoreResult<Option<PersistentRow>>;

    /// Range read: rows with `start_row_key_exclusive < row_key <
    /// end_row_key_exclusive`, ascending, up to `limit`. Implementations
    /// drive any continuation tokens internally until the limit is reached
    /// or the range is exhausted.
    async fn range_read(
        &self,
        container: &str,
        partition_key: &str,
        start_row_key_exclusive: &str,
        end_row_key_exclusive: &str,
        limit: usize,
    ) -> StoreResult<Vec<PersistentRow>>;
}

/// One slot of a script result array.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Int(i64),
    Data(Vec<u8>),
    Nil,
}

impl ScriptValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

/// Bound for lexicographic sorted-set range queries.
#[derive(Debug, Clone, PartialEq)]
pub enum LexBound {
    /// Unbounded low end.
    Min,
    /// Unbounded high end.
    Max,
    Inclusive(Vec<u8>),
    Exclusive(Vec<u8>),
}

impl LexBound {
    /// True when `member` is inside this bound used as a minimum.
    pub fn admits_from_below(&self, member: &[u8]) -> bool {
        match self {
            Self::Min => true,
            Self::Max => false,
            Self::Inclusive(b) => member >= b.as_slice(),
            Self::Exclusive(b) => member > b.as_slice(),
        }
    }

    /// True when `member` is inside this bound used as a maximum.
    pub fn admits_from_above(&self, member: &[u8]) -> bool {
        match self {
            Self::Min => false,
            Self::Max => true,
            Self::Inclusive(b) => member <= b.as_slice(),
            Self::Exclusive(b) => member < b.as_slice(),
        }
    }
}

/// Client for the volatile cache.
///
/// `run_script` executes a compiled [`CacheScript`] in a single round trip:
/// every condition is evaluated before any action runs, and no partial
/// effects are observable before the result array is returned. The remaining
/// methods are plain reads over the cache's native hash / string /
/// sorted-set values.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn run_script(&self, script: &CacheScript) -> StoreResult<Vec<ScriptValue>>;

    /// All fields of a hash value, or `None` when the key is absent.
    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>>;

    /// Selected fields of a hash value; absent fields are omitted from the
    /// map. `None` when the key is absent.
    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
    ) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>>;

    async fn string_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn sorted_set_score(&self, key: &str, member: &[u8]) -> StoreResult<Option<f64>>;

    /// Members in lexicographic order between `min` and `max`, up to
    /// `limit`; `reverse` walks from the high end down.
    async fn sorted_set_range_by_lex(
        &self,
        key: &str,
        min: &LexBound,
        max: &LexBound,
        limit: usize,
        reverse: bool,
    ) -> StoreResult<Vec<Vec<u8>>>;

    /// Members with scores between ranks `start..=stop` in score order;
    /// `reverse` ranks from the high end down.
    async fn sorted_set_range_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> StoreResult<Vec<(Vec<u8>, f64)>>;

    async fn sorted_set_length(&self, key: &str) -> StoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lex_bound_admission() {
        let min = LexBound::Exclusive(b"b".to_vec());
        assert!(!min.admits_from_below(b"a"));
        assert!(!min.admits_from_below(b"b"));
        assert!(min.admits_from_below(b"ba"));

        let max = LexBound::Inclusive(b"m".to_vec());
        assert!(max.admits_from_above(b"m"));
        assert!(!max.admits_from_above(b"ma"));

        assert!(LexBound::Min.admits_from_below(b""));
        assert!(LexBound::Max.admits_from_above(b"\xff\xff"));
    }

    #[test]
    fn test_script_value_accessors() {
        assert_eq!(ScriptValue::Int(3).as_int(), Some(3));
        assert_eq!(ScriptValue::Data(b"x".to_vec()).as_data(), Some(&b"x"[..]));
        assert_eq!(ScriptValue::Nil.as_int(), None);
    }
}
