//! Entity records.
//!
//! Entities are plain data: a partition key, an opaque ETag, cache-only
//! bookkeeping (flags, expiry, staged ETag), and a map of custom fields.
//! Custom fields live in a `BTreeMap` so their ascending-name order is a
//! structural property of the type; the cache binary codec depends on that
//! order to invert encode without a schema descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cache-only bookkeeping flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheFlags(u8);

impl CacheFlags {
    pub const NONE: CacheFlags = CacheFlags(0);
    /// The cached value is an invalidation marker, not trustworthy data.
    pub const INVALID: CacheFlags = CacheFlags(1);
    /// The cached payload carries no explicit ETag; the ETag is derived
    /// from the raw payload bytes.
    pub const NO_ETAG: CacheFlags = CacheFlags(2);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: CacheFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CacheFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: CacheFlags) {
        self.0 &= !other.0;
    }
}

/// Closed set of custom-field value types.
///
/// The cache codec assigns each variant a fixed type tag; adding a variant
/// is a wire-format change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Str(Option<String>),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    EnumStr(String),
    Bytes(Vec<u8>),
}

/// Shared entity bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityCore {
    /// Partition key; populated by the backend on every read.
    pub partition_key: String,
    /// Opaque concurrency token; `None` until the entity has been stored.
    pub etag: Option<String>,
    pub cache_flags: CacheFlags,
    /// Expiry stamped on invalidation markers.
    pub cache_expiry: Option<DateTime<Utc>>,
    /// Staged post-write ETag, used internally by the execution pipeline
    /// before the new ETag is visible to the caller.
    pub custom_etag: Option<String>,
    /// Custom fields in ascending name order.
    pub fields: BTreeMap<String, FieldValue>,
}

impl EntityCore {
    /// The ETag a write should stamp: the staged one when present,
    /// otherwise the currently known one.
    pub fn effective_etag(&self) -> Option<&str> {
        self.custom_etag.as_deref().or(self.etag.as_deref())
    }

    /// String field accessor; `None` when absent or stored as absent.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Str(v)) => v.as_deref(),
            Some(FieldValue::EnumStr(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// i64 field accessor; zero when absent (partial reads return the
    /// default value for unprojected fields rather than failing).
    pub fn i64_field(&self, name: &str) -> i64 {
        match self.fields.get(name) {
            Some(FieldValue::I64(v)) => *v,
            Some(FieldValue::I32(v)) => i64::from(*v),
            _ => 0,
        }
    }

    /// f64 field accessor; zero when absent.
    pub fn f64_field(&self, name: &str) -> f64 {
        match self.fields.get(name) {
            Some(FieldValue::F64(v)) => *v,
            _ => 0.0,
        }
    }

    /// bool field accessor; false when absent.
    pub fn bool_field(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(FieldValue::Bool(true)))
    }
}

/// Entity for object and fixed-object tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectEntity {
    pub object_key: String,
    pub core: EntityCore,
}

impl ObjectEntity {
    pub fn new(object_key: impl Into<String>) -> Self {
        Self {
            object_key: object_key.into(),
            core: EntityCore::default(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.core.fields.insert(name.into(), value);
        self
    }
}

/// Entity for count tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CountEntity {
    pub count_key: String,
    pub value: f64,
    pub core: EntityCore,
}

impl CountEntity {
    pub fn new(count_key: impl Into<String>, value: f64) -> Self {
        Self {
            count_key: count_key.into(),
            value,
            core: EntityCore::default(),
        }
    }
}

/// Entity for feed tables. The cursor always equals the item key; readers
/// hand the last returned cursor back to continue pagination.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedEntity {
    pub feed_key: String,
    pub item_key: String,
    pub cursor: String,
    pub core: EntityCore,
}

impl FeedEntity {
    pub fn new(feed_key: impl Into<String>, item_key: impl Into<String>) -> Self {
        let item_key = item_key.into();
        Self {
            feed_key: feed_key.into(),
            cursor: item_key.clone(),
            item_key,
            core: EntityCore::default(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.core.fields.insert(name.into(), value);
        self
    }
}

/// Entity for rank-feed tables (cache-only, score-ordered).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RankFeedEntity {
    pub feed_key: String,
    pub item_key: String,
    pub score: f64,
    pub core: EntityCore,
}

impl RankFeedEntity {
    pub fn new(feed_key: impl Into<String>, item_key: impl Into<String>, score: f64) -> Self {
        Self {
            feed_key: feed_key.into(),
            item_key: item_key.into(),
            score,
            core: EntityCore::default(),
        }
    }
}

/// Entity payload carried by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreEntity {
    Object(ObjectEntity),
    Count(CountEntity),
    Feed(FeedEntity),
    RankFeed(RankFeedEntity),
}

impl StoreEntity {
    pub fn core(&self) -> &EntityCore {
        match self {
            Self::Object(e) => &e.core,
            Self::Count(e) => &e.core,
            Self::Feed(e) => &e.core,
            Self::RankFeed(e) => &e.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut EntityCore {
        match self {
            Self::Object(e) => &mut e.core,
            Self::Count(e) => &mut e.core,
            Self::Feed(e) => &mut e.core,
            Self::RankFeed(e) => &mut e.core,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectEntity> {
        match self {
            Self::Object(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<&CountEntity> {
        match self {
            Self::Count(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_feed(&self) -> Option<&FeedEntity> {
        match self {
            Self::Feed(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_rank_feed(&self) -> Option<&RankFeedEntity> {
        match self {
            Self::RankFeed(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_flags_bitset() {
        let mut flags = CacheFlags::NONE;
        assert!(!flags.contains(CacheFlags::INVALID));

        flags.insert(CacheFlags::INVALID);
        flags.insert(CacheFlags::NO_ETAG);
        assert!(flags.contains(CacheFlags::INVALID));
        assert!(flags.contains(CacheFlags::NO_ETAG));
        assert_eq!(flags.bits(), 3);

        flags.remove(CacheFlags::INVALID);
        assert!(!flags.contains(CacheFlags::INVALID));
        assert!(flags.contains(CacheFlags::NO_ETAG));
    }

    #[test]
    fn test_fields_iterate_in_name_order() {
        let entity = ObjectEntity::new("k")
            .with_field("zeta", FieldValue::I64(1))
            .with_field("alpha", FieldValue::I64(2))
            .with_field("mid", FieldValue::I64(3));

        let names: Vec<&str> = entity.core.fields.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_field_accessors_default_to_zero_values() {
        let core = EntityCore::default();
        assert_eq!(core.i64_field("Foo"), 0);
        assert_eq!(core.f64_field("Foo"), 0.0);
        assert!(!core.bool_field("Foo"));
        assert_eq!(core.str_field("Foo"), None);
    }

    #[test]
    fn test_effective_etag_prefers_staged() {
        let mut core = EntityCore {
            etag: Some("old".to_string()),
            ..Default::default()
        };
        assert_eq!(core.effective_etag(), Some("old"));
        core.custom_etag = Some("staged".to_string());
        assert_eq!(core.effective_etag(), Some("staged"));
    }

    #[test]
    fn test_feed_entity_cursor_equals_item_key() {
        let e = FeedEntity::new("feed", "item-7");
        assert_eq!(e.cursor, e.item_key);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Whatever order fields are inserted in, iteration is in
            /// ascending name order. The cache codec depends on this to
            /// invert encode without a schema descriptor.
            #[test]
            fn prop_fields_always_iterate_sorted(
                names in proptest::collection::vec("[a-zA-Z_][a-zA-Z0-9_]{0,12}", 0..16)
            ) {
                let mut entity = ObjectEntity::new("k");
                for (i, name) in names.iter().enumerate() {
                    entity = entity.with_field(name.clone(), FieldValue::I64(i as i64));
                }
                let iterated: Vec<&String> = entity.core.fields.keys().collect();
                let mut sorted = iterated.clone();
                sorted.sort();
                prop_assert_eq!(iterated, sorted);
            }
        }
    }
}
