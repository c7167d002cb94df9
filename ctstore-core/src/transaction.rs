//! Atomic transaction assembly.
//!
//! A transaction is an ordered list of operations sharing one container and
//! one partition key, with at most one operation per distinct
//! (table, partition key, key, item key) tuple. The invariants are
//! re-checked on every `add` so assembly fails fast rather than at
//! execution time. Cache-only operations cannot be mixed with any other
//! storage mode: the cache script and the persistent batch are separate
//! atomic units and mixing them would silently break all-or-nothing
//! semantics.

use crate::operation::Operation;
use crate::table::StorageMode;
use std::collections::HashSet;

/// Index split of a transaction's operations by storage mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeSplit {
    pub cache_only: Vec<usize>,
    pub persistent_only: Vec<usize>,
    pub default: Vec<usize>,
}

/// An ordered, validated batch of operations executed atomically.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    operations: Vec<Operation>,
    seen: HashSet<(String, String, Option<String>)>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation, re-checking the transaction invariants.
    ///
    /// # Panics
    ///
    /// Panics when the operation targets a different container or partition
    /// key than the transaction, duplicates an already-added
    /// (table, key, item key) tuple, or mixes cache-only operations with
    /// other storage modes. These are programmer errors.
    pub fn add(&mut self, op: Operation) {
        if let Some(first) = self.operations.first() {
            assert_eq!(
                first.table.container_name, op.table.container_name,
                "all operations in a transaction must target one container"
            );
            assert_eq!(
                first.partition_key, op.partition_key,
                "all operations in a transaction must share one partition key"
            );
            let has_cache_only = self
                .operations
                .iter()
                .any(|o| o.table.storage_mode == StorageMode::CacheOnly);
            let adding_cache_only = op.table.storage_mode == StorageMode::CacheOnly;
            assert!(
                has_cache_only == adding_cache_only,
                "cache-only operations cannot be mixed with other storage modes"
            );
        }
        let tuple = (
            op.table.table_name.clone(),
            op.key.clone(),
            op.item_key.clone(),
        );
        assert!(
            self.seen.insert(tuple),
            "duplicate operation for one (table, key, item key) tuple"
        );
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.operations.first().map(|op| op.partition_key.as_str())
    }

    pub fn container_name(&self) -> Option<&str> {
        self.operations
            .first()
            .map(|op| op.table.container_name.as_str())
    }

    /// Partition operation indexes by storage mode, preserving order.
    pub fn split_by_mode(&self) -> ModeSplit {
        let mut split = ModeSplit::default();
        for (i, op) in self.operations.iter().enumerate() {
            match op.table.storage_mode {
                StorageMode::CacheOnly => split.cache_only.push(i),
                StorageMode::PersistentOnly => split.persistent_only.push(i),
                StorageMode::Default => split.default.push(i),
            }
        }
        split
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ObjectEntity;
    use crate::table::{StorageMode, Table};

    #[test]
    fn test_add_accepts_same_partition() {
        let t1 = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        let t2 = Table::object("app", "a", "Settings", "s", StorageMode::Default);

        let mut txn = Transaction::new();
        txn.add(Operation::insert_object(&t1, "pk", "k1", &ObjectEntity::new("k1")));
        txn.add(Operation::insert_object(&t2, "pk", "k1", &ObjectEntity::new("k1")));
        assert_eq!(txn.len(), 2);
        assert_eq!(txn.partition_key(), Some("pk"));
    }

    #[test]
    #[should_panic(expected = "share one partition key")]
    fn test_add_rejects_mixed_partition_keys() {
        let t = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        let mut txn = Transaction::new();
        txn.add(Operation::insert_object(&t, "pk1", "k1", &ObjectEntity::new("k1")));
        txn.add(Operation::insert_object(&t, "pk2", "k2", &ObjectEntity::new("k2")));
    }

    #[test]
    #[should_panic(expected = "duplicate operation")]
    fn test_add_rejects_duplicate_entity() {
        let t = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        let mut txn = Transaction::new();
        txn.add(Operation::insert_object(&t, "pk", "k1", &ObjectEntity::new("k1")));
        txn.add(Operation::insert_or_replace_object(&t, "pk", "k1", &ObjectEntity::new("k1")));
    }

    #[test]
    #[should_panic(expected = "cache-only operations cannot be mixed")]
    fn test_add_rejects_mixed_cache_only() {
        let cache_only = Table::object("app", "a", "Sessions", "e", StorageMode::CacheOnly);
        let default = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        let mut txn = Transaction::new();
        txn.add(Operation::insert_object(&cache_only, "pk", "k1", &ObjectEntity::new("k1")));
        txn.add(Operation::insert_object(&default, "pk", "k2", &ObjectEntity::new("k2")));
    }

    #[test]
    fn test_split_by_mode_preserves_indexes() {
        let default = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        let persistent = Table::object("app", "a", "Audit", "u", StorageMode::PersistentOnly);

        let mut txn = Transaction::new();
        txn.add(Operation::insert_object(&default, "pk", "k1", &ObjectEntity::new("k1")));
        txn.add(Operation::insert_object(&persistent, "pk", "k2", &ObjectEntity::new("k2")));
        txn.add(Operation::insert_object(&default, "pk", "k3", &ObjectEntity::new("k3")));

        let split = txn.split_by_mode();
        assert_eq!(split.default, vec![0, 2]);
        assert_eq!(split.persistent_only, vec![1]);
        assert!(split.cache_only.is_empty());
    }
}
