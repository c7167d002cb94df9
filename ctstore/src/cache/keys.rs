//! Cache key composition.
//!
//! Cache keys are built from the container and table initials declared on
//! the [`Table`] descriptor, keeping keys short while staying unique per
//! deployment. The layout is persisted state: changing it orphans every
//! existing cache entry.

use ctstore_core::Table;

/// Key for an object, fixed-object or count value, and for the sorted set
/// backing a feed or rank feed (where `key` is the feed key).
pub fn cache_key(table: &Table, partition_key: &str, key: &str) -> String {
    format!(
        "{}{}:{}:{}",
        table.container_initial, table.table_initial, partition_key, key
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctstore_core::{StorageMode, Table};

    #[test]
    fn test_cache_key_uses_initials() {
        let table = Table::object("appcontainer", "a", "Profiles", "p", StorageMode::Default);
        assert_eq!(cache_key(&table, "user1", "k1"), "ap:user1:k1");
    }

    #[test]
    fn test_cache_key_distinct_per_table_initial() {
        let t1 = Table::object("app", "a", "Profiles", "p", StorageMode::Default);
        let t2 = Table::object("app", "a", "Settings", "s", StorageMode::Default);
        assert_ne!(cache_key(&t1, "pk", "k"), cache_key(&t2, "pk", "k"));
    }
}
