//! CTStore - Dual-Backend Data Access
//!
//! A data-access layer presenting object, fixed-object, count, feed and
//! rank-feed tables over two backing stores: a persistent table store and a
//! volatile cache. Tables declare a storage mode; Default-mode writes run a
//! three-phase invalidate / commit / repair protocol so readers either see
//! committed data or are told to ask the source of truth.
//!
//! The wire clients are the embedder's concern: implement
//! [`clients::PersistentClient`] and [`clients::CacheClient`], or use the
//! in-memory reference pair in [`memory`].

pub mod cache;
pub mod clients;
pub mod manager;
pub mod memory;
pub mod persistent;
pub mod registry;
pub mod store;

pub use cache::CacheBackend;
pub use clients::{
    CacheClient, LexBound, PersistentClient, PersistentRow, PersistentWrite, ScriptValue,
    WriteKind,
};
pub use manager::ExecutionManager;
pub use memory::{MemoryCacheClient, MemoryPersistentClient};
pub use persistent::PersistentBackend;
pub use registry::ClientRegistry;
pub use store::CtStore;

// Re-export the core value types so embedders depend on one crate.
pub use ctstore_core::{
    CacheFlags, CountEntity, EntityCore, FailureKind, FeedEntity, FeedOrder, FieldValue,
    ModeSplit, ObjectEntity, Operation, OperationResult, OperationType, RankFeedEntity,
    StorageMode, StoreConfig, StoreEntity, StoreError, StoreResult, Table, TableKind,
    Transaction, ETAG_ANY,
};
