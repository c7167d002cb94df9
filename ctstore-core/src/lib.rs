//! CTStore Core - Tables, Entities, Operations and Transactions
//!
//! Pure value types for the CTStore dual-backend data-access layer.
//! The backends, execution manager and store facade live in the `ctstore`
//! crate; this crate has no I/O.

pub mod config;
pub mod entity;
pub mod error;
pub mod operation;
pub mod result;
pub mod table;
pub mod transaction;

pub use config::StoreConfig;
pub use entity::{
    CacheFlags, CountEntity, EntityCore, FeedEntity, FieldValue, ObjectEntity, RankFeedEntity,
    StoreEntity,
};
pub use error::{FailureKind, StoreError, StoreResult};
pub use operation::{Operation, OperationType, ETAG_ANY};
pub use result::OperationResult;
pub use table::{FeedOrder, StorageMode, Table, TableKind};
pub use transaction::{ModeSplit, Transaction};
