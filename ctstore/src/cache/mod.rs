//! Volatile cache backend.
//!
//! Split into the key scheme ([`keys`]), the binary payload codec
//! ([`codec`]), the atomic script compiler ([`script`]) and the execution /
//! read surface ([`backend`]).

pub mod backend;
pub mod codec;
pub mod keys;
pub mod script;

pub use backend::CacheBackend;
pub use script::{Action, CacheScript, Check, Condition, Trim, NOOP_SENTINEL};
