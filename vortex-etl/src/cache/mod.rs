//! On-disk block cache
//!
//! Transformed blocks are persisted keyed by a configuration
//! fingerprint so repeated runs skip decoding.

pub mod entry;
pub mod fingerprint;
pub mod store;

pub use fingerprint::{fingerprint, manifest_digest};
pub use store::{BlockSource, CacheIndex, CacheStore, ComputedBlock};
