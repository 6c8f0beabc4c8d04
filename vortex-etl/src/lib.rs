//! Vortex ETL - manifest-driven batched data loading
//!
//! This crate provides:
//! - Manifest parsing and deterministic subsetting
//! - Image and label field transforms to fixed-shape tensors
//! - Fixed-size batching with restartable iteration
//! - An on-disk block cache keyed by configuration fingerprint

pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;

pub use cache::CacheStore;
pub use config::{DecodeFailurePolicy, FieldConfig, FieldRole, LoaderConfig};
pub use data::{Batch, BatchLoader, Tensor};
pub use error::{EtlError, Result};
