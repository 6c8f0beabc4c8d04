//! Cache fingerprints
//!
//! A fingerprint names one manifest + ETL configuration combination.
//! Any change to the inputs that affect block contents yields a new
//! fingerprint, so old entries are simply never looked up again.
//!
//! The fingerprint only covers configuration. Edits to the manifest
//! file itself are caught by [`manifest_digest`], which every block
//! and index records alongside the fingerprint.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::config::{FieldConfig, LoaderConfig};
use crate::data::manifest::Record;
use crate::error::{EtlError, Result};

use super::entry::BLOCK_FORMAT_VERSION;

#[derive(Serialize)]
struct FingerprintInput<'a> {
    format_version: u32,
    manifest_path: PathBuf,
    manifest_root: Option<&'a PathBuf>,
    etl: &'a [FieldConfig],
    subset_fraction: f64,
    batch_size: usize,
    block_size: usize,
    shuffle_manifest: bool,
    random_seed: u64,
}

/// Lowercase hex SHA-256 of the block-affecting configuration
pub fn fingerprint(config: &LoaderConfig) -> Result<String> {
    let input = FingerprintInput {
        format_version: BLOCK_FORMAT_VERSION,
        manifest_path: config.manifest_path(),
        manifest_root: config.manifest_root.as_ref(),
        etl: &config.etl,
        subset_fraction: config.subset_fraction,
        batch_size: config.batch_size,
        block_size: config.block_size,
        shuffle_manifest: config.shuffle_manifest,
        random_seed: config.random_seed,
    };
    let canonical = serde_json::to_vec(&input).map_err(|e| EtlError::Internal {
        message: format!("fingerprint serialization failed: {}", e),
    })?;
    Ok(sha256_hex(&canonical))
}

/// Lowercase hex SHA-256 over the epoch's records, in epoch order
///
/// Fields are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub fn manifest_digest(records: &[Record]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((records.len() as u64).to_le_bytes());
    for record in records {
        hasher.update((record.fields.len() as u64).to_le_bytes());
        for field in &record.fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    hex(&hasher.finalize())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
