//! Block cache on the local filesystem
//!
//! Layout under the cache directory:
//!
//! ```text
//! <fingerprint>/index.json
//! <fingerprint>/block_000000.bin
//! <fingerprint>/block_000001.bin
//! ```
//!
//! Entries are written to a temporary name and renamed into place, so a
//! reader never observes a partially written block.
//!
//! Blocks and the index also record the manifest digest they were built
//! from; an entry whose digest differs from the caller's is stale.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry::{decode_block, encode_block};
use crate::data::batch::FieldBatch;
use crate::error::{EtlError, Result};

/// Cache key: (fingerprint, block id)
pub type BlockKey = (String, u64);

/// Per-fingerprint summary, enough to serve an epoch without the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    pub fingerprint: String,
    /// Digest of the epoch's manifest records
    pub manifest_digest: String,
    /// Records in the (subset) epoch
    pub record_count: usize,
    pub batch_count: usize,
    pub block_count: usize,
    pub created_at: DateTime<Utc>,
}

impl CacheIndex {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(
        fingerprint: impl Into<String>,
        manifest_digest: impl Into<String>,
        record_count: usize,
        batch_count: usize,
        block_count: usize,
    ) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            fingerprint: fingerprint.into(),
            manifest_digest: manifest_digest.into(),
            record_count,
            batch_count,
            block_count,
            created_at: Utc::now(),
        }
    }

    fn same_layout(&self, other: &CacheIndex) -> bool {
        self.version == other.version
            && self.fingerprint == other.fingerprint
            && self.manifest_digest == other.manifest_digest
            && self.record_count == other.record_count
            && self.batch_count == other.batch_count
            && self.block_count == other.block_count
    }
}

/// Result of a compute callback
#[derive(Debug)]
pub struct ComputedBlock {
    pub batches: Vec<FieldBatch>,
    /// False when the block must not be cached (e.g. it holds substituted records)
    pub persist: bool,
}

/// Where a block returned by [`CacheStore::get_or_compute`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Read from a valid cache entry
    Cache,
    /// Computed; `written` says whether it was persisted
    Computed { written: bool },
}

/// Filesystem block cache
///
/// Shared between loaders via `Arc`. At most one write happens per
/// `(fingerprint, block_id)` for the lifetime of the store, unless the
/// entry is later found stale, in which case the next computation may
/// overwrite it. Concurrent callers on the same key are serialised by a
/// per-block lock.
pub struct CacheStore {
    root: PathBuf,
    block_locks: Mutex<HashMap<BlockKey, Arc<Mutex<()>>>>,
    written: Mutex<HashSet<BlockKey>>,
}

impl CacheStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            block_locks: Mutex::new(HashMap::new()),
            written: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all entries for a fingerprint
    pub fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint)
    }

    pub fn block_path(&self, fingerprint: &str, block_id: u64) -> PathBuf {
        self.entry_dir(fingerprint)
            .join(format!("block_{:06}.bin", block_id))
    }

    pub fn index_path(&self, fingerprint: &str) -> PathBuf {
        self.entry_dir(fingerprint).join("index.json")
    }

    /// Return the cached block, or compute, persist and return it
    pub fn get_or_compute<F>(
        &self,
        fingerprint: &str,
        manifest_digest: &str,
        block_id: u64,
        compute: F,
    ) -> Result<(Vec<FieldBatch>, BlockSource)>
    where
        F: FnOnce() -> Result<ComputedBlock>,
    {
        let key: BlockKey = (fingerprint.to_string(), block_id);
        let lock = self.block_lock(&key);
        let _guard = lock.lock();

        if let Some(batches) = self.read_block(fingerprint, manifest_digest, block_id)? {
            debug!("Cache hit for block {} of {}", block_id, fingerprint);
            return Ok((batches, BlockSource::Cache));
        }

        let computed = compute()?;
        let written = computed.persist && self.written.lock().insert(key);
        if written {
            let data = encode_block(fingerprint, manifest_digest, block_id, &computed.batches)?;
            self.write_atomic(&self.block_path(fingerprint, block_id), &data)?;
            debug!(
                "Cached block {} of {} ({} bytes)",
                block_id,
                fingerprint,
                data.len()
            );
        }

        Ok((computed.batches, BlockSource::Computed { written }))
    }

    /// Read a block if a valid entry exists
    ///
    /// Stale or corrupt entries are reported as absent and their key is
    /// released from the write-once set, so the caller recomputes and
    /// overwrites them. Other I/O failures are fatal.
    pub fn read_block(
        &self,
        fingerprint: &str,
        manifest_digest: &str,
        block_id: u64,
    ) -> Result<Option<Vec<FieldBatch>>> {
        let path = self.block_path(fingerprint, block_id);
        let data = match std::fs::read(&path) {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EtlError::cache_io(path, e)),
        };

        match decode_block(&path, data, fingerprint, manifest_digest, block_id) {
            Ok(batches) => Ok(Some(batches)),
            Err(e) if e.is_corruption() => {
                warn!("Discarding stale cache entry: {}", e);
                self.written
                    .lock()
                    .remove(&(fingerprint.to_string(), block_id));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether every block `0..block_count` has a valid entry on disk
    ///
    /// Each block is fully decoded and checksummed, so a torn or stale
    /// file counts as missing.
    pub fn has_blocks(
        &self,
        fingerprint: &str,
        manifest_digest: &str,
        block_count: usize,
    ) -> Result<bool> {
        for block_id in 0..block_count as u64 {
            if self.read_block(fingerprint, manifest_digest, block_id)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Load the index for a fingerprint, if present and readable
    pub fn read_index(&self, fingerprint: &str) -> Result<Option<CacheIndex>> {
        let path = self.index_path(fingerprint);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EtlError::cache_io(path, e)),
        };

        match serde_json::from_str::<CacheIndex>(&json) {
            Ok(index) if index.fingerprint == fingerprint
                && index.version == CacheIndex::CURRENT_VERSION =>
            {
                Ok(Some(index))
            }
            Ok(_) => {
                warn!("Ignoring mismatched cache index {}", path.display());
                Ok(None)
            }
            Err(e) => {
                warn!("Ignoring unreadable cache index {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Persist the index unless an equivalent one is already on disk
    pub fn write_index(&self, index: &CacheIndex) -> Result<()> {
        if let Some(existing) = self.read_index(&index.fingerprint)? {
            if existing.same_layout(index) {
                return Ok(());
            }
        }

        let path = self.index_path(&index.fingerprint);
        let json = serde_json::to_vec_pretty(index).map_err(|e| EtlError::Internal {
            message: format!("cache index serialization failed: {}", e),
        })?;
        self.write_atomic(&path, &json)?;
        info!(
            "Wrote cache index for {} ({} records, {} blocks)",
            index.fingerprint, index.record_count, index.block_count
        );
        Ok(())
    }

    fn block_lock(&self, key: &BlockKey) -> Arc<Mutex<()>> {
        self.block_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write to a unique temporary name, then rename over `path`
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir).map_err(|e| EtlError::cache_io(dir, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!("{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

        std::fs::write(&tmp, data).map_err(|e| EtlError::cache_io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(EtlError::cache_io(path, e));
        }
        Ok(())
    }
}
