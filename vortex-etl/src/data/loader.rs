//! Batch loader
//!
//! Main interface: reads the manifest, subsets it, groups records into
//! fixed-size batches and yields `(inputs, targets)` pairs, going
//! through the block cache when one is configured.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use super::batch::{Batch, FieldBatch};
use super::manifest::{ManifestReader, Record};
use super::tensor::Tensor;
use super::transform::RecordTransformer;
use crate::cache::{self, BlockSource, CacheIndex, CacheStore, ComputedBlock};
use crate::config::{FieldRole, LoaderConfig};
use crate::error::{EtlError, Result};
use crate::metrics::LoaderMetrics;

/// Loader lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    /// Constructed, never iterated
    Created,
    /// An iteration pass is in progress
    Streaming,
    /// The last pass reached the end of the epoch
    Exhausted,
}

/// Where batches come from
enum Source {
    /// Manifest was read; blocks are computed on a cache miss
    Manifest(Arc<Vec<Record>>),
    /// Manifest absent; every block is served from the cache
    CacheOnly,
}

/// Manifest-driven batch loader
///
/// Restartable: each call to [`BatchLoader::iter`] re-walks the epoch
/// from the first batch in the same order. The final partial batch is
/// padded with records from the start of the subset, so every batch has
/// exactly `batch_size` rows; [`Batch::valid`] counts the real ones.
pub struct BatchLoader {
    config: LoaderConfig,
    transformer: RecordTransformer,
    roles: Vec<FieldRole>,
    source: Source,
    record_count: usize,
    batch_count: usize,
    block_count: usize,
    fingerprint: String,
    manifest_digest: String,
    cache: Option<Arc<CacheStore>>,
    metrics: Arc<LoaderMetrics>,
    state: Mutex<LoaderState>,
}

impl BatchLoader {
    /// Create a loader, caching under `config.cache_directory` if set
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let cache = config
            .cache_directory
            .as_ref()
            .map(|dir| CacheStore::new(dir.clone()));
        Self::with_cache(config, cache)
    }

    /// Create a loader with an explicit (possibly shared) cache store
    pub fn with_cache(config: LoaderConfig, cache: Option<Arc<CacheStore>>) -> Result<Self> {
        config.validate()?;
        let fingerprint = cache::fingerprint(&config)?;
        let manifest_path = config.manifest_path();

        let (source, record_count, manifest_digest) = match ManifestReader::read(&manifest_path) {
            Ok(mut manifest) => {
                if manifest.width() < config.etl.len() {
                    return Err(EtlError::config(format!(
                        "etl declares {} fields but {} has {} columns",
                        config.etl.len(),
                        manifest_path.display(),
                        manifest.width()
                    )));
                }
                if config.shuffle_manifest {
                    manifest.shuffle(config.random_seed);
                }
                manifest.truncate_to_fraction(config.subset_fraction);
                let records = manifest.records().to_vec();
                let count = records.len();
                let digest = cache::manifest_digest(&records);
                (Source::Manifest(Arc::new(records)), count, digest)
            }
            Err(EtlError::ManifestNotFound { path }) => {
                let index = match &cache {
                    Some(store) => store.read_index(&fingerprint)?,
                    None => None,
                };
                let complete = match (&index, &cache) {
                    (Some(index), Some(store)) => store.has_blocks(
                        &fingerprint,
                        &index.manifest_digest,
                        index.block_count,
                    )?,
                    _ => false,
                };
                match index {
                    Some(index) if complete => {
                        info!(
                            "Manifest {} missing, serving {} records from cache {}",
                            path.display(),
                            index.record_count,
                            fingerprint
                        );
                        (Source::CacheOnly, index.record_count, index.manifest_digest)
                    }
                    _ => return Err(EtlError::ManifestNotFound { path }),
                }
            }
            Err(e) => return Err(e),
        };

        let batch_count = record_count.div_ceil(config.batch_size);
        let block_count = batch_count.div_ceil(config.block_size);

        if let (Some(store), Source::Manifest(_)) = (&cache, &source) {
            store.write_index(&CacheIndex::new(
                fingerprint.clone(),
                manifest_digest.clone(),
                record_count,
                batch_count,
                block_count,
            ))?;
        }

        info!(
            "BatchLoader ready: {} records, {} batches of {}, {} blocks",
            record_count, batch_count, config.batch_size, block_count
        );

        Ok(Self {
            transformer: RecordTransformer::new(&config),
            roles: config.etl.iter().map(|f| f.role()).collect(),
            config,
            source,
            record_count,
            batch_count,
            block_count,
            fingerprint,
            manifest_digest,
            cache,
            metrics: Arc::new(LoaderMetrics::new()),
            state: Mutex::new(LoaderState::Created),
        })
    }

    /// Start a fresh pass over the epoch
    pub fn iter(&self) -> BatchIter<'_> {
        *self.state.lock() = LoaderState::Streaming;
        BatchIter {
            loader: self,
            next_batch: 0,
            pending: VecDeque::new(),
            failed: false,
        }
    }

    /// Records in the (subset) epoch, excluding padding
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Batches per epoch: `ceil(record_count / batch_size)`
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Digest of the epoch's manifest records (from the index in cache-only mode)
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn state(&self) -> LoaderState {
        *self.state.lock()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn metrics(&self) -> &LoaderMetrics {
        &self.metrics
    }

    /// Whether batches are served without reading the manifest
    pub fn is_cache_only(&self) -> bool {
        matches!(self.source, Source::CacheOnly)
    }

    fn load_block(&self, block_id: usize) -> Result<Vec<FieldBatch>> {
        let store = match &self.cache {
            Some(store) => store,
            None => {
                return self
                    .metrics
                    .block_load_duration
                    .time(|| self.compute_block(block_id))
                    .map(|computed| computed.batches)
            }
        };

        let (batches, source) = self.metrics.block_load_duration.time(|| {
            store.get_or_compute(
                &self.fingerprint,
                &self.manifest_digest,
                block_id as u64,
                || self.compute_block(block_id),
            )
        })?;
        match source {
            BlockSource::Cache => self.metrics.cache_hits.inc(),
            BlockSource::Computed { written } => {
                self.metrics.cache_misses.inc();
                if written {
                    self.metrics.cache_writes.inc();
                }
            }
        }
        Ok(batches)
    }

    /// Transform the records of one block
    fn compute_block(&self, block_id: usize) -> Result<ComputedBlock> {
        let records = match &self.source {
            Source::Manifest(records) => records,
            Source::CacheOnly => {
                return Err(EtlError::ManifestNotFound {
                    path: self.config.manifest_path(),
                })
            }
        };

        let first = block_id * self.config.block_size;
        let last = (first + self.config.block_size).min(self.batch_count);
        let mut batches = Vec::with_capacity(last - first);
        let mut substituted = 0;

        for batch_idx in first..last {
            let batch_size = self.config.batch_size;
            let start = batch_idx * batch_size;
            let valid = batch_size.min(records.len() - start);

            let mut per_field: Vec<Vec<Tensor>> =
                vec![Vec::with_capacity(batch_size); self.roles.len()];
            for offset in 0..batch_size {
                // Wrap-around padding for the final partial batch
                let record = &records[(start + offset) % records.len()];
                let transformed = self.transformer.transform(record)?;
                substituted += transformed.substituted;
                for (slot, tensor) in per_field.iter_mut().zip(transformed.tensors) {
                    slot.push(tensor);
                }
            }

            let tensors = per_field
                .iter()
                .map(|samples| Tensor::stack(samples))
                .collect::<Result<Vec<_>>>()?;
            batches.push(FieldBatch {
                index: batch_idx,
                valid,
                tensors,
            });
        }

        if substituted > 0 {
            self.metrics.records_substituted.add(substituted as u64);
        }
        debug!(
            "Computed block {} ({} batches, {} substituted fields)",
            block_id,
            batches.len(),
            substituted
        );

        Ok(ComputedBlock {
            batches,
            persist: substituted == 0,
        })
    }
}

impl<'a> IntoIterator for &'a BatchLoader {
    type Item = Result<Batch>;
    type IntoIter = BatchIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over a loader's epoch
///
/// Yields `Err` at most once; iteration stops after an error.
pub struct BatchIter<'a> {
    loader: &'a BatchLoader,
    next_batch: usize,
    pending: VecDeque<FieldBatch>,
    failed: bool,
}

impl BatchIter<'_> {
    /// Batches not yet yielded in this pass
    pub fn remaining(&self) -> usize {
        if self.failed {
            0
        } else {
            self.loader.batch_count - self.next_batch
        }
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.next_batch >= self.loader.batch_count {
            *self.loader.state.lock() = LoaderState::Exhausted;
            return None;
        }

        if self.pending.is_empty() {
            let block_id = self.next_batch / self.loader.config.block_size;
            match self.loader.load_block(block_id) {
                Ok(batches) => self.pending.extend(batches),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let batch = match self.pending.pop_front() {
            Some(batch) if batch.index == self.next_batch => batch,
            other => {
                self.failed = true;
                return Some(Err(EtlError::Internal {
                    message: format!(
                        "block for batch {} returned {:?}",
                        self.next_batch,
                        other.map(|b| b.index)
                    ),
                }));
            }
        };

        self.next_batch += 1;
        let metrics = &self.loader.metrics;
        metrics.batches_produced.inc();
        metrics.records_processed.add(batch.valid as u64);

        Some(Ok(Batch::from_fields(batch, &self.loader.roles)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (0, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldConfig;

    fn write_manifest(dir: &std::path::Path, rows: usize) {
        let text: String = (0..rows).map(|i| format!("{}\n", i)).collect();
        std::fs::write(dir.join("labels.csv"), text).unwrap();
    }

    fn labels_config(dir: &std::path::Path, batch_size: usize) -> LoaderConfig {
        LoaderConfig::new("labels.csv", batch_size, vec![FieldConfig::label(true)])
            .with_manifest_root(dir)
    }

    fn labels(batch: &Batch) -> Vec<i32> {
        batch.targets[0].to_i32_vec().unwrap()
    }

    #[test]
    fn test_partial_batch_wraps_around() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 5);
        let loader = BatchLoader::new(labels_config(dir.path(), 2)).unwrap();
        assert_eq!(loader.batch_count(), 3);

        let batches: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        assert_eq!(labels(&batches[0]), vec![0, 1]);
        assert_eq!(labels(&batches[2]), vec![4, 0]);
        assert_eq!(batches[2].valid, 1);
        assert!(batches[2].is_padded());
        assert_eq!(loader.metrics().records_processed.get(), 5);
        assert_eq!(loader.metrics().block_load_duration.count(), 3);
    }

    #[test]
    fn test_state_machine_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 3);
        let loader = BatchLoader::new(labels_config(dir.path(), 1)).unwrap();
        assert_eq!(loader.state(), LoaderState::Created);

        let mut iter = loader.iter();
        iter.next().unwrap().unwrap();
        assert_eq!(loader.state(), LoaderState::Streaming);
        assert_eq!(iter.remaining(), 2);
        let rest: Vec<_> = iter.collect::<Result<_>>().unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(loader.state(), LoaderState::Exhausted);

        let first: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        let second: Vec<Batch> = (&loader).into_iter().collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_subset_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 10);
        let loader =
            BatchLoader::new(labels_config(dir.path(), 4).with_subset_fraction(0.5)).unwrap();
        assert_eq!(loader.record_count(), 5);
        let all: Vec<i32> = loader
            .iter()
            .flat_map(|b| labels(&b.unwrap()))
            .collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4, 0, 1, 2]);
    }

    #[test]
    fn test_too_few_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 2);
        let config = LoaderConfig::new(
            "labels.csv",
            1,
            vec![FieldConfig::label(true), FieldConfig::label(true)],
        )
        .with_manifest_root(dir.path());
        assert!(matches!(
            BatchLoader::new(config),
            Err(EtlError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_missing_manifest_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let err = BatchLoader::new(labels_config(dir.path(), 1)).err().unwrap();
        assert!(matches!(err, EtlError::ManifestNotFound { .. }));
    }
}
