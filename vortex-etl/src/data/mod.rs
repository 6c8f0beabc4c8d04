//! Data loading pipeline
//!
//! Manifest reading, per-record transforms and batch assembly.

pub mod batch;
pub mod loader;
pub mod manifest;
pub mod tensor;
pub mod transform;

pub use batch::{Batch, FieldBatch};
pub use loader::{BatchIter, BatchLoader, LoaderState};
pub use manifest::{Manifest, ManifestReader, Record};
pub use tensor::{DType, Tensor};
pub use transform::{RecordTransformer, TransformedRecord};
