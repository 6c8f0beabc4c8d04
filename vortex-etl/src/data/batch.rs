//! Batches of transformed records

use super::tensor::Tensor;
use crate::config::FieldRole;

/// One batch with tensors in `etl` field order
///
/// This is the unit stored in cache blocks; roles are applied when it
/// is turned into a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBatch {
    /// Batch position within the epoch
    pub index: usize,
    /// Leading records that are real (the rest is wrap-around padding)
    pub valid: usize,
    /// One tensor per field, shape `(batch_size, *field_shape)`
    pub tensors: Vec<Tensor>,
}

/// A batch ready for training: `(inputs, targets)`
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Batch position within the epoch
    pub index: usize,
    /// Leading records that are real (the rest is wrap-around padding)
    pub valid: usize,
    /// Input-role field tensors, in `etl` order
    pub inputs: Vec<Tensor>,
    /// Target-role field tensors, in `etl` order
    pub targets: Vec<Tensor>,
}

impl Batch {
    /// Split field tensors by role
    pub fn from_fields(batch: FieldBatch, roles: &[FieldRole]) -> Self {
        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        for (tensor, role) in batch.tensors.into_iter().zip(roles) {
            match role {
                FieldRole::Input => inputs.push(tensor),
                FieldRole::Target => targets.push(tensor),
            }
        }
        Self {
            index: batch.index,
            valid: batch.valid,
            inputs,
            targets,
        }
    }

    /// Batch cardinality (including padding)
    pub fn size(&self) -> usize {
        self.inputs
            .iter()
            .chain(&self.targets)
            .next()
            .map_or(0, |t| t.shape()[0])
    }

    /// Whether the batch was completed with wrap-around records
    pub fn is_padded(&self) -> bool {
        self.valid < self.size()
    }

    pub fn into_pair(self) -> (Vec<Tensor>, Vec<Tensor>) {
        (self.inputs, self.targets)
    }
}
