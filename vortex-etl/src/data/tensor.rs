//! Dense little-endian tensors
//!
//! Tensors own their bytes through [`Bytes`] so batches can be sliced
//! out of cache blocks without copying.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};

/// Element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I32,
    F32,
}

impl DType {
    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
        }
    }
}

/// A dense tensor with row-major layout
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl Tensor {
    /// Wrap raw bytes, checking they match the shape
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(dtype.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| EtlError::Internal {
                message: format!("tensor shape {:?} overflows", shape),
            })?;
        if data.len() != expected {
            return Err(EtlError::Internal {
                message: format!(
                    "tensor of shape {:?} ({:?}) needs {} bytes, got {}",
                    shape,
                    dtype,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// All-zero tensor
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_in_bytes();
        Self {
            dtype,
            shape,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self> {
        Self::from_bytes(DType::U8, shape, Bytes::from(values))
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(DType::I32, shape, buf.freeze())
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(DType::F32, shape, buf.freeze())
    }

    /// Stack same-shaped tensors along a new leading dimension
    pub fn stack(tensors: &[Tensor]) -> Result<Self> {
        let first = tensors.first().ok_or_else(|| EtlError::Internal {
            message: "cannot stack zero tensors".into(),
        })?;
        let mut buf = BytesMut::with_capacity(first.data.len() * tensors.len());
        for t in tensors {
            if t.dtype != first.dtype || t.shape != first.shape {
                return Err(EtlError::Internal {
                    message: format!(
                        "cannot stack {:?}{:?} with {:?}{:?}",
                        first.dtype, first.shape, t.dtype, t.shape
                    ),
                });
            }
            buf.extend_from_slice(&t.data);
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(tensors.len());
        shape.extend_from_slice(&first.shape);
        Self::from_bytes(first.dtype, shape, buf.freeze())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Decode elements as `i32` (only for `I32` tensors)
    pub fn to_i32_vec(&self) -> Option<Vec<i32>> {
        if self.dtype != DType::I32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Decode elements as `f32` (only for `F32` tensors)
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}
