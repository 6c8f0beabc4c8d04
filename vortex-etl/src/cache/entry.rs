//! On-disk cache block format
//!
//! ```text
//! magic "VXETLBLK" | header length (u32 LE) | JSON header | payload
//! ```
//!
//! The header names the fingerprint, manifest digest and block id it was
//! written for and carries a CRC32C of the payload, so stale or torn
//! entries are detectable without any side files.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::batch::FieldBatch;
use crate::data::tensor::{DType, Tensor};
use crate::error::{EtlError, Result};

/// Leading bytes of every block file
pub const BLOCK_MAGIC: &[u8; 8] = b"VXETLBLK";

/// Current block format version
pub const BLOCK_FORMAT_VERSION: u32 = 1;

/// Shape and type of one stored tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorHeader {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

/// Per-batch metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub index: usize,
    pub valid: usize,
    pub tensors: Vec<TensorHeader>,
}

/// Self-describing block header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub fingerprint: String,
    /// Digest of the manifest records the block was computed from
    pub manifest_digest: String,
    pub block_id: u64,
    pub batches: Vec<BatchHeader>,
    pub payload_len: u64,
    pub crc32c: u32,
}

/// Serialize a block of batches
pub fn encode_block(
    fingerprint: &str,
    manifest_digest: &str,
    block_id: u64,
    batches: &[FieldBatch],
) -> Result<Bytes> {
    let mut payload = BytesMut::new();
    let mut headers = Vec::with_capacity(batches.len());

    for batch in batches {
        let mut tensors = Vec::with_capacity(batch.tensors.len());
        for tensor in &batch.tensors {
            payload.extend_from_slice(tensor.as_bytes());
            tensors.push(TensorHeader {
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
            });
        }
        headers.push(BatchHeader {
            index: batch.index,
            valid: batch.valid,
            tensors,
        });
    }

    let header = BlockHeader {
        version: BLOCK_FORMAT_VERSION,
        fingerprint: fingerprint.to_string(),
        manifest_digest: manifest_digest.to_string(),
        block_id,
        batches: headers,
        payload_len: payload.len() as u64,
        crc32c: crc32c::crc32c(&payload),
    };
    let header_json = serde_json::to_vec(&header).map_err(|e| EtlError::Internal {
        message: format!("block header serialization failed: {}", e),
    })?;

    let mut out = BytesMut::with_capacity(BLOCK_MAGIC.len() + 4 + header_json.len() + payload.len());
    out.extend_from_slice(BLOCK_MAGIC);
    out.put_u32_le(header_json.len() as u32);
    out.extend_from_slice(&header_json);
    out.extend_from_slice(&payload);
    Ok(out.freeze())
}

/// Parse a block, verifying it belongs to `(fingerprint, manifest_digest, block_id)`
///
/// `path` is only used for error reporting. Tensors share `data`.
pub fn decode_block(
    path: &Path,
    data: Bytes,
    fingerprint: &str,
    manifest_digest: &str,
    block_id: u64,
) -> Result<Vec<FieldBatch>> {
    let corrupt = |reason: String| EtlError::CacheCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let prefix = BLOCK_MAGIC.len() + 4;
    if data.len() < prefix || &data[..BLOCK_MAGIC.len()] != BLOCK_MAGIC {
        return Err(corrupt("missing block magic".into()));
    }
    let len_bytes = &data[BLOCK_MAGIC.len()..prefix];
    let header_len =
        u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if data.len() < prefix + header_len {
        return Err(corrupt("truncated header".into()));
    }

    let header: BlockHeader = serde_json::from_slice(&data[prefix..prefix + header_len])
        .map_err(|e| corrupt(format!("unreadable header: {}", e)))?;

    if header.version != BLOCK_FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} (expected {})",
            header.version, BLOCK_FORMAT_VERSION
        )));
    }
    if header.fingerprint != fingerprint || header.block_id != block_id {
        return Err(corrupt(format!(
            "entry is for {}/{} not {}/{}",
            header.fingerprint, header.block_id, fingerprint, block_id
        )));
    }
    if header.manifest_digest != manifest_digest {
        return Err(corrupt(format!(
            "entry was computed from manifest {} not {}",
            header.manifest_digest, manifest_digest
        )));
    }

    let payload = data.slice(prefix + header_len..);
    if payload.len() as u64 != header.payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    let actual = crc32c::crc32c(&payload);
    if actual != header.crc32c {
        return Err(EtlError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.crc32c,
            actual,
        });
    }

    let mut offset = 0usize;
    let mut batches = Vec::with_capacity(header.batches.len());
    for batch in header.batches {
        let mut tensors = Vec::with_capacity(batch.tensors.len());
        for th in batch.tensors {
            let len = th
                .shape
                .iter()
                .try_fold(th.dtype.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
                .ok_or_else(|| corrupt(format!("tensor shape {:?} overflows", th.shape)))?;
            let end = offset
                .checked_add(len)
                .filter(|&end| end <= payload.len())
                .ok_or_else(|| corrupt("tensor extends past payload".into()))?;
            let bytes = payload.slice(offset..end);
            offset = end;
            tensors.push(Tensor::from_bytes(th.dtype, th.shape, bytes)?);
        }
        batches.push(FieldBatch {
            index: batch.index,
            valid: batch.valid,
            tensors,
        });
    }
    if offset != payload.len() {
        return Err(corrupt(format!("{} trailing payload bytes", payload.len() - offset)));
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<FieldBatch> {
        vec![
            FieldBatch {
                index: 0,
                valid: 1,
                tensors: vec![
                    Tensor::from_u8(vec![1, 1, 2, 2], vec![1, 2, 3, 4]).unwrap(),
                    Tensor::from_i32(vec![1, 1], &[7]).unwrap(),
                ],
            },
            FieldBatch {
                index: 1,
                valid: 1,
                tensors: vec![
                    Tensor::from_u8(vec![1, 1, 2, 2], vec![5, 6, 7, 8]).unwrap(),
                    Tensor::from_i32(vec![1, 1], &[9]).unwrap(),
                ],
            },
        ]
    }

    #[test]
    fn test_block_roundtrip() {
        let batches = sample();
        let data = encode_block("abc", "m1", 3, &batches).unwrap();
        let decoded = decode_block(Path::new("b"), data, "abc", "m1", 3).unwrap();
        assert_eq!(decoded, batches);
    }

    #[test]
    fn test_fingerprint_mismatch_is_stale() {
        let data = encode_block("abc", "m1", 0, &sample()).unwrap();
        let err = decode_block(Path::new("b"), data.clone(), "def", "m1", 0).unwrap_err();
        assert!(err.is_corruption());
        let err = decode_block(Path::new("b"), data.clone(), "abc", "m1", 1).unwrap_err();
        assert!(err.is_corruption());
        let err = decode_block(Path::new("b"), data, "abc", "m2", 0).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_payload_bitflip_detected() {
        let data = encode_block("abc", "m1", 0, &sample()).unwrap();
        let mut raw = data.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let err = decode_block(Path::new("b"), Bytes::from(raw), "abc", "m1", 0).unwrap_err();
        assert!(matches!(err, EtlError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_entry() {
        let data = encode_block("abc", "m1", 0, &sample()).unwrap();
        let err = decode_block(Path::new("b"), data.slice(..data.len() - 3), "abc", "m1", 0).unwrap_err();
        assert!(err.is_corruption());
        assert!(decode_block(Path::new("b"), Bytes::from_static(b"VX"), "abc", "m1", 0).is_err());
    }

    #[test]
    fn test_oversized_shape_is_corrupt() {
        let header = BlockHeader {
            version: BLOCK_FORMAT_VERSION,
            fingerprint: "abc".into(),
            manifest_digest: "m1".into(),
            block_id: 0,
            batches: vec![BatchHeader {
                index: 0,
                valid: 1,
                tensors: vec![TensorHeader {
                    dtype: DType::I32,
                    shape: vec![4294967296, 4294967296],
                }],
            }],
            payload_len: 0,
            crc32c: crc32c::crc32c(&[]),
        };
        let header_json = serde_json::to_vec(&header).unwrap();
        let mut raw = BLOCK_MAGIC.to_vec();
        raw.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
        raw.extend_from_slice(&header_json);

        let err = decode_block(Path::new("b"), Bytes::from(raw), "abc", "m1", 0).unwrap_err();
        assert!(matches!(err, EtlError::CacheCorrupt { .. }));
    }
}
