//! Error types for the ETL loader
//!
//! Error taxonomy covering manifest, configuration, transform,
//! and cache failures.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for all loader operations
#[derive(Debug, Error)]
pub enum EtlError {
    // ========== Manifest Errors ==========

    /// Manifest file absent and no cache can stand in for it
    #[error("Manifest not found: {}", path.display())]
    ManifestNotFound { path: PathBuf },

    /// Manifest could not be parsed
    #[error("Malformed manifest {} at line {line}: {reason}", path.display())]
    ManifestMalformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    // ========== Configuration Errors ==========

    /// Invalid or incomplete configuration bundle
    #[error("Configuration error: {reason}")]
    ConfigurationError { reason: String },

    // ========== Transform Errors ==========

    /// A record field could not be decoded
    #[error("Failed to decode field {field} from '{source_value}': {reason}")]
    FieldDecodeError {
        field: usize,
        source_value: String,
        reason: String,
    },

    // ========== Cache Errors ==========

    /// Cache I/O failed (disk full, permission denied, ...)
    #[error("Cache I/O failed for {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache entry is structurally invalid
    #[error("Corrupt cache entry {}: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },

    /// Checksum mismatch on cache read
    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    // ========== Iteration Errors ==========

    /// Data exhausted (end of epoch)
    #[error("Data exhausted for current epoch")]
    DataExhausted,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EtlError {
    /// Returns true if the loader cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EtlError::ManifestNotFound { .. }
                | EtlError::ManifestMalformed { .. }
                | EtlError::ConfigurationError { .. }
                | EtlError::CacheIo { .. }
        )
    }

    /// Returns true if this error indicates a damaged cache entry
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EtlError::ChecksumMismatch { .. } | EtlError::CacheCorrupt { .. }
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        EtlError::ConfigurationError {
            reason: reason.into(),
        }
    }

    pub(crate) fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EtlError::CacheIo {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = EtlError::config("batch_size must be positive");
        assert!(err.is_fatal());
        assert!(!err.is_corruption());

        let err = EtlError::ChecksumMismatch {
            path: PathBuf::from("block_000000.bin"),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_corruption());
        assert!(!err.is_fatal());

        let err = EtlError::FieldDecodeError {
            field: 0,
            source_value: "missing.png".into(),
            reason: "not found".into(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_display_includes_path() {
        let err = EtlError::ManifestNotFound {
            path: PathBuf::from("/data/train.csv"),
        };
        assert_eq!(err.to_string(), "Manifest not found: /data/train.csv");
    }
}
