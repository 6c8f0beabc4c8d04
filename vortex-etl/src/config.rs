//! Loader configuration bundle
//!
//! Parsed from a JSON mapping. Unknown keys are ignored; missing
//! required keys and out-of-range values surface as
//! [`EtlError::ConfigurationError`] at construction.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data::tensor::DType;
use crate::error::{EtlError, Result};

/// Default cache granularity, in batches
pub const DEFAULT_BLOCK_SIZE: usize = 1;

/// Default number of image channels (RGB)
pub const DEFAULT_IMAGE_CHANNELS: u32 = 3;

/// What to do when a record field cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Replace the field with an all-zero tensor and keep going
    #[default]
    Substitute,
    /// Surface a `FieldDecodeError` from the iterator
    Abort,
}

/// Whether a field's tensors are model inputs or training targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldRole {
    Input,
    Target,
}

/// Image transform: decode and resize to a fixed CHW shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub height: u32,
    pub width: u32,
    /// 3 for RGB, 1 for luma
    #[serde(default = "default_channels")]
    pub channels: u32,
}

/// Label transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Emit the raw class as a single scalar channel
    #[serde(default)]
    pub binary: bool,
    /// One-hot width when `binary` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,
}

/// Transform kind, tagged by the `type` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    Image(ImageConfig),
    Label(LabelConfig),
}

/// Declarative transform spec for one manifest column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Overrides the role implied by the kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<FieldRole>,
}

impl FieldConfig {
    /// RGB image field
    pub fn image(height: u32, width: u32) -> Self {
        Self {
            kind: FieldKind::Image(ImageConfig {
                height,
                width,
                channels: DEFAULT_IMAGE_CHANNELS,
            }),
            role: None,
        }
    }

    /// Label field emitted as a single scalar
    pub fn label(binary: bool) -> Self {
        Self {
            kind: FieldKind::Label(LabelConfig {
                binary,
                num_classes: None,
            }),
            role: None,
        }
    }

    /// Label field emitted as a one-hot vector
    pub fn one_hot(num_classes: usize) -> Self {
        Self {
            kind: FieldKind::Label(LabelConfig {
                binary: false,
                num_classes: Some(num_classes),
            }),
            role: None,
        }
    }

    /// Set an explicit role
    pub fn with_role(mut self, role: FieldRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Effective role: images are inputs, labels are targets
    pub fn role(&self) -> FieldRole {
        self.role.unwrap_or(match self.kind {
            FieldKind::Image(_) => FieldRole::Input,
            FieldKind::Label(_) => FieldRole::Target,
        })
    }

    /// Per-record output shape (without the batch dimension)
    pub fn shape(&self) -> Vec<usize> {
        match &self.kind {
            FieldKind::Image(img) => vec![
                img.channels as usize,
                img.height as usize,
                img.width as usize,
            ],
            FieldKind::Label(label) if label.binary => vec![1],
            FieldKind::Label(label) => vec![label.num_classes.unwrap_or(0)],
        }
    }

    /// Element type of the output tensor
    pub fn dtype(&self) -> DType {
        match &self.kind {
            FieldKind::Image(_) => DType::U8,
            FieldKind::Label(label) if label.binary => DType::I32,
            FieldKind::Label(_) => DType::F32,
        }
    }

    fn validate(&self, idx: usize) -> Result<()> {
        match &self.kind {
            FieldKind::Image(img) => {
                if img.height == 0 || img.width == 0 {
                    return Err(EtlError::config(format!(
                        "etl[{}]: image height and width must be positive",
                        idx
                    )));
                }
                if img.channels != 1 && img.channels != 3 {
                    return Err(EtlError::config(format!(
                        "etl[{}]: image channels must be 1 or 3, got {}",
                        idx, img.channels
                    )));
                }
            }
            FieldKind::Label(label) => {
                if !label.binary && label.num_classes.map_or(true, |n| n == 0) {
                    return Err(EtlError::config(format!(
                        "etl[{}]: non-binary label requires num_classes >= 1",
                        idx
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Configuration bundle for a [`crate::BatchLoader`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Manifest file, relative to `manifest_root` unless absolute
    pub manifest_filename: PathBuf,
    /// Directory the manifest and its relative record paths live in
    #[serde(default)]
    pub manifest_root: Option<PathBuf>,
    /// Records per batch
    pub batch_size: usize,
    /// Fraction of manifest rows to use, in (0, 1]
    #[serde(default = "default_subset_fraction")]
    pub subset_fraction: f64,
    /// Batches per cache block
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Cache location; caching is disabled when absent
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,
    /// Shuffle manifest rows (deterministically) before subsetting
    #[serde(default)]
    pub shuffle_manifest: bool,
    /// Seed for the manifest shuffle
    #[serde(default)]
    pub random_seed: u64,
    /// Per-record decode failure handling
    #[serde(default)]
    pub decode_failure: DecodeFailurePolicy,
    /// Ordered field transforms; field `i` consumes manifest column `i`
    pub etl: Vec<FieldConfig>,
}

fn default_subset_fraction() -> f64 {
    1.0
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_channels() -> u32 {
    DEFAULT_IMAGE_CHANNELS
}

impl LoaderConfig {
    /// Create a configuration with defaults for all optional keys
    pub fn new(
        manifest_filename: impl Into<PathBuf>,
        batch_size: usize,
        etl: Vec<FieldConfig>,
    ) -> Self {
        Self {
            manifest_filename: manifest_filename.into(),
            manifest_root: None,
            batch_size,
            subset_fraction: default_subset_fraction(),
            block_size: DEFAULT_BLOCK_SIZE,
            cache_directory: None,
            shuffle_manifest: false,
            random_seed: 0,
            decode_failure: DecodeFailurePolicy::default(),
            etl,
        }
    }

    /// Set the manifest root directory
    pub fn with_manifest_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.manifest_root = Some(root.into());
        self
    }

    /// Set the cache directory
    pub fn with_cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_directory = Some(dir.into());
        self
    }

    /// Set the cache block size (in batches)
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the subset fraction
    pub fn with_subset_fraction(mut self, fraction: f64) -> Self {
        self.subset_fraction = fraction;
        self
    }

    /// Set the decode failure policy
    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    /// Enable a seeded manifest shuffle
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_manifest = true;
        self.random_seed = seed;
        self
    }

    /// Parse and validate a configuration mapping
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| EtlError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| EtlError::config(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EtlError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.manifest_filename.as_os_str().is_empty() {
            return Err(EtlError::config("manifest_filename must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(EtlError::config("batch_size must be positive"));
        }
        if self.block_size == 0 {
            return Err(EtlError::config("block_size must be positive"));
        }
        if !(self.subset_fraction > 0.0 && self.subset_fraction <= 1.0) {
            return Err(EtlError::config(format!(
                "subset_fraction must be in (0, 1], got {}",
                self.subset_fraction
            )));
        }
        if self.etl.is_empty() {
            return Err(EtlError::config("etl must declare at least one field"));
        }
        for (idx, field) in self.etl.iter().enumerate() {
            field.validate(idx)?;
        }
        Ok(())
    }

    /// Full manifest path
    pub fn manifest_path(&self) -> PathBuf {
        self.resolve(&self.manifest_filename)
    }

    /// Resolve a path relative to `manifest_root`
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.manifest_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario() -> serde_json::Value {
        json!({
            "manifest_filename": "train.csv",
            "manifest_root": "/data",
            "batch_size": 1,
            "subset_fraction": 1.0,
            "block_size": 2,
            "cache_directory": "/cache",
            "etl": [
                {"type": "image", "height": 224, "width": 224},
                {"type": "label", "binary": true}
            ]
        })
    }

    #[test]
    fn test_parse_scenario() {
        let config = LoaderConfig::from_value(scenario()).unwrap();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.block_size, 2);
        assert_eq!(config.manifest_path(), PathBuf::from("/data/train.csv"));
        assert_eq!(config.etl[0].shape(), vec![3, 224, 224]);
        assert_eq!(config.etl[0].role(), FieldRole::Input);
        assert_eq!(config.etl[1].shape(), vec![1]);
        assert_eq!(config.etl[1].role(), FieldRole::Target);
        assert_eq!(config.decode_failure, DecodeFailurePolicy::Substitute);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let mut value = scenario();
        value["shuffle_enable"] = json!(true);
        value["etl"][0]["flip_enable"] = json!(true);
        assert!(LoaderConfig::from_value(value).is_ok());
    }

    #[test]
    fn test_missing_required_keys() {
        for key in ["manifest_filename", "batch_size", "etl"] {
            let mut value = scenario();
            value.as_object_mut().unwrap().remove(key);
            let err = LoaderConfig::from_value(value).unwrap_err();
            assert!(
                matches!(err, EtlError::ConfigurationError { .. }),
                "missing {} gave {:?}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_range_checks() {
        let mut value = scenario();
        value["batch_size"] = json!(0);
        assert!(LoaderConfig::from_value(value).is_err());

        let mut value = scenario();
        value["subset_fraction"] = json!(0.0);
        assert!(LoaderConfig::from_value(value).is_err());

        let mut value = scenario();
        value["subset_fraction"] = json!(1.5);
        assert!(LoaderConfig::from_value(value).is_err());

        let mut value = scenario();
        value["etl"][1] = json!({"type": "label", "binary": false});
        assert!(LoaderConfig::from_value(value).is_err());

        let mut value = scenario();
        value["etl"][0]["height"] = json!(0);
        assert!(LoaderConfig::from_value(value).is_err());
    }

    #[test]
    fn test_one_hot_and_role_override() {
        let field = FieldConfig::one_hot(10).with_role(FieldRole::Input);
        assert_eq!(field.shape(), vec![10]);
        assert_eq!(field.dtype(), DType::F32);
        assert_eq!(field.role(), FieldRole::Input);
    }

    #[test]
    fn test_absolute_manifest_ignores_root() {
        let config = LoaderConfig::new("/abs/train.csv", 4, vec![FieldConfig::label(true)])
            .with_manifest_root("/data");
        assert_eq!(config.manifest_path(), PathBuf::from("/abs/train.csv"));
        assert_eq!(config.resolve("img/0.png"), PathBuf::from("/data/img/0.png"));
    }
}
