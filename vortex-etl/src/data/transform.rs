//! Per-record field transforms
//!
//! Turns one raw manifest [`Record`] into fixed-shape tensors, one per
//! configured field.

use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::manifest::Record;
use super::tensor::Tensor;
use crate::config::{
    DecodeFailurePolicy, FieldConfig, FieldKind, ImageConfig, LabelConfig, LoaderConfig,
};
use crate::error::{EtlError, Result};

/// Field tensors for one record
#[derive(Debug, Clone)]
pub struct TransformedRecord {
    /// One tensor per field, in `etl` order
    pub tensors: Vec<Tensor>,
    /// Fields replaced by zeros after a decode failure
    pub substituted: usize,
}

/// Applies the configured field transforms to records
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    fields: Vec<FieldConfig>,
    root: Option<PathBuf>,
    policy: DecodeFailurePolicy,
}

impl RecordTransformer {
    /// Create a transformer from a loader configuration
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            fields: config.etl.clone(),
            root: config.manifest_root.clone(),
            policy: config.decode_failure,
        }
    }

    pub fn fields(&self) -> &[FieldConfig] {
        &self.fields
    }

    /// Transform one record
    ///
    /// Under [`DecodeFailurePolicy::Substitute`] a failing field becomes
    /// an all-zero tensor of its declared shape; under `Abort` the
    /// `FieldDecodeError` is returned.
    pub fn transform(&self, record: &Record) -> Result<TransformedRecord> {
        let mut tensors = Vec::with_capacity(self.fields.len());
        let mut substituted = 0;

        for (idx, field) in self.fields.iter().enumerate() {
            let decoded = match record.field(idx) {
                Some(value) => self.transform_field(idx, field, value),
                None => Err(EtlError::FieldDecodeError {
                    field: idx,
                    source_value: String::new(),
                    reason: format!("record {} has no column {}", record.index, idx),
                }),
            };

            match decoded {
                Ok(tensor) => tensors.push(tensor),
                Err(e) if self.policy == DecodeFailurePolicy::Substitute => {
                    warn!("Substituting zeros for record {}: {}", record.index, e);
                    tensors.push(Tensor::zeros(field.dtype(), field.shape()));
                    substituted += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(TransformedRecord {
            tensors,
            substituted,
        })
    }

    fn transform_field(&self, idx: usize, field: &FieldConfig, value: &str) -> Result<Tensor> {
        let decode_err = |reason: String| EtlError::FieldDecodeError {
            field: idx,
            source_value: value.to_string(),
            reason,
        };

        match &field.kind {
            FieldKind::Image(cfg) => {
                let path = self.resolve(value);
                decode_image(&path, cfg).map_err(decode_err)
            }
            FieldKind::Label(cfg) => decode_label(value, cfg).map_err(decode_err),
        }
    }

    fn resolve(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Decode an image file and resize it to a CHW `U8` tensor
fn decode_image(path: &Path, cfg: &ImageConfig) -> std::result::Result<Tensor, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| format!("cannot decode {}: {}", path.display(), e))?;

    let (h, w) = (cfg.height as usize, cfg.width as usize);
    let hwc = if cfg.channels == 1 {
        let luma = img.to_luma8();
        image::imageops::resize(&luma, cfg.width, cfg.height, FilterType::Triangle).into_raw()
    } else {
        let rgb = img.to_rgb8();
        image::imageops::resize(&rgb, cfg.width, cfg.height, FilterType::Triangle).into_raw()
    };

    let c = cfg.channels as usize;
    if hwc.len() != h * w * c {
        return Err(format!(
            "resized buffer length {} does not match {}x{}x{}",
            hwc.len(),
            c,
            h,
            w
        ));
    }

    // HWC -> CHW
    let mut chw = vec![0u8; hwc.len()];
    for (pixel, values) in hwc.chunks_exact(c).enumerate() {
        for (channel, v) in values.iter().enumerate() {
            chw[channel * h * w + pixel] = *v;
        }
    }

    Tensor::from_u8(vec![c, h, w], chw).map_err(|e| e.to_string())
}

/// Parse a label value into a scalar or one-hot tensor
fn decode_label(value: &str, cfg: &LabelConfig) -> std::result::Result<Tensor, String> {
    let class: i32 = value
        .trim()
        .parse()
        .map_err(|e| format!("label is not an integer: {}", e))?;

    if cfg.binary {
        return Tensor::from_i32(vec![1], &[class]).map_err(|e| e.to_string());
    }

    let num_classes = cfg.num_classes.unwrap_or(0);
    let slot = usize::try_from(class)
        .ok()
        .filter(|&c| c < num_classes)
        .ok_or_else(|| format!("class {} outside 0..{}", class, num_classes))?;
    let mut one_hot = vec![0f32; num_classes];
    one_hot[slot] = 1.0;
    Tensor::from_f32(vec![num_classes], &one_hot).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tensor::DType;

    fn record(fields: &[&str]) -> Record {
        Record {
            index: 0,
            fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_binary_label() {
        let config = LoaderConfig::new("m.csv", 1, vec![FieldConfig::label(true)]);
        let out = RecordTransformer::new(&config).transform(&record(&["2"])).unwrap();
        assert_eq!(out.tensors[0].shape(), &[1]);
        assert_eq!(out.tensors[0].to_i32_vec().unwrap(), vec![2]);
        assert_eq!(out.substituted, 0);
    }

    #[test]
    fn test_one_hot_label() {
        let config = LoaderConfig::new("m.csv", 1, vec![FieldConfig::one_hot(4)]);
        let out = RecordTransformer::new(&config).transform(&record(&["1"])).unwrap();
        assert_eq!(out.tensors[0].to_f32_vec().unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_missing_image_substituted() {
        let config = LoaderConfig::new(
            "m.csv",
            1,
            vec![FieldConfig::image(8, 6), FieldConfig::label(true)],
        )
        .with_manifest_root("/nonexistent/root");
        let out = RecordTransformer::new(&config)
            .transform(&record(&["missing.png", "1"]))
            .unwrap();
        assert_eq!(out.substituted, 1);
        assert_eq!(out.tensors[0].shape(), &[3, 8, 6]);
        assert_eq!(out.tensors[0].dtype(), DType::U8);
        assert!(out.tensors[0].as_bytes().iter().all(|&b| b == 0));
        assert_eq!(out.tensors[1].to_i32_vec().unwrap(), vec![1]);
    }

    #[test]
    fn test_missing_image_aborts() {
        let config = LoaderConfig::new("m.csv", 1, vec![FieldConfig::image(8, 8)])
            .with_manifest_root("/nonexistent/root")
            .with_decode_failure(DecodeFailurePolicy::Abort);
        let err = RecordTransformer::new(&config)
            .transform(&record(&["missing.png"]))
            .unwrap_err();
        assert!(matches!(err, EtlError::FieldDecodeError { field: 0, .. }));
    }

    #[test]
    fn test_bad_label_aborts() {
        let config = LoaderConfig::new("m.csv", 1, vec![FieldConfig::one_hot(2)])
            .with_decode_failure(DecodeFailurePolicy::Abort);
        let transformer = RecordTransformer::new(&config);
        assert!(transformer.transform(&record(&["cat"])).is_err());
        assert!(transformer.transform(&record(&["5"])).is_err());
        assert!(transformer.transform(&record(&["-1"])).is_err());
    }

    #[test]
    fn test_decode_and_resize_image() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::RgbImage::from_pixel(16, 10, image::Rgb([200, 100, 50]));
        img.save(dir.path().join("a.png")).unwrap();

        let config = LoaderConfig::new("m.csv", 1, vec![FieldConfig::image(4, 5)])
            .with_manifest_root(dir.path())
            .with_decode_failure(DecodeFailurePolicy::Abort);
        let out = RecordTransformer::new(&config).transform(&record(&["a.png"])).unwrap();
        let tensor = &out.tensors[0];
        assert_eq!(tensor.shape(), &[3, 4, 5]);

        // Planar layout: all red values first
        let near = |b: u8, v: u8| b.abs_diff(v) <= 1;
        let bytes = tensor.as_bytes();
        assert!(bytes[..20].iter().all(|&b| near(b, 200)));
        assert!(bytes[20..40].iter().all(|&b| near(b, 100)));
        assert!(bytes[40..].iter().all(|&b| near(b, 50)));
    }
}
