//! Manifest reading
//!
//! A manifest is a CSV index of records, one per line, with quoting
//! handled by the `csv` crate. Blank lines and `#` comments are skipped;
//! an optional leading `@` row names the columns.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{EtlError, Result};

/// One logical sample: the raw field values of a manifest row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Position in the manifest file (0-based, among records)
    pub index: usize,
    /// Raw column values
    pub fields: Vec<String>,
}

impl Record {
    pub fn field(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(String::as_str)
    }
}

/// Ordered sequence of records with a fixed column count
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    columns: Option<Vec<String>>,
    width: usize,
    records: Vec<Record>,
}

impl Manifest {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column names from the `@` header row, if present
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Fields per record
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reorder records with a seeded deterministic shuffle
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng_state = seed;
        for i in (1..self.records.len()).rev() {
            rng_state = rng_state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let j = ((rng_state >> 33) % (i as u64 + 1)) as usize;
            self.records.swap(i, j);
        }
    }

    /// Keep the leading `ceil(len * fraction)` records (at least one)
    pub fn truncate_to_fraction(&mut self, fraction: f64) {
        let keep = subset_len(self.records.len(), fraction);
        self.records.truncate(keep);
    }
}

/// Number of rows kept for a subset fraction
pub fn subset_len(rows: usize, fraction: f64) -> usize {
    if rows == 0 {
        return 0;
    }
    let keep = (rows as f64 * fraction).ceil() as usize;
    keep.clamp(1, rows)
}

/// Parses manifest files into [`Manifest`]s
pub struct ManifestReader;

impl ManifestReader {
    /// Read and parse a manifest file
    pub fn read(path: impl AsRef<Path>) -> Result<Manifest> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EtlError::ManifestNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => {
                return Err(EtlError::ManifestMalformed {
                    path: path.to_path_buf(),
                    line: 0,
                    reason: format!("unreadable: {}", e),
                });
            }
        };

        let manifest = Self::parse(path, &text)?;
        info!(
            "Loaded manifest {} ({} records, {} columns)",
            path.display(),
            manifest.len(),
            manifest.width()
        );
        Ok(manifest)
    }

    /// Parse manifest text; `path` is used for error reporting
    pub fn parse(path: impl AsRef<Path>, text: &str) -> Result<Manifest> {
        let path = path.as_ref().to_path_buf();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut columns = None;
        let mut width = None;
        let mut records = Vec::new();

        for row in reader.records() {
            let row = row.map_err(|e| EtlError::ManifestMalformed {
                path: path.clone(),
                line: e.position().map_or(0, |p| p.line() as usize),
                reason: e.to_string(),
            })?;
            let line = row.position().map_or(0, |p| p.line() as usize);

            // Whitespace-only line
            if row.len() == 1 && row.get(0).map_or(true, str::is_empty) {
                continue;
            }

            let mut fields: Vec<String> = row.iter().map(str::to_string).collect();

            if let Some(name) = fields[0].strip_prefix('@') {
                if columns.is_some() || !records.is_empty() {
                    return Err(EtlError::ManifestMalformed {
                        path,
                        line,
                        reason: "header row must precede all records".into(),
                    });
                }
                fields[0] = name.trim().to_string();
                width = Some(fields.len());
                columns = Some(fields);
                continue;
            }

            match width {
                None => width = Some(fields.len()),
                Some(w) if w != fields.len() => {
                    return Err(EtlError::ManifestMalformed {
                        path,
                        line,
                        reason: format!("expected {} fields, found {}", w, fields.len()),
                    });
                }
                Some(_) => {}
            }

            records.push(Record {
                index: records.len(),
                fields,
            });
        }

        if records.is_empty() {
            return Err(EtlError::ManifestMalformed {
                path,
                line: 0,
                reason: "manifest contains no records".into(),
            });
        }

        debug!("Parsed {} manifest records", records.len());

        Ok(Manifest {
            path,
            columns,
            width: width.unwrap_or(0),
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let manifest = ManifestReader::parse("m.csv", "a.png,1\nb.png,2\n").unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.width(), 2);
        assert_eq!(manifest.records()[1].field(0), Some("b.png"));
        assert_eq!(manifest.records()[1].index, 1);
    }

    #[test]
    fn test_header_comments_and_blanks() {
        let text = "@FILE,LABEL\n# comment\n\n a.png , 0 \nb.png,1\n";
        let manifest = ManifestReader::parse("m.csv", text).unwrap();
        assert_eq!(manifest.columns().unwrap(), &["FILE", "LABEL"]);
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.records()[0].fields, vec!["a.png", "0"]);
    }

    #[test]
    fn test_inconsistent_row_width() {
        let err = ManifestReader::parse("m.csv", "a.png,1\nb.png\n").unwrap_err();
        match err {
            EtlError::ManifestMalformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_quoted_field_keeps_comma() {
        let text = "@FILE,LABEL\n\"cats, small/a.png\",1\nb.png,0\n";
        let manifest = ManifestReader::parse("m.csv", text).unwrap();
        assert_eq!(manifest.width(), 2);
        assert_eq!(manifest.records()[0].field(0), Some("cats, small/a.png"));
        assert_eq!(manifest.records()[0].field(1), Some("1"));
    }

    #[test]
    fn test_header_after_record_rejected() {
        let err = ManifestReader::parse("m.csv", "a.png,1\n@FILE,LABEL\n").unwrap_err();
        match err {
            EtlError::ManifestMalformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_header_width_enforced() {
        assert!(ManifestReader::parse("m.csv", "@A,B,C\na.png,1\n").is_err());
    }

    #[test]
    fn test_empty_manifest_is_malformed() {
        assert!(matches!(
            ManifestReader::parse("m.csv", "# nothing\n"),
            Err(EtlError::ManifestMalformed { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = ManifestReader::read("/nonexistent/dir/train.csv").unwrap_err();
        assert!(matches!(err, EtlError::ManifestNotFound { .. }));
    }

    #[test]
    fn test_subset_len() {
        assert_eq!(subset_len(10, 1.0), 10);
        assert_eq!(subset_len(10, 0.25), 3);
        assert_eq!(subset_len(10, 0.01), 1);
        assert_eq!(subset_len(0, 0.5), 0);
    }

    #[test]
    fn test_shuffle_is_deterministic_permutation() {
        let text: String = (0..20).map(|i| format!("{}.png,{}\n", i, i)).collect();
        let mut a = ManifestReader::parse("m.csv", &text).unwrap();
        let mut b = ManifestReader::parse("m.csv", &text).unwrap();
        a.shuffle(7);
        b.shuffle(7);
        assert_eq!(a.records(), b.records());

        let mut indices: Vec<usize> = a.records().iter().map(|r| r.index).collect();
        assert_ne!(indices, (0..20).collect::<Vec<_>>());
        indices.sort_unstable();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());
    }
}
