//! Unit tests for manifest files on disk
//!
//! Covers path resolution, header handling and malformed input.

use vortex_etl::data::ManifestReader;
use vortex_etl::{EtlError, FieldConfig, LoaderConfig};

#[test]
fn test_read_relative_to_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("train.csv"), "@FILE,LABEL\na.png,1\nb.png,2\n").unwrap();

    let config = LoaderConfig::new("train.csv", 1, vec![FieldConfig::label(true)])
        .with_manifest_root(dir.path());
    let manifest = ManifestReader::read(config.manifest_path()).unwrap();

    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.path(), dir.path().join("train.csv"));
    assert_eq!(config.resolve(&manifest.records()[0].fields[0]), dir.path().join("a.png"));
}

#[test]
fn test_malformed_reports_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.csv");
    std::fs::write(&path, "# header comment\na.png,1\nb.png,2,extra\n").unwrap();

    match ManifestReader::read(&path).unwrap_err() {
        EtlError::ManifestMalformed { line, reason, .. } => {
            assert_eq!(line, 3);
            assert!(reason.contains("expected 2 fields"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_missing_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let err = ManifestReader::read(dir.path().join("train.csv")).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, EtlError::ManifestNotFound { .. }));
}
