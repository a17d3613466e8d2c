mod common;

use common::*;
use insar_pipeline::io::{validate_safe_package, GranuleName, GranuleStager, SlcReader};
use insar_pipeline::types::{InsarError, Polarization};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_staging_is_idempotent() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let archive = write_safe_zip(dir.path(), REFERENCE_GRANULE, &speckle(7));
    let stager = GranuleStager::new(dir.path().join("staging"));

    let first = stager.stage_product(&archive).unwrap();
    assert!(first.extracted);
    assert!(first
        .product_dir
        .ends_with(format!("{}/{}.SAFE", REFERENCE_GRANULE, REFERENCE_GRANULE)));
    assert!(first.product_dir.join("manifest.safe").is_file());

    // Anything added to the extraction must survive a second staging
    let marker = first.product_dir.join("marker.txt");
    fs::write(&marker, "kept").unwrap();

    let second = stager.stage_product(&archive).unwrap();
    assert!(!second.extracted);
    assert_eq!(second.product_dir, first.product_dir);
    assert_eq!(fs::read_to_string(&marker).unwrap(), "kept");

    // No temporary extraction directories are left behind
    let leftovers: Vec<_> = fs::read_dir(dir.path().join("staging"))
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_staged_directory_is_used_in_place() {
    let dir = TempDir::new().unwrap();
    let archive = write_safe_zip(dir.path(), REFERENCE_GRANULE, &speckle(7));
    let stager = GranuleStager::new(dir.path().join("staging"));
    let product_dir = stager.stage(&archive).unwrap();

    let again = stager.stage_product(&product_dir).unwrap();
    assert!(!again.extracted);
    assert_eq!(again.product_dir, product_dir);
}

#[test]
fn test_missing_and_unsupported_products() {
    let dir = TempDir::new().unwrap();
    let stager = GranuleStager::new(dir.path().join("staging"));

    let missing = stager.stage(dir.path().join("absent.zip"));
    assert!(matches!(missing, Err(InsarError::Staging(_))));

    let tarball = dir.path().join("product.tar.gz");
    fs::write(&tarball, b"not a zip").unwrap();
    assert!(matches!(stager.stage(&tarball), Err(InsarError::Staging(_))));
}

#[test]
fn test_staged_product_reads_as_acquisition() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let archive = write_safe_zip(dir.path(), SECONDARY_GRANULE, &speckle(3));

    let validation = validate_safe_package(&archive);
    assert!(validation.valid, "{:?}", validation.error);
    let name = validation.granule.unwrap();
    assert_eq!(name.mission, "S1A");
    assert_eq!(name.product_type, "SLC");

    let product_dir = GranuleStager::new(dir.path().join("staging")).stage(&archive).unwrap();
    let acquisition = SlcReader::new(&product_dir)
        .unwrap()
        .read_acquisition(Polarization::VV, None)
        .unwrap();

    assert_eq!(acquisition.granule, SECONDARY_GRANULE);
    assert_eq!(acquisition.start_time, name.start_time);
    assert_eq!((acquisition.geometry.lines, acquisition.geometry.samples), (SIZE, SIZE));
    assert_eq!(acquisition.geometry.tie_points.len(), 4);
    assert_eq!(acquisition.geometry.footprint().unwrap(), job_bbox());

    let image = SlcReader::read_slc(&acquisition).unwrap();
    assert_eq!(image.dim(), (SIZE, SIZE));

    let reference = GranuleName::parse(REFERENCE_GRANULE).unwrap();
    assert_eq!((name.start_time - reference.start_time).num_days(), 12);
}
