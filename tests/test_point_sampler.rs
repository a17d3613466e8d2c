mod common;

use approx::assert_relative_eq;
use common::init_logging;
use insar_pipeline::core::ExtractionError;
use insar_pipeline::io::raster;
use insar_pipeline::types::{GeoTransform, NODATA};
use insar_pipeline::{BoundingBox, PointRequest, PointSampler, RasterProduct};
use ndarray::Array2;
use std::path::PathBuf;
use tempfile::TempDir;

/// 20x20 grid over 45..44 N, 4..5 E; displacement encodes row and column
fn write_products(dir: &TempDir) -> (PathBuf, PathBuf) {
    let gt = GeoTransform::north_up(&BoundingBox::new(45.0, 44.0, 5.0, 4.0), 0.05, 0.05);
    let mut displacement = Array2::from_shape_fn((20, 20), |(i, j)| (i * 100 + j) as f32 * 0.1);
    displacement[[19, 19]] = NODATA;
    let coherence = Array2::from_shape_fn((20, 20), |(i, _)| i as f32 / 20.0);

    let displacement_path = dir.path().join("displacement.tif");
    let coherence_path = dir.path().join("coherence.tif");
    raster::write_raster(&displacement_path, &RasterProduct::geographic(displacement, gt)).unwrap();
    raster::write_raster(&coherence_path, &RasterProduct::geographic(coherence, gt)).unwrap();
    (displacement_path, coherence_path)
}

#[test]
fn test_sampling_geotiffs() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let (displacement, coherence) = write_products(&dir);

    let points = vec![
        // Row 2, column 4
        PointRequest::new("inside", 44.88, 4.22),
        PointRequest::new("north-west corner", 45.0, 4.0),
        PointRequest::new("nodata", 44.01, 4.99),
        PointRequest::new("west of raster", 44.5, 3.5),
    ];
    let samples = PointSampler::sample_rasters(&displacement, Some(&coherence), &points).unwrap();

    let ids: Vec<_> = samples.iter().map(|s| s.point_id.as_str()).collect();
    assert_eq!(ids, vec!["inside", "north-west corner", "nodata", "west of raster"]);

    let inside = &samples[0];
    assert!(inside.valid);
    assert_relative_eq!(inside.displacement_mm.unwrap(), 20.4, epsilon = 1e-4);
    assert_relative_eq!(inside.coherence.unwrap(), 0.1, epsilon = 1e-6);
    assert_eq!(inside.lat, Some(44.88));

    assert!(samples[1].valid);
    assert_relative_eq!(samples[1].displacement_mm.unwrap(), 0.0);

    // Inside the raster but on a nodata pixel: no value, no error
    assert!(!samples[2].valid);
    assert!(samples[2].displacement_mm.is_none());
    assert!(samples[2].error.is_none());
    assert_relative_eq!(samples[2].coherence.unwrap(), 0.95, epsilon = 1e-6);

    assert!(!samples[3].valid);
    assert_eq!(samples[3].error.as_deref(), Some("Point outside raster bounds"));
}

#[test]
fn test_missing_coordinates_reported_per_point() {
    let dir = TempDir::new().unwrap();
    let (displacement, _) = write_products(&dir);

    let points: Vec<PointRequest> =
        serde_json::from_str(r#"[{"id": "no-lon", "lat": 44.5}, {"id": "ok", "lat": 44.5, "lon": 4.5}]"#).unwrap();
    let samples = PointSampler::sample_rasters(&displacement, None, &points).unwrap();

    assert_eq!(samples.len(), 2);
    assert!(!samples[0].valid);
    assert_eq!(
        samples[0].error.as_deref(),
        Some(ExtractionError::MissingCoordinates.to_string().as_str())
    );
    assert!(samples[1].valid);
    assert!(samples[1].coherence.is_none());

    let json = serde_json::to_value(&samples[1]).unwrap();
    assert_eq!(json["point_id"], "ok");
    assert!(json.get("error").is_none());
}

#[test]
fn test_missing_raster_is_an_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.tif");
    let result = PointSampler::sample_rasters(&missing, None, &[PointRequest::new("p", 44.5, 4.5)]);
    assert!(result.is_err());
}
