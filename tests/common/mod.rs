//! Synthetic Sentinel-1 products and recording collaborators shared by the
//! integration tests
#![allow(dead_code)]

use insar_pipeline::io::raster;
use insar_pipeline::io::GranuleSource;
use insar_pipeline::job::{JobOutput, Notifier};
use insar_pipeline::types::{InsarError, InsarResult, SarComplex, SarImage};
use insar_pipeline::{BoundingBox, ProcessingConfig};
use ndarray::Array2;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zip::write::FileOptions;
use zip::ZipWriter;

pub const REFERENCE_GRANULE: &str = "S1A_IW_SLC__1SDV_20230601T053000_20230601T053027_048812_05DEAD_A1B2";
pub const SECONDARY_GRANULE: &str = "S1A_IW_SLC__1SDV_20230613T053000_20230613T053027_048987_05E2F0_C3D4";
pub const SIZE: usize = 64;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn job_bbox() -> BoundingBox {
    BoundingBox::new(45.0, 44.0, 5.0, 4.0)
}

/// Deterministic speckle-like amplitude and phase
pub fn speckle(seed: u64) -> SarImage {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % 10_000) as f32 / 10_000.0
    };
    Array2::from_shape_fn((SIZE, SIZE), |_| {
        let amplitude = 0.2 + next();
        let phase = (next() - 0.5) * 2.0 * std::f32::consts::PI;
        SarComplex::from_polar(amplitude, phase)
    })
}

/// Secondary differing from the reference by a smooth phase ramp
pub fn with_phase_ramp(reference: &SarImage, radians_per_pixel: f32) -> SarImage {
    Array2::from_shape_fn(reference.dim(), |(i, j)| {
        reference[[i, j]] * SarComplex::from_polar(1.0, -radians_per_pixel * (i + j) as f32)
    })
}

fn annotation_xml(start: &str, bbox: &BoundingBox) -> String {
    let last = (SIZE - 1) as f64;
    let corners = [
        (0.0, 0.0, bbox.north, bbox.west),
        (0.0, last, bbox.north, bbox.east),
        (last, 0.0, bbox.south, bbox.west),
        (last, last, bbox.south, bbox.east),
    ];
    let points: String = corners
        .iter()
        .map(|(line, pixel, lat, lon)| {
            format!(
                "<geolocationGridPoint><line>{}</line><pixel>{}</pixel><latitude>{}</latitude>\
                 <longitude>{}</longitude><height>100.0</height><incidenceAngle>35.0</incidenceAngle>\
                 </geolocationGridPoint>",
                line, pixel, lat, lon
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<product>
  <adsHeader>
    <missionId>S1A</missionId>
    <polarisation>VV</polarisation>
    <swath>IW1</swath>
    <startTime>{start}</startTime>
  </adsHeader>
  <imageAnnotation>
    <imageInformation>
      <productFirstLineUtcTime>{start}</productFirstLineUtcTime>
      <slantRangeTime>5.331e-03</slantRangeTime>
      <rangePixelSpacing>2.329562</rangePixelSpacing>
      <azimuthPixelSpacing>13.97</azimuthPixelSpacing>
      <azimuthTimeInterval>2.055556e-03</azimuthTimeInterval>
      <numberOfSamples>{size}</numberOfSamples>
      <numberOfLines>{size}</numberOfLines>
    </imageInformation>
  </imageAnnotation>
  <geolocationGrid>
    <geolocationGridPointList count="4">{points}</geolocationGridPointList>
  </geolocationGrid>
</product>"#,
        start = start,
        size = SIZE,
        points = points
    )
}

/// Write `{dir}/{granule}.zip` holding a minimal single-swath SAFE product
pub fn write_safe_zip(dir: &Path, granule: &str, image: &SarImage) -> PathBuf {
    let start = &granule[17..32];
    let start_time = format!(
        "{}-{}-{}T{}:{}:{}.000000",
        &start[0..4],
        &start[4..6],
        &start[6..8],
        &start[9..11],
        &start[11..13],
        &start[13..15]
    );
    let stem = format!("s1a-iw1-slc-vv-{}-001", start.to_lowercase());

    let measurement = dir.join(format!("{}-measurement.tiff", granule));
    raster::write_complex(&measurement, image).unwrap();
    let measurement_bytes = fs::read(&measurement).unwrap();
    fs::remove_file(&measurement).unwrap();

    let zip_path = dir.join(format!("{}.zip", granule));
    let mut zip = ZipWriter::new(File::create(&zip_path).unwrap());
    let options = FileOptions::default();
    let safe = format!("{}.SAFE", granule);
    zip.start_file(format!("{}/manifest.safe", safe), options).unwrap();
    zip.write_all(b"<xfdu/>").unwrap();
    zip.start_file(format!("{}/annotation/{}.xml", safe, stem), options).unwrap();
    zip.write_all(annotation_xml(&start_time, &job_bbox()).as_bytes()).unwrap();
    zip.start_file(format!("{}/measurement/{}.tiff", safe, stem), options).unwrap();
    zip.write_all(&measurement_bytes).unwrap();
    zip.finish().unwrap();
    zip_path
}

/// Processing configuration sized for 64x64 test scenes under `root`
pub fn test_config(root: &Path) -> ProcessingConfig {
    let mut config = ProcessingConfig::default();
    config.staging.work_root = root.join("work");
    config.dem.cache_dir = root.join("dem");
    config.dem.sources = Vec::new();
    config.dem.pixel_size_deg = 0.01;
    config.coregistration.patch_size = 16;
    config.coregistration.search_radius = 2;
    config.coregistration.patches_azimuth = 3;
    config.coregistration.patches_range = 3;
    config.phase_filter.patch_size = 16;
    config.geocode.pixel_size_deg = 0.01;
    config
}

/// Serves prepared archives for URLs and counts fetches
#[derive(Default)]
pub struct MockGranuleSource {
    archives: HashMap<String, PathBuf>,
    pub fetches: AtomicUsize,
}

impl MockGranuleSource {
    pub fn new(archives: HashMap<String, PathBuf>) -> Self {
        Self {
            archives,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl GranuleSource for MockGranuleSource {
    fn fetch(&self, location: &str, granule_name: &str) -> InsarResult<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.archives
            .get(location)
            .cloned()
            .ok_or_else(|| InsarError::Network(format!("no route to {} for {}", location, granule_name)))
    }
}

/// Keeps every notification it is sent
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<(String, JobOutput)>>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, url: &str, output: &JobOutput) -> InsarResult<()> {
        self.sent.lock().unwrap().push((url.to_string(), output.clone()));
        Ok(())
    }
}

/// Notifier whose endpoint is always down
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, url: &str, _output: &JobOutput) -> InsarResult<()> {
        Err(InsarError::Delivery(format!("{} unreachable", url)))
    }
}
