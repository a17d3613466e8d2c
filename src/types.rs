use chrono::{DateTime, Utc};
use ndarray::Array2;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complex-valued SLC sample (I + jQ)
pub type SarComplex = Complex<f32>;

/// 2D complex SLC array (azimuth lines x range samples)
pub type SarImage = Array2<SarComplex>;

/// 2D real-valued raster (phase, coherence, offsets, displacement)
pub type SarRealImage = Array2<f32>;

/// Nodata sentinel shared by every raster product
pub const NODATA: f32 = -9999.0;

/// Sentinel-1 C-band carrier wavelength in meters
pub const SENTINEL1_WAVELENGTH_M: f64 = 0.0555041;

/// Speed of light (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// True when a raster value carries data (finite and not the nodata sentinel)
pub fn is_valid<T: num_traits::Float>(value: T) -> bool {
    match T::from(NODATA) {
        Some(nodata) => value.is_finite() && value != nodata,
        None => value.is_finite(),
    }
}

/// Geographic bounding box in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Default for BoundingBox {
    /// Whole globe, used when a job omits its bbox
    fn default() -> Self {
        Self {
            north: 90.0,
            south: -90.0,
            east: 180.0,
            west: -180.0,
        }
    }
}

impl BoundingBox {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self { north, south, east, west }
    }

    /// Check north > south and east > west
    pub fn validate(&self) -> InsarResult<()> {
        let values = [self.north, self.south, self.east, self.west];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(InsarError::Validation(format!(
                "Bounding box contains non-finite coordinates: {:?}",
                self
            )));
        }
        if self.north <= self.south {
            return Err(InsarError::Validation(format!(
                "Bounding box north ({}) must be greater than south ({})",
                self.north, self.south
            )));
        }
        if self.east <= self.west {
            return Err(InsarError::Validation(format!(
                "Bounding box east ({}) must be greater than west ({})",
                self.east, self.west
            )));
        }
        Ok(())
    }

    /// Expand every edge by `margin` degrees, clamped to valid lat/lon
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            north: (self.north + margin).min(90.0),
            south: (self.south - margin).max(-90.0),
            east: (self.east + margin).min(180.0),
            west: (self.west - margin).max(-180.0),
        }
    }

    /// Round every edge to two decimals
    pub fn rounded(&self) -> Self {
        let round2 = |v: f64| (v * 100.0).round() / 100.0;
        Self {
            north: round2(self.north),
            south: round2(self.south),
            east: round2(self.east),
            west: round2(self.west),
        }
    }

    /// DEM cache key: margin-expanded, two-decimal rounded extent.
    ///
    /// Jobs whose boxes round to the same key share one cached tile.
    pub fn dem_cache_key(&self, margin: f64) -> String {
        let key_box = self.expanded(margin).rounded();
        format!(
            "dem_{:.2}_{:.2}_{:.2}_{:.2}",
            key_box.south, key_box.west, key_box.north, key_box.east
        )
    }

    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.north >= other.north
            && self.south <= other.south
            && self.east >= other.east
            && self.west <= other.west
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.north + self.south) / 2.0, (self.east + self.west) / 2.0)
    }
}

/// Affine geotransform (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform anchored at the box's north-west corner
    pub fn north_up(bbox: &BoundingBox, pixel_size_x: f64, pixel_size_y: f64) -> Self {
        Self {
            top_left_x: bbox.west,
            pixel_width: pixel_size_x,
            rotation_x: 0.0,
            top_left_y: bbox.north,
            rotation_y: 0.0,
            pixel_height: -pixel_size_y,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Fractional (col, row) of a geographic coordinate; rotation terms are ignored
    pub fn geo_to_pixel(&self, lon: f64, lat: f64) -> (f64, f64) {
        (
            (lon - self.top_left_x) / self.pixel_width,
            (lat - self.top_left_y) / self.pixel_height,
        )
    }

    /// Geographic (lon, lat) of a pixel centre
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.top_left_x + (col as f64 + 0.5) * self.pixel_width,
            self.top_left_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Extent covered by a raster of the given shape (rows, cols)
    pub fn extent(&self, shape: (usize, usize)) -> BoundingBox {
        let (rows, cols) = shape;
        let x_end = self.top_left_x + cols as f64 * self.pixel_width;
        let y_end = self.top_left_y + rows as f64 * self.pixel_height;
        BoundingBox {
            north: self.top_left_y.max(y_end),
            south: self.top_left_y.min(y_end),
            east: self.top_left_x.max(x_end),
            west: self.top_left_x.min(x_end),
        }
    }
}

/// Single-band float raster with nodata sentinel and optional georeferencing
#[derive(Debug, Clone)]
pub struct RasterProduct {
    pub data: SarRealImage,
    pub nodata: f32,
    pub geo_transform: Option<GeoTransform>,
    /// EPSG code of the spatial reference once geocoded
    pub epsg: Option<u32>,
}

impl RasterProduct {
    /// Radar-grid raster (no georeferencing)
    pub fn radar(data: SarRealImage) -> Self {
        Self {
            data,
            nodata: NODATA,
            geo_transform: None,
            epsg: None,
        }
    }

    /// Geographic raster in EPSG:4326
    pub fn geographic(data: SarRealImage, geo_transform: GeoTransform) -> Self {
        Self {
            data,
            nodata: NODATA,
            geo_transform: Some(geo_transform),
            epsg: Some(4326),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn is_nodata(&self, value: f32) -> bool {
        !value.is_finite() || value == self.nodata
    }

    /// Values that are neither NaN nor nodata
    pub fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().copied().filter(move |v| !self.is_nodata(*v))
    }
}

/// Polarization channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarization {
    VV,
    VH,
    HV,
    HH,
}

impl Polarization {
    /// Lower-case token used in SAFE file names (`-vv-`)
    pub fn file_token(&self) -> &'static str {
        match self {
            Polarization::VV => "vv",
            Polarization::VH => "vh",
            Polarization::HV => "hv",
            Polarization::HH => "hh",
        }
    }
}

impl std::fmt::Display for Polarization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarization::VV => write!(f, "VV"),
            Polarization::VH => write!(f, "VH"),
            Polarization::HV => write!(f, "HV"),
            Polarization::HH => write!(f, "HH"),
        }
    }
}

/// Sensor family; fixes the carrier wavelength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorFamily {
    Sentinel1,
}

impl SensorFamily {
    /// Carrier wavelength in meters
    pub fn wavelength_m(&self) -> f64 {
        match self {
            SensorFamily::Sentinel1 => SENTINEL1_WAVELENGTH_M,
        }
    }

    /// Resolve from a mission identifier such as "S1A"
    pub fn from_mission(mission: &str) -> InsarResult<Self> {
        if mission.to_uppercase().starts_with("S1") {
            Ok(SensorFamily::Sentinel1)
        } else {
            Err(InsarError::Metadata(format!("Unsupported mission: {}", mission)))
        }
    }
}

/// Orbit state vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVector {
    pub time: DateTime<Utc>,
    pub position: [f64; 3],  // [x, y, z] in meters (ECEF)
    pub velocity: [f64; 3],  // [vx, vy, vz] in m/s
}

/// Orbit information carried in the product annotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbitData {
    pub state_vectors: Vec<StateVector>,
    pub reference_time: DateTime<Utc>,
}

/// Geolocation tie point linking a radar pixel to the ground
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiePoint {
    pub line: f64,
    pub pixel: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
    pub incidence_angle: f64, // degrees
}

/// Radar geometry of one acquisition, read from its annotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadarGeometry {
    pub lines: usize,
    pub samples: usize,
    pub first_line_time: DateTime<Utc>,
    /// Azimuth time interval between lines (s)
    pub azimuth_time_interval: f64,
    /// Two-way slant range time to first sample (s)
    pub slant_range_time: f64,
    pub range_pixel_spacing: f64,
    pub azimuth_pixel_spacing: f64,
    pub orbit: Option<OrbitData>,
    pub tie_points: Vec<TiePoint>,
}

impl RadarGeometry {
    /// Slant range (m) of a range sample
    pub fn slant_range_at(&self, pixel: f64) -> f64 {
        self.slant_range_time * SPEED_OF_LIGHT / 2.0 + pixel * self.range_pixel_spacing
    }

    /// Mean incidence angle (degrees) over the tie points
    pub fn mean_incidence_angle(&self) -> Option<f64> {
        if self.tie_points.is_empty() {
            return None;
        }
        let sum: f64 = self.tie_points.iter().map(|t| t.incidence_angle).sum();
        Some(sum / self.tie_points.len() as f64)
    }

    /// Ground footprint spanned by the tie points
    pub fn footprint(&self) -> Option<BoundingBox> {
        if self.tie_points.is_empty() {
            return None;
        }
        let mut bbox = BoundingBox {
            north: f64::MIN,
            south: f64::MAX,
            east: f64::MIN,
            west: f64::MAX,
        };
        for tp in &self.tie_points {
            bbox.north = bbox.north.max(tp.latitude);
            bbox.south = bbox.south.min(tp.latitude);
            bbox.east = bbox.east.max(tp.longitude);
            bbox.west = bbox.west.min(tp.longitude);
        }
        Some(bbox)
    }
}

/// Staged SAR acquisition; immutable once staged
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub granule: String,
    pub product_dir: PathBuf,
    pub measurement: PathBuf,
    pub sensor: SensorFamily,
    pub mission: String,
    pub polarization: Polarization,
    pub start_time: DateTime<Utc>,
    pub geometry: RadarGeometry,
}

impl Acquisition {
    pub fn wavelength_m(&self) -> f64 {
        self.sensor.wavelength_m()
    }
}

/// Error types for InSAR processing
#[derive(Debug, thiserror::Error)]
pub enum InsarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Failure inside a pipeline stage, tagged with the stage name
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<InsarError>,
    },
}

impl InsarError {
    /// Tag an error with the pipeline stage it escaped from
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        match self {
            // Validation and staging failures keep their own kind
            e @ InsarError::Validation(_)
            | e @ InsarError::Staging(_)
            | e @ InsarError::Stage { .. } => e,
            other => InsarError::Stage {
                stage: stage.into(),
                source: Box::new(other),
            },
        }
    }

    /// Full `source()` chain, one cause per line
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut current: Option<&dyn std::error::Error> = std::error::Error::source(self);
        while let Some(cause) = current {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            current = cause.source();
        }
        out
    }
}

impl From<reqwest::Error> for InsarError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InsarError::Network(format!("request timed out: {}", e))
        } else {
            InsarError::Network(e.to_string())
        }
    }
}

impl From<zip::result::ZipError> for InsarError {
    fn from(e: zip::result::ZipError) -> Self {
        InsarError::Staging(format!("archive error: {}", e))
    }
}

/// Result type for InSAR operations
pub type InsarResult<T> = Result<T, InsarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dem_cache_key_rounds_with_margin() {
        let bbox = BoundingBox::new(45.0, 44.0, 5.0, 4.0);
        assert_eq!(bbox.dem_cache_key(0.1), "dem_43.90_3.90_45.10_5.10");

        // A box a few meters away shares the key
        let nearby = BoundingBox::new(45.001, 44.002, 5.003, 3.999);
        assert_eq!(bbox.dem_cache_key(0.1), nearby.dem_cache_key(0.1));
    }

    #[test]
    fn test_bbox_validation() {
        assert!(BoundingBox::new(45.0, 44.0, 5.0, 4.0).validate().is_ok());
        assert!(BoundingBox::new(44.0, 45.0, 5.0, 4.0).validate().is_err());
        assert!(BoundingBox::new(45.0, 44.0, 4.0, 4.0).validate().is_err());
        assert!(BoundingBox::default().validate().is_ok());
    }

    #[test]
    fn test_geotransform_roundtrip_pixel() {
        let bbox = BoundingBox::new(45.0, 44.0, 5.0, 4.0);
        let gt = GeoTransform::north_up(&bbox, 0.01, 0.01);
        let (col, row) = gt.geo_to_pixel(4.505, 44.495);
        assert_eq!(col.floor() as i64, 50);
        assert_eq!(row.floor() as i64, 50);
        let extent = gt.extent((100, 100));
        assert!((extent.south - 44.0).abs() < 1e-9);
        assert!((extent.east - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_stage_tagging_keeps_validation() {
        let err = InsarError::Validation("missing".into()).in_stage("Staging");
        assert!(matches!(err, InsarError::Validation(_)));

        let err = InsarError::Processing("boom".into()).in_stage("Unwrapping");
        assert!(err.to_string().starts_with("Unwrapping stage failed"));
        assert!(err.chain().contains("caused by: Processing error: boom"));
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid(1.0f32));
        assert!(!is_valid(NODATA));
        assert!(!is_valid(f32::NAN));
        assert!(!is_valid(-9999.0f64));
    }
}
