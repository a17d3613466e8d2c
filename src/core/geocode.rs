use crate::core::least_squares;
use crate::io::dem::{grid_for, DemTile};
use crate::io::raster;
use crate::types::{
    Acquisition, BoundingBox, InsarError, InsarResult, RasterProduct, SarRealImage, NODATA,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

/// Geocoding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeParams {
    /// Output posting in degrees
    pub pixel_size_deg: f64,
    /// Per-axis cap on the output grid; the posting is coarsened to respect it
    pub max_dimension: usize,
}

impl Default for GeocodeParams {
    fn default() -> Self {
        Self {
            pixel_size_deg: 0.0001,
            max_dimension: 4096,
        }
    }
}

/// Geocoded displacement and coherence in EPSG:4326
#[derive(Debug, Clone)]
pub struct GeocodedProducts {
    pub displacement: RasterProduct,
    pub coherence: RasterProduct,
    pub displacement_path: PathBuf,
    pub coherence_path: PathBuf,
}

/// Line-of-sight displacement in millimetres for an unwrapped phase in radians
pub fn phase_to_displacement_mm(phase: f32, wavelength_m: f64) -> f32 {
    (phase as f64 * wavelength_m * 1000.0 / (4.0 * PI)) as f32
}

/// Backward mapping from geographic coordinates to radar (line, pixel).
///
/// Both coordinates are bilinear in (lat, lon) about `origin`. The terrain
/// term moves the range coordinate by the elevation difference to the
/// reference height projected through the incidence angle.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarMapping {
    origin: (f64, f64),
    line: [f64; 4],
    pixel: [f64; 4],
    reference_height: f64,
    /// Range pixels per metre of elevation
    terrain_factor: f64,
}

impl RadarMapping {
    /// Fit on the acquisition's tie points, or map `bbox` linearly onto a
    /// radar grid of `shape` when too few are available.
    pub fn for_acquisition(acquisition: &Acquisition, bbox: &BoundingBox, shape: (usize, usize)) -> Self {
        let geometry = &acquisition.geometry;
        let mut mapping = match Self::fit(acquisition) {
            Some(mapping) => mapping,
            None => {
                log::warn!(
                    "{}: {} tie points, mapping bounding box linearly onto the radar grid",
                    acquisition.granule,
                    geometry.tie_points.len()
                );
                Self::linear(bbox, shape)
            }
        };

        if let Some(incidence) = geometry.mean_incidence_angle() {
            if geometry.range_pixel_spacing > 0.0 {
                mapping.terrain_factor =
                    -incidence.to_radians().cos() / geometry.range_pixel_spacing;
            }
        }
        mapping
    }

    /// Least-squares fit of (line, pixel) on (1, lat, lon, lat·lon)
    pub fn fit(acquisition: &Acquisition) -> Option<Self> {
        let tie_points = &acquisition.geometry.tie_points;
        if tie_points.len() < 4 {
            return None;
        }
        let n = tie_points.len() as f64;
        let origin = (
            tie_points.iter().map(|t| t.latitude).sum::<f64>() / n,
            tie_points.iter().map(|t| t.longitude).sum::<f64>() / n,
        );

        let rows: Vec<Vec<f64>> = tie_points
            .iter()
            .map(|t| {
                let (y, x) = (t.latitude - origin.0, t.longitude - origin.1);
                vec![1.0, y, x, y * x]
            })
            .collect();
        let lines: Vec<f64> = tie_points.iter().map(|t| t.line).collect();
        let pixels: Vec<f64> = tie_points.iter().map(|t| t.pixel).collect();

        let line = least_squares::solve(&rows, &lines)?;
        let pixel = least_squares::solve(&rows, &pixels)?;
        log::debug!("Radar mapping fitted on {} tie points", tie_points.len());

        Some(Self {
            origin,
            line: [line[0], line[1], line[2], line[3]],
            pixel: [pixel[0], pixel[1], pixel[2], pixel[3]],
            reference_height: tie_points.iter().map(|t| t.height).sum::<f64>() / n,
            terrain_factor: 0.0,
        })
    }

    /// North edge to line 0 and west edge to pixel 0, in pixel-centre coordinates
    pub fn linear(bbox: &BoundingBox, (lines, samples): (usize, usize)) -> Self {
        let origin = (bbox.north, bbox.west);
        let line_scale = lines as f64 / bbox.height();
        let pixel_scale = samples as f64 / bbox.width();
        Self {
            origin,
            line: [-0.5, -line_scale, 0.0, 0.0],
            pixel: [-0.5, 0.0, pixel_scale, 0.0],
            reference_height: 0.0,
            terrain_factor: 0.0,
        }
    }

    /// Fractional (line, pixel) for a ground point; `height` enables the
    /// terrain term
    pub fn radar_position(&self, lat: f64, lon: f64, height: Option<f64>) -> (f64, f64) {
        let (y, x) = (lat - self.origin.0, lon - self.origin.1);
        let eval = |c: &[f64; 4]| c[0] + c[1] * y + c[2] * x + c[3] * y * x;
        let shift = height
            .map(|h| (h - self.reference_height) * self.terrain_factor)
            .unwrap_or(0.0);
        (eval(&self.line), eval(&self.pixel) + shift)
    }
}

/// Projects radar-grid products onto a geographic grid
pub struct Geocoder {
    params: GeocodeParams,
}

impl Geocoder {
    pub fn new(params: GeocodeParams) -> Self {
        Self { params }
    }

    /// Geocode unwrapped phase (as displacement) and coherence over `bbox`
    /// and write them into `{out_dir}/geocoded/`
    pub fn geocode(
        &self,
        unwrapped: &SarRealImage,
        coherence: &SarRealImage,
        acquisition: &Acquisition,
        dem: &DemTile,
        bbox: &BoundingBox,
        out_dir: &Path,
    ) -> InsarResult<GeocodedProducts> {
        let (displacement, coherence) = self.geocode_arrays(unwrapped, coherence, acquisition, dem, bbox)?;

        let dir = out_dir.join("geocoded");
        fs::create_dir_all(&dir)?;
        let displacement_path = dir.join("displacement.tif");
        let coherence_path = dir.join("coherence.tif");
        raster::write_raster(&displacement_path, &displacement)?;
        raster::write_raster(&coherence_path, &coherence)?;

        Ok(GeocodedProducts {
            displacement,
            coherence,
            displacement_path,
            coherence_path,
        })
    }

    /// In-memory geocoding; returns (displacement_mm, coherence) rasters
    pub fn geocode_arrays(
        &self,
        unwrapped: &SarRealImage,
        coherence: &SarRealImage,
        acquisition: &Acquisition,
        dem: &DemTile,
        bbox: &BoundingBox,
    ) -> InsarResult<(RasterProduct, RasterProduct)> {
        bbox.validate()?;
        if unwrapped.dim() != coherence.dim() {
            return Err(InsarError::Processing(format!(
                "Unwrapped phase {:?} and coherence {:?} grids differ",
                unwrapped.dim(),
                coherence.dim()
            )));
        }

        let (geo_transform, shape) = grid_for(bbox, self.params.pixel_size_deg, self.params.max_dimension);
        log::info!(
            "Geocoding onto {}x{} grid at {:.6} deg",
            shape.1,
            shape.0,
            geo_transform.pixel_width
        );

        let dem_raster = dem.load()?;
        if dem.source.is_synthetic() {
            log::info!("Terrain term uses synthetic DEM");
        }
        let mapping = RadarMapping::for_acquisition(acquisition, bbox, unwrapped.dim());
        let wavelength = acquisition.wavelength_m();

        let mut displacement = Array2::from_elem(shape, NODATA);
        let mut geo_coherence = Array2::from_elem(shape, NODATA);

        let project = |(row, col): (usize, usize), disp: &mut f32, coh: &mut f32| {
            let (lon, lat) = geo_transform.pixel_center(col, row);
            let height = raster::sample_geographic(&dem_raster, lon, lat).map(f64::from);
            let (line, pixel) = mapping.radar_position(lat, lon, height);
            if let Some(phase) = raster::interpolate(unwrapped, line, pixel) {
                *disp = phase_to_displacement_mm(phase, wavelength);
            }
            if let Some(value) = raster::interpolate(coherence, line, pixel) {
                *coh = value;
            }
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut displacement).and(&mut geo_coherence).par_for_each(project);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut displacement).and(&mut geo_coherence).for_each(project);

        let covered = displacement.iter().filter(|&&v| v != NODATA).count();
        log::info!(
            "Geocoded coverage: {:.1}%",
            100.0 * covered as f64 / displacement.len().max(1) as f64
        );

        Ok((
            RasterProduct::geographic(displacement, geo_transform),
            RasterProduct::geographic(geo_coherence, geo_transform),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dem::{DemConfig, DemProvider};
    use crate::types::{Polarization, RadarGeometry, SensorFamily, TiePoint, SENTINEL1_WAVELENGTH_M};
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn acquisition(tie_points: Vec<TiePoint>) -> Acquisition {
        let start = Utc.with_ymd_and_hms(2023, 6, 1, 5, 30, 0).unwrap();
        Acquisition {
            granule: "S1A_IW_SLC__1SDV_20230601T053000_20230601T053027_048812_05DEAD_0001".to_string(),
            product_dir: PathBuf::from("/nonexistent"),
            measurement: PathBuf::from("/nonexistent/measurement.tiff"),
            sensor: SensorFamily::Sentinel1,
            mission: "S1A".to_string(),
            polarization: Polarization::VV,
            start_time: start,
            geometry: RadarGeometry {
                lines: 20,
                samples: 30,
                first_line_time: start,
                azimuth_time_interval: 2.0e-3,
                slant_range_time: 5.4e-3,
                range_pixel_spacing: 2.33,
                azimuth_pixel_spacing: 13.9,
                orbit: None,
                tie_points,
            },
        }
    }

    fn synthetic_dem(dir: &TempDir, bbox: &BoundingBox) -> DemTile {
        let provider = DemProvider::new(DemConfig {
            cache_dir: dir.path().to_path_buf(),
            sources: Vec::new(),
            pixel_size_deg: 0.01,
            ..DemConfig::default()
        });
        provider.get_dem(bbox).unwrap()
    }

    #[test]
    fn test_phase_to_displacement() {
        let mm = phase_to_displacement_mm(2.0 * std::f32::consts::PI, SENTINEL1_WAVELENGTH_M);
        assert_relative_eq!(mm, 27.75205, epsilon = 1e-3);
        assert_eq!(phase_to_displacement_mm(0.0, SENTINEL1_WAVELENGTH_M), 0.0);
    }

    #[test]
    fn test_fit_recovers_bilinear_mapping() {
        let truth = |lat: f64, lon: f64| {
            let (y, x) = (lat - 44.5, lon - 4.5);
            (10.0 - 20.0 * y + 1.5 * x + 0.3 * y * x, 15.0 + 0.5 * y + 30.0 * x - 0.2 * y * x)
        };
        let mut tie_points = Vec::new();
        for lat in [44.0, 44.5, 45.0] {
            for lon in [4.0, 4.5, 5.0] {
                let (line, pixel) = truth(lat, lon);
                tie_points.push(TiePoint {
                    line,
                    pixel,
                    latitude: lat,
                    longitude: lon,
                    height: 100.0,
                    incidence_angle: 35.0,
                });
            }
        }

        let acq = acquisition(tie_points);
        let mapping = RadarMapping::for_acquisition(&acq, &BoundingBox::new(45.0, 44.0, 5.0, 4.0), (20, 30));
        let (line, pixel) = mapping.radar_position(44.7, 4.2, Some(100.0));
        let (exp_line, exp_pixel) = truth(44.7, 4.2);
        assert_relative_eq!(line, exp_line, epsilon = 1e-6);
        assert_relative_eq!(pixel, exp_pixel, epsilon = 1e-6);

        // 233 m above the tie height moves the sample towards near range
        let (_, raised) = mapping.radar_position(44.7, 4.2, Some(333.0));
        let expected_shift = -233.0 * 35f64.to_radians().cos() / 2.33;
        assert_relative_eq!(raised - pixel, expected_shift, epsilon = 1e-6);
    }

    #[test]
    fn test_linear_mapping_corners() {
        let bbox = BoundingBox::new(45.0, 44.0, 5.0, 4.0);
        let mapping = RadarMapping::linear(&bbox, (20, 30));
        let (line, pixel) = mapping.radar_position(45.0, 4.0, None);
        assert_relative_eq!(line, -0.5);
        assert_relative_eq!(pixel, -0.5);
        let (line, pixel) = mapping.radar_position(44.0, 5.0, None);
        assert_relative_eq!(line, 19.5);
        assert_relative_eq!(pixel, 29.5);
    }

    #[test]
    fn test_geocode_constant_phase_and_nodata() {
        let dir = TempDir::new().unwrap();
        let bbox = BoundingBox::new(45.0, 44.0, 5.0, 4.0);
        let dem = synthetic_dem(&dir, &bbox);

        let mut unwrapped = Array2::from_elem((20, 30), 1.0f32);
        // West third of the radar grid is nodata
        for i in 0..20 {
            for j in 0..10 {
                unwrapped[[i, j]] = NODATA;
            }
        }
        let coherence = Array2::from_elem((20, 30), 0.8f32);

        let geocoder = Geocoder::new(GeocodeParams {
            pixel_size_deg: 0.02,
            max_dimension: 4096,
        });
        let products = geocoder
            .geocode(&unwrapped, &coherence, &acquisition(Vec::new()), &dem, &bbox, dir.path())
            .unwrap();

        assert!(products.displacement_path.exists());
        assert!(products.coherence_path.exists());
        assert_eq!(products.displacement.dim(), (50, 50));
        assert_eq!(products.displacement.epsg, Some(4326));

        let expected = phase_to_displacement_mm(1.0, SENTINEL1_WAVELENGTH_M);
        let data = &products.displacement.data;
        assert_relative_eq!(data[[25, 40]], expected, epsilon = 1e-5);
        assert_eq!(data[[25, 2]], NODATA);
        assert!(data.iter().all(|&v| v == NODATA || (v - expected).abs() < 1e-4));
        assert_relative_eq!(products.coherence.data[[25, 2]], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let dir = TempDir::new().unwrap();
        let bbox = BoundingBox::new(45.0, 44.0, 5.0, 4.0);
        let dem = synthetic_dem(&dir, &bbox);
        let geocoder = Geocoder::new(GeocodeParams::default());
        let result = geocoder.geocode_arrays(
            &Array2::zeros((4, 4)),
            &Array2::zeros((4, 5)),
            &acquisition(Vec::new()),
            &dem,
            &bbox,
        );
        assert!(result.is_err());
    }
}
