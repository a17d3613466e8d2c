use crate::io::raster;
use crate::types::{GeoTransform, InsarError, InsarResult, RasterProduct};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// A caller-supplied location to sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRequest {
    pub id: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

impl PointRequest {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            lat: Some(lat),
            lon: Some(lon),
        }
    }
}

/// Displacement read at one requested point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSample {
    pub point_id: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub displacement_mm: Option<f32>,
    pub coherence: Option<f32>,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-point sampling faults; reported inline, never propagated
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("Missing coordinates")]
    MissingCoordinates,

    #[error("Point outside raster bounds")]
    OutsideBounds,

    #[error("Raster is not georeferenced")]
    NotGeoreferenced,
}

/// Reads displacement and coherence at requested points
pub struct PointSampler;

impl PointSampler {
    /// Sample every point, preserving input order.
    ///
    /// Faults affect only their own point and are reported through
    /// `valid = false` and `error`.
    pub fn sample_at(
        displacement: &RasterProduct,
        coherence: Option<&RasterProduct>,
        points: &[PointRequest],
    ) -> Vec<PointSample> {
        log::info!("Sampling displacement at {} points", points.len());
        let sample = |point: &PointRequest| Self::sample_point(displacement, coherence, point);

        #[cfg(feature = "parallel")]
        let samples: Vec<PointSample> = points.par_iter().map(sample).collect();
        #[cfg(not(feature = "parallel"))]
        let samples: Vec<PointSample> = points.iter().map(sample).collect();

        let valid = samples.iter().filter(|s| s.valid).count();
        log::info!("{}/{} points valid", valid, samples.len());
        samples
    }

    /// Open GeoTIFFs and sample them
    pub fn sample_rasters<P: AsRef<Path>>(
        displacement_path: P,
        coherence_path: Option<P>,
        points: &[PointRequest],
    ) -> InsarResult<Vec<PointSample>> {
        let displacement = raster::read_raster(displacement_path)?;
        let coherence = coherence_path.map(raster::read_raster).transpose()?;
        if displacement.geo_transform.is_none() {
            return Err(InsarError::InvalidFormat(
                "Displacement raster has no geotransform".to_string(),
            ));
        }
        Ok(Self::sample_at(&displacement, coherence.as_ref(), points))
    }

    fn sample_point(
        displacement: &RasterProduct,
        coherence: Option<&RasterProduct>,
        point: &PointRequest,
    ) -> PointSample {
        let mut sample = PointSample {
            point_id: point.id.clone(),
            lat: point.lat,
            lon: point.lon,
            displacement_mm: None,
            coherence: None,
            valid: false,
            error: None,
        };

        let (lat, lon) = match (point.lat, point.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                sample.error = Some(ExtractionError::MissingCoordinates.to_string());
                return sample;
            }
        };

        let value = match Self::read_at(displacement, lat, lon) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Point {}: {}", point.id, e);
                sample.error = Some(e.to_string());
                return sample;
            }
        };

        if !displacement.is_nodata(value) {
            sample.displacement_mm = Some(value);
            sample.valid = true;
        }
        if let Some(coherence) = coherence {
            sample.coherence = Self::read_at(coherence, lat, lon)
                .ok()
                .filter(|&v| !coherence.is_nodata(v));
        }
        sample
    }

    /// Value of the pixel containing (lat, lon)
    fn read_at(product: &RasterProduct, lat: f64, lon: f64) -> Result<f32, ExtractionError> {
        let gt = product
            .geo_transform
            .as_ref()
            .ok_or(ExtractionError::NotGeoreferenced)?;
        let (row, col) = Self::pixel_of(gt, product.dim(), lat, lon)?;
        Ok(product.data[[row, col]])
    }

    fn pixel_of(
        gt: &GeoTransform,
        (height, width): (usize, usize),
        lat: f64,
        lon: f64,
    ) -> Result<(usize, usize), ExtractionError> {
        let (col, row) = gt.geo_to_pixel(lon, lat);
        let (col, row) = (col.floor(), row.floor());
        if !col.is_finite() || !row.is_finite() || col < 0.0 || row < 0.0 {
            return Err(ExtractionError::OutsideBounds);
        }
        let (col, row) = (col as usize, row as usize);
        if col >= width || row >= height {
            return Err(ExtractionError::OutsideBounds);
        }
        Ok((row, col))
    }
}
