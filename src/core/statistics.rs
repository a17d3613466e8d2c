//! Job-level summary statistics over geocoded products and point samples

use crate::core::sampler::PointSample;
use crate::types::RasterProduct;
use serde::{Deserialize, Serialize};

/// Mean, population standard deviation and range of a set of values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl Summary {
    /// `None` for an empty input
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            sum_sq += v * v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return None;
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        Some(Self {
            mean,
            std: variance.sqrt(),
            min,
            max,
            count,
        })
    }
}

/// Line-of-sight velocity over the valid points, in mm/year
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityStats {
    pub time_span_days: f64,
    pub mean_velocity_mm_year: f64,
    pub std_velocity_mm_year: f64,
    pub min_velocity_mm_year: f64,
    pub max_velocity_mm_year: f64,
}

/// Statistics block reported with a successful job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean_coherence: Option<f64>,
    pub std_coherence: Option<f64>,
    pub mean_displacement_mm: Option<f64>,
    pub std_displacement_mm: Option<f64>,
    pub min_displacement_mm: Option<f64>,
    pub max_displacement_mm: Option<f64>,
    pub valid_points: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<VelocityStats>,
}

impl Statistics {
    /// Summarise geocoded rasters and point samples.
    ///
    /// Coherence outside [0, 1] is ignored along with nodata.
    pub fn compute(displacement: &RasterProduct, coherence: &RasterProduct, points: &[PointSample]) -> Self {
        let disp = Summary::from_values(displacement.valid_values().map(f64::from));
        let coh = Summary::from_values(
            coherence
                .valid_values()
                .filter(|v| (0.0..=1.0).contains(v))
                .map(f64::from),
        );

        let stats = Self {
            mean_coherence: coh.map(|s| s.mean),
            std_coherence: coh.map(|s| s.std),
            mean_displacement_mm: disp.map(|s| s.mean),
            std_displacement_mm: disp.map(|s| s.std),
            min_displacement_mm: disp.map(|s| s.min),
            max_displacement_mm: disp.map(|s| s.max),
            valid_points: points.iter().filter(|p| p.valid).count(),
            velocity: None,
        };
        log::debug!("Statistics: {:?}", stats);
        stats
    }

    pub fn with_velocity(mut self, velocity: Option<VelocityStats>) -> Self {
        self.velocity = velocity;
        self
    }
}

/// Annualised velocity of the valid point displacements.
///
/// `None` when no point is valid or the time span is not positive.
pub fn velocity(points: &[PointSample], time_span_days: f64) -> Option<VelocityStats> {
    if time_span_days.is_nan() || time_span_days <= 0.0 {
        return None;
    }
    let annual_factor = 365.25 / time_span_days;
    let summary = Summary::from_values(
        points
            .iter()
            .filter(|p| p.valid)
            .filter_map(|p| p.displacement_mm)
            .map(|d| f64::from(d) * annual_factor),
    )?;
    Some(VelocityStats {
        time_span_days,
        mean_velocity_mm_year: summary.mean,
        std_velocity_mm_year: summary.std,
        min_velocity_mm_year: summary.min,
        max_velocity_mm_year: summary.max,
    })
}
