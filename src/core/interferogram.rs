use crate::core::coregistration::CoregisteredPair;
use crate::io::raster;
use crate::types::{
    InsarError, InsarResult, RasterProduct, SarComplex, SarImage, SarRealImage, NODATA,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Interferogram formation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterferogramParams {
    /// Coherence estimation window (must be odd)
    pub window_size: usize,
}

impl Default for InterferogramParams {
    fn default() -> Self {
        Self { window_size: 5 }
    }
}

/// Wrapped phase and coherence on the reference radar grid
#[derive(Debug, Clone)]
pub struct InterferogramProducts {
    pub phase: RasterProduct,
    pub coherence: RasterProduct,
    pub phase_path: PathBuf,
    pub coherence_path: PathBuf,
}

/// Forms the interferogram of a co-registered pair
pub struct InterferogramFormer {
    params: InterferogramParams,
}

impl InterferogramFormer {
    pub fn new(params: InterferogramParams) -> Self {
        Self { params }
    }

    /// Form phase and coherence and write them into `{out_dir}/interferogram/`
    pub fn form(&self, pair: &CoregisteredPair, out_dir: &Path) -> InsarResult<InterferogramProducts> {
        let (phase, coherence) = self.form_arrays(&pair.reference, &pair.secondary)?;

        let dir = out_dir.join("interferogram");
        fs::create_dir_all(&dir)?;
        let phase = RasterProduct::radar(phase);
        let coherence = RasterProduct::radar(coherence);
        let phase_path = dir.join("interferogram.tif");
        let coherence_path = dir.join("coherence.tif");
        raster::write_raster(&phase_path, &phase)?;
        raster::write_raster(&coherence_path, &coherence)?;

        Ok(InterferogramProducts {
            phase,
            coherence,
            phase_path,
            coherence_path,
        })
    }

    /// Wrapped phase of `reference * conj(secondary)` and boxcar coherence.
    ///
    /// Pixels where either input is non-finite or has zero intensity are
    /// nodata in both outputs and excluded from neighbouring windows.
    pub fn form_arrays(
        &self,
        reference: &SarImage,
        secondary: &SarImage,
    ) -> InsarResult<(SarRealImage, SarRealImage)> {
        if reference.dim() != secondary.dim() {
            return Err(InsarError::Processing(format!(
                "Reference {:?} and secondary {:?} grids differ",
                reference.dim(),
                secondary.dim()
            )));
        }
        if self.params.window_size == 0 || self.params.window_size % 2 == 0 {
            return Err(InsarError::Processing(
                "Coherence window size must be odd".to_string(),
            ));
        }

        log::info!(
            "Forming interferogram: {}x{}, coherence window {}",
            reference.ncols(),
            reference.nrows(),
            self.params.window_size
        );

        let valid = |c: &SarComplex| c.re.is_finite() && c.im.is_finite() && c.norm_sqr() > 0.0;
        let zero = SarComplex::new(0.0, 0.0);

        // Per-pixel products, zeroed where invalid so they drop out of window sums
        let mask = Zip::from(reference).and(secondary).map_collect(|r, s| valid(r) && valid(s));
        let cross = Zip::from(reference)
            .and(secondary)
            .and(&mask)
            .map_collect(|r, s, &ok| if ok { r * s.conj() } else { zero });
        let ref_power = Zip::from(reference)
            .and(&mask)
            .map_collect(|r, &ok| if ok { r.norm_sqr() as f64 } else { 0.0 });
        let sec_power = Zip::from(secondary)
            .and(&mask)
            .map_collect(|s, &ok| if ok { s.norm_sqr() as f64 } else { 0.0 });

        let (height, width) = reference.dim();
        let half = self.params.window_size / 2;
        let mut phase = Array2::from_elem((height, width), NODATA);
        let mut coherence = Array2::from_elem((height, width), NODATA);

        let estimate = |(i, j): (usize, usize), ph: &mut f32, coh: &mut f32| {
            if !mask[[i, j]] {
                return;
            }
            *ph = cross[[i, j]].arg();

            let mut sum = SarComplex::new(0.0, 0.0);
            let mut p1 = 0.0f64;
            let mut p2 = 0.0f64;
            for y in i.saturating_sub(half)..(i + half + 1).min(height) {
                for x in j.saturating_sub(half)..(j + half + 1).min(width) {
                    sum += cross[[y, x]];
                    p1 += ref_power[[y, x]];
                    p2 += sec_power[[y, x]];
                }
            }
            let denom = (p1 * p2).sqrt();
            *coh = if denom > 0.0 {
                ((sum.norm() as f64 / denom) as f32).clamp(0.0, 1.0)
            } else {
                0.0
            };
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut phase).and(&mut coherence).par_for_each(estimate);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut phase).and(&mut coherence).for_each(estimate);

        Ok((phase, coherence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    #[test]
    fn test_identical_images_are_fully_coherent() {
        let image = Array2::from_shape_fn((8, 8), |(i, j)| {
            SarComplex::from_polar(1.0 + i as f32, 0.1 * j as f32)
        });
        let former = InterferogramFormer::new(InterferogramParams { window_size: 3 });
        let (phase, coherence) = former.form_arrays(&image, &image).unwrap();

        assert!(phase.iter().all(|&p| p.abs() < 1e-5));
        for &c in coherence.iter() {
            assert_relative_eq!(c, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_phase_difference_and_nodata() {
        let reference = Array2::from_elem((5, 5), SarComplex::from_polar(1.0, 0.5));
        let mut secondary = Array2::from_elem((5, 5), SarComplex::from_polar(2.0, -0.25));
        secondary[[2, 2]] = SarComplex::new(f32::NAN, f32::NAN);
        secondary[[0, 0]] = SarComplex::new(0.0, 0.0);

        let former = InterferogramFormer::new(InterferogramParams::default());
        let (phase, coherence) = former.form_arrays(&reference, &secondary).unwrap();

        assert_relative_eq!(phase[[1, 1]], 0.75, epsilon = 1e-5);
        assert!(phase.iter().all(|&p| p == NODATA || (-PI..=PI).contains(&p)));
        assert_eq!(phase[[2, 2]], NODATA);
        assert_eq!(coherence[[2, 2]], NODATA);
        assert_eq!(coherence[[0, 0]], NODATA);
        assert_relative_eq!(coherence[[4, 4]], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_even_window_rejected() {
        let image = Array2::from_elem((4, 4), SarComplex::new(1.0, 0.0));
        let former = InterferogramFormer::new(InterferogramParams { window_size: 4 });
        assert!(former.form_arrays(&image, &image).is_err());
    }
}
