use crate::core::least_squares;
use crate::io::dem::DemTile;
use crate::io::orbit::OrbitReader;
use crate::io::raster;
use crate::io::slc_reader::SlcReader;
use crate::types::{
    Acquisition, InsarResult, OrbitData, RadarGeometry, RasterProduct, SarComplex, SarImage,
};
use ndarray::{s, Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Co-registration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoregistrationParams {
    /// Cross-correlation patch size (pixels)
    pub patch_size: usize,
    /// Search radius around the geometric offset (pixels)
    pub search_radius: usize,
    /// Patches along azimuth
    pub patches_azimuth: usize,
    /// Patches along range
    pub patches_range: usize,
    /// Matches below this peak correlation are discarded
    pub min_correlation: f32,
}

impl Default for CoregistrationParams {
    fn default() -> Self {
        Self {
            patch_size: 64,
            search_radius: 8,
            patches_azimuth: 8,
            patches_range: 8,
            min_correlation: 0.3,
        }
    }
}

/// Secondary-minus-reference pixel offsets, affine in (line, pixel)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetModel {
    /// azimuth offset = a[0] + a[1]*line + a[2]*pixel
    pub azimuth: [f64; 3],
    /// range offset = r[0] + r[1]*line + r[2]*pixel
    pub range: [f64; 3],
}

impl OffsetModel {
    pub fn constant(azimuth: f64, range: f64) -> Self {
        Self {
            azimuth: [azimuth, 0.0, 0.0],
            range: [range, 0.0, 0.0],
        }
    }

    /// (azimuth, range) offset at a reference pixel
    pub fn offset_at(&self, line: f64, pixel: f64) -> (f64, f64) {
        (
            self.azimuth[0] + self.azimuth[1] * line + self.azimuth[2] * pixel,
            self.range[0] + self.range[1] * line + self.range[2] * pixel,
        )
    }
}

/// One accepted cross-correlation match
#[derive(Debug, Clone, Copy)]
pub struct PatchMatch {
    pub line: f64,
    pub pixel: f64,
    pub azimuth_offset: f64,
    pub range_offset: f64,
    pub correlation: f32,
}

/// Reference and secondary on a common grid
#[derive(Debug, Clone)]
pub struct CoregisteredPair {
    pub reference: SarImage,
    /// Secondary resampled onto the reference grid; NaN where it has no coverage
    pub secondary: SarImage,
    pub model: OffsetModel,
    pub azimuth_offsets: RasterProduct,
    pub range_offsets: RasterProduct,
    pub azimuth_offsets_path: PathBuf,
    pub range_offsets_path: PathBuf,
}

/// Aligns a secondary acquisition onto the reference radar grid
pub struct Coregistrator {
    params: CoregistrationParams,
}

impl Coregistrator {
    pub fn new(params: CoregistrationParams) -> Self {
        Self { params }
    }

    /// Co-register two staged acquisitions and write the offset field into
    /// `{out_dir}/coregistered/`.
    pub fn coregister(
        &self,
        reference: &Acquisition,
        secondary: &Acquisition,
        dem: &DemTile,
        out_dir: &Path,
    ) -> InsarResult<CoregisteredPair> {
        let dem_product = dem.load()?;
        let initial = Self::geometric_offset(reference, secondary, &dem_product);
        log::info!(
            "Geometric offset: azimuth {:.3}, range {:.3} pixels",
            initial.0,
            initial.1
        );

        let reference_slc = SlcReader::read_slc(reference)?;
        let secondary_slc = SlcReader::read_slc(secondary)?;

        let dir = out_dir.join("coregistered");
        fs::create_dir_all(&dir)?;
        self.coregister_images(reference_slc, &secondary_slc, initial, &dir)
    }

    /// Register already-loaded images starting from an initial offset
    pub fn coregister_images(
        &self,
        reference: SarImage,
        secondary: &SarImage,
        initial: (f64, f64),
        dir: &Path,
    ) -> InsarResult<CoregisteredPair> {
        let matches = self.estimate_offsets(&reference, secondary, initial);
        log::info!("Accepted {} patch matches", matches.len());

        let model = Self::fit_model(&matches, initial);
        log::debug!("Offset model: {:?}", model);

        let resampled = Self::resample(secondary, &model, reference.dim());

        let (height, width) = reference.dim();
        let azimuth = Array2::from_shape_fn((height, width), |(i, j)| {
            model.offset_at(i as f64, j as f64).0 as f32
        });
        let range = Array2::from_shape_fn((height, width), |(i, j)| {
            model.offset_at(i as f64, j as f64).1 as f32
        });
        let azimuth_offsets = RasterProduct::radar(azimuth);
        let range_offsets = RasterProduct::radar(range);

        let azimuth_offsets_path = dir.join("azimuth_offsets.tif");
        let range_offsets_path = dir.join("range_offsets.tif");
        raster::write_raster(&azimuth_offsets_path, &azimuth_offsets)?;
        raster::write_raster(&range_offsets_path, &range_offsets)?;

        Ok(CoregisteredPair {
            reference,
            secondary: resampled,
            model,
            azimuth_offsets,
            range_offsets,
            azimuth_offsets_path,
            range_offsets_path,
        })
    }

    /// Offset predicted from orbits: the scene centre is located on both
    /// orbits by zero-Doppler search and the time and range differences are
    /// converted to pixels. Zero when either product lacks an orbit.
    pub fn geometric_offset(
        reference: &Acquisition,
        secondary: &Acquisition,
        dem: &RasterProduct,
    ) -> (f64, f64) {
        let ref_geom = &reference.geometry;
        let sec_geom = &secondary.geometry;
        let (ref_orbit, sec_orbit) = match (&ref_geom.orbit, &sec_geom.orbit) {
            (Some(r), Some(s)) => (r, s),
            _ => {
                log::warn!("Orbit state vectors missing, assuming zero geometric offset");
                return (0.0, 0.0);
            }
        };
        let (lat, lon) = match ref_geom.footprint() {
            Some(bbox) => bbox.center(),
            None => {
                log::warn!("No geolocation grid, assuming zero geometric offset");
                return (0.0, 0.0);
            }
        };
        let mean_tie_height = ref_geom.tie_points.iter().map(|t| t.height).sum::<f64>()
            / ref_geom.tie_points.len().max(1) as f64;
        let height = raster::sample_geographic(dem, lon, lat)
            .map(f64::from)
            .unwrap_or(mean_tie_height);
        let target = OrbitReader::latlon_to_ecef(lat, lon, height);

        let locate = |geometry: &RadarGeometry, orbit: &OrbitData| -> InsarResult<(f64, f64)> {
            let t = OrbitReader::zero_doppler_time(orbit, &target)?;
            let position = OrbitReader::interpolate_position(orbit, t)?;
            let seconds = (t - geometry.first_line_time)
                .num_microseconds()
                .unwrap_or(0) as f64
                * 1e-6;
            let line = seconds / geometry.azimuth_time_interval;
            let slant_range = OrbitReader::distance(&position, &target);
            let pixel = (slant_range - geometry.slant_range_at(0.0)) / geometry.range_pixel_spacing;
            Ok((line, pixel))
        };

        match (locate(ref_geom, ref_orbit), locate(sec_geom, sec_orbit)) {
            (Ok((ref_line, ref_pixel)), Ok((sec_line, sec_pixel))) => {
                (sec_line - ref_line, sec_pixel - ref_pixel)
            }
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("Geometric offset unavailable ({}), assuming zero", e);
                (0.0, 0.0)
            }
        }
    }

    /// Amplitude cross-correlation on a grid of patches around `initial`
    pub fn estimate_offsets(
        &self,
        reference: &SarImage,
        secondary: &SarImage,
        initial: (f64, f64),
    ) -> Vec<PatchMatch> {
        let ref_amp = reference.mapv(|c| if c.norm().is_finite() { c.norm() } else { 0.0 });
        let sec_amp = secondary.mapv(|c| if c.norm().is_finite() { c.norm() } else { 0.0 });

        let (height, width) = reference.dim();
        let patch = self.params.patch_size.min(height).min(width);
        let radius = self.params.search_radius as isize;
        if patch < 4 {
            return Vec::new();
        }

        let centres = |extent: usize, count: usize| -> Vec<usize> {
            let count = count.max(1);
            let usable = extent - patch;
            (0..count)
                .map(|k| (usable as f64 * (k as f64 + 0.5) / count as f64).round() as usize)
                .collect()
        };
        let rows = centres(height, self.params.patches_azimuth);
        let cols = centres(width, self.params.patches_range);
        let origins: Vec<(usize, usize)> = rows
            .iter()
            .flat_map(|&r| cols.iter().map(move |&c| (r, c)))
            .collect();

        let base = (initial.0.round() as isize, initial.1.round() as isize);
        let search = |&(r0, c0): &(usize, usize)| -> Option<PatchMatch> {
            let ref_patch = ref_amp.slice(s![r0..r0 + patch, c0..c0 + patch]);
            let scores = Array2::from_shape_fn(
                (2 * radius as usize + 1, 2 * radius as usize + 1),
                |(dy, dx)| {
                    let sr = r0 as isize + base.0 + dy as isize - radius;
                    let sc = c0 as isize + base.1 + dx as isize - radius;
                    if sr < 0
                        || sc < 0
                        || sr as usize + patch > height.min(sec_amp.nrows())
                        || sc as usize + patch > width.min(sec_amp.ncols())
                    {
                        return f32::NAN;
                    }
                    let sec_patch = sec_amp.slice(s![
                        sr as usize..sr as usize + patch,
                        sc as usize..sc as usize + patch
                    ]);
                    normalized_correlation(ref_patch.view(), sec_patch)
                },
            );

            let ((py, px), peak) = scores
                .indexed_iter()
                .filter(|(_, v)| v.is_finite())
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, v)| (idx, *v))?;
            if peak < self.params.min_correlation {
                return None;
            }

            let refine = |minus: Option<f32>, plus: Option<f32>| -> f64 {
                match (minus, plus) {
                    (Some(m), Some(p)) if m.is_finite() && p.is_finite() => {
                        let denom = m - 2.0 * peak + p;
                        if denom.abs() > 1e-9 {
                            (0.5 * (m - p) / denom).clamp(-0.5, 0.5) as f64
                        } else {
                            0.0
                        }
                    }
                    _ => 0.0,
                }
            };
            let sub_y = refine(
                py.checked_sub(1).and_then(|y| scores.get((y, px)).copied()),
                scores.get((py + 1, px)).copied(),
            );
            let sub_x = refine(
                px.checked_sub(1).and_then(|x| scores.get((py, x)).copied()),
                scores.get((py, px + 1)).copied(),
            );

            let half = patch as f64 / 2.0;
            Some(PatchMatch {
                line: r0 as f64 + half,
                pixel: c0 as f64 + half,
                azimuth_offset: (base.0 + py as isize - radius) as f64 + sub_y,
                range_offset: (base.1 + px as isize - radius) as f64 + sub_x,
                correlation: peak,
            })
        };

        Self::search_patches(&origins, search)
    }

    #[cfg(feature = "parallel")]
    fn search_patches<F>(origins: &[(usize, usize)], search: F) -> Vec<PatchMatch>
    where
        F: Fn(&(usize, usize)) -> Option<PatchMatch> + Sync + Send,
    {
        use rayon::prelude::*;
        origins.par_iter().filter_map(search).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn search_patches<F>(origins: &[(usize, usize)], search: F) -> Vec<PatchMatch>
    where
        F: Fn(&(usize, usize)) -> Option<PatchMatch>,
    {
        origins.iter().filter_map(search).collect()
    }

    /// Least-squares affine fit; mean shift below three matches and the
    /// geometric offset when nothing matched.
    pub fn fit_model(matches: &[PatchMatch], initial: (f64, f64)) -> OffsetModel {
        if matches.is_empty() {
            log::warn!("No reliable patch matches, using geometric offset");
            return OffsetModel::constant(initial.0, initial.1);
        }

        let n = matches.len() as f64;
        let mean_az = matches.iter().map(|m| m.azimuth_offset).sum::<f64>() / n;
        let mean_rg = matches.iter().map(|m| m.range_offset).sum::<f64>() / n;
        if matches.len() < 3 {
            return OffsetModel::constant(mean_az, mean_rg);
        }

        let design: Vec<Vec<f64>> = matches.iter().map(|m| vec![1.0, m.line, m.pixel]).collect();
        let az: Vec<f64> = matches.iter().map(|m| m.azimuth_offset).collect();
        let rg: Vec<f64> = matches.iter().map(|m| m.range_offset).collect();

        match (
            least_squares::solve(&design, &az),
            least_squares::solve(&design, &rg),
        ) {
            (Some(a), Some(r)) => OffsetModel {
                azimuth: [a[0], a[1], a[2]],
                range: [r[0], r[1], r[2]],
            },
            _ => OffsetModel::constant(mean_az, mean_rg),
        }
    }

    /// Bilinear complex resampling of the secondary onto the reference grid
    pub fn resample(secondary: &SarImage, model: &OffsetModel, shape: (usize, usize)) -> SarImage {
        let (sec_h, sec_w) = secondary.dim();
        let invalid = SarComplex::new(f32::NAN, f32::NAN);
        let mut output = Array2::from_elem(shape, invalid);
        if sec_h == 0 || sec_w == 0 {
            return output;
        }

        let sample = |(i, j): (usize, usize), value: &mut SarComplex| {
            let (daz, drg) = model.offset_at(i as f64, j as f64);
            let y = i as f64 + daz;
            let x = j as f64 + drg;
            if y < 0.0 || x < 0.0 || y > (sec_h - 1) as f64 || x > (sec_w - 1) as f64 {
                return;
            }
            let y0 = y.floor() as usize;
            let x0 = x.floor() as usize;
            let y1 = (y0 + 1).min(sec_h - 1);
            let x1 = (x0 + 1).min(sec_w - 1);
            let fy = (y - y0 as f64) as f32;
            let fx = (x - x0 as f64) as f32;
            *value = secondary[[y0, x0]] * ((1.0 - fy) * (1.0 - fx))
                + secondary[[y0, x1]] * ((1.0 - fy) * fx)
                + secondary[[y1, x0]] * (fy * (1.0 - fx))
                + secondary[[y1, x1]] * (fy * fx);
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut output).par_for_each(sample);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut output).for_each(sample);

        output
    }
}

/// Zero-mean normalized cross-correlation of two equally sized patches
fn normalized_correlation(a: ArrayView2<f32>, b: ArrayView2<f32>) -> f32 {
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&va, &vb) in a.iter().zip(b.iter()) {
        let da = va as f64 - mean_a;
        let db = vb as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return f32::NAN;
    }
    (cov / (var_a * var_b).sqrt()) as f32
}
