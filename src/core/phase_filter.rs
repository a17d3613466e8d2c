use crate::types::{is_valid, InsarError, InsarResult, SarComplex, SarRealImage, NODATA};
use ndarray::{s, Array2, Zip};
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::sync::Arc;

/// Phase filtering parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseFilterParams {
    pub filter_type: PhaseFilterType,
    /// Goldstein patch size (pixels)
    pub patch_size: usize,
    /// Spectrum smoothing kernel (must be odd)
    pub smoothing_window: usize,
    /// Lower bound of the adaptive exponent
    pub alpha_min: f32,
    /// Exponent applied at zero coherence
    pub alpha_max: f32,
    /// Boxcar window size (must be odd)
    pub window_size: usize,
}

impl Default for PhaseFilterParams {
    fn default() -> Self {
        Self {
            filter_type: PhaseFilterType::Goldstein,
            patch_size: 32,
            smoothing_window: 3,
            alpha_min: 0.2,
            alpha_max: 0.8,
            window_size: 5,
        }
    }
}

/// Available phase filter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseFilterType {
    /// Goldstein-Werner adaptive spectral filter
    Goldstein,
    /// Fixed-window circular mean
    Boxcar,
}

/// Wrapped-phase filter
pub struct PhaseFilter {
    params: PhaseFilterParams,
}

/// Wrap a phase value into [-pi, pi]
pub fn wrap_phase(phase: f32) -> f32 {
    let wrapped = (phase + PI).rem_euclid(2.0 * PI) - PI;
    wrapped.clamp(-PI, PI)
}

impl PhaseFilter {
    pub fn new(params: PhaseFilterParams) -> Self {
        Self { params }
    }

    /// Filter wrapped phase. Nodata pixels stay nodata and contribute nothing.
    pub fn apply(&self, phase: &SarRealImage, coherence: &SarRealImage) -> InsarResult<SarRealImage> {
        log::info!("Applying {:?} phase filter", self.params.filter_type);
        log::debug!("Filter parameters: {:?}", self.params);

        if phase.dim() != coherence.dim() {
            return Err(InsarError::Processing(format!(
                "Phase {:?} and coherence {:?} grids differ",
                phase.dim(),
                coherence.dim()
            )));
        }

        let (height, width) = phase.dim();
        let window = match self.params.filter_type {
            PhaseFilterType::Goldstein => self.params.patch_size,
            PhaseFilterType::Boxcar => self.params.window_size,
        };
        if height < window || width < window {
            return Err(InsarError::Processing(format!(
                "Image size {}x{} is too small for window size {}",
                height, width, window
            )));
        }

        let filtered = match self.params.filter_type {
            PhaseFilterType::Goldstein => {
                if self.params.smoothing_window % 2 == 0 {
                    return Err(InsarError::Processing(
                        "Smoothing window must be odd".to_string(),
                    ));
                }
                if self.params.patch_size < 4 {
                    return Err(InsarError::Processing(
                        "Goldstein patch size must be at least 4".to_string(),
                    ));
                }
                self.goldstein(phase, coherence)
            }
            PhaseFilterType::Boxcar => {
                if self.params.window_size % 2 == 0 {
                    return Err(InsarError::Processing("Window size must be odd".to_string()));
                }
                self.boxcar(phase)
            }
        };

        log::info!("Phase filtering completed");
        Ok(filtered)
    }

    fn phasors(phase: &SarRealImage) -> Array2<SarComplex> {
        phase.mapv(|p| {
            if is_valid(p) {
                SarComplex::from_polar(1.0, p)
            } else {
                SarComplex::new(0.0, 0.0)
            }
        })
    }

    /// Circular mean over a fixed window
    fn boxcar(&self, phase: &SarRealImage) -> SarRealImage {
        let z = Self::phasors(phase);
        let (height, width) = phase.dim();
        let half = self.params.window_size / 2;

        let mut output = Array2::from_elem((height, width), NODATA);
        Zip::indexed(&mut output).and(phase).for_each(|(i, j), out, &p| {
            if !is_valid(p) {
                return;
            }
            let window = z.slice(s![
                i.saturating_sub(half)..(i + half + 1).min(height),
                j.saturating_sub(half)..(j + half + 1).min(width)
            ]);
            let sum = window.iter().fold(SarComplex::new(0.0, 0.0), |acc, v| acc + v);
            *out = wrap_phase(sum.arg());
        });
        output
    }

    /// Patch origins along one axis: step `patch/4`, last patch flush with the edge
    fn origins(extent: usize, patch: usize) -> Vec<usize> {
        let step = (patch / 4).max(1);
        let mut origins: Vec<usize> = (0..=extent - patch).step_by(step).collect();
        if origins.last() != Some(&(extent - patch)) {
            origins.push(extent - patch);
        }
        origins
    }

    /// Goldstein-Werner filter: each patch spectrum is weighted by its own
    /// smoothed magnitude raised to an exponent that grows as coherence drops.
    fn goldstein(&self, phase: &SarRealImage, coherence: &SarRealImage) -> SarRealImage {
        let z = Self::phasors(phase);
        let (height, width) = phase.dim();
        let n = self.params.patch_size;

        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(n);
        let inverse = planner.plan_fft_inverse(n);

        // Triangular taper for overlap-add
        let taper: Vec<f32> = (0..n).map(|k| (k + 1).min(n - k) as f32).collect();

        let patches: Vec<(usize, usize)> = Self::origins(height, n)
            .into_iter()
            .flat_map(|r| Self::origins(width, n).into_iter().map(move |c| (r, c)))
            .collect();

        let filter_patch = |&(r0, c0): &(usize, usize)| -> Option<(usize, usize, Vec<SarComplex>)> {
            let coh = coherence.slice(s![r0..r0 + n, c0..c0 + n]);
            let valid: Vec<f32> = coh.iter().copied().filter(|c| is_valid(*c)).collect();
            if valid.is_empty() {
                return None;
            }
            let mean_coh = valid.iter().sum::<f32>() / valid.len() as f32;
            let alpha = (self.params.alpha_max * (1.0 - mean_coh))
                .clamp(self.params.alpha_min, self.params.alpha_max);

            let mut buffer: Vec<SarComplex> = z.slice(s![r0..r0 + n, c0..c0 + n]).iter().copied().collect();
            fft2d(&mut buffer, n, &forward);

            let magnitude: Vec<f32> = buffer.iter().map(|c| c.norm()).collect();
            let smoothed = smooth_circular(&magnitude, n, self.params.smoothing_window);
            let peak = smoothed.iter().cloned().fold(0.0f32, f32::max);
            if peak > 0.0 {
                for (value, weight) in buffer.iter_mut().zip(smoothed.iter()) {
                    *value *= (weight / peak).powf(alpha);
                }
            }

            fft2d(&mut buffer, n, &inverse);
            for (k, value) in buffer.iter_mut().enumerate() {
                *value *= taper[k / n] * taper[k % n];
            }
            Some((r0, c0, buffer))
        };

        let filtered = Self::run_patches(&patches, filter_patch);

        let mut accum = Array2::from_elem((height, width), SarComplex::new(0.0, 0.0));
        for (r0, c0, buffer) in filtered {
            let mut target = accum.slice_mut(s![r0..r0 + n, c0..c0 + n]);
            for (slot, value) in target.iter_mut().zip(buffer.iter()) {
                *slot += value;
            }
        }

        Zip::from(&accum).and(phase).map_collect(|acc, &p| {
            if !is_valid(p) {
                NODATA
            } else if acc.norm_sqr() > 0.0 {
                wrap_phase(acc.arg())
            } else {
                p
            }
        })
    }

    #[cfg(feature = "parallel")]
    fn run_patches<F>(patches: &[(usize, usize)], op: F) -> Vec<(usize, usize, Vec<SarComplex>)>
    where
        F: Fn(&(usize, usize)) -> Option<(usize, usize, Vec<SarComplex>)> + Sync + Send,
    {
        use rayon::prelude::*;
        patches.par_iter().filter_map(op).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn run_patches<F>(patches: &[(usize, usize)], op: F) -> Vec<(usize, usize, Vec<SarComplex>)>
    where
        F: Fn(&(usize, usize)) -> Option<(usize, usize, Vec<SarComplex>)>,
    {
        patches.iter().filter_map(op).collect()
    }
}

/// In-place 2D FFT of a row-major `n x n` buffer
fn fft2d(data: &mut [SarComplex], n: usize, fft: &Arc<dyn Fft<f32>>) {
    for row in data.chunks_exact_mut(n) {
        fft.process(row);
    }
    let mut column = vec![SarComplex::new(0.0, 0.0); n];
    for c in 0..n {
        for r in 0..n {
            column[r] = data[r * n + c];
        }
        fft.process(&mut column);
        for r in 0..n {
            data[r * n + c] = column[r];
        }
    }
}

/// Box smoothing with wrap-around, matching the periodic spectrum
fn smooth_circular(values: &[f32], n: usize, window: usize) -> Vec<f32> {
    let half = (window / 2) as isize;
    let norm = (window * window) as f32;
    let ni = n as isize;
    (0..n * n)
        .map(|k| {
            let (r, c) = ((k / n) as isize, (k % n) as isize);
            let mut sum = 0.0;
            for dy in -half..=half {
                for dx in -half..=half {
                    let y = (r + dy).rem_euclid(ni) as usize;
                    let x = (c + dx).rem_euclid(ni) as usize;
                    sum += values[y * n + x];
                }
            }
            sum / norm
        })
        .collect()
}
