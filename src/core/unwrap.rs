use crate::core::phase_filter::wrap_phase;
use crate::types::{is_valid, InsarError, InsarResult, SarRealImage, NODATA};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// Phase unwrapping parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwrapParams {
    pub method: UnwrapMethod,
    /// Pixels below this coherence are excluded from the unwrapping domain
    pub min_coherence: f32,
    /// Connected regions smaller than this are masked
    pub min_region_size: usize,
}

impl Default for UnwrapParams {
    fn default() -> Self {
        Self {
            method: UnwrapMethod::QualityGuided,
            min_coherence: 0.2,
            min_region_size: 16,
        }
    }
}

/// Available unwrapping methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnwrapMethod {
    /// Region growing ordered by coherence
    QualityGuided,
    /// Row-then-column integration
    Separable,
}

/// Summary of one unwrapping run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwrapReport {
    pub regions: usize,
    pub unwrapped_pixels: usize,
    pub masked_pixels: usize,
}

/// Heap entry; ordered by coherence
#[derive(Debug, Clone, Copy)]
struct Candidate {
    quality: f32,
    index: (usize, usize),
    parent: (usize, usize),
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.quality
            .total_cmp(&other.quality)
            .then_with(|| other.index.cmp(&self.index))
    }
}

fn neighbours(
    (i, j): (usize, usize),
    (height, width): (usize, usize),
) -> impl Iterator<Item = (usize, usize)> {
    let up = i.checked_sub(1).map(|y| (y, j));
    let down = (i + 1 < height).then_some((i + 1, j));
    let left = j.checked_sub(1).map(|x| (i, x));
    let right = (j + 1 < width).then_some((i, j + 1));
    [up, down, left, right].into_iter().flatten()
}

/// Resolves 2pi ambiguities in wrapped phase
pub struct PhaseUnwrapper {
    params: UnwrapParams,
}

impl PhaseUnwrapper {
    pub fn new(params: UnwrapParams) -> Self {
        Self { params }
    }

    /// Unwrap filtered phase using coherence as quality.
    ///
    /// Nodata phase, nodata coherence and coherence below `min_coherence`
    /// are outside the domain and come out as nodata.
    pub fn unwrap(
        &self,
        phase: &SarRealImage,
        coherence: &SarRealImage,
    ) -> InsarResult<(SarRealImage, UnwrapReport)> {
        if phase.dim() != coherence.dim() {
            return Err(InsarError::Processing(format!(
                "Phase {:?} and coherence {:?} grids differ",
                phase.dim(),
                coherence.dim()
            )));
        }
        log::info!("Unwrapping phase with {:?} method", self.params.method);

        let domain = self.domain(phase, coherence);
        let (mut labels, regions) = Self::label_regions(&domain);

        // Drop regions too small to unwrap reliably
        let mut kept = Vec::new();
        for region in regions {
            if region.len() < self.params.min_region_size {
                for &idx in &region {
                    labels[idx] = None;
                }
            } else {
                kept.push(region);
            }
        }

        let mut unwrapped = match self.params.method {
            UnwrapMethod::QualityGuided => Self::grow_regions(phase, coherence, &kept),
            UnwrapMethod::Separable => Self::separable(phase, &labels),
        };
        for ((i, j), value) in unwrapped.indexed_iter_mut() {
            if labels[[i, j]].is_none() {
                *value = NODATA;
            }
        }

        let unwrapped_pixels = kept.iter().map(Vec::len).sum::<usize>();
        let report = UnwrapReport {
            regions: kept.len(),
            unwrapped_pixels,
            masked_pixels: phase.len() - unwrapped_pixels,
        };
        log::info!(
            "Unwrapped {} pixels in {} regions, {} masked",
            report.unwrapped_pixels,
            report.regions,
            report.masked_pixels
        );
        Ok((unwrapped, report))
    }

    fn domain(&self, phase: &SarRealImage, coherence: &SarRealImage) -> Array2<bool> {
        ndarray::Zip::from(phase)
            .and(coherence)
            .map_collect(|&p, &c| is_valid(p) && is_valid(c) && c >= self.params.min_coherence)
    }

    /// 4-connected components of the domain
    fn label_regions(domain: &Array2<bool>) -> (Array2<Option<usize>>, Vec<Vec<(usize, usize)>>) {
        let shape = domain.dim();
        let mut labels: Array2<Option<usize>> = Array2::from_elem(shape, None);
        let mut regions = Vec::new();

        for ((i, j), &inside) in domain.indexed_iter() {
            if !inside || labels[[i, j]].is_some() {
                continue;
            }
            let label = regions.len();
            let mut members = Vec::new();
            let mut queue = VecDeque::from([(i, j)]);
            labels[[i, j]] = Some(label);
            while let Some(idx) = queue.pop_front() {
                members.push(idx);
                for n in neighbours(idx, shape) {
                    if domain[n] && labels[n].is_none() {
                        labels[n] = Some(label);
                        queue.push_back(n);
                    }
                }
            }
            regions.push(members);
        }
        (labels, regions)
    }

    /// Quality-guided growth, one seed per region at its most coherent pixel
    fn grow_regions(
        phase: &SarRealImage,
        coherence: &SarRealImage,
        regions: &[Vec<(usize, usize)>],
    ) -> SarRealImage {
        let shape = phase.dim();
        let mut output = Array2::from_elem(shape, NODATA);
        let mut done = Array2::from_elem(shape, false);
        let mut in_region = Array2::from_elem(shape, false);
        for region in regions {
            for &idx in region {
                in_region[idx] = true;
            }
        }

        for region in regions {
            let seed = match region
                .iter()
                .copied()
                .max_by(|a, b| coherence[*a].total_cmp(&coherence[*b]))
            {
                Some(seed) => seed,
                None => continue,
            };
            output[seed] = phase[seed];
            done[seed] = true;

            let mut heap = BinaryHeap::new();
            let push_neighbours = |heap: &mut BinaryHeap<Candidate>, from: (usize, usize), done: &Array2<bool>| {
                for n in neighbours(from, shape) {
                    if in_region[n] && !done[n] {
                        heap.push(Candidate {
                            quality: coherence[n],
                            index: n,
                            parent: from,
                        });
                    }
                }
            };
            push_neighbours(&mut heap, seed, &done);

            while let Some(Candidate { index, parent, .. }) = heap.pop() {
                if done[index] {
                    continue;
                }
                output[index] = output[parent] + wrap_phase(phase[index] - phase[parent]);
                done[index] = true;
                push_neighbours(&mut heap, index, &done);
            }
        }
        output
    }

    /// Integrate each run of domain pixels along its row, then align the run
    /// by whole cycles to the row above through its first shared column.
    /// Integration never crosses a masked gap; a run with nothing above it
    /// keeps its own offset.
    fn separable(phase: &SarRealImage, labels: &Array2<Option<usize>>) -> SarRealImage {
        let (height, width) = phase.dim();
        let mut output = Array2::from_elem((height, width), NODATA);
        let two_pi = 2.0 * std::f32::consts::PI;

        for i in 0..height {
            let mut j = 0;
            while j < width {
                if labels[[i, j]].is_none() {
                    j += 1;
                    continue;
                }
                let start = j;
                output[[i, j]] = phase[[i, j]];
                j += 1;
                while j < width && labels[[i, j]].is_some() {
                    output[[i, j]] = output[[i, j - 1]] + wrap_phase(phase[[i, j]] - phase[[i, j - 1]]);
                    j += 1;
                }

                // Vertically adjacent domain pixels always share a region
                let shared = match i.checked_sub(1) {
                    Some(above) => (start..j).find(|&k| labels[[above, k]].is_some()),
                    None => None,
                };
                if let Some(k) = shared {
                    let cycles = ((output[[i - 1, k]] - output[[i, k]]) / two_pi).round();
                    if cycles != 0.0 {
                        for k in start..j {
                            output[[i, k]] += cycles * two_pi;
                        }
                    }
                }
            }
        }
        output
    }
}
