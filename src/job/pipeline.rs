//! The processing stages a job runs through

use crate::config::ProcessingConfig;
use crate::core::{
    CoregisteredPair, Coregistrator, GeocodedProducts, Geocoder, InterferogramFormer,
    InterferogramProducts, PhaseFilter, PhaseUnwrapper, PointRequest, PointSample, PointSampler,
    UnwrapReport,
};
use crate::io::raster;
use crate::io::{
    DemProvider, DemTile, GranuleSource, GranuleStager, HttpGranuleSource, LocalGranuleSource,
    SlcReader,
};
use crate::job::model::{GranuleLocations, JobInput};
use crate::types::{Acquisition, BoundingBox, InsarResult, RasterProduct, SarRealImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Both acquisitions and the DEM covering the job's bbox
#[derive(Debug, Clone)]
pub struct StagedInputs {
    pub reference: Acquisition,
    pub secondary: Acquisition,
    pub dem: DemTile,
}

/// Output of the phase filter stage
#[derive(Debug, Clone)]
pub struct FilteredPhase {
    pub phase: SarRealImage,
    pub path: PathBuf,
}

/// Output of the unwrapping stage
#[derive(Debug, Clone)]
pub struct UnwrappedPhase {
    pub phase: SarRealImage,
    pub report: UnwrapReport,
    pub path: PathBuf,
}

/// One method per processing state of a job
pub trait InsarStages: Send + Sync {
    fn stage(
        &self,
        input: &JobInput,
        locations: &GranuleLocations,
        work_dir: &Path,
    ) -> InsarResult<StagedInputs>;

    fn coregister(&self, staged: &StagedInputs, work_dir: &Path) -> InsarResult<CoregisteredPair>;

    fn form_interferogram(
        &self,
        pair: &CoregisteredPair,
        work_dir: &Path,
    ) -> InsarResult<InterferogramProducts>;

    fn filter(&self, interferogram: &InterferogramProducts, work_dir: &Path) -> InsarResult<FilteredPhase>;

    fn unwrap(
        &self,
        filtered: &FilteredPhase,
        interferogram: &InterferogramProducts,
        work_dir: &Path,
    ) -> InsarResult<UnwrappedPhase>;

    fn geocode(
        &self,
        unwrapped: &UnwrappedPhase,
        interferogram: &InterferogramProducts,
        staged: &StagedInputs,
        bbox: &BoundingBox,
        work_dir: &Path,
    ) -> InsarResult<GeocodedProducts>;

    fn extract(&self, geocoded: &GeocodedProducts, points: &[PointRequest]) -> InsarResult<Vec<PointSample>>;
}

/// Stages backed by the crate's processors
pub struct InsarPipeline {
    config: ProcessingConfig,
    remote: Arc<dyn GranuleSource>,
    local: Arc<dyn GranuleSource>,
    stager: GranuleStager,
    dem: DemProvider,
}

impl InsarPipeline {
    pub fn new(config: ProcessingConfig) -> Self {
        let remote = Arc::new(HttpGranuleSource::new(
            config.staging.input_dir(),
            config.staging.download_timeout_secs,
        ));
        Self {
            remote,
            local: Arc::new(LocalGranuleSource),
            stager: GranuleStager::new(config.staging.staging_dir()),
            dem: DemProvider::new(config.dem.clone()),
            config,
        }
    }

    /// Replace the source used for granule URLs
    pub fn with_granule_source(mut self, source: Arc<dyn GranuleSource>) -> Self {
        self.remote = source;
        self
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    fn acquire(&self, source: &dyn GranuleSource, location: &str, granule: &str) -> InsarResult<Acquisition> {
        let archive = source.fetch(location, granule)?;
        let product_dir = self.stager.stage(&archive)?;
        let reader = SlcReader::new(&product_dir)?;
        let acquisition = reader.read_acquisition(
            self.config.staging.polarization,
            self.config.staging.swath.as_deref(),
        )?;
        log::info!(
            "Staged {} ({} x {})",
            acquisition.granule,
            acquisition.geometry.samples,
            acquisition.geometry.lines
        );
        Ok(acquisition)
    }
}

impl InsarStages for InsarPipeline {
    fn stage(
        &self,
        input: &JobInput,
        locations: &GranuleLocations,
        _work_dir: &Path,
    ) -> InsarResult<StagedInputs> {
        let (source, reference, secondary) = match locations {
            GranuleLocations::Urls { reference, secondary } => (self.remote.as_ref(), reference, secondary),
            GranuleLocations::Paths { reference, secondary } => (self.local.as_ref(), reference, secondary),
        };
        let reference = self.acquire(source, reference, &input.reference_granule)?;
        let secondary = self.acquire(source, secondary, &input.secondary_granule)?;
        if reference.polarization != secondary.polarization {
            log::warn!(
                "Polarization mismatch: {} vs {}",
                reference.polarization,
                secondary.polarization
            );
        }

        let dem = self.dem.get_dem(&input.bbox)?;
        log::info!(
            "DEM {} ({}{})",
            dem.path.display(),
            dem.source.label(),
            if dem.cache_hit { ", cached" } else { "" }
        );
        Ok(StagedInputs {
            reference,
            secondary,
            dem,
        })
    }

    fn coregister(&self, staged: &StagedInputs, work_dir: &Path) -> InsarResult<CoregisteredPair> {
        Coregistrator::new(self.config.coregistration.clone()).coregister(
            &staged.reference,
            &staged.secondary,
            &staged.dem,
            work_dir,
        )
    }

    fn form_interferogram(
        &self,
        pair: &CoregisteredPair,
        work_dir: &Path,
    ) -> InsarResult<InterferogramProducts> {
        InterferogramFormer::new(self.config.interferogram.clone()).form(pair, work_dir)
    }

    fn filter(&self, interferogram: &InterferogramProducts, work_dir: &Path) -> InsarResult<FilteredPhase> {
        let phase = PhaseFilter::new(self.config.phase_filter.clone())
            .apply(&interferogram.phase.data, &interferogram.coherence.data)?;
        let dir = work_dir.join("filtered");
        fs::create_dir_all(&dir)?;
        let path = dir.join("filtered_phase.tif");
        let product = RasterProduct::radar(phase);
        raster::write_raster(&path, &product)?;
        Ok(FilteredPhase {
            phase: product.data,
            path,
        })
    }

    fn unwrap(
        &self,
        filtered: &FilteredPhase,
        interferogram: &InterferogramProducts,
        work_dir: &Path,
    ) -> InsarResult<UnwrappedPhase> {
        let (phase, report) = PhaseUnwrapper::new(self.config.unwrap.clone())
            .unwrap(&filtered.phase, &interferogram.coherence.data)?;
        let dir = work_dir.join("unwrapped");
        fs::create_dir_all(&dir)?;
        let path = dir.join("unwrapped.tif");
        let product = RasterProduct::radar(phase);
        raster::write_raster(&path, &product)?;
        Ok(UnwrappedPhase {
            phase: product.data,
            report,
            path,
        })
    }

    fn geocode(
        &self,
        unwrapped: &UnwrappedPhase,
        interferogram: &InterferogramProducts,
        staged: &StagedInputs,
        bbox: &BoundingBox,
        work_dir: &Path,
    ) -> InsarResult<GeocodedProducts> {
        Geocoder::new(self.config.geocode.clone()).geocode(
            &unwrapped.phase,
            &interferogram.coherence.data,
            &staged.reference,
            &staged.dem,
            bbox,
            work_dir,
        )
    }

    fn extract(&self, geocoded: &GeocodedProducts, points: &[PointRequest]) -> InsarResult<Vec<PointSample>> {
        Ok(PointSampler::sample_at(
            &geocoded.displacement,
            Some(&geocoded.coherence),
            points,
        ))
    }
}
