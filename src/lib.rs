//! insar-pipeline: two-pass Sentinel-1 InSAR displacement processing
//!
//! Takes a reference and a secondary SLC acquisition of the same area and
//! produces a geocoded line-of-sight displacement map, coherence and
//! displacement samples at caller-supplied points. Jobs run through an
//! explicit state machine (`job::JobState`) that stages granules and a DEM,
//! co-registers, forms and filters the interferogram, unwraps, geocodes and
//! samples, then delivers results and cleans up.

pub mod config;
pub mod core;
pub mod io;
pub mod job;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{DeliveryConfig, ProcessingConfig, StagingConfig};
pub use types::{
    Acquisition, BoundingBox, GeoTransform, InsarError, InsarResult, Polarization, RasterProduct,
    SarImage, SarRealImage, NODATA,
};

pub use core::{PointRequest, PointSample, PointSampler};
pub use io::{DemProvider, DemTile, GranuleStager};
pub use job::{JobInput, JobOrchestrator, JobOutput, JobState, JobStatus, JobWorker};
