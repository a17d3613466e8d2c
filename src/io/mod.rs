//! Input/output: SAFE products, DEMs and raster files

pub mod annotation;
pub mod dem;
pub mod granule;
pub mod orbit;
pub mod raster;
pub mod slc_reader;
pub mod source;

pub use annotation::AnnotationParser;
pub use dem::{DemConfig, DemProvider, DemSource, DemTile};
pub use granule::{validate_safe_package, GranuleName, GranuleStager, SafeValidation, StagedProduct};
pub use orbit::OrbitReader;
pub use slc_reader::SlcReader;
pub use source::{GranuleSource, HttpGranuleSource, LocalGranuleSource};
