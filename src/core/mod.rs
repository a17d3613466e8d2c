//! Interferometric processing stages

pub mod coregistration;
pub mod geocode;
pub mod interferogram;
pub mod least_squares;
pub mod phase_filter;
pub mod sampler;
pub mod statistics;
pub mod unwrap;

// Re-export main types
pub use coregistration::{CoregisteredPair, CoregistrationParams, Coregistrator, OffsetModel, PatchMatch};
pub use geocode::{phase_to_displacement_mm, GeocodeParams, GeocodedProducts, Geocoder, RadarMapping};
pub use interferogram::{InterferogramFormer, InterferogramParams, InterferogramProducts};
pub use phase_filter::{wrap_phase, PhaseFilter, PhaseFilterParams, PhaseFilterType};
pub use sampler::{ExtractionError, PointRequest, PointSample, PointSampler};
pub use statistics::{Statistics, Summary, VelocityStats};
pub use unwrap::{PhaseUnwrapper, UnwrapMethod, UnwrapParams, UnwrapReport};
