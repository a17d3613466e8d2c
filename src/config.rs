//! Processing configuration passed explicitly to the orchestrator

use crate::core::{
    CoregistrationParams, GeocodeParams, InterferogramParams, PhaseFilterParams, UnwrapParams,
};
use crate::io::DemConfig;
use crate::types::{InsarError, InsarResult, Polarization};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where granules are downloaded and extracted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Root for downloads, extractions and per-job working directories
    pub work_root: PathBuf,
    pub polarization: Polarization,
    /// Sub-swath to process (e.g. "iw2"); first match when unset
    pub swath: Option<String>,
    pub download_timeout_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("insar-pipeline"),
            polarization: Polarization::VV,
            swath: None,
            download_timeout_secs: 3600,
        }
    }
}

impl StagingConfig {
    /// Shared directory for downloaded archives
    pub fn input_dir(&self) -> PathBuf {
        self.work_root.join("input")
    }

    /// Shared directory for extracted products
    pub fn staging_dir(&self) -> PathBuf {
        self.work_root.join("staging")
    }

    /// Per-job working directory, removed when the job ends
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.work_root.join("jobs").join(job_id)
    }
}

/// Result upload and notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Directory local artifact copies are kept under
    pub artifact_dir: Option<PathBuf>,
    /// Base URL artifacts are PUT to
    pub artifact_base_url: Option<String>,
    pub upload_timeout_secs: u64,
    pub webhook_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            artifact_base_url: None,
            upload_timeout_secs: 300,
            webhook_timeout_secs: 30,
        }
    }
}

/// Every tunable of a processing run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub staging: StagingConfig,
    pub dem: DemConfig,
    pub coregistration: CoregistrationParams,
    pub interferogram: InterferogramParams,
    pub phase_filter: PhaseFilterParams,
    pub unwrap: UnwrapParams,
    pub geocode: GeocodeParams,
    pub delivery: DeliveryConfig,
}

impl ProcessingConfig {
    /// Load from a JSON file; missing sections take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> InsarResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> InsarResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| InsarError::InvalidFormat(format!("configuration: {}", e)))
    }
}
