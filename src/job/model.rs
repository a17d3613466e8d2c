//! Job descriptors exchanged with the serving shell

use crate::core::{PointRequest, PointSample, Statistics};
use crate::io::source::is_plain_name;
use crate::types::{BoundingBox, InsarError, InsarResult};
use serde::{Deserialize, Serialize};

/// Job descriptor as received from the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInput {
    pub job_id: String,
    pub infrastructure_id: Option<String>,
    pub reference_granule: String,
    pub secondary_granule: String,
    pub reference_url: Option<String>,
    pub secondary_url: Option<String>,
    pub reference_path: Option<String>,
    pub secondary_path: Option<String>,
    pub bbox: BoundingBox,
    pub points: Vec<PointRequest>,
    pub webhook_url: Option<String>,
}

/// Where both granules come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GranuleLocations {
    Urls { reference: String, secondary: String },
    Paths { reference: String, secondary: String },
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

impl JobInput {
    pub fn from_json(text: &str) -> InsarResult<Self> {
        serde_json::from_str(text).map_err(|e| InsarError::Validation(format!("Invalid job input: {}", e)))
    }

    /// Check required fields and granule locations without touching the
    /// filesystem or network
    pub fn validate(&self) -> InsarResult<GranuleLocations> {
        for (field, value) in [
            ("job_id", &self.job_id),
            ("reference_granule", &self.reference_granule),
            ("secondary_granule", &self.secondary_granule),
        ] {
            if value.trim().is_empty() {
                return Err(InsarError::Validation(format!("Missing required field: {}", field)));
            }
        }
        // Each of these names a file or directory under the work root
        for (field, value) in [
            ("job_id", &self.job_id),
            ("reference_granule", &self.reference_granule),
            ("secondary_granule", &self.secondary_granule),
        ] {
            if !is_plain_name(value) {
                return Err(InsarError::Validation(format!("Invalid {}: {}", field, value)));
            }
        }
        self.bbox.validate()?;

        let urls = (non_empty(&self.reference_url), non_empty(&self.secondary_url));
        let paths = (non_empty(&self.reference_path), non_empty(&self.secondary_path));
        match (urls, paths) {
            ((Some(reference), Some(secondary)), _) => Ok(GranuleLocations::Urls {
                reference: reference.to_string(),
                secondary: secondary.to_string(),
            }),
            (_, (Some(reference), Some(secondary))) => Ok(GranuleLocations::Paths {
                reference: reference.to_string(),
                secondary: secondary.to_string(),
            }),
            _ => Err(InsarError::Validation(
                "Must provide either URLs or paths for granules".to_string(),
            )),
        }
    }
}

/// Terminal outcome reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Error,
}

/// Results block of a successful job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub interferogram_url: Option<String>,
    pub coherence_url: Option<String>,
    pub displacement_url: Option<String>,
    pub unwrapped_url: Option<String>,
    pub displacement_points: Vec<PointSample>,
    pub statistics: Statistics,
}

/// Job response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub job_id: String,
    pub status: JobStatus,
    pub results: Option<JobResults>,
    pub processing_time_seconds: f64,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
}

/// Round to hundredths of a second
pub(crate) fn round_seconds(seconds: f64) -> f64 {
    (seconds * 100.0).round() / 100.0
}

impl JobOutput {
    pub fn success(job_id: &str, results: JobResults, elapsed_secs: f64) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Success,
            results: Some(results),
            processing_time_seconds: round_seconds(elapsed_secs),
            error: None,
            error_trace: None,
        }
    }

    pub fn failure(job_id: &str, error: String, trace: String, elapsed_secs: f64) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Error,
            results: None,
            processing_time_seconds: round_seconds(elapsed_secs),
            error: Some(error),
            error_trace: Some(trace),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> JobInput {
        JobInput {
            job_id: "job-1".into(),
            reference_granule: "REF".into(),
            secondary_granule: "SEC".into(),
            reference_url: Some("https://example.com/ref.zip".into()),
            secondary_url: Some("https://example.com/sec.zip".into()),
            ..JobInput::default()
        }
    }

    #[test]
    fn test_deserialize_defaults_bbox_to_globe() {
        let input = JobInput::from_json(
            r#"{"job_id": "j", "reference_granule": "a", "secondary_granule": "b",
                "reference_path": "/a.zip", "secondary_path": "/b.zip",
                "points": [{"id": "p1", "lat": 44.5, "lon": 4.5}, {"id": "p2"}]}"#,
        )
        .unwrap();
        assert_eq!(input.bbox, BoundingBox::default());
        assert_eq!(input.points.len(), 2);
        assert_eq!(input.points[1].lat, None);
        assert!(matches!(input.validate(), Ok(GranuleLocations::Paths { .. })));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(input().validate(), Ok(GranuleLocations::Urls { .. })));

        let mut missing = input();
        missing.secondary_granule.clear();
        let err = missing.validate().unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Missing required field: secondary_granule");

        let mut mixed = input();
        mixed.secondary_url = None;
        mixed.reference_path = Some("/a.zip".into());
        assert!(matches!(mixed.validate(), Err(InsarError::Validation(_))));

        let mut traversal = input();
        traversal.job_id = "../etc".into();
        assert!(traversal.validate().is_err());

        for name in ["../x", "/tmp/x.zip", "dir/x"] {
            let mut escaping = input();
            escaping.reference_granule = name.into();
            let err = escaping.validate().unwrap_err();
            assert_eq!(err.to_string(), format!("Validation error: Invalid reference_granule: {}", name));

            let mut escaping = input();
            escaping.secondary_granule = name.into();
            assert!(matches!(escaping.validate(), Err(InsarError::Validation(_))));
        }
    }

    #[test]
    fn test_output_serialization() {
        let output = JobOutput::failure("j", "boom".into(), "trace".into(), 1.23456);
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["processing_time_seconds"], 1.23);
        assert!(json["results"].is_null());

        let ok = JobOutput::success("j", JobResults::default(), 0.004);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error_trace").is_none());
        assert_eq!(json["results"]["statistics"]["valid_points"], 0);
    }
}
