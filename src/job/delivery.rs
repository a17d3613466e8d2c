//! Result delivery: artifact upload and webhook notification

use crate::config::DeliveryConfig;
use crate::job::model::JobOutput;
use crate::types::{InsarError, InsarResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage key of a job artifact
pub fn artifact_key(job_id: &str, artifact: &str) -> String {
    format!("results/{}/{}.tif", job_id, artifact)
}

/// Publishes job artifacts and returns a URL for each
pub trait ArtifactStore: Send + Sync {
    fn upload(&self, job_id: &str, artifact: &str, path: &Path) -> InsarResult<String>;
}

/// Sends the job response to a caller-supplied URL
pub trait Notifier: Send + Sync {
    fn notify(&self, url: &str, output: &JobOutput) -> InsarResult<()>;
}

/// Copies artifacts under a local root, keyed like remote storage
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn upload(&self, job_id: &str, artifact: &str, path: &Path) -> InsarResult<String> {
        let target = self.root.join(artifact_key(job_id, artifact));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &target).map_err(|e| {
            InsarError::Delivery(format!("copying {} to {}: {}", path.display(), target.display(), e))
        })?;
        log::info!("Stored {} at {}", artifact, target.display());
        Ok(target.display().to_string())
    }
}

/// PUTs artifacts to `{base_url}/results/{job_id}/{artifact}.tif`
pub struct HttpArtifactStore {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpArtifactStore {
    pub fn new(base_url: &str, timeout_secs: u64) -> InsarResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl ArtifactStore for HttpArtifactStore {
    fn upload(&self, job_id: &str, artifact: &str, path: &Path) -> InsarResult<String> {
        let url = format!("{}/{}", self.base_url, artifact_key(job_id, artifact));
        log::info!("Uploading {} to {}", artifact, url);
        let file = fs::File::open(path)?;
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/tiff")
            .body(file)
            .send()
            .map_err(|e| InsarError::Delivery(format!("upload of {} failed: {}", artifact, e)))?;
        if !response.status().is_success() {
            return Err(InsarError::Delivery(format!(
                "upload of {} returned HTTP {}",
                artifact,
                response.status().as_u16()
            )));
        }
        Ok(url)
    }
}

/// POSTs the job response as JSON
pub struct HttpWebhookNotifier {
    client: reqwest::blocking::Client,
}

impl HttpWebhookNotifier {
    pub fn new(timeout_secs: u64) -> InsarResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

impl Notifier for HttpWebhookNotifier {
    fn notify(&self, url: &str, output: &JobOutput) -> InsarResult<()> {
        let response = self
            .client
            .post(url)
            .json(output)
            .send()
            .map_err(|e| InsarError::Delivery(format!("webhook {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(InsarError::Delivery(format!(
                "webhook {} returned HTTP {}",
                url,
                response.status().as_u16()
            )));
        }
        log::info!("Webhook notified: {}", url);
        Ok(())
    }
}

/// Store implied by the delivery configuration; an HTTP endpoint wins over
/// a local directory
pub fn artifact_store_from_config(config: &DeliveryConfig) -> InsarResult<Option<Box<dyn ArtifactStore>>> {
    if let Some(base_url) = &config.artifact_base_url {
        return Ok(Some(Box::new(HttpArtifactStore::new(base_url, config.upload_timeout_secs)?)));
    }
    Ok(config
        .artifact_dir
        .as_ref()
        .map(|dir| Box::new(LocalArtifactStore::new(dir)) as Box<dyn ArtifactStore>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::JobOutput;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_key() {
        assert_eq!(artifact_key("job-7", "coherence"), "results/job-7/coherence.tif");
    }

    #[test]
    fn test_local_store_copies_under_key() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("displacement.tif");
        fs::write(&source, b"raster").unwrap();

        let store = LocalArtifactStore::new(dir.path().join("bucket"));
        let url = store.upload("j1", "displacement", &source).unwrap();
        let expected = dir.path().join("bucket/results/j1/displacement.tif");
        assert_eq!(url, expected.display().to_string());
        assert_eq!(fs::read(expected).unwrap(), b"raster");
    }

    #[test]
    fn test_local_store_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let err = store.upload("j1", "coherence", &dir.path().join("nope.tif")).unwrap_err();
        assert!(matches!(err, InsarError::Delivery(_)));
    }

    #[test]
    fn test_unreachable_webhook_is_delivery_error() {
        let notifier = HttpWebhookNotifier::new(2).unwrap();
        let output = JobOutput::failure("j", "e".into(), "t".into(), 0.0);
        let err = notifier.notify("http://127.0.0.1:9/hook", &output).unwrap_err();
        assert!(matches!(err, InsarError::Delivery(_)));
    }

    #[test]
    fn test_store_from_config() {
        assert!(artifact_store_from_config(&DeliveryConfig::default()).unwrap().is_none());
        let config = DeliveryConfig {
            artifact_dir: Some(PathBuf::from("/tmp/artifacts")),
            ..DeliveryConfig::default()
        };
        assert!(artifact_store_from_config(&config).unwrap().is_some());
    }
}
