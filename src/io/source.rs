//! Granule acquisition: download by URL or pass through local paths

use crate::types::{InsarError, InsarResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Makes a granule archive available on the local filesystem
pub trait GranuleSource: Send + Sync {
    /// Return a local path for `location`, named after `granule_name`
    fn fetch(&self, location: &str, granule_name: &str) -> InsarResult<PathBuf>;
}

/// True when `name` is a single path component that stays inside the
/// directory it is joined to
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !Path::new(name).is_absolute()
}

/// Archive file name for a granule; `.zip` is appended when missing
pub fn archive_name(granule_name: &str) -> InsarResult<String> {
    if !is_plain_name(granule_name) {
        return Err(InsarError::Staging(format!("Invalid granule name: {:?}", granule_name)));
    }
    if granule_name.ends_with(".zip") {
        Ok(granule_name.to_string())
    } else {
        Ok(format!("{}.zip", granule_name))
    }
}

/// Downloads granules over HTTP into a shared input directory
pub struct HttpGranuleSource {
    input_dir: PathBuf,
    timeout: Duration,
}

impl HttpGranuleSource {
    pub fn new<P: AsRef<Path>>(input_dir: P, timeout_secs: u64) -> Self {
        Self {
            input_dir: input_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl GranuleSource for HttpGranuleSource {
    fn fetch(&self, url: &str, granule_name: &str) -> InsarResult<PathBuf> {
        let output_path = self.input_dir.join(archive_name(granule_name)?);
        fs::create_dir_all(&self.input_dir)?;
        if output_path.exists() {
            log::info!("Granule already exists: {}", output_path.display());
            return Ok(output_path);
        }

        log::info!("Downloading {}", granule_name);
        log::debug!("  URL: {}", url);
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("insar-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut response = client.get(url).send()?;
        if !response.status().is_success() {
            return Err(InsarError::Staging(format!(
                "HTTP {} downloading {}",
                response.status().as_u16(),
                granule_name
            )));
        }

        // The temp file is removed on drop if anything below fails
        let mut temp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.input_dir)?;
        let bytes = std::io::copy(&mut response, &mut temp)
            .map_err(|e| InsarError::Staging(format!("download of {} interrupted: {}", granule_name, e)))?;
        temp.persist(&output_path).map_err(|e| InsarError::Io(e.error))?;

        log::info!(
            "Download complete: {} ({:.1} MB)",
            output_path.display(),
            bytes as f64 / 1e6
        );
        Ok(output_path)
    }
}

/// Uses granules already on disk
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGranuleSource;

impl GranuleSource for LocalGranuleSource {
    fn fetch(&self, path: &str, granule_name: &str) -> InsarResult<PathBuf> {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(InsarError::Staging(format!(
                "Granule {} not found at {}",
                granule_name,
                path.display()
            )));
        }
        Ok(path)
    }
}
