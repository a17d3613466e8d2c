//! Granule staging: normalize a downloaded SAR product (zip archive or
//! directory) into a canonical `.SAFE` product directory.

use crate::types::{InsarError, InsarResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use zip::ZipArchive;

const MANIFEST: &str = "manifest.safe";

/// Outcome of staging one product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedProduct {
    /// Canonical product directory (the `.SAFE` root)
    pub product_dir: PathBuf,
    /// False when an earlier extraction was reused
    pub extracted: bool,
}

/// Extracts product archives into a per-product staging directory
pub struct GranuleStager {
    staging_dir: PathBuf,
}

impl GranuleStager {
    pub fn new<P: AsRef<Path>>(staging_dir: P) -> Self {
        Self {
            staging_dir: staging_dir.as_ref().to_path_buf(),
        }
    }

    /// Stage a product and return its canonical directory
    pub fn stage<P: AsRef<Path>>(&self, product_path: P) -> InsarResult<PathBuf> {
        Ok(self.stage_product(product_path)?.product_dir)
    }

    /// Stage a product, reporting whether extraction actually ran.
    ///
    /// Archives are extracted into `{staging_dir}/{archive stem}`; an existing
    /// directory of that name is reused as is.
    pub fn stage_product<P: AsRef<Path>>(&self, product_path: P) -> InsarResult<StagedProduct> {
        let product_path = product_path.as_ref();

        if product_path.is_dir() {
            log::info!("Using product directory: {}", product_path.display());
            return Ok(StagedProduct {
                product_dir: Self::find_product_dir(product_path)?,
                extracted: false,
            });
        }

        if !product_path.is_file() {
            return Err(InsarError::Staging(format!(
                "Product not found: {}",
                product_path.display()
            )));
        }

        let is_zip = product_path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if !is_zip {
            return Err(InsarError::Staging(format!(
                "Unsupported product format (expected .zip archive or directory): {}",
                product_path.display()
            )));
        }

        let stem = product_path
            .file_stem()
            .ok_or_else(|| InsarError::Staging(format!("Archive has no name: {}", product_path.display())))?;
        let extract_dir = self.staging_dir.join(stem);

        let extracted = if extract_dir.exists() {
            log::info!("Product already extracted, skipping: {}", extract_dir.display());
            false
        } else {
            log::info!("Extracting: {}", product_path.display());
            self.extract_archive(product_path, &extract_dir)?;
            true
        };

        Ok(StagedProduct {
            product_dir: Self::find_product_dir(&extract_dir)?,
            extracted,
        })
    }

    /// Extract into a temp directory then rename, so a half-written
    /// extraction is never mistaken for a finished one.
    fn extract_archive(&self, archive_path: &Path, target: &Path) -> InsarResult<()> {
        fs::create_dir_all(&self.staging_dir)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.staging_dir)?;

        let file = File::open(archive_path)?;
        let mut archive = ZipArchive::new(file)?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let relative = match entry.enclosed_name() {
                Some(name) => name.to_path_buf(),
                None => {
                    log::warn!("Skipping unsafe archive entry: {}", entry.name());
                    continue;
                }
            };
            let out_path = temp_dir.path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            io::copy(&mut entry, &mut out_file)?;
        }

        match fs::rename(temp_dir.path(), target) {
            Ok(()) => Ok(()),
            // Another worker finished the same extraction first
            Err(_) if target.exists() => {
                log::info!("Concurrent extraction detected, reusing {}", target.display());
                Ok(())
            }
            Err(e) => Err(InsarError::Staging(format!(
                "Failed to publish extraction to {}: {}",
                target.display(),
                e
            ))),
        }
    }

    /// Locate the `.SAFE` root inside (or at) `dir`
    fn find_product_dir(dir: &Path) -> InsarResult<PathBuf> {
        if dir.join(MANIFEST).is_file() {
            return Ok(dir.to_path_buf());
        }

        let mut candidates: Vec<PathBuf> = fs::read_dir(dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("safe"))
                    .unwrap_or(false)
                    || path.join(MANIFEST).is_file()
            })
            .collect();
        candidates.sort();

        candidates.into_iter().next().ok_or_else(|| {
            InsarError::Staging(format!(
                "No .SAFE product directory found in {}",
                dir.display()
            ))
        })
    }
}

/// Fields encoded in a Sentinel-1 granule name,
/// e.g. `S1A_IW_SLC__1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE`
#[derive(Debug, Clone, PartialEq)]
pub struct GranuleName {
    pub name: String,
    pub mission: String,
    pub mode: String,
    pub product_type: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
}

fn granule_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<mission>S1[ABCD])_(?P<mode>[A-Z0-9]{2})_(?P<ptype>[A-Z]{3})_{1,2}\w{4}_(?P<start>\d{8}T\d{6})_(?P<stop>\d{8}T\d{6})",
        )
        .ok()
    })
    .as_ref()
}

impl GranuleName {
    /// Parse a granule name; archive suffixes (`.zip`, `.SAFE`) are tolerated
    pub fn parse(name: &str) -> Option<Self> {
        let caps = granule_regex()?.captures(name)?;
        let parse_time = |s: &str| {
            NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
                .ok()
                .map(|t| t.and_utc())
        };
        let base = name
            .trim_end_matches(".zip")
            .trim_end_matches(".SAFE")
            .to_string();
        Some(Self {
            name: base,
            mission: caps["mission"].to_string(),
            mode: caps["mode"].to_string(),
            product_type: caps["ptype"].to_string(),
            start_time: parse_time(&caps["start"])?,
            stop_time: parse_time(&caps["stop"])?,
        })
    }
}

/// Result of checking a SAFE package without extracting it
#[derive(Debug, Clone)]
pub struct SafeValidation {
    pub valid: bool,
    pub granule: Option<GranuleName>,
    pub error: Option<String>,
}

/// Check that a SAFE package (zip or directory) carries a manifest
pub fn validate_safe_package<P: AsRef<Path>>(path: P) -> SafeValidation {
    let path = path.as_ref();
    let granule = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(GranuleName::parse);

    let manifest_check: Result<(), String> = if path.is_dir() {
        GranuleStager::find_product_dir(path)
            .map(|_| ())
            .map_err(|_| "No manifest.safe found in directory".to_string())
    } else {
        match File::open(path).map_err(|e| e.to_string()).and_then(|f| {
            ZipArchive::new(f).map_err(|_| "Invalid zip file".to_string())
        }) {
            Ok(archive) => {
                if archive.file_names().any(|n| n.ends_with(MANIFEST)) {
                    Ok(())
                } else {
                    Err("No manifest.safe found in zip".to_string())
                }
            }
            Err(e) => Err(e),
        }
    };

    match manifest_check {
        Ok(()) => SafeValidation { valid: true, granule, error: None },
        Err(error) => SafeValidation { valid: false, granule, error: Some(error) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_granule_name_parsing() {
        let g = GranuleName::parse(
            "S1A_IW_SLC__1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE.zip",
        )
        .unwrap();
        assert_eq!(g.mission, "S1A");
        assert_eq!(g.mode, "IW");
        assert_eq!(g.product_type, "SLC");
        assert_eq!(g.start_time.to_rfc3339(), "2020-01-03T17:08:15+00:00");
        assert_eq!(g.name, "S1A_IW_SLC__1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE");

        assert!(GranuleName::parse("not-a-granule").is_none());
    }

    #[test]
    fn test_stage_archive_without_safe_dir_fails() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        write_zip(&archive, &[("readme.txt", "nothing here")]);

        let stager = GranuleStager::new(dir.path().join("slc"));
        let err = stager.stage(&archive).unwrap_err();
        assert!(matches!(err, InsarError::Staging(_)));
    }

    #[test]
    fn test_validate_safe_package() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.zip");
        write_zip(&good, &[("P.SAFE/manifest.safe", "<xfdu/>")]);
        assert!(validate_safe_package(&good).valid);

        let bad = dir.path().join("bad.zip");
        write_zip(&bad, &[("P.SAFE/other.xml", "<x/>")]);
        let result = validate_safe_package(&bad);
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("No manifest.safe found in zip"));
    }
}
