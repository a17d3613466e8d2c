use crate::io::annotation::AnnotationParser;
use crate::io::granule::GranuleName;
use crate::io::raster;
use crate::types::{Acquisition, InsarError, InsarResult, Polarization, SarImage, SensorFamily};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Sentinel-1 SLC reader over a staged `.SAFE` directory
pub struct SlcReader {
    product_dir: PathBuf,
}

/// Measurement raster and its annotation for one swath/polarization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementFiles {
    pub swath: String,
    pub measurement: PathBuf,
    pub annotation: PathBuf,
}

impl SlcReader {
    /// Create a new SLC reader for a staged product directory
    pub fn new<P: AsRef<Path>>(product_dir: P) -> InsarResult<Self> {
        let product_dir = product_dir.as_ref().to_path_buf();
        if !product_dir.is_dir() {
            return Err(InsarError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Product directory not found: {}", product_dir.display()),
            )));
        }
        Ok(Self { product_dir })
    }

    pub fn product_dir(&self) -> &Path {
        &self.product_dir
    }

    /// Files under `subdir` whose names match `pattern`, sorted
    fn list_matching(&self, subdir: &str, pattern: &Regex) -> InsarResult<Vec<PathBuf>> {
        let dir = self.product_dir.join(subdir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| pattern.is_match(n))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Find the measurement raster and annotation for a polarization.
    ///
    /// With no swath given the first swath in name order is used.
    pub fn find_measurement(
        &self,
        pol: Polarization,
        swath: Option<&str>,
    ) -> InsarResult<MeasurementFiles> {
        let pattern = Regex::new(&format!(
            r"(?i)^s1[abcd]-(?P<swath>[a-z]{{2}}\d?)-slc-{}-.*\.(?P<ext>tiff?|xml)$",
            pol.file_token()
        ))
        .map_err(|e| InsarError::Processing(format!("Invalid measurement pattern: {}", e)))?;

        let swath_of = |path: &Path| -> Option<String> {
            let name = path.file_name()?.to_str()?;
            Some(pattern.captures(name)?["swath"].to_uppercase())
        };
        let wanted = swath.map(str::to_uppercase);

        let measurement = self
            .list_matching("measurement", &pattern)?
            .into_iter()
            .find(|path| match (&wanted, swath_of(path.as_path())) {
                (Some(w), Some(s)) => *w == s,
                (None, Some(_)) => true,
                _ => false,
            })
            .ok_or_else(|| {
                InsarError::InvalidFormat(format!(
                    "No {} measurement{} found in {}",
                    pol,
                    wanted.as_ref().map(|w| format!(" for swath {}", w)).unwrap_or_default(),
                    self.product_dir.display()
                ))
            })?;
        let found_swath = swath_of(measurement.as_path()).unwrap_or_default();

        // Annotation shares the measurement file stem
        let same_stem = measurement
            .file_stem()
            .map(|stem| self.product_dir.join("annotation").join(stem).with_extension("xml"));
        let annotation = match same_stem {
            Some(path) if path.is_file() => path,
            _ => self
                .list_matching("annotation", &pattern)?
                .into_iter()
                .find(|path| swath_of(path.as_path()).as_deref() == Some(found_swath.as_str()))
                .ok_or_else(|| {
                    InsarError::InvalidFormat(format!(
                        "No annotation found for {} {} in {}",
                        found_swath,
                        pol,
                        self.product_dir.display()
                    ))
                })?,
        };

        Ok(MeasurementFiles {
            swath: found_swath,
            measurement,
            annotation,
        })
    }

    /// Parse the annotation and describe the acquisition
    pub fn read_acquisition(&self, pol: Polarization, swath: Option<&str>) -> InsarResult<Acquisition> {
        let files = self.find_measurement(pol, swath)?;
        log::debug!(
            "Using measurement {} with annotation {}",
            files.measurement.display(),
            files.annotation.display()
        );

        let xml_content = fs::read_to_string(&files.annotation)?;
        let annotation = AnnotationParser::parse_annotation(&xml_content)?;
        let geometry = AnnotationParser::extract_geometry(&annotation)?;
        let mission = annotation.ads_header.mission_id.clone();

        let dir_name = self
            .product_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let granule = GranuleName::parse(dir_name)
            .map(|g| g.name)
            .unwrap_or_else(|| dir_name.trim_end_matches(".SAFE").to_string());

        Ok(Acquisition {
            granule,
            product_dir: self.product_dir.clone(),
            measurement: files.measurement,
            sensor: SensorFamily::from_mission(&mission)?,
            mission,
            polarization: pol,
            start_time: AnnotationParser::parse_time(&annotation.ads_header.start_time)?,
            geometry,
        })
    }

    /// Read the complex samples of an acquisition
    pub fn read_slc(acquisition: &Acquisition) -> InsarResult<SarImage> {
        log::info!("Reading SLC data: {}", acquisition.measurement.display());
        let image = raster::read_complex(&acquisition.measurement)?;
        let expected = (acquisition.geometry.lines, acquisition.geometry.samples);
        if image.dim() != expected {
            return Err(InsarError::InvalidFormat(format!(
                "Measurement is {:?} but annotation reports {:?}",
                image.dim(),
                expected
            )));
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_product_dir() {
        assert!(SlcReader::new("/nonexistent/product.SAFE").is_err());
    }

    #[test]
    fn test_find_measurement_by_swath() {
        let dir = TempDir::new().unwrap();
        let safe = dir.path().join("P.SAFE");
        fs::create_dir_all(safe.join("measurement")).unwrap();
        fs::create_dir_all(safe.join("annotation")).unwrap();
        for swath in ["iw1", "iw2"] {
            let stem = format!("s1a-{}-slc-vv-20200103t170815-20200103t170842-030639-0382d5-004", swath);
            fs::write(safe.join("measurement").join(format!("{}.tiff", stem)), b"").unwrap();
            fs::write(safe.join("annotation").join(format!("{}.xml", stem)), b"").unwrap();
        }

        let reader = SlcReader::new(&safe).unwrap();
        let first = reader.find_measurement(Polarization::VV, None).unwrap();
        assert_eq!(first.swath, "IW1");

        let second = reader.find_measurement(Polarization::VV, Some("iw2")).unwrap();
        assert_eq!(second.swath, "IW2");
        assert!(second.annotation.to_string_lossy().contains("-iw2-"));

        assert!(reader.find_measurement(Polarization::VH, None).is_err());
    }
}
