use crate::io::raster;
use crate::types::{BoundingBox, GeoTransform, InsarError, InsarResult, RasterProduct, NODATA};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata item recording where a cached DEM came from
pub const DEM_SOURCE_KEY: &str = "DEM_SOURCE";
const SYNTHETIC_TAG: &str = "synthetic";

/// Copernicus GLO-30 Cloud Optimized GeoTIFF on AWS open data
pub const COPERNICUS_GLO30_TEMPLATE: &str = "https://copernicus-dem-30m.s3.amazonaws.com/Copernicus_DSM_COG_10_{cop_lat}_{cop_lon}_DEM/Copernicus_DSM_COG_10_{cop_lat}_{cop_lon}_DEM.tif";
/// AWS Terrain Tiles, SRTM 1 arc-second skadi layout
pub const SRTM_SKADI_TEMPLATE: &str =
    "https://s3.amazonaws.com/elevation-tiles-prod/skadi/{lat_dir}/{tile}.hgt.gz";

/// DEM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemConfig {
    /// Shared cache directory; tiles are keyed by rounded extent
    pub cache_dir: PathBuf,
    /// Margin added around the requested bbox (degrees)
    pub margin_deg: f64,
    /// Output posting (degrees); ~30 m at 0.0003
    pub pixel_size_deg: f64,
    /// Largest grid dimension per axis; the posting is coarsened to fit
    pub max_dimension: usize,
    /// More 1x1 degree tiles than this goes straight to the synthetic DEM
    pub max_tiles: usize,
    /// URL templates tried in order for every tile.
    /// Placeholders: `{tile}` (N44E004), `{lat_dir}` (N44),
    /// `{cop_lat}` (N44_00), `{cop_lon}` (E004_00)
    pub sources: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: usize,
    /// Elevation of the flat fallback DEM (m)
    pub fallback_elevation_m: f32,
}

impl Default for DemConfig {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("insar-pipeline")
                .join("dem"),
            margin_deg: 0.1,
            pixel_size_deg: 0.0003,
            max_dimension: 4096,
            max_tiles: 16,
            sources: vec![
                COPERNICUS_GLO30_TEMPLATE.to_string(),
                SRTM_SKADI_TEMPLATE.to_string(),
            ],
            timeout_secs: 120,
            max_retries: 2,
            fallback_elevation_m: 100.0,
        }
    }
}

/// Where a DEM's elevations came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemSource {
    /// Mosaicked from downloaded tiles
    Remote { urls: Vec<String> },
    /// Flat fallback raster
    Synthetic,
    /// Cached raster without a provenance tag
    Unknown,
}

impl DemSource {
    fn to_metadata(&self) -> String {
        match self {
            DemSource::Remote { urls } => urls.join(" "),
            DemSource::Synthetic => SYNTHETIC_TAG.to_string(),
            DemSource::Unknown => String::new(),
        }
    }

    fn from_metadata(value: Option<&str>) -> Self {
        match value {
            Some(SYNTHETIC_TAG) => DemSource::Synthetic,
            Some(urls) if !urls.trim().is_empty() => DemSource::Remote {
                urls: urls.split_whitespace().map(str::to_string).collect(),
            },
            _ => DemSource::Unknown,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, DemSource::Synthetic)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DemSource::Remote { .. } => "remote",
            DemSource::Synthetic => SYNTHETIC_TAG,
            DemSource::Unknown => "unknown",
        }
    }
}

/// A cached elevation raster; never modified once published
#[derive(Debug, Clone)]
pub struct DemTile {
    pub path: PathBuf,
    pub extent: BoundingBox,
    pub source: DemSource,
    pub cache_hit: bool,
}

impl DemTile {
    /// Load the elevation raster
    pub fn load(&self) -> InsarResult<RasterProduct> {
        raster::read_raster(&self.path)
    }
}

/// One 1x1 degree source tile, named by its south-west corner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileId {
    lat: i32,
    lon: i32,
}

impl TileId {
    /// SRTM naming, e.g. N44E004
    fn name(&self) -> String {
        format!("{}{}", self.lat_dir(), self.lon_part(3))
    }

    fn lat_dir(&self) -> String {
        let prefix = if self.lat >= 0 { "N" } else { "S" };
        format!("{}{:02}", prefix, self.lat.abs())
    }

    fn lon_part(&self, width: usize) -> String {
        let prefix = if self.lon >= 0 { "E" } else { "W" };
        format!("{}{:0width$}", prefix, self.lon.abs(), width = width)
    }

    fn url(&self, template: &str) -> String {
        template
            .replace("{tile}", &self.name())
            .replace("{lat_dir}", &self.lat_dir())
            .replace("{cop_lat}", &format!("{}_00", self.lat_dir()))
            .replace("{cop_lon}", &format!("{}_00", self.lon_part(3)))
    }
}

/// Tiles covering a box
fn tiles_for(bbox: &BoundingBox) -> Vec<TileId> {
    let min_lat = bbox.south.floor() as i32;
    let max_lat = (bbox.north.ceil() as i32).max(min_lat + 1);
    let min_lon = bbox.west.floor() as i32;
    let max_lon = (bbox.east.ceil() as i32).max(min_lon + 1);

    let mut tiles = Vec::new();
    for lat in min_lat..max_lat {
        for lon in min_lon..max_lon {
            tiles.push(TileId { lat, lon });
        }
    }
    tiles
}

/// Output grid for an extent: posting coarsened so neither axis exceeds `max_dimension`
pub(crate) fn grid_for(
    extent: &BoundingBox,
    pixel_size_deg: f64,
    max_dimension: usize,
) -> (GeoTransform, (usize, usize)) {
    let max_dimension = max_dimension.max(1) as f64;
    let pixel_size = pixel_size_deg
        .max(extent.width() / max_dimension)
        .max(extent.height() / max_dimension);
    let cols = ((extent.width() / pixel_size).round() as usize).max(1);
    let rows = ((extent.height() / pixel_size).round() as usize).max(1);
    (GeoTransform::north_up(extent, pixel_size, pixel_size), (rows, cols))
}

/// Supplies elevation rasters for bounding boxes, caching them by rounded extent
pub struct DemProvider {
    config: DemConfig,
}

impl DemProvider {
    pub fn new(config: DemConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DemConfig {
        &self.config
    }

    /// Cache path for a bbox
    pub fn cache_path(&self, bbox: &BoundingBox) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.tif", bbox.dem_cache_key(self.config.margin_deg)))
    }

    /// Get a DEM covering `bbox`.
    ///
    /// Boxes sharing a cache key share one file. On a miss the tiles are
    /// downloaded and mosaicked; when that is impossible a flat synthetic DEM
    /// is cached in its place.
    pub fn get_dem(&self, bbox: &BoundingBox) -> InsarResult<DemTile> {
        bbox.validate()?;
        let path = self.cache_path(bbox);

        if path.is_file() {
            log::info!("DEM cache hit: {}", path.display());
            return self.open_cached(path, bbox);
        }

        log::info!("DEM cache miss, preparing {}", path.display());
        fs::create_dir_all(&self.config.cache_dir)?;

        let extent = bbox.expanded(self.config.margin_deg).rounded();
        let (product, source) = match self.build_remote(&extent) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("DEM download failed ({}), using synthetic DEM", e);
                (self.build_synthetic(&extent), DemSource::Synthetic)
            }
        };

        if !self.publish(&path, &product, &source)? {
            // Another job published this key first
            return self.open_cached(path, bbox);
        }

        Ok(DemTile {
            path,
            extent,
            source,
            cache_hit: false,
        })
    }

    fn open_cached(&self, path: PathBuf, bbox: &BoundingBox) -> InsarResult<DemTile> {
        let product = raster::read_raster(&path)?;
        let extent = product
            .geo_transform
            .map(|gt| gt.extent(product.dim()))
            .unwrap_or_else(|| bbox.expanded(self.config.margin_deg).rounded());
        if !extent.contains(bbox) {
            log::warn!(
                "Cached DEM {} does not fully cover requested bbox {:?}",
                path.display(),
                bbox
            );
        }
        let source = DemSource::from_metadata(
            raster::read_metadata_item(&path, DEM_SOURCE_KEY)?.as_deref(),
        );
        Ok(DemTile {
            path,
            extent,
            source,
            cache_hit: true,
        })
    }

    /// Write to a temp file in the cache dir and link it into place; a
    /// partially written DEM is never visible under the cache key.
    /// Returns false when another writer got there first.
    fn publish(&self, path: &Path, product: &RasterProduct, source: &DemSource) -> InsarResult<bool> {
        let temp_path = tempfile::Builder::new()
            .prefix(".dem-")
            .suffix(".tif")
            .tempfile_in(&self.config.cache_dir)?
            .into_temp_path();

        let source_tag = source.to_metadata();
        raster::write_raster_with_metadata(&temp_path, product, &[(DEM_SOURCE_KEY, &source_tag)])?;

        match temp_path.persist_noclobber(path) {
            Ok(()) => {
                log::info!("Cached DEM at {}", path.display());
                Ok(true)
            }
            Err(_) if path.is_file() => {
                log::info!("DEM {} published concurrently, discarding ours", path.display());
                Ok(false)
            }
            Err(e) => Err(InsarError::Io(e.error)),
        }
    }

    /// Flat raster at the fallback elevation over the rounded extent
    fn build_synthetic(&self, extent: &BoundingBox) -> RasterProduct {
        let (gt, shape) = grid_for(extent, self.config.pixel_size_deg, self.config.max_dimension);
        log::warn!(
            "Creating synthetic DEM: {}x{} at {} m",
            shape.1,
            shape.0,
            self.config.fallback_elevation_m
        );
        RasterProduct::geographic(Array2::from_elem(shape, self.config.fallback_elevation_m), gt)
    }

    /// Download every covering tile, then mosaic onto the output grid
    fn build_remote(&self, extent: &BoundingBox) -> InsarResult<(RasterProduct, DemSource)> {
        if self.config.sources.is_empty() {
            return Err(InsarError::Network("no DEM sources configured".to_string()));
        }
        let tiles = tiles_for(extent);
        if tiles.len() > self.config.max_tiles {
            return Err(InsarError::Processing(format!(
                "{} DEM tiles required, limit is {}",
                tiles.len(),
                self.config.max_tiles
            )));
        }
        log::debug!("Required DEM tiles: {:?}", tiles.iter().map(TileId::name).collect::<Vec<_>>());

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .user_agent(concat!("insar-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let tile_dir = self.config.cache_dir.join("tiles");
        fs::create_dir_all(&tile_dir)?;

        let mut rasters = Vec::with_capacity(tiles.len());
        let mut urls = Vec::with_capacity(tiles.len());
        for tile in &tiles {
            let (tile_path, url) = self.fetch_tile(&client, tile, &tile_dir)?;
            rasters.push(raster::read_raster(&tile_path)?);
            urls.push(url);
        }

        let (gt, shape) = grid_for(extent, self.config.pixel_size_deg, self.config.max_dimension);
        let mosaic = Self::mosaic(&rasters, &gt, shape);
        Ok((RasterProduct::geographic(mosaic, gt), DemSource::Remote { urls }))
    }

    /// Fetch one tile from the first source that serves it
    fn fetch_tile(
        &self,
        client: &reqwest::blocking::Client,
        tile: &TileId,
        tile_dir: &Path,
    ) -> InsarResult<(PathBuf, String)> {
        let mut last_error = None;
        for template in &self.config.sources {
            let url = tile.url(template);
            let extension = if url.ends_with(".hgt.gz") || url.ends_with(".hgt") { "hgt" } else { "tif" };
            // SRTM HGT files must keep their tile name for GDAL to georeference them
            let tile_path = tile_dir.join(format!("{}.{}", tile.name(), extension));
            if tile_path.is_file() {
                log::debug!("DEM tile {} already cached", tile_path.display());
                return Ok((tile_path, url));
            }

            match self.download_with_retries(client, &url, &tile_path) {
                Ok(()) => {
                    log::info!("Downloaded DEM tile {} from {}", tile.name(), url);
                    return Ok((tile_path, url));
                }
                Err(e) => {
                    log::warn!("DEM source failed for {}: {}", tile.name(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            InsarError::Network(format!("no source served DEM tile {}", tile.name()))
        }))
    }

    fn download_with_retries(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
        output_path: &Path,
    ) -> InsarResult<()> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match Self::download_once(client, url, output_path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("Download attempt {} of {} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(Duration::from_secs(attempt as u64));
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| InsarError::Network("download failed".to_string())))
    }

    fn download_once(client: &reqwest::blocking::Client, url: &str, output_path: &Path) -> InsarResult<()> {
        let response = client.get(url).send()?;
        if !response.status().is_success() {
            return Err(InsarError::Network(format!("HTTP {} for {}", response.status().as_u16(), url)));
        }
        let content = response.bytes()?;

        // Small bodies are error pages, not elevation data
        if content.len() < 1024 {
            return Err(InsarError::Network(format!(
                "Downloaded file too small ({} bytes), likely an error page",
                content.len()
            )));
        }

        let payload = if is_gzip_content(&content) {
            let mut decoder = flate2::read::GzDecoder::new(&content[..]);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            decompressed
        } else {
            content.to_vec()
        };

        let parent = output_path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut temp, &payload)?;
        temp.persist(output_path).map_err(|e| InsarError::Io(e.error))?;
        Ok(())
    }

    /// Bilinear mosaic of source tiles onto the output grid.
    /// Pixels no tile covers, or whose samples are nodata, stay nodata.
    fn mosaic(rasters: &[RasterProduct], gt: &GeoTransform, shape: (usize, usize)) -> Array2<f32> {
        let mut output = Array2::from_elem(shape, NODATA);
        for ((row, col), value) in output.indexed_iter_mut() {
            let (lon, lat) = gt.pixel_center(col, row);
            if let Some(h) = rasters
                .iter()
                .find_map(|tile| raster::sample_geographic(tile, lon, lat))
            {
                *value = h;
            }
        }
        output
    }
}

fn is_gzip_content(content: &[u8]) -> bool {
    content.len() >= 2 && content[0] == 0x1F && content[1] == 0x8B
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tile_names_and_urls() {
        let tiles = tiles_for(&BoundingBox::new(45.1, 43.9, 5.1, 3.9));
        assert_eq!(tiles.len(), 9);
        assert_eq!(tiles[0].name(), "N43E003");

        let west = TileId { lat: -3, lon: -72 };
        assert_eq!(west.name(), "S03W072");
        assert_eq!(
            west.url(SRTM_SKADI_TEMPLATE),
            "https://s3.amazonaws.com/elevation-tiles-prod/skadi/S03/S03W072.hgt.gz"
        );
        assert!(west.url(COPERNICUS_GLO30_TEMPLATE).contains("Copernicus_DSM_COG_10_S03_00_W072_00_DEM"));
    }

    #[test]
    fn test_grid_is_capped() {
        let (gt, shape) = grid_for(&BoundingBox::default(), 0.0003, 1000);
        assert_eq!(shape, (500, 1000));
        assert!((gt.pixel_width - 0.36).abs() < 1e-12);
    }

    #[test]
    fn test_synthetic_dem_without_sources() {
        let dir = TempDir::new().unwrap();
        let provider = DemProvider::new(DemConfig {
            cache_dir: dir.path().to_path_buf(),
            sources: vec![],
            pixel_size_deg: 0.01,
            ..DemConfig::default()
        });

        let tile = provider.get_dem(&BoundingBox::new(45.0, 44.0, 5.0, 4.0)).unwrap();
        assert!(tile.source.is_synthetic());
        assert!(!tile.cache_hit);
        assert!(tile.path.ends_with("dem_43.90_3.90_45.10_5.10.tif"));

        let product = tile.load().unwrap();
        assert_eq!(product.dim(), (120, 120));
        assert!(product.data.iter().all(|&h| h == 100.0));
        assert_eq!(product.epsg, Some(4326));
    }

    #[test]
    fn test_untagged_cached_dem_is_not_synthetic() {
        let dir = TempDir::new().unwrap();
        let provider = DemProvider::new(DemConfig {
            cache_dir: dir.path().to_path_buf(),
            sources: vec![],
            pixel_size_deg: 0.01,
            ..DemConfig::default()
        });
        let bbox = BoundingBox::new(45.0, 44.0, 5.0, 4.0);
        let extent = bbox.expanded(0.1).rounded();
        let (gt, shape) = grid_for(&extent, 0.01, 4096);
        raster::write_raster(
            provider.cache_path(&bbox),
            &RasterProduct::geographic(Array2::from_elem(shape, 250.0), gt),
        )
        .unwrap();

        let tile = provider.get_dem(&bbox).unwrap();
        assert!(tile.cache_hit);
        assert_eq!(tile.source, DemSource::Unknown);
        assert!(tile.load().unwrap().data.iter().all(|&h| h == 250.0));
    }

    #[test]
    fn test_dem_source_metadata() {
        assert_eq!(DemSource::from_metadata(Some("synthetic")), DemSource::Synthetic);
        let remote = DemSource::Remote { urls: vec!["a".into(), "b".into()] };
        assert_eq!(DemSource::from_metadata(Some(&remote.to_metadata())), remote);

        // A missing or blank tag says nothing about where the heights came from
        assert_eq!(DemSource::from_metadata(None), DemSource::Unknown);
        assert_eq!(DemSource::from_metadata(Some("  ")), DemSource::Unknown);
        assert!(!DemSource::Unknown.is_synthetic());
        assert_eq!(DemSource::Unknown.label(), "unknown");
    }
}
