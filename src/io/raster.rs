//! GeoTIFF read/write for single-band float products and complex SLC rasters

use crate::types::{
    is_valid, GeoTransform, InsarError, InsarResult, RasterProduct, SarComplex, SarImage, NODATA,
};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::Path;

const CREATION_OPTIONS: [RasterCreationOption<'static>; 2] = [
    RasterCreationOption { key: "COMPRESS", value: "LZW" },
    RasterCreationOption { key: "TILED", value: "YES" },
];

/// Read band 1 of a GeoTIFF as a float raster.
///
/// The file's own nodata value (if any) is normalized to the crate-wide sentinel.
pub fn read_raster<P: AsRef<Path>>(path: P) -> InsarResult<RasterProduct> {
    let path = path.as_ref();
    log::debug!("Reading raster: {}", path.display());

    let dataset = Dataset::open(path)?;
    let (width, height) = dataset.raster_size();
    let rasterband = dataset.rasterband(1)?;
    let file_nodata = rasterband.no_data_value().map(|v| v as f32);
    let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

    let mut data = Array2::from_shape_vec((height, width), band_data.data)
        .map_err(|e| InsarError::Processing(format!("Failed to reshape raster data: {}", e)))?;

    if let Some(nd) = file_nodata {
        if nd != NODATA {
            data.mapv_inplace(|v| if v == nd { NODATA } else { v });
        }
    }

    let geo_transform = dataset.geo_transform().ok().map(GeoTransform::from_gdal);
    let epsg = dataset
        .spatial_ref()
        .ok()
        .and_then(|srs| srs.auth_code().ok())
        .map(|code| code as u32);

    Ok(RasterProduct {
        data,
        nodata: NODATA,
        geo_transform,
        epsg,
    })
}

/// Write a float raster as a single-band LZW-compressed GeoTIFF
pub fn write_raster<P: AsRef<Path>>(path: P, product: &RasterProduct) -> InsarResult<()> {
    write_raster_with_metadata(path, product, &[])
}

/// Write a float raster and attach dataset-level metadata items
pub fn write_raster_with_metadata<P: AsRef<Path>>(
    path: P,
    product: &RasterProduct,
    metadata: &[(&str, &str)],
) -> InsarResult<()> {
    let path = path.as_ref();
    log::debug!("Writing raster: {}", path.display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = product.dim();

    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path,
        width as isize,
        height as isize,
        1,
        &CREATION_OPTIONS,
    )?;

    if let Some(gt) = &product.geo_transform {
        dataset.set_geo_transform(&gt.to_gdal())?;
    }
    if let Some(epsg) = product.epsg {
        dataset.set_spatial_ref(&SpatialRef::from_epsg(epsg)?)?;
    }
    for (key, value) in metadata {
        dataset.set_metadata_item(key, value, "")?;
    }

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<f32> = product.data.iter().cloned().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;
    rasterband.set_no_data_value(Some(product.nodata as f64))?;

    Ok(())
}

/// Read one dataset-level metadata item
pub fn read_metadata_item<P: AsRef<Path>>(path: P, key: &str) -> InsarResult<Option<String>> {
    let dataset = Dataset::open(path.as_ref())?;
    Ok(dataset.metadata_item(key, ""))
}

/// Sample `data` at a fractional (row, col) position in pixel-centre
/// coordinates.
///
/// Bilinear when all four neighbours are valid, nearest neighbour otherwise;
/// nodata never leaks into an interpolated value. `None` outside the grid or
/// when the nearest sample is itself invalid.
pub fn interpolate(data: &Array2<f32>, row: f64, col: f64) -> Option<f32> {
    let (height, width) = data.dim();
    if height == 0 || width == 0 || !row.is_finite() || !col.is_finite() {
        return None;
    }
    if row < -0.5 || col < -0.5 || row > height as f64 - 0.5 || col > width as f64 - 0.5 {
        return None;
    }

    let r = row.clamp(0.0, (height - 1) as f64);
    let c = col.clamp(0.0, (width - 1) as f64);
    let r0 = r.floor() as usize;
    let c0 = c.floor() as usize;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let dr = r - r0 as f64;
    let dc = c - c0 as f64;

    let v00 = data[[r0, c0]];
    let v01 = data[[r0, c1]];
    let v10 = data[[r1, c0]];
    let v11 = data[[r1, c1]];

    if is_valid(v00) && is_valid(v01) && is_valid(v10) && is_valid(v11) {
        let top = v00 as f64 * (1.0 - dc) + v01 as f64 * dc;
        let bottom = v10 as f64 * (1.0 - dc) + v11 as f64 * dc;
        return Some((top * (1.0 - dr) + bottom * dr) as f32);
    }

    let nearest = data[[r.round() as usize, c.round() as usize]];
    if is_valid(nearest) {
        Some(nearest)
    } else {
        None
    }
}

/// Sample a georeferenced raster at a geographic coordinate
pub fn sample_geographic(product: &RasterProduct, lon: f64, lat: f64) -> Option<f32> {
    let gt = product.geo_transform.as_ref()?;
    let (col, row) = gt.geo_to_pixel(lon, lat);
    interpolate(&product.data, row - 0.5, col - 0.5)
}

/// Write a complex image as a two-band (I, Q) Float32 GeoTIFF
pub fn write_complex<P: AsRef<Path>>(path: P, image: &SarImage) -> InsarResult<()> {
    let path = path.as_ref();
    log::debug!("Writing complex raster: {}", path.display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = image.dim();
    let dataset = driver.create_with_band_type_with_options::<f32, _>(
        path,
        width as isize,
        height as isize,
        2,
        &CREATION_OPTIONS,
    )?;

    let i_data: Vec<f32> = image.iter().map(|c| c.re).collect();
    let q_data: Vec<f32> = image.iter().map(|c| c.im).collect();
    for (band_index, data) in [(1, i_data), (2, q_data)] {
        let mut band = dataset.rasterband(band_index)?;
        band.write((0, 0), (width, height), &Buffer::new((width, height), data))?;
    }

    Ok(())
}

/// Read complex samples from a GeoTIFF.
///
/// Two or more bands are taken as separate I and Q bands. A single band is
/// read through GDAL as CFloat32, which covers the CInt16 layout of Sentinel-1
/// measurement files.
pub fn read_complex<P: AsRef<Path>>(path: P) -> InsarResult<SarImage> {
    let path = path.as_ref();
    let start_time = std::time::Instant::now();

    let dataset = Dataset::open(path)?;
    let (width, height) = dataset.raster_size();
    let band_count = dataset.raster_count();
    log::debug!("SLC raster {}: {} x {}, bands: {}", path.display(), width, height, band_count);

    let samples: Vec<SarComplex> = if band_count >= 2 {
        let window = (0, 0);
        let size = (width, height);
        let i_data = dataset.rasterband(1)?.read_as::<f32>(window, size, size, None)?;
        let q_data = dataset.rasterband(2)?.read_as::<f32>(window, size, size, None)?;
        i_data
            .data
            .iter()
            .zip(q_data.data.iter())
            .map(|(&i, &q)| SarComplex::new(i, q))
            .collect()
    } else if band_count == 1 {
        let band = dataset.rasterband(1)?;
        let mut buffer = vec![SarComplex::new(0.0, 0.0); width * height];
        // SAFETY: buffer holds width*height CFloat32 values, matching the requested
        // window and buffer type; Complex<f32> is repr(C) with (re, im) layout.
        let status = unsafe {
            gdal_sys::GDALRasterIO(
                band.c_rasterband(),
                gdal_sys::GDALRWFlag::GF_Read,
                0,
                0,
                width as i32,
                height as i32,
                buffer.as_mut_ptr() as *mut std::ffi::c_void,
                width as i32,
                height as i32,
                gdal_sys::GDALDataType::GDT_CFloat32,
                0,
                0,
            )
        };
        if status != gdal_sys::CPLErr::CE_None {
            return Err(InsarError::InvalidFormat(format!(
                "Failed to read complex samples from {}",
                path.display()
            )));
        }
        buffer
    } else {
        return Err(InsarError::InvalidFormat(format!(
            "Unexpected number of bands in {}: {}",
            path.display(),
            band_count
        )));
    };

    let image = Array2::from_shape_vec((height, width), samples)
        .map_err(|e| InsarError::Processing(format!("Failed to reshape SLC data: {}", e)))?;

    log::debug!("SLC read took {:?}", start_time.elapsed());
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use tempfile::TempDir;

    #[test]
    fn test_raster_roundtrip_keeps_nodata_and_georeference() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coherence.tif");

        let mut data = Array2::from_elem((4, 5), 0.5f32);
        data[[1, 2]] = NODATA;
        let gt = GeoTransform::north_up(&BoundingBox::new(45.0, 44.0, 5.0, 4.0), 0.2, 0.25);
        write_raster(&path, &RasterProduct::geographic(data, gt)).unwrap();

        let read = read_raster(&path).unwrap();
        assert_eq!(read.dim(), (4, 5));
        assert_eq!(read.data[[1, 2]], NODATA);
        assert_eq!(read.data[[0, 0]], 0.5);
        assert_eq!(read.geo_transform, Some(gt));
        assert_eq!(read.epsg, Some(4326));
    }

    #[test]
    fn test_interpolation_never_blends_nodata() {
        let mut data = Array2::from_shape_fn((3, 3), |(r, c)| (r * 3 + c) as f32);
        assert_eq!(interpolate(&data, 0.5, 0.5), Some(2.0));

        data[[1, 1]] = NODATA;
        // Falls back to the nearest sample, which is valid here
        assert_eq!(interpolate(&data, 0.4, 0.4), Some(0.0));
        // Nearest sample is nodata
        assert_eq!(interpolate(&data, 0.9, 0.9), None);
        assert_eq!(interpolate(&data, -1.0, 0.0), None);
    }

    #[test]
    fn test_metadata_item_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dem.tif");
        let product = RasterProduct::radar(Array2::from_elem((2, 2), 100.0f32));
        write_raster_with_metadata(&path, &product, &[("DEM_SOURCE", "synthetic")]).unwrap();
        assert_eq!(
            read_metadata_item(&path, "DEM_SOURCE").unwrap().as_deref(),
            Some("synthetic")
        );
    }

    #[test]
    fn test_complex_roundtrip_two_band() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slc.tif");
        let image = Array2::from_shape_fn((3, 4), |(r, c)| SarComplex::new(r as f32, -(c as f32)));

        write_complex(&path, &image).unwrap();
        let read = read_complex(&path).unwrap();
        assert_eq!(read, image);
    }
}
