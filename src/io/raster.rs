//! GeoTIFF (and any GDAL-readable raster) loading and writing

use crate::types::{BoundingBox, Crs, GeoTransform, Pixel, Raster, VerdeError, VerdeResult};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options applied when persisting a raster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOptions {
    /// GeoTIFF COMPRESS creation option (e.g. "LZW", "DEFLATE"); `None` writes uncompressed
    pub compression: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: Some("LZW".to_string()),
        }
    }
}

/// Read band 1 of a raster as `f32`
pub fn read_raster<P: AsRef<Path>>(path: P) -> VerdeResult<Raster<f32>> {
    read_raster_band(path, 1)
}

/// Read a single (1-based) band of a raster as `f32`.
///
/// The dataset is opened and closed inside this call; nothing holds the
/// file handle once it returns.
pub fn read_raster_band<P: AsRef<Path>>(path: P, band: usize) -> VerdeResult<Raster<f32>> {
    read_band_as::<f32, _>(path, band)
}

/// Size, georeferencing and band count of an opened dataset
struct RasterHeader {
    width: usize,
    height: usize,
    band_count: isize,
    geo_transform: GeoTransform,
    crs: Crs,
}

fn open_dataset(path: &Path) -> VerdeResult<Dataset> {
    if !path.exists() {
        return Err(VerdeError::read(path, "file does not exist"));
    }
    Dataset::open(path).map_err(|e| VerdeError::read(path, e.to_string()))
}

/// Rejects rasters with no bands, zero size, no usable geotransform or no CRS
fn read_header(dataset: &Dataset, path: &Path) -> VerdeResult<RasterHeader> {
    let band_count = dataset.raster_count();
    if band_count < 1 {
        return Err(VerdeError::read(path, "raster has no bands"));
    }

    let (width, height) = dataset.raster_size();
    if width == 0 || height == 0 {
        return Err(VerdeError::read(
            path,
            format!("zero-sized raster ({}x{})", width, height),
        ));
    }

    let geo_transform = dataset
        .geo_transform()
        .map(GeoTransform::from_gdal)
        .map_err(|e| VerdeError::read(path, format!("missing geotransform: {}", e)))?;
    if geo_transform.is_degenerate() {
        return Err(VerdeError::read(
            path,
            format!("degenerate geotransform {:?}", geo_transform.to_gdal()),
        ));
    }

    let projection = dataset.projection();
    if projection.trim().is_empty() {
        return Err(VerdeError::read(path, "raster has no coordinate reference system"));
    }
    let crs = Crs::from_wkt(&projection).map_err(|e| VerdeError::read(path, e.to_string()))?;

    Ok(RasterHeader {
        width,
        height,
        band_count,
        geo_transform,
        crs,
    })
}

/// Read a single (1-based) band of a raster as any supported pixel type
pub fn read_band_as<T: Pixel, P: AsRef<Path>>(path: P, band: usize) -> VerdeResult<Raster<T>> {
    let path = path.as_ref();
    log::info!("Reading raster band {} from: {}", band, path.display());

    let dataset = open_dataset(path)?;
    let header = read_header(&dataset, path)?;
    if band == 0 || band as isize > header.band_count {
        return Err(VerdeError::read(
            path,
            format!("band {} requested but raster has {} band(s)", band, header.band_count),
        ));
    }

    let (width, height) = (header.width, header.height);
    log::debug!("Raster size: {}x{} ({} bands)", width, height, header.band_count);
    log::debug!("Raster geotransform: {:?}", header.geo_transform.to_gdal());
    log::debug!("Raster CRS: {}", header.crs);

    let rasterband = dataset
        .rasterband(band as isize)
        .map_err(|e| VerdeError::read(path, e.to_string()))?;
    let nodata = rasterband.no_data_value();
    let band_data = rasterband
        .read_as::<T>((0, 0), (width, height), (width, height), None)
        .map_err(|e| VerdeError::read(path, e.to_string()))?;

    let array = Array2::from_shape_vec((height, width), band_data.data)
        .map_err(|e| VerdeError::read(path, format!("failed to reshape band data: {}", e)))?;

    Raster::new(array, header.geo_transform, header.crs, nodata).map_err(|e| VerdeError::read(path, e.to_string()))
}

/// Georeferenced extent and CRS without reading pixels.
/// Applies the same checks as [`read_band_as`].
pub fn raster_bounds<P: AsRef<Path>>(path: P) -> VerdeResult<(BoundingBox, Crs)> {
    let path = path.as_ref();
    let dataset = open_dataset(path)?;
    let header = read_header(&dataset, path)?;
    Ok((header.geo_transform.bounds(header.height, header.width), header.crs))
}

/// Save a single-band raster as GeoTIFF.
///
/// Float rasters without a sentinel are tagged with NaN as no-data.
pub fn write_raster<T: Pixel, P: AsRef<Path>>(
    raster: &Raster<T>,
    output_path: P,
    options: &WriteOptions,
) -> VerdeResult<()> {
    let output_path = output_path.as_ref();
    log::info!("Saving raster as GeoTIFF: {}", output_path.display());

    write_geotiff(raster, output_path, options).map_err(|e| match e {
        VerdeError::Write { .. } => e,
        other => VerdeError::write(output_path, other.to_string()),
    })
}

fn write_geotiff<T: Pixel>(raster: &Raster<T>, output_path: &Path, options: &WriteOptions) -> VerdeResult<()> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = raster.dim();

    let creation_options: Vec<RasterCreationOption> = options
        .compression
        .as_deref()
        .map(|value| vec![RasterCreationOption { key: "COMPRESS", value }])
        .unwrap_or_default();

    let mut dataset = driver.create_with_band_type_with_options::<T, _>(
        output_path,
        width as isize,
        height as isize,
        1,
        &creation_options,
    )?;

    dataset.set_geo_transform(&raster.geo_transform().to_gdal())?;
    dataset.set_projection(raster.crs().wkt())?;

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<T> = raster.data().iter().cloned().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;

    let nodata = match raster.nodata() {
        Some(value) => Some(value),
        None if T::IS_FLOAT => Some(f64::NAN),
        None => None,
    };
    if nodata.is_some() {
        rasterband.set_no_data_value(nodata)?;
    }

    log::debug!("Wrote {}x{} raster to {}", width, height, output_path.display());
    Ok(())
}

/// Stages every output of a run and publishes them together.
///
/// Files are written into a hidden temporary directory beside each
/// destination and renamed into place by [`OutputBatch::commit`]. Dropping
/// an uncommitted batch discards the staged files, so a failed run leaves
/// no partial outputs behind.
pub struct OutputBatch {
    options: WriteOptions,
    staged: Vec<(tempfile::TempDir, PathBuf, PathBuf)>,
}

impl OutputBatch {
    pub fn new(options: WriteOptions) -> Self {
        Self {
            options,
            staged: Vec::new(),
        }
    }

    fn stage_path(&mut self, destination: &Path) -> VerdeResult<PathBuf> {
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !parent.is_dir() {
            return Err(VerdeError::write(
                destination,
                format!("output directory {} does not exist", parent.display()),
            ));
        }
        let file_name = destination
            .file_name()
            .ok_or_else(|| VerdeError::write(destination, "output path has no file name"))?;

        let staging = tempfile::Builder::new()
            .prefix(".verdemetria-staging-")
            .tempdir_in(&parent)
            .map_err(|e| VerdeError::write(destination, e.to_string()))?;
        let staged_path = staging.path().join(file_name);
        self.staged.push((staging, staged_path.clone(), destination.to_path_buf()));
        Ok(staged_path)
    }

    /// Stage a raster for `destination`
    pub fn add_raster<T: Pixel>(&mut self, raster: &Raster<T>, destination: &Path) -> VerdeResult<()> {
        let staged = self.stage_path(destination)?;
        let options = self.options.clone();
        write_raster(raster, &staged, &options).map_err(|e| match e {
            VerdeError::Write { reason, .. } => VerdeError::write(destination, reason),
            other => other,
        })
    }

    /// Stage an arbitrary file produced by `writer`
    pub fn add_file<F>(&mut self, destination: &Path, writer: F) -> VerdeResult<()>
    where
        F: FnOnce(&Path) -> VerdeResult<()>,
    {
        let staged = self.stage_path(destination)?;
        writer(&staged).map_err(|e| match e {
            VerdeError::Write { reason, .. } => VerdeError::write(destination, reason),
            other => VerdeError::write(destination, other.to_string()),
        })
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Move every staged file to its destination.
    ///
    /// Either every destination is published or none is: files replaced
    /// earlier in the batch are restored if a later rename fails.
    pub fn commit(self) -> VerdeResult<Vec<PathBuf>> {
        for (_, _, destination) in &self.staged {
            if destination.is_dir() {
                return Err(VerdeError::write(destination, "destination is a directory"));
            }
        }

        let mut published: Vec<(usize, Option<PathBuf>)> = Vec::with_capacity(self.staged.len());
        for (index, (staging, staged_path, destination)) in self.staged.iter().enumerate() {
            let backup = if destination.exists() {
                let backup = staging.path().join(".previous");
                if let Err(e) = std::fs::rename(destination, &backup) {
                    self.roll_back(&published);
                    return Err(VerdeError::write(destination, e.to_string()));
                }
                Some(backup)
            } else {
                None
            };

            if let Err(e) = std::fs::rename(staged_path, destination) {
                if let Some(backup) = &backup {
                    let _ = std::fs::rename(backup, destination);
                }
                self.roll_back(&published);
                return Err(VerdeError::write(destination, e.to_string()));
            }
            published.push((index, backup));
        }

        let destinations: Vec<PathBuf> = self.staged.iter().map(|(_, _, d)| d.clone()).collect();
        for destination in &destinations {
            log::info!("Published {}", destination.display());
        }
        Ok(destinations)
    }

    /// Undo renames already made by a failing commit, newest first
    fn roll_back(&self, published: &[(usize, Option<PathBuf>)]) {
        for (index, backup) in published.iter().rev() {
            let destination = &self.staged[*index].2;
            let restored = match backup {
                Some(backup) => std::fs::rename(backup, destination),
                None => std::fs::remove_file(destination),
            };
            if let Err(e) = restored {
                log::error!("Failed to roll back {}: {}", destination.display(), e);
            } else {
                log::warn!("Rolled back {}", destination.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn utm() -> Crs {
        Crs::from_epsg(32618).unwrap()
    }

    #[test]
    fn test_write_then_read_preserves_georeferencing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("band.tif");

        let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        let raster = Raster::new(array![[0.1f32, 0.2], [0.3, f32::NAN]], gt, utm(), None).unwrap();
        write_raster(&raster, &path, &WriteOptions::default()).unwrap();

        let loaded = read_raster(&path).unwrap();
        assert_eq!(loaded.dim(), (2, 2));
        assert_eq!(loaded.geo_transform(), &gt);
        assert!(loaded.crs().is_same(&utm()).unwrap());
        assert_eq!(loaded.data()[[0, 1]], 0.2);
        assert!(loaded.data()[[1, 1]].is_nan());
        assert!(loaded.nodata().map_or(false, |v| v.is_nan()));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = read_raster("/nonexistent/B04.tif").unwrap_err();
        assert!(matches!(err, VerdeError::Read { .. }));
    }

    #[test]
    fn test_band_out_of_range_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("single.tif");
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        let raster = Raster::new(array![[1.0f32]], gt, utm(), None).unwrap();
        write_raster(&raster, &path, &WriteOptions::default()).unwrap();

        let err = read_raster_band(&path, 2).unwrap_err();
        assert!(matches!(err, VerdeError::Read { .. }));
    }

    /// Hand-written VRT header; bands read as zeros
    fn vrt(dir: &Path, name: &str, size: (usize, usize), srs: Option<&str>, gt: Option<&str>, bands: usize) -> PathBuf {
        let mut xml = format!(r#"<VRTDataset rasterXSize="{}" rasterYSize="{}">"#, size.0, size.1);
        if let Some(srs) = srs {
            xml.push_str(&format!("<SRS>{}</SRS>", srs));
        }
        if let Some(gt) = gt {
            xml.push_str(&format!("<GeoTransform>{}</GeoTransform>", gt));
        }
        for band in 1..=bands {
            xml.push_str(&format!(r#"<VRTRasterBand dataType="Float32" band="{}"/>"#, band));
        }
        xml.push_str("</VRTDataset>");

        let path = dir.join(name);
        std::fs::write(&path, xml).unwrap();
        path
    }

    const UTM_GT: &str = "500000.0, 10.0, 0.0, 4600000.0, 0.0, -10.0";

    #[test]
    fn test_well_formed_vrt_header_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = vrt(dir.path(), "ok.vrt", (3, 2), Some("EPSG:32618"), Some(UTM_GT), 1);

        let raster = read_raster(&path).unwrap();
        assert_eq!(raster.dim(), (2, 3));

        let (bounds, crs) = raster_bounds(&path).unwrap();
        assert!(crs.is_same(&utm()).unwrap());
        assert_eq!((bounds.min_x, bounds.max_x), (500_000.0, 500_030.0));
        assert_eq!((bounds.min_y, bounds.max_y), (4_599_980.0, 4_600_000.0));
    }

    #[test]
    fn test_raster_without_bands_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = vrt(dir.path(), "no_bands.vrt", (2, 2), Some("EPSG:32618"), Some(UTM_GT), 0);

        assert!(matches!(read_raster(&path).unwrap_err(), VerdeError::Read { .. }));
        assert!(matches!(raster_bounds(&path).unwrap_err(), VerdeError::Read { .. }));
    }

    #[test]
    fn test_zero_sized_raster_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = vrt(dir.path(), "empty.vrt", (0, 2), Some("EPSG:32618"), Some(UTM_GT), 1);

        assert!(matches!(read_raster(&path).unwrap_err(), VerdeError::Read { .. }));
        assert!(matches!(raster_bounds(&path).unwrap_err(), VerdeError::Read { .. }));
    }

    #[test]
    fn test_raster_without_crs_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = vrt(dir.path(), "no_crs.vrt", (2, 2), None, Some(UTM_GT), 1);

        let err = read_raster(&path).unwrap_err();
        assert!(matches!(err, VerdeError::Read { .. }));
        assert!(err.to_string().contains("coordinate reference system"));
        assert!(matches!(raster_bounds(&path).unwrap_err(), VerdeError::Read { .. }));
    }

    #[test]
    fn test_zero_pixel_size_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = vrt(
            dir.path(),
            "flat.vrt",
            (2, 2),
            Some("EPSG:32618"),
            Some("500000.0, 0.0, 0.0, 4600000.0, 0.0, -10.0"),
            1,
        );

        assert!(matches!(read_raster(&path).unwrap_err(), VerdeError::Read { .. }));
        assert!(matches!(raster_bounds(&path).unwrap_err(), VerdeError::Read { .. }));
    }

    #[test]
    fn test_raster_bounds_of_missing_file() {
        let err = raster_bounds("/nonexistent/B08.tif").unwrap_err();
        assert!(matches!(err, VerdeError::Read { .. }));
    }

    #[test]
    fn test_uncommitted_batch_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("ndvi.tif");
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        let raster = Raster::new(array![[0.5f32]], gt, utm(), None).unwrap();

        {
            let mut batch = OutputBatch::new(WriteOptions::default());
            batch.add_raster(&raster, &destination).unwrap();
            assert_eq!(batch.len(), 1);
        }

        assert!(!destination.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_committed_batch_publishes_all_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let raster_dst = dir.path().join("mask.tif");
        let text_dst = dir.path().join("summary.csv");
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        let mask = Raster::new(array![[1u8, 0]], gt, utm(), Some(255.0)).unwrap();

        let mut batch = OutputBatch::new(WriteOptions::default());
        batch.add_raster(&mask, &raster_dst).unwrap();
        batch
            .add_file(&text_dst, |p| std::fs::write(p, "category\n").map_err(VerdeError::from))
            .unwrap();
        let published = batch.commit().unwrap();

        assert_eq!(published.len(), 2);
        assert!(raster_dst.exists());
        assert_eq!(std::fs::read_to_string(&text_dst).unwrap(), "category\n");

        let reloaded = read_band_as::<u8, _>(&raster_dst, 1).unwrap();
        assert_eq!(reloaded.nodata(), Some(255.0));
        assert_eq!(reloaded.data()[[0, 0]], 1);
    }

    #[test]
    fn test_missing_output_directory_is_write_error() {
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        let raster = Raster::new(array![[0.5f32]], gt, utm(), None).unwrap();
        let mut batch = OutputBatch::new(WriteOptions::default());
        let err = batch
            .add_raster(&raster, Path::new("/nonexistent-dir/ndvi.tif"))
            .unwrap_err();
        assert!(matches!(err, VerdeError::Write { .. }));
    }

    #[test]
    fn test_directory_destination_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("mask.tif");
        let blocked = dir.path().join("summary.csv");
        std::fs::create_dir(&blocked).unwrap();
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        let mask = Raster::new(array![[1u8]], gt, utm(), Some(255.0)).unwrap();

        let mut batch = OutputBatch::new(WriteOptions::default());
        batch.add_raster(&mask, &first).unwrap();
        batch
            .add_file(&blocked, |p| std::fs::write(p, "category\n").map_err(VerdeError::from))
            .unwrap();

        let err = batch.commit().unwrap_err();
        assert!(matches!(err, VerdeError::Write { .. }));
        assert!(!first.exists());
        assert!(blocked.is_dir());
    }

    #[test]
    fn test_failed_commit_restores_replaced_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept");
        let vanishing = dir.path().join("vanishing");
        std::fs::create_dir(&kept).unwrap();
        std::fs::create_dir(&vanishing).unwrap();

        let first = kept.join("summary.csv");
        std::fs::write(&first, "previous run\n").unwrap();
        let second = vanishing.join("summary.csv");

        let mut batch = OutputBatch::new(WriteOptions::default());
        batch
            .add_file(&first, |p| std::fs::write(p, "new run\n").map_err(VerdeError::from))
            .unwrap();
        batch
            .add_file(&second, |p| std::fs::write(p, "new run\n").map_err(VerdeError::from))
            .unwrap();

        // Second staged file disappears, so its rename fails after the first succeeded
        std::fs::remove_dir_all(&vanishing).unwrap();

        let err = batch.commit().unwrap_err();
        assert!(matches!(err, VerdeError::Write { .. }));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "previous run\n");
        assert!(!second.exists());
    }
}
