use gdal::raster::GdalType;
use gdal::spatial_ref::SpatialRef;
use ndarray::Array2;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Real-valued reflectance or index grid (rows x cols)
pub type NdviImage = Array2<f32>;

/// Categorical grid of change codes
pub type ClassImage = Array2<u8>;

/// Coordinate system classification, as reported by GDAL/PROJ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// Geographic coordinates (latitude, longitude) in angular units
    Geographic,
    /// Projected coordinates (e.g., UTM) with linear units
    Projected { metres_per_unit: f64 },
    /// Local or engineering systems that are neither of the above
    Other,
}

/// Axis-aligned extent in the units of some CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Smallest box containing every finite point, or `None` when there is none
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut bbox: Option<BoundingBox> = None;
        for (x, y) in points {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            bbox = Some(match bbox {
                None => BoundingBox { min_x: x, max_x: x, min_y: y, max_y: y },
                Some(b) => BoundingBox {
                    min_x: b.min_x.min(x),
                    max_x: b.max_x.max(x),
                    min_y: b.min_y.min(y),
                    max_y: b.max_y.max(y),
                },
            });
        }
        bbox
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Overlapping region with positive area; boxes that only touch do not overlap
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_x = self.min_x.max(other.min_x);
        let max_x = self.max_x.min(other.max_x);
        let min_y = self.min_y.max(other.min_y);
        let max_y = self.max_y.min(other.max_y);

        if min_x < max_x && min_y < max_y {
            Some(BoundingBox { min_x, max_x, min_y, max_y })
        } else {
            None
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_some()
    }
}

/// Affine transformation parameters (GDAL ordering)
///
/// `x = top_left_x + col * pixel_width + row * rotation_x`
/// `y = top_left_y + col * rotation_y + row * pixel_height`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square or rectangular cells
    pub fn north_up(top_left_x: f64, top_left_y: f64, cell_width: f64, cell_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: cell_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -cell_height.abs(), // Negative for north-up images
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map fractional (col, row) pixel coordinates to georeferenced (x, y)
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Georeferenced coordinates of a pixel centre
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    pub fn determinant(&self) -> f64 {
        self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y
    }

    pub fn is_degenerate(&self) -> bool {
        let det = self.determinant();
        !det.is_finite() || det == 0.0 || self.to_gdal().iter().any(|v| !v.is_finite())
    }

    /// Map georeferenced (x, y) back to fractional (col, row) pixel coordinates
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (self.pixel_height * dx - self.rotation_x * dy) / det;
        let row = (-self.rotation_y * dx + self.pixel_width * dy) / det;
        Some((col, row))
    }

    /// Ground footprint of one cell in squared CRS units
    pub fn cell_area(&self) -> f64 {
        self.determinant().abs()
    }

    /// Cell edge lengths (width, height) in CRS units
    pub fn cell_size(&self) -> (f64, f64) {
        (
            self.pixel_width.hypot(self.rotation_y),
            self.rotation_x.hypot(self.pixel_height),
        )
    }

    /// Extent covered by a grid of the given shape
    pub fn bounds(&self, rows: usize, cols: usize) -> BoundingBox {
        let (r, c) = (rows as f64, cols as f64);
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(c, 0.0),
            self.apply(0.0, r),
            self.apply(c, r),
        ];
        let (x0, y0) = corners[0];
        BoundingBox::from_points(corners).unwrap_or(BoundingBox {
            min_x: x0,
            max_x: x0,
            min_y: y0,
            max_y: y0,
        })
    }

    /// True when both transforms describe the same pixel lattice.
    ///
    /// Every coefficient must agree within `tolerance_pixels` of this
    /// transform's cell size.
    pub fn aligns_with(&self, other: &GeoTransform, tolerance_pixels: f64) -> bool {
        let (cw, ch) = self.cell_size();
        let scale = cw.max(ch);
        let tol = tolerance_pixels * scale;

        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }
}

/// Coordinate reference system, held as WKT so it can cross threads and
/// be cloned freely. GDAL handles are created on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crs {
    definition: String,
    wkt: String,
}

impl Crs {
    pub fn from_epsg(code: u32) -> VerdeResult<Self> {
        let srs = SpatialRef::from_epsg(code)
            .map_err(|e| VerdeError::InvalidCrs(format!("EPSG:{}: {}", code, e)))?;
        Ok(Self {
            definition: format!("EPSG:{}", code),
            wkt: srs.to_wkt()?,
        })
    }

    /// Accepts anything GDAL understands: `EPSG:32618`, PROJ strings, WKT
    pub fn from_user_input(definition: &str) -> VerdeResult<Self> {
        let trimmed = definition.trim();
        if trimmed.is_empty() {
            return Err(VerdeError::InvalidCrs("Empty CRS definition".to_string()));
        }
        let srs = SpatialRef::from_definition(trimmed)
            .map_err(|e| VerdeError::InvalidCrs(format!("{}: {}", trimmed, e)))?;
        Ok(Self {
            definition: trimmed.to_string(),
            wkt: srs.to_wkt()?,
        })
    }

    /// Wrap a WKT string read from a dataset
    pub fn from_wkt(wkt: &str) -> VerdeResult<Self> {
        if wkt.trim().is_empty() {
            return Err(VerdeError::InvalidCrs("Empty WKT".to_string()));
        }
        let srs = SpatialRef::from_wkt(wkt)
            .map_err(|e| VerdeError::InvalidCrs(format!("Unparseable WKT: {}", e)))?;
        let definition = srs.authority().unwrap_or_else(|_| "custom WKT".to_string());
        Ok(Self {
            definition,
            wkt: wkt.to_string(),
        })
    }

    /// Short human-readable label (authority code when known)
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn wkt(&self) -> &str {
        &self.wkt
    }

    /// GDAL spatial reference with x=easting/longitude, y=northing/latitude
    pub fn spatial_ref(&self) -> VerdeResult<SpatialRef> {
        let srs = SpatialRef::from_wkt(&self.wkt)?;
        srs.set_axis_mapping_strategy(
            gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
        );
        Ok(srs)
    }

    pub fn coordinate_system(&self) -> VerdeResult<CoordinateSystem> {
        let srs = self.spatial_ref()?;
        if srs.is_geographic() {
            Ok(CoordinateSystem::Geographic)
        } else if srs.is_projected() {
            Ok(CoordinateSystem::Projected {
                metres_per_unit: srs.linear_units(),
            })
        } else {
            Ok(CoordinateSystem::Other)
        }
    }

    pub fn is_same(&self, other: &Crs) -> VerdeResult<bool> {
        if self.wkt == other.wkt {
            return Ok(true);
        }
        Ok(self.spatial_ref()? == other.spatial_ref()?)
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.definition)
    }
}

/// Pixel types a raster can carry
pub trait Pixel: Copy + PartialEq + Send + Sync + NumCast + GdalType + 'static {
    /// Floating-point types get NaN as their implicit no-data value
    const IS_FLOAT: bool = false;

    /// No-data test: NaN always counts, as does an exact sentinel match
    fn matches_nodata(self, nodata: Option<f64>) -> bool {
        match self.to_f64() {
            Some(v) => v.is_nan() || nodata.map_or(false, |nd| v == nd),
            None => true,
        }
    }
}

impl Pixel for f32 {
    const IS_FLOAT: bool = true;
}
impl Pixel for f64 {
    const IS_FLOAT: bool = true;
}
impl Pixel for u8 {}
impl Pixel for u16 {}
impl Pixel for i16 {}
impl Pixel for i32 {}

/// A georeferenced 2D grid. Stages never mutate a raster; each one
/// returns a new grid sharing the georeferencing of its input.
#[derive(Debug, Clone)]
pub struct Raster<T: Pixel = f32> {
    data: Array2<T>,
    geo_transform: GeoTransform,
    crs: Crs,
    nodata: Option<f64>,
}

impl<T: Pixel> Raster<T> {
    pub fn new(
        data: Array2<T>,
        geo_transform: GeoTransform,
        crs: Crs,
        nodata: Option<f64>,
    ) -> VerdeResult<Self> {
        let (rows, cols) = data.dim();
        if rows == 0 || cols == 0 {
            return Err(VerdeError::InvalidParameter(format!(
                "Raster dimensions must be non-zero, got {}x{}",
                rows, cols
            )));
        }
        if geo_transform.is_degenerate() {
            return Err(VerdeError::InvalidParameter(format!(
                "Degenerate geotransform: {:?}",
                geo_transform.to_gdal()
            )));
        }
        Ok(Self {
            data,
            geo_transform,
            crs,
            nodata,
        })
    }

    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    pub fn into_data(self) -> Array2<T> {
        self.data
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        &self.geo_transform
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn is_valid(&self, value: T) -> bool {
        !value.matches_nodata(self.nodata)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| self.is_valid(v)).count()
    }

    pub fn bounds(&self) -> BoundingBox {
        let (rows, cols) = self.dim();
        self.geo_transform.bounds(rows, cols)
    }

    /// New raster on the same grid and CRS with a different payload
    pub fn derive<U: Pixel>(&self, data: Array2<U>, nodata: Option<f64>) -> VerdeResult<Raster<U>> {
        if data.dim() != self.dim() {
            return Err(VerdeError::ShapeMismatch {
                context: "derived grid".to_string(),
                expected: self.dim(),
                found: data.dim(),
            });
        }
        Raster::new(data, self.geo_transform, self.crs.clone(), nodata)
    }
}

/// Pipeline stage, reported alongside failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Load,
    Crop,
    Ndvi,
    Alignment,
    ChangeDetection,
    AreaAggregation,
    Write,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Load => write!(f, "load"),
            PipelineStage::Crop => write!(f, "AOI crop"),
            PipelineStage::Ndvi => write!(f, "NDVI"),
            PipelineStage::Alignment => write!(f, "alignment"),
            PipelineStage::ChangeDetection => write!(f, "change detection"),
            PipelineStage::AreaAggregation => write!(f, "area aggregation"),
            PipelineStage::Write => write!(f, "write"),
        }
    }
}

/// Error types for NDVI and change processing
#[derive(Debug, thiserror::Error)]
pub enum VerdeError {
    #[error("Failed to read raster {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Incompatible grids: {0}")]
    IncompatibleGrid(String),

    #[error("Invalid CRS: {0}")]
    InvalidCrs(String),

    #[error("Failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("{stage} stage failed for {path}: {source}")]
    Stage {
        stage: PipelineStage,
        path: PathBuf,
        #[source]
        source: Box<VerdeError>,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl VerdeError {
    pub fn read<P: AsRef<Path>>(path: P, reason: impl Into<String>) -> Self {
        VerdeError::Read {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn write<P: AsRef<Path>>(path: P, reason: impl Into<String>) -> Self {
        VerdeError::Write {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Innermost error, skipping stage wrappers
    pub fn root(&self) -> &VerdeError {
        match self {
            VerdeError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Attach the failing stage and input path to an error
pub trait StageContext<T> {
    fn at_stage<P: AsRef<Path>>(self, stage: PipelineStage, path: P) -> VerdeResult<T>;
}

impl<T> StageContext<T> for VerdeResult<T> {
    fn at_stage<P: AsRef<Path>>(self, stage: PipelineStage, path: P) -> VerdeResult<T> {
        self.map_err(|e| VerdeError::Stage {
            stage,
            path: path.as_ref().to_path_buf(),
            source: Box::new(e),
        })
    }
}

/// Result type for NDVI and change operations
pub type VerdeResult<T> = Result<T, VerdeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geotransform_roundtrip_through_inverse() {
        let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        let (x, y) = gt.pixel_center(3, 7);
        assert_eq!((x, y), (500_075.0, 4_599_965.0));

        let (col, row) = gt.invert(x, y).unwrap();
        assert!((col - 7.5).abs() < 1e-9);
        assert!((row - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_geotransform_rotated_inverse() {
        let gt = GeoTransform::from_gdal([100.0, 2.0, 0.5, 200.0, 0.25, -3.0]);
        let (x, y) = gt.apply(4.0, 6.0);
        let (col, row) = gt.invert(x, y).unwrap();
        assert!((col - 4.0).abs() < 1e-9);
        assert!((row - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cell_area_and_bounds() {
        let gt = GeoTransform::north_up(0.0, 100.0, 20.0, 30.0);
        assert_eq!(gt.cell_area(), 600.0);
        assert_eq!(gt.cell_size(), (20.0, 30.0));

        let bounds = gt.bounds(2, 5);
        assert_eq!(bounds.min_x, 0.0);
        assert_eq!(bounds.max_x, 100.0);
        assert_eq!(bounds.min_y, 40.0);
        assert_eq!(bounds.max_y, 100.0);
    }

    #[test]
    fn test_alignment_tolerance_is_relative_to_cell_size() {
        let a = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        let mut b = a;
        b.top_left_x += 1e-7;
        assert!(a.aligns_with(&b, 1e-6));

        b.top_left_x += 0.5;
        assert!(!a.aligns_with(&b, 1e-6));
    }

    #[test]
    fn test_bbox_touching_edges_do_not_overlap() {
        let a = BoundingBox { min_x: 0.0, max_x: 10.0, min_y: 0.0, max_y: 10.0 };
        let b = BoundingBox { min_x: 10.0, max_x: 20.0, min_y: 0.0, max_y: 10.0 };
        let c = BoundingBox { min_x: 5.0, max_x: 15.0, min_y: 5.0, max_y: 15.0 };

        assert!(!a.intersects(&b));
        let overlap = a.intersection(&c).unwrap();
        assert_eq!(overlap, BoundingBox { min_x: 5.0, max_x: 10.0, min_y: 5.0, max_y: 10.0 });
    }

    #[test]
    fn test_pixel_nodata_matching() {
        assert!(f32::NAN.matches_nodata(None));
        assert!((-9999.0f32).matches_nodata(Some(-9999.0)));
        assert!(!(0.5f32).matches_nodata(Some(-9999.0)));
        assert!(255u8.matches_nodata(Some(255.0)));
        assert!(!1u8.matches_nodata(None));
    }

    #[test]
    fn test_stage_context_wraps_and_root_unwraps() {
        let result: VerdeResult<()> = Err(VerdeError::IncompatibleGrid("no overlap".into()));
        let err = result.at_stage(PipelineStage::Alignment, "/tmp/ndvi_t2.tif").unwrap_err();

        let message = err.to_string();
        assert!(message.contains("alignment"));
        assert!(message.contains("/tmp/ndvi_t2.tif"));
        assert!(matches!(err.root(), VerdeError::IncompatibleGrid(_)));
    }
}
