use crate::types::{BoundingBox, Crs, GeoTransform, Pixel, Raster, VerdeError, VerdeResult};
use gdal::spatial_ref::CoordTransform;
use ndarray::Array2;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Samples taken along each edge when projecting an extent
const OUTLINE_POINTS_PER_EDGE: usize = 21;

/// Interpolation used when a raster is moved onto another grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplingMethod {
    /// Value of the source pixel containing the target centre (categorical data)
    Nearest,
    /// Distance-weighted mean of the four nearest source centres (continuous data)
    Bilinear,
}

impl Default for ResamplingMethod {
    fn default() -> Self {
        ResamplingMethod::Bilinear
    }
}

impl std::str::FromStr for ResamplingMethod {
    type Err = VerdeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" | "near" => Ok(ResamplingMethod::Nearest),
            "bilinear" => Ok(ResamplingMethod::Bilinear),
            _ => Err(VerdeError::InvalidParameter(format!(
                "Invalid resampling method: {}. Must be one of: nearest, bilinear",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ResamplingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResamplingMethod::Nearest => write!(f, "nearest"),
            ResamplingMethod::Bilinear => write!(f, "bilinear"),
        }
    }
}

/// Target lattice for a warp
#[derive(Debug, Clone)]
pub struct GridSpec {
    pub rows: usize,
    pub cols: usize,
    pub geo_transform: GeoTransform,
    pub crs: Crs,
}

impl GridSpec {
    /// The grid a raster already lives on
    pub fn of<T: Pixel>(raster: &Raster<T>) -> Self {
        let (rows, cols) = raster.dim();
        Self {
            rows,
            cols,
            geo_transform: *raster.geo_transform(),
            crs: raster.crs().clone(),
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        self.geo_transform.bounds(self.rows, self.cols)
    }
}

/// Point transformation between two CRSs (x = easting/longitude).
/// Identity when both CRSs are the same.
pub struct PointTransformer {
    inner: Option<CoordTransform>,
}

impl PointTransformer {
    pub fn new(from: &Crs, to: &Crs) -> VerdeResult<Self> {
        if from.is_same(to)? {
            return Ok(Self { inner: None });
        }
        let source = from.spatial_ref()?;
        let target = to.spatial_ref()?;
        let transform = CoordTransform::new(&source, &target).map_err(|e| {
            VerdeError::InvalidCrs(format!("No transformation from {} to {}: {}", from, to, e))
        })?;
        Ok(Self {
            inner: Some(transform),
        })
    }

    pub fn is_identity(&self) -> bool {
        self.inner.is_none()
    }

    /// Transform in place. Points PROJ cannot transform become NaN rather
    /// than failing the whole batch.
    pub fn transform(&self, xs: &mut [f64], ys: &mut [f64]) {
        let transform = match &self.inner {
            Some(t) => t,
            None => return,
        };

        let (orig_x, orig_y) = (xs.to_vec(), ys.to_vec());
        let mut zs = vec![0.0; xs.len()];
        if transform.transform_coords(xs, ys, &mut zs).is_ok() {
            return;
        }

        // Batch failed: retry point by point so one bad point does not poison the rest
        for i in 0..orig_x.len() {
            let mut x = [orig_x[i]];
            let mut y = [orig_y[i]];
            let mut z = [0.0];
            match transform.transform_coords(&mut x, &mut y, &mut z) {
                Ok(()) => {
                    xs[i] = x[0];
                    ys[i] = y[0];
                }
                Err(_) => {
                    xs[i] = f64::NAN;
                    ys[i] = f64::NAN;
                }
            }
        }
    }
}

/// Densified outline of a grid's extent, in the grid's CRS
pub(crate) fn outline_points(geo_transform: &GeoTransform, rows: usize, cols: usize) -> Vec<(f64, f64)> {
    let n = OUTLINE_POINTS_PER_EDGE;
    let (r, c) = (rows as f64, cols as f64);
    let mut points = Vec::with_capacity(4 * n);

    for i in 0..n {
        let t = i as f64 / (n - 1) as f64;
        points.push(geo_transform.apply(t * c, 0.0));
        points.push(geo_transform.apply(t * c, r));
        points.push(geo_transform.apply(0.0, t * r));
        points.push(geo_transform.apply(c, t * r));
    }
    points
}

/// Extent of a grid after projecting its outline into `target`
pub fn projected_bounds(grid: &GridSpec, target: &Crs) -> VerdeResult<Option<BoundingBox>> {
    let transformer = PointTransformer::new(&grid.crs, target)?;
    if transformer.is_identity() {
        return Ok(Some(grid.bounds()));
    }

    let points = outline_points(&grid.geo_transform, grid.rows, grid.cols);
    let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    let mut ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    transformer.transform(&mut xs, &mut ys);

    Ok(BoundingBox::from_points(xs.into_iter().zip(ys)))
}

/// Default destination grid for reprojecting a raster into `target`.
///
/// Square cells are sized so the diagonal of the projected extent spans
/// the same number of pixels as the source diagonal.
pub fn default_grid<T: Pixel>(raster: &Raster<T>, target: &Crs) -> VerdeResult<GridSpec> {
    let source = GridSpec::of(raster);
    if raster.crs().is_same(target)? {
        return Ok(source);
    }

    let bounds = projected_bounds(&source, target)?.ok_or_else(|| {
        VerdeError::IncompatibleGrid(format!(
            "Raster extent cannot be represented in {}",
            target
        ))
    })?;

    let (rows, cols) = raster.dim();
    let pixel_diagonal = (cols as f64).hypot(rows as f64);
    let resolution = bounds.width().hypot(bounds.height()) / pixel_diagonal;
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(VerdeError::IncompatibleGrid(format!(
            "Projected extent in {} is degenerate: {:?}",
            target, bounds
        )));
    }

    let out_cols = ((bounds.width() / resolution).ceil() as usize).max(1);
    let out_rows = ((bounds.height() / resolution).ceil() as usize).max(1);

    log::debug!(
        "Default grid in {}: {}x{} at {:.3} units/pixel",
        target,
        out_rows,
        out_cols,
        resolution
    );

    Ok(GridSpec {
        rows: out_rows,
        cols: out_cols,
        geo_transform: GeoTransform::north_up(bounds.min_x, bounds.max_y, resolution, resolution),
        crs: target.clone(),
    })
}

/// Fill value for pixels the source does not cover
pub(crate) fn fill_value<T: Pixel>(raster: &Raster<T>) -> VerdeResult<T> {
    let fill = match raster.nodata() {
        Some(nd) => <T as NumCast>::from(nd),
        None if T::IS_FLOAT => <T as NumCast>::from(f64::NAN),
        None => None,
    };
    fill.ok_or_else(|| {
        VerdeError::InvalidParameter(
            "Integer rasters need a representable no-data value to be resampled".to_string(),
        )
    })
}

/// Resample `raster` onto `target` by inverse-mapping every target pixel
/// centre into the source grid. Target pixels outside the source extent
/// become no-data.
pub fn warp<T: Pixel>(raster: &Raster<T>, target: &GridSpec, method: ResamplingMethod) -> VerdeResult<Raster<T>> {
    log::info!(
        "Warping {}x{} raster onto {}x{} grid ({} resampling)",
        raster.dim().0,
        raster.dim().1,
        target.rows,
        target.cols,
        method
    );

    let fill = fill_value(raster)?;
    let transformer = PointTransformer::new(&target.crs, raster.crs())?;
    let source_gt = raster.geo_transform();
    let (src_rows, src_cols) = raster.dim();

    let mut output = Array2::from_elem((target.rows, target.cols), fill);
    let mut xs = vec![0.0; target.cols];
    let mut ys = vec![0.0; target.cols];
    let mut covered = 0usize;

    for i in 0..target.rows {
        for j in 0..target.cols {
            let (x, y) = target.geo_transform.pixel_center(i, j);
            xs[j] = x;
            ys[j] = y;
        }
        transformer.transform(&mut xs, &mut ys);

        for j in 0..target.cols {
            let (col, row) = match source_gt.invert(xs[j], ys[j]) {
                Some(p) if p.0.is_finite() && p.1.is_finite() => p,
                _ => continue,
            };

            if col < 0.0 || row < 0.0 || col >= src_cols as f64 || row >= src_rows as f64 {
                continue;
            }

            let value = match method {
                ResamplingMethod::Nearest => {
                    let v = raster.data()[[row as usize, col as usize]];
                    if raster.is_valid(v) {
                        Some(v)
                    } else {
                        None
                    }
                }
                ResamplingMethod::Bilinear => bilinear_sample(raster, col, row),
            };

            if let Some(v) = value {
                output[[i, j]] = v;
                covered += 1;
            }
        }
    }

    let coverage = covered as f64 / (target.rows * target.cols) as f64 * 100.0;
    log::info!("Warp completed: {:.1}% of target pixels covered", coverage);

    let nodata = raster.nodata();
    Raster::new(output, target.geo_transform, target.crs.clone(), nodata)
}

/// Bilinear interpolation between the four pixel centres around the
/// fractional pixel coordinate (col, row). Samples in the outer half pixel
/// clamp to the edge centres. Any no-data neighbour yields `None`.
fn bilinear_sample<T: Pixel>(raster: &Raster<T>, col: f64, row: f64) -> Option<T> {
    let (rows, cols) = raster.dim();
    let u = (col - 0.5).clamp(0.0, (cols - 1) as f64);
    let v = (row - 0.5).clamp(0.0, (rows - 1) as f64);

    let x1 = u.floor() as usize;
    let y1 = v.floor() as usize;
    let x2 = (x1 + 1).min(cols - 1);
    let y2 = (y1 + 1).min(rows - 1);

    let dx = u - x1 as f64;
    let dy = v - y1 as f64;

    let data = raster.data();
    let mut corners = [0.0f64; 4];
    for (k, &(r, c)) in [(y1, x1), (y1, x2), (y2, x1), (y2, x2)].iter().enumerate() {
        let value = data[[r, c]];
        if !raster.is_valid(value) {
            return None;
        }
        corners[k] = value.to_f64()?;
    }
    let [v11, v21, v12, v22] = corners;

    let interpolated = v11 * (1.0 - dx) * (1.0 - dy)
        + v21 * dx * (1.0 - dy)
        + v12 * (1.0 - dx) * dy
        + v22 * dx * dy;

    <T as NumCast>::from(interpolated)
}
