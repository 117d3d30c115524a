use crate::core::reproject::{fill_value, PointTransformer};
use crate::io::aoi::AreaOfInterest;
use crate::types::{GeoTransform, Pixel, Raster, VerdeError, VerdeResult};
use ndarray::s;

const PIXEL_EDGE_TOLERANCE: f64 = 1e-6;

/// Crop a raster to an AOI.
///
/// The window is the AOI bounding box snapped outward to whole pixels.
/// Inside the window, pixels whose centre lies outside every AOI polygon
/// become no-data. An AOI that misses the raster fails with
/// `IncompatibleGrid`.
pub fn crop_to_aoi<T: Pixel>(raster: &Raster<T>, aoi: &AreaOfInterest) -> VerdeResult<Raster<T>> {
    let transformer = PointTransformer::new(aoi.crs(), raster.crs())?;
    let local = aoi.map_vertices(raster.crs().clone(), |xs, ys| transformer.transform(xs, ys))?;

    let aoi_bounds = local
        .bounds()
        .ok_or_else(|| VerdeError::IncompatibleGrid("AOI has an empty extent".to_string()))?;
    let overlap = aoi_bounds.intersection(&raster.bounds()).ok_or_else(|| {
        VerdeError::IncompatibleGrid(format!(
            "AOI {:?} does not overlap raster extent {:?} in {}",
            aoi_bounds,
            raster.bounds(),
            raster.crs()
        ))
    })?;

    let gt = raster.geo_transform();
    let (rows, cols) = raster.dim();

    let corners = [
        (overlap.min_x, overlap.min_y),
        (overlap.min_x, overlap.max_y),
        (overlap.max_x, overlap.min_y),
        (overlap.max_x, overlap.max_y),
    ];
    let mut col_min = f64::INFINITY;
    let mut col_max = f64::NEG_INFINITY;
    let mut row_min = f64::INFINITY;
    let mut row_max = f64::NEG_INFINITY;
    for (x, y) in corners {
        let (col, row) = gt
            .invert(x, y)
            .ok_or_else(|| VerdeError::Processing("Raster geotransform is not invertible".to_string()))?;
        col_min = col_min.min(col);
        col_max = col_max.max(col);
        row_min = row_min.min(row);
        row_max = row_max.max(row);
    }

    let c0 = snap(col_min).floor().max(0.0) as usize;
    let r0 = snap(row_min).floor().max(0.0) as usize;
    let c1 = (snap(col_max).ceil().max(0.0) as usize).min(cols);
    let r1 = (snap(row_max).ceil().max(0.0) as usize).min(rows);
    if c0 >= c1 || r0 >= r1 {
        return Err(VerdeError::IncompatibleGrid(
            "AOI window covers no whole pixel of the raster".to_string(),
        ));
    }

    log::info!(
        "Cropping {}x{} raster to AOI window rows {}..{}, cols {}..{}",
        rows,
        cols,
        r0,
        r1,
        c0,
        c1
    );

    let (origin_x, origin_y) = gt.apply(c0 as f64, r0 as f64);
    let window_gt = GeoTransform {
        top_left_x: origin_x,
        top_left_y: origin_y,
        ..*gt
    };

    let fill = fill_value(raster)?;
    let mut window = raster.data().slice(s![r0..r1, c0..c1]).to_owned();
    let mut outside = 0usize;
    for ((i, j), value) in window.indexed_iter_mut() {
        let (x, y) = window_gt.pixel_center(i, j);
        if !local.contains(x, y) {
            *value = fill;
            outside += 1;
        }
    }

    let total = window.len();
    if outside == total {
        log::warn!("No pixel centre of the cropped window falls inside the AOI");
    }
    log::info!(
        "AOI crop completed: {}x{} pixels, {} masked outside the AOI",
        r1 - r0,
        c1 - c0,
        outside
    );

    Raster::new(window, window_gt, raster.crs().clone(), raster.nodata())
}

/// Round pixel coordinates that sit on a pixel edge up to float noise
fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < PIXEL_EDGE_TOLERANCE {
        rounded
    } else {
        v
    }
}
