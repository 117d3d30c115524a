use crate::core::reproject::{projected_bounds, warp, GridSpec, ResamplingMethod};
use crate::types::{Pixel, Raster, VerdeError, VerdeResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Grid alignment parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentParams {
    /// Interpolation used when the second grid has to be resampled
    pub resampling: ResamplingMethod,
    /// Allowed geotransform difference, in pixels of the reference grid
    pub tolerance_pixels: f64,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            resampling: ResamplingMethod::Bilinear,
            tolerance_pixels: 1e-6,
        }
    }
}

/// Which aspects of two grids agree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridComparison {
    pub same_shape: bool,
    pub same_transform: bool,
    pub same_crs: bool,
}

impl GridComparison {
    pub fn is_aligned(&self) -> bool {
        self.same_shape && self.same_transform && self.same_crs
    }
}

/// Gate in front of every pixelwise comparison: brings a second raster
/// onto the grid of a reference raster.
pub struct GridAligner {
    params: AlignmentParams,
}

impl GridAligner {
    /// Create an aligner with default parameters
    pub fn new() -> Self {
        Self {
            params: AlignmentParams::default(),
        }
    }

    /// Create an aligner with custom parameters
    pub fn with_params(params: AlignmentParams) -> Self {
        Self { params }
    }

    pub fn compare<T: Pixel, U: Pixel>(&self, reference: &Raster<T>, other: &Raster<U>) -> VerdeResult<GridComparison> {
        Ok(GridComparison {
            same_shape: reference.dim() == other.dim(),
            same_transform: reference
                .geo_transform()
                .aligns_with(other.geo_transform(), self.params.tolerance_pixels),
            same_crs: reference.crs().is_same(other.crs())?,
        })
    }

    /// Return `other` untouched when it already shares the reference grid,
    /// otherwise a copy resampled (and reprojected if needed) onto it.
    ///
    /// Fails with `IncompatibleGrid` when the two extents do not overlap.
    pub fn align<'a, T: Pixel>(&self, reference: &Raster<T>, other: &'a Raster<T>) -> VerdeResult<Cow<'a, Raster<T>>> {
        if !self.params.tolerance_pixels.is_finite() || self.params.tolerance_pixels < 0.0 {
            return Err(VerdeError::InvalidParameter(format!(
                "Alignment tolerance must be a non-negative number of pixels, got {}",
                self.params.tolerance_pixels
            )));
        }

        let comparison = self.compare(reference, other)?;
        if comparison.is_aligned() {
            log::info!("Grids already aligned ({}x{})", reference.dim().0, reference.dim().1);
            return Ok(Cow::Borrowed(other));
        }

        log::warn!(
            "Grids differ (shape: {}, transform: {}, CRS: {}), resampling onto reference grid",
            !comparison.same_shape,
            !comparison.same_transform,
            !comparison.same_crs
        );

        let reference_grid = GridSpec::of(reference);
        let other_bounds = projected_bounds(&GridSpec::of(other), reference.crs())?;
        let overlap = other_bounds.and_then(|b| b.intersection(&reference_grid.bounds()));
        if overlap.is_none() {
            return Err(VerdeError::IncompatibleGrid(format!(
                "Rasters do not overlap: reference {:?} in {}, other {:?}",
                reference_grid.bounds(),
                reference.crs(),
                other_bounds
            )));
        }

        let resampled = warp(other, &reference_grid, self.params.resampling)?;
        Ok(Cow::Owned(resampled))
    }
}

impl Default for GridAligner {
    fn default() -> Self {
        Self::new()
    }
}

/// Bring `other` onto the grid of `reference`
pub fn align_to<'a, T: Pixel>(
    reference: &Raster<T>,
    other: &'a Raster<T>,
    params: &AlignmentParams,
) -> VerdeResult<Cow<'a, Raster<T>>> {
    GridAligner::with_params(params.clone()).align(reference, other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn utm() -> Crs {
        Crs::from_epsg(32618).unwrap()
    }

    #[test]
    fn test_identical_grids_returned_unchanged() {
        let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        let a = Raster::new(array![[0.1f32, 0.2]], gt, utm(), None).unwrap();
        let b = Raster::new(array![[0.3f32, 0.4]], gt, utm(), None).unwrap();

        let aligned = align_to(&a, &b, &AlignmentParams::default()).unwrap();
        assert!(matches!(aligned, Cow::Borrowed(_)));
        assert_eq!(aligned.data(), b.data());
    }

    #[test]
    fn test_subpixel_noise_within_tolerance() {
        let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        let mut nudged = gt;
        nudged.top_left_x += 1e-6;
        let a = Raster::new(array![[0.1f32]], gt, utm(), None).unwrap();
        let b = Raster::new(array![[0.3f32]], nudged, utm(), None).unwrap();

        let aligned = align_to(&a, &b, &AlignmentParams::default()).unwrap();
        assert!(matches!(aligned, Cow::Borrowed(_)));
    }

    #[test]
    fn test_different_resolution_is_resampled() {
        let fine = GeoTransform::north_up(0.0, 20.0, 10.0, 10.0);
        let coarse = GeoTransform::north_up(0.0, 20.0, 20.0, 20.0);
        let reference = Raster::new(Array2::<f32>::zeros((2, 2)), fine, utm(), None).unwrap();
        let other = Raster::new(array![[0.8f32]], coarse, utm(), None).unwrap();

        let params = AlignmentParams {
            resampling: ResamplingMethod::Nearest,
            ..AlignmentParams::default()
        };
        let aligned = align_to(&reference, &other, &params).unwrap();
        assert!(matches!(aligned, Cow::Owned(_)));
        assert_eq!(aligned.dim(), (2, 2));
        assert_eq!(aligned.geo_transform(), reference.geo_transform());
        for v in aligned.data().iter() {
            assert_abs_diff_eq!(*v, 0.8, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_disjoint_grids_are_incompatible() {
        let a = Raster::new(array![[0.1f32]], GeoTransform::north_up(0.0, 10.0, 10.0, 10.0), utm(), None).unwrap();
        let b = Raster::new(array![[0.1f32]], GeoTransform::north_up(1_000.0, 10.0, 10.0, 10.0), utm(), None).unwrap();

        let err = align_to(&a, &b, &AlignmentParams::default()).unwrap_err();
        assert!(matches!(err, VerdeError::IncompatibleGrid(_)));
    }

    #[test]
    fn test_comparison_reports_crs_difference() {
        let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        let a = Raster::new(array![[0.1f32]], gt, utm(), None).unwrap();
        let b = Raster::new(array![[0.1f32]], gt, Crs::from_epsg(32619).unwrap(), None).unwrap();

        let comparison = GridAligner::new().compare(&a, &b).unwrap();
        assert!(comparison.same_shape);
        assert!(comparison.same_transform);
        assert!(!comparison.same_crs);
        assert!(!comparison.is_aligned());
    }

    #[test]
    fn test_geographic_raster_is_reprojected_onto_utm_reference() {
        use crate::core::reproject::PointTransformer;

        // 0.1 x 0.1 degree source near Bogota, each pixel holding its centre longitude
        let wgs84 = Crs::from_epsg(4326).unwrap();
        let source_gt = GeoTransform::north_up(-74.25, 4.65, 0.005, 0.005);
        let longitudes = Array2::from_shape_fn((20, 20), |(_, j)| -74.25 + (j as f64 + 0.5) * 0.005);
        let source = Raster::new(longitudes, source_gt, wgs84.clone(), None).unwrap();

        // 1 km UTM reference grid centred on (-74.2, 4.6), well inside the source
        let to_utm = PointTransformer::new(&wgs84, &utm()).unwrap();
        let mut xs = [-74.2];
        let mut ys = [4.6];
        to_utm.transform(&mut xs, &mut ys);
        let reference_gt = GeoTransform::north_up(xs[0] - 500.0, ys[0] + 500.0, 100.0, 100.0);
        let reference = Raster::new(Array2::<f64>::zeros((10, 10)), reference_gt, utm(), None).unwrap();

        let aligned = align_to(&reference, &source, &AlignmentParams::default()).unwrap();
        assert!(matches!(aligned, Cow::Owned(_)));
        assert_eq!(aligned.dim(), (10, 10));
        assert_eq!(aligned.geo_transform(), reference.geo_transform());
        assert!(aligned.crs().is_same(&utm()).unwrap());
        assert_eq!(aligned.valid_count(), 100);

        // Every resampled value is the longitude of its own pixel centre
        let to_wgs84 = PointTransformer::new(&utm(), &wgs84).unwrap();
        for ((i, j), value) in aligned.data().indexed_iter() {
            let (x, y) = reference_gt.pixel_center(i, j);
            let mut lon = [x];
            let mut lat = [y];
            to_wgs84.transform(&mut lon, &mut lat);
            assert_abs_diff_eq!(*value, lon[0], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_partial_geographic_overlap_leaves_uncovered_pixels_nodata() {
        let wgs84 = Crs::from_epsg(4326).unwrap();
        let source = Raster::new(
            Array2::from_elem((20, 20), 0.5f32),
            GeoTransform::north_up(-74.25, 4.65, 0.005, 0.005),
            wgs84.clone(),
            None,
        )
        .unwrap();

        // Reference straddles the eastern source edge at -74.15
        let to_utm = crate::core::reproject::PointTransformer::new(&wgs84, &utm()).unwrap();
        let mut xs = [-74.15];
        let mut ys = [4.6];
        to_utm.transform(&mut xs, &mut ys);
        let reference = Raster::new(
            Array2::<f32>::zeros((4, 10)),
            GeoTransform::north_up(xs[0] - 500.0, ys[0] + 200.0, 100.0, 100.0),
            utm(),
            None,
        )
        .unwrap();

        let aligned = align_to(&reference, &source, &AlignmentParams::default()).unwrap();
        let valid = aligned.valid_count();
        assert!(valid > 0 && valid < 40, "expected partial coverage, got {}", valid);
        for v in aligned.data().iter().filter(|v| !v.is_nan()) {
            assert_abs_diff_eq!(*v, 0.5, epsilon = 1e-6);
        }
        // West half covered, east half beyond the source
        assert!(!aligned.data()[[0, 0]].is_nan());
        assert!(aligned.data()[[0, 9]].is_nan());
    }
}
