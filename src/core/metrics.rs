use crate::types::{Raster, VerdeError, VerdeResult};
use serde::{Deserialize, Serialize};

/// NDVI class boundaries for vegetation density
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VegetationThresholds {
    /// Below this: bare soil, water or built-up
    pub bare: f64,
    /// Below this: sparse vegetation
    pub sparse: f64,
    /// Below this: moderate vegetation; at or above: dense
    pub moderate: f64,
}

impl Default for VegetationThresholds {
    fn default() -> Self {
        Self {
            bare: 0.2,
            sparse: 0.4,
            moderate: 0.6,
        }
    }
}

impl VegetationThresholds {
    pub fn validate(&self) -> VerdeResult<()> {
        let ordered = self.bare < self.sparse && self.sparse < self.moderate;
        let finite = [self.bare, self.sparse, self.moderate].iter().all(|v| v.is_finite());
        if !ordered || !finite {
            return Err(VerdeError::InvalidParameter(format!(
                "Vegetation thresholds must be finite and strictly increasing, got {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Summary statistics of an NDVI grid over its valid pixels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VegetationMetrics {
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub valid_pixels: usize,
    pub bare_pixels: usize,
    pub sparse_pixels: usize,
    pub moderate_pixels: usize,
    pub dense_pixels: usize,
}

impl VegetationMetrics {
    /// Share of valid pixels at or above the sparse boundary
    pub fn vegetated_fraction(&self) -> f64 {
        if self.valid_pixels == 0 {
            return f64::NAN;
        }
        (self.moderate_pixels + self.dense_pixels) as f64 / self.valid_pixels as f64
    }
}

/// Mean, spread, range and density-class counts of an NDVI grid.
/// An all-no-data grid yields NaN statistics and zero counts.
pub fn vegetation_metrics(ndvi: &Raster<f32>, thresholds: &VegetationThresholds) -> VerdeResult<VegetationMetrics> {
    thresholds.validate()?;

    let mut metrics = VegetationMetrics {
        mean: f64::NAN,
        std_dev: f64::NAN,
        min: f64::NAN,
        max: f64::NAN,
        valid_pixels: 0,
        bare_pixels: 0,
        sparse_pixels: 0,
        moderate_pixels: 0,
        dense_pixels: 0,
    };

    // Welford update keeps the variance stable on large grids
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for &value in ndvi.data().iter() {
        if !ndvi.is_valid(value) || !value.is_finite() {
            continue;
        }
        let v = value as f64;
        metrics.valid_pixels += 1;

        let delta = v - mean;
        mean += delta / metrics.valid_pixels as f64;
        m2 += delta * (v - mean);
        min = min.min(v);
        max = max.max(v);

        if v < thresholds.bare {
            metrics.bare_pixels += 1;
        } else if v < thresholds.sparse {
            metrics.sparse_pixels += 1;
        } else if v < thresholds.moderate {
            metrics.moderate_pixels += 1;
        } else {
            metrics.dense_pixels += 1;
        }
    }

    if metrics.valid_pixels > 0 {
        metrics.mean = mean;
        metrics.std_dev = (m2 / metrics.valid_pixels as f64).sqrt();
        metrics.min = min;
        metrics.max = max;
    }

    log::info!(
        "NDVI statistics: mean={:.4}, std={:.4}, min={:.4}, max={:.4} over {} pixels",
        metrics.mean,
        metrics.std_dev,
        metrics.min,
        metrics.max,
        metrics.valid_pixels
    );
    log::debug!(
        "Vegetation classes: bare={}, sparse={}, moderate={}, dense={}",
        metrics.bare_pixels,
        metrics.sparse_pixels,
        metrics.moderate_pixels,
        metrics.dense_pixels
    );

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn ndvi(data: Array2<f32>) -> Raster<f32> {
        let gt = GeoTransform::north_up(0.0, 0.0, 30.0, 30.0);
        Raster::new(data, gt, Crs::from_epsg(32633).unwrap(), None).unwrap()
    }

    #[test]
    fn test_statistics_and_classes() {
        let grid = ndvi(array![[0.1f32, 0.3], [0.5, 0.7], [f32::NAN, 0.2]]);
        let metrics = vegetation_metrics(&grid, &VegetationThresholds::default()).unwrap();

        assert_eq!(metrics.valid_pixels, 5);
        assert_abs_diff_eq!(metrics.mean, 0.36, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.min, 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.max, 0.7, epsilon = 1e-6);

        // Population variance of {0.1, 0.3, 0.5, 0.7, 0.2}
        let expected_var = [0.1f64, 0.3, 0.5, 0.7, 0.2]
            .iter()
            .map(|v| (v - 0.36).powi(2))
            .sum::<f64>()
            / 5.0;
        assert_abs_diff_eq!(metrics.std_dev, expected_var.sqrt(), epsilon = 1e-6);

        // 0.2 sits on the bare/sparse boundary and counts as sparse
        assert_eq!(metrics.bare_pixels, 1);
        assert_eq!(metrics.sparse_pixels, 2);
        assert_eq!(metrics.moderate_pixels, 1);
        assert_eq!(metrics.dense_pixels, 1);
        assert_abs_diff_eq!(metrics.vegetated_fraction(), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_all_nodata_grid() {
        let grid = ndvi(Array2::from_elem((2, 2), f32::NAN));
        let metrics = vegetation_metrics(&grid, &VegetationThresholds::default()).unwrap();
        assert_eq!(metrics.valid_pixels, 0);
        assert!(metrics.mean.is_nan());
        assert!(metrics.std_dev.is_nan());
        assert_eq!(metrics.dense_pixels + metrics.bare_pixels, 0);
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let thresholds = VegetationThresholds {
            bare: 0.5,
            sparse: 0.4,
            moderate: 0.6,
        };
        let grid = ndvi(array![[0.1f32]]);
        assert!(vegetation_metrics(&grid, &thresholds).is_err());
    }
}
