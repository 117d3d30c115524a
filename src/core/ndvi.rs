use crate::types::{NdviImage, Raster, VerdeError, VerdeResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Geotransform tolerance between the red and NIR bands, in pixels
const BAND_ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// What to do with an index value outside [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutOfRange {
    /// Clamp to the nearest bound and flag the pixel
    Clamp,
    /// Replace with no-data and flag the pixel
    Invalidate,
}

/// NDVI parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdviParams {
    /// Denominator stabilizer: ndvi = (nir - red) / (nir + red + epsilon)
    pub epsilon: f64,
    /// Out-of-range policy
    pub out_of_range: OutOfRange,
}

impl Default for NdviParams {
    fn default() -> Self {
        Self {
            epsilon: 1e-8,
            out_of_range: OutOfRange::Clamp,
        }
    }
}

impl NdviParams {
    pub fn validate(&self) -> VerdeResult<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(VerdeError::InvalidParameter(format!(
                "NDVI epsilon must be a small positive number, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// NDVI grid plus its quality flags
#[derive(Debug, Clone)]
pub struct NdviProduct {
    /// Index values in [-1, 1]; NaN marks no-data
    pub ndvi: Raster<f32>,
    /// True where the computed value fell outside [-1, 1]
    pub out_of_range: Array2<bool>,
    pub out_of_range_count: usize,
    pub valid_count: usize,
}

/// Per-pixel outcome
#[derive(Debug, Clone, Copy, PartialEq)]
enum NdviPixel {
    Value(f32),
    Flagged(f32),
    Rejected,
    NoData,
}

/// NDVI calculator
pub struct NdviCalculator {
    params: NdviParams,
}

impl NdviCalculator {
    /// Create a calculator with default parameters
    pub fn new() -> Self {
        Self {
            params: NdviParams::default(),
        }
    }

    /// Create a calculator with custom parameters
    pub fn with_params(params: NdviParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NdviParams {
        &self.params
    }

    /// Compute NDVI from red and near-infrared reflectance bands.
    ///
    /// Both bands must share shape and geotransform. No-data in either
    /// band, non-finite reflectance and pixels where both bands are zero
    /// produce no-data.
    pub fn compute(&self, red: &Raster<f32>, nir: &Raster<f32>) -> VerdeResult<NdviProduct> {
        self.params.validate()?;

        if red.dim() != nir.dim() {
            return Err(VerdeError::ShapeMismatch {
                context: "NDVI red/NIR bands".to_string(),
                expected: red.dim(),
                found: nir.dim(),
            });
        }
        if !red
            .geo_transform()
            .aligns_with(nir.geo_transform(), BAND_ALIGNMENT_TOLERANCE)
        {
            return Err(VerdeError::IncompatibleGrid(format!(
                "Red and NIR bands have different geotransforms: {:?} vs {:?}",
                red.geo_transform().to_gdal(),
                nir.geo_transform().to_gdal()
            )));
        }
        if !red.crs().is_same(nir.crs())? {
            log::warn!(
                "Red ({}) and NIR ({}) bands report different CRSs, using the red band's",
                red.crs(),
                nir.crs()
            );
        }

        let (rows, cols) = red.dim();
        log::info!("Computing NDVI for {}x{} pixels", rows, cols);
        log::debug!("NDVI parameters: {:?}", self.params);

        let pixels = self.map_pixels(red, nir);

        let ndvi: NdviImage = pixels.map(|p| match *p {
            NdviPixel::Value(v) | NdviPixel::Flagged(v) => v,
            NdviPixel::Rejected | NdviPixel::NoData => f32::NAN,
        });
        let out_of_range = pixels.map(|p| matches!(p, NdviPixel::Flagged(_) | NdviPixel::Rejected));

        let out_of_range_count = out_of_range.iter().filter(|&&f| f).count();
        let valid_count = ndvi.iter().filter(|v| !v.is_nan()).count();

        if out_of_range_count > 0 {
            log::warn!(
                "{} NDVI pixels fell outside [-1, 1] ({:?} policy)",
                out_of_range_count,
                self.params.out_of_range
            );
        }

        let total = rows * cols;
        log::info!(
            "NDVI completed: {} valid pixels ({:.1}%)",
            valid_count,
            valid_count as f64 / total as f64 * 100.0
        );

        Ok(NdviProduct {
            ndvi: red.derive(ndvi, None)?,
            out_of_range,
            out_of_range_count,
            valid_count,
        })
    }

    #[cfg(feature = "parallel")]
    fn map_pixels(&self, red: &Raster<f32>, nir: &Raster<f32>) -> Array2<NdviPixel> {
        Zip::from(red.data())
            .and(nir.data())
            .par_map_collect(|&r, &n| self.pixel(red, nir, r, n))
    }

    #[cfg(not(feature = "parallel"))]
    fn map_pixels(&self, red: &Raster<f32>, nir: &Raster<f32>) -> Array2<NdviPixel> {
        Zip::from(red.data())
            .and(nir.data())
            .map_collect(|&r, &n| self.pixel(red, nir, r, n))
    }

    fn pixel(&self, red: &Raster<f32>, nir: &Raster<f32>, r: f32, n: f32) -> NdviPixel {
        if !red.is_valid(r) || !nir.is_valid(n) || !r.is_finite() || !n.is_finite() {
            return NdviPixel::NoData;
        }

        let value = match ndvi_value(r as f64, n as f64, self.params.epsilon) {
            Some(v) => v,
            None => return NdviPixel::NoData,
        };

        if (-1.0..=1.0).contains(&value) {
            return NdviPixel::Value(value as f32);
        }

        match self.params.out_of_range {
            OutOfRange::Clamp => NdviPixel::Flagged(value.clamp(-1.0, 1.0) as f32),
            OutOfRange::Invalidate => NdviPixel::Rejected,
        }
    }
}

impl Default for NdviCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Unclamped index for one pixel; `None` when both bands are zero
pub fn ndvi_value(red: f64, nir: f64, epsilon: f64) -> Option<f64> {
    if red == 0.0 && nir == 0.0 {
        return None;
    }
    let value = (nir - red) / (nir + red + epsilon);
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Compute NDVI with the given parameters
pub fn compute_ndvi(red: &Raster<f32>, nir: &Raster<f32>, params: &NdviParams) -> VerdeResult<NdviProduct> {
    NdviCalculator::with_params(params.clone()).compute(red, nir)
}
