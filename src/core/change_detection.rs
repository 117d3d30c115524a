use crate::types::{ClassImage, Raster, VerdeError, VerdeResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Geotransform tolerance between the two dates, in pixels
const DATE_ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Slack on threshold ties. NDVI is stored as `f32`, so a decimal change
/// such as 0.3 -> 0.4 reaches the comparison up to two half-ulps short of
/// the threshold.
pub const THRESHOLD_TIE_TOLERANCE: f64 = 2.0 * f32::EPSILON as f64;

/// Change category of one pixel, with its on-disk code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeClass {
    NoChange,
    Gain,
    Loss,
    /// No-data in either date
    Invalid,
}

impl ChangeClass {
    /// Every category that partitions the valid pixels, in report order
    pub const VALID: [ChangeClass; 3] = [ChangeClass::NoChange, ChangeClass::Gain, ChangeClass::Loss];

    /// Code written to the change mask; `Invalid` doubles as the mask's no-data value
    pub const fn code(self) -> u8 {
        match self {
            ChangeClass::NoChange => 0,
            ChangeClass::Gain => 1,
            ChangeClass::Loss => 2,
            ChangeClass::Invalid => 255,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChangeClass::NoChange),
            1 => Some(ChangeClass::Gain),
            2 => Some(ChangeClass::Loss),
            255 => Some(ChangeClass::Invalid),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChangeClass::NoChange => "no_change",
            ChangeClass::Gain => "gain",
            ChangeClass::Loss => "loss",
            ChangeClass::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// No-data value of the change mask on disk
pub const CHANGE_MASK_NODATA: u8 = ChangeClass::Invalid.code();

/// Change thresholds on `delta = ndvi_t2 - ndvi_t1`.
/// Both bounds are inclusive: `delta >= gain` is gain, `delta <= loss` is loss,
/// each within [`THRESHOLD_TIE_TOLERANCE`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeThresholds {
    pub gain: f64,
    pub loss: f64,
}

impl ChangeThresholds {
    /// `delta >= threshold` is gain, `delta <= -threshold` is loss
    pub fn symmetric(threshold: f64) -> Self {
        Self {
            gain: threshold,
            loss: -threshold,
        }
    }

    pub fn validate(&self) -> VerdeResult<()> {
        if !self.gain.is_finite() || !self.loss.is_finite() {
            return Err(VerdeError::InvalidParameter(format!(
                "Change thresholds must be finite, got gain={} loss={}",
                self.gain, self.loss
            )));
        }
        if self.gain < 0.0 || self.loss > 0.0 {
            return Err(VerdeError::InvalidParameter(format!(
                "Gain threshold must be >= 0 and loss threshold <= 0, got gain={} loss={}",
                self.gain, self.loss
            )));
        }
        Ok(())
    }

    /// Classify one NDVI difference. Gain is tested first.
    pub fn classify(&self, delta: f64) -> ChangeClass {
        if delta >= self.gain - THRESHOLD_TIE_TOLERANCE {
            ChangeClass::Gain
        } else if delta <= self.loss + THRESHOLD_TIE_TOLERANCE {
            ChangeClass::Loss
        } else {
            ChangeClass::NoChange
        }
    }
}

/// Pixel counts per change class.
///
/// Counts are plain integers so tiles of one mask can be counted
/// separately and merged in any order with the same result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub no_change: usize,
    pub gain: usize,
    pub loss: usize,
    pub invalid: usize,
}

impl ClassCounts {
    /// Count the codes of a change mask; unknown codes count as invalid
    pub fn from_codes<'a, I: IntoIterator<Item = &'a u8>>(codes: I) -> Self {
        let mut counts = ClassCounts::default();
        for &code in codes {
            counts.add(ChangeClass::from_code(code).unwrap_or(ChangeClass::Invalid));
        }
        counts
    }

    pub fn add(&mut self, class: ChangeClass) {
        match class {
            ChangeClass::NoChange => self.no_change += 1,
            ChangeClass::Gain => self.gain += 1,
            ChangeClass::Loss => self.loss += 1,
            ChangeClass::Invalid => self.invalid += 1,
        }
    }

    pub fn get(&self, class: ChangeClass) -> usize {
        match class {
            ChangeClass::NoChange => self.no_change,
            ChangeClass::Gain => self.gain,
            ChangeClass::Loss => self.loss,
            ChangeClass::Invalid => self.invalid,
        }
    }

    pub fn merge(&self, other: &ClassCounts) -> ClassCounts {
        ClassCounts {
            no_change: self.no_change + other.no_change,
            gain: self.gain + other.gain,
            loss: self.loss + other.loss,
            invalid: self.invalid + other.invalid,
        }
    }

    pub fn valid(&self) -> usize {
        self.no_change + self.gain + self.loss
    }

    pub fn total(&self) -> usize {
        self.valid() + self.invalid
    }
}

/// Categorical change grid plus its class counts
#[derive(Debug, Clone)]
pub struct ChangeMask {
    /// Codes from [`ChangeClass::code`]; 255 marks no-data
    pub mask: Raster<u8>,
    pub counts: ClassCounts,
}

/// Change detector
pub struct ChangeDetector {
    thresholds: ChangeThresholds,
}

impl ChangeDetector {
    /// The thresholds are required; there is no default sensitivity
    pub fn new(thresholds: ChangeThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ChangeThresholds {
        &self.thresholds
    }

    /// Classify the per-pixel change from `ndvi_t1` to `ndvi_t2`.
    ///
    /// Both grids must already be aligned (same shape and geotransform).
    pub fn detect(&self, ndvi_t1: &Raster<f32>, ndvi_t2: &Raster<f32>) -> VerdeResult<ChangeMask> {
        self.thresholds.validate()?;
        check_same_grid(ndvi_t1, ndvi_t2, "change detection")?;

        let (rows, cols) = ndvi_t1.dim();
        log::info!("Detecting change over {}x{} pixels", rows, cols);
        log::debug!("Change thresholds: {:?}", self.thresholds);

        let codes = self.map_classes(ndvi_t1, ndvi_t2);
        let counts = count_classes(&codes);

        let valid = counts.valid().max(1) as f64;
        log::info!(
            "Change detection completed: no_change={} ({:.1}%), gain={} ({:.1}%), loss={} ({:.1}%), invalid={}",
            counts.no_change,
            counts.no_change as f64 / valid * 100.0,
            counts.gain,
            counts.gain as f64 / valid * 100.0,
            counts.loss,
            counts.loss as f64 / valid * 100.0,
            counts.invalid
        );

        Ok(ChangeMask {
            mask: ndvi_t1.derive(codes, Some(CHANGE_MASK_NODATA as f64))?,
            counts,
        })
    }

    #[cfg(feature = "parallel")]
    fn map_classes(&self, t1: &Raster<f32>, t2: &Raster<f32>) -> ClassImage {
        Zip::from(t1.data())
            .and(t2.data())
            .par_map_collect(|&a, &b| self.pixel(t1, t2, a, b).code())
    }

    #[cfg(not(feature = "parallel"))]
    fn map_classes(&self, t1: &Raster<f32>, t2: &Raster<f32>) -> ClassImage {
        Zip::from(t1.data())
            .and(t2.data())
            .map_collect(|&a, &b| self.pixel(t1, t2, a, b).code())
    }

    fn pixel(&self, t1: &Raster<f32>, t2: &Raster<f32>, a: f32, b: f32) -> ChangeClass {
        match pixel_delta(t1, t2, a, b) {
            Some(delta) => self.thresholds.classify(delta),
            None => ChangeClass::Invalid,
        }
    }
}

/// Per-row counts merged into one total
#[cfg(feature = "parallel")]
fn count_classes(codes: &ClassImage) -> ClassCounts {
    use rayon::prelude::*;

    match codes.as_slice() {
        Some(flat) => flat
            .par_chunks(codes.ncols().max(1))
            .map(|row| ClassCounts::from_codes(row))
            .reduce(ClassCounts::default, |a, b| a.merge(&b)),
        None => ClassCounts::from_codes(codes.iter()),
    }
}

#[cfg(not(feature = "parallel"))]
fn count_classes(codes: &ClassImage) -> ClassCounts {
    ClassCounts::from_codes(codes.iter())
}

/// Classify change between two aligned NDVI grids
pub fn detect_change(ndvi_t1: &Raster<f32>, ndvi_t2: &Raster<f32>, thresholds: ChangeThresholds) -> VerdeResult<ChangeMask> {
    ChangeDetector::new(thresholds).detect(ndvi_t1, ndvi_t2)
}

fn pixel_delta(t1: &Raster<f32>, t2: &Raster<f32>, a: f32, b: f32) -> Option<f64> {
    if !t1.is_valid(a) || !t2.is_valid(b) || !a.is_finite() || !b.is_finite() {
        return None;
    }
    Some(b as f64 - a as f64)
}

fn check_same_grid(t1: &Raster<f32>, t2: &Raster<f32>, context: &str) -> VerdeResult<()> {
    if t1.dim() != t2.dim() {
        return Err(VerdeError::ShapeMismatch {
            context: context.to_string(),
            expected: t1.dim(),
            found: t2.dim(),
        });
    }
    if !t1
        .geo_transform()
        .aligns_with(t2.geo_transform(), DATE_ALIGNMENT_TOLERANCE)
    {
        return Err(VerdeError::IncompatibleGrid(format!(
            "{} requires aligned grids; run alignment first ({:?} vs {:?})",
            context,
            t1.geo_transform().to_gdal(),
            t2.geo_transform().to_gdal()
        )));
    }
    Ok(())
}

/// Continuous `t2 - t1` grid; no-data in either date stays no-data (NaN)
pub fn difference(ndvi_t1: &Raster<f32>, ndvi_t2: &Raster<f32>) -> VerdeResult<Raster<f32>> {
    check_same_grid(ndvi_t1, ndvi_t2, "NDVI difference")?;

    let delta: Array2<f32> = Zip::from(ndvi_t1.data())
        .and(ndvi_t2.data())
        .map_collect(|&a, &b| match pixel_delta(ndvi_t1, ndvi_t2, a, b) {
            Some(d) => d as f32,
            None => f32::NAN,
        });

    ndvi_t1.derive(delta, None)
}

/// Comparison operator for [`threshold_mask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Greater,
    Less,
    /// Approximate equality: |a - b| <= 1e-8 + 1e-5 * |b|
    Equal,
    GreaterEqual,
    LessEqual,
}

impl Comparison {
    pub fn test(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Greater => value > threshold,
            Comparison::Less => value < threshold,
            Comparison::Equal => (value - threshold).abs() <= 1e-8 + 1e-5 * threshold.abs(),
            Comparison::GreaterEqual => value >= threshold,
            Comparison::LessEqual => value <= threshold,
        }
    }
}

impl std::str::FromStr for Comparison {
    type Err = VerdeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "greater" | "gt" | ">" => Ok(Comparison::Greater),
            "less" | "lt" | "<" => Ok(Comparison::Less),
            "equal" | "eq" | "==" => Ok(Comparison::Equal),
            "greater_equal" | "ge" | ">=" => Ok(Comparison::GreaterEqual),
            "less_equal" | "le" | "<=" => Ok(Comparison::LessEqual),
            _ => Err(VerdeError::InvalidParameter(format!(
                "Invalid comparison: {}. Must be one of: greater, less, equal, greater_equal, less_equal",
                s
            ))),
        }
    }
}

/// Boolean mask of pixels passing `value <op> threshold`; no-data is always false
pub fn threshold_mask(grid: &Raster<f32>, threshold: f64, comparison: Comparison) -> Array2<bool> {
    grid.data().map(|&v| grid.is_valid(v) && v.is_finite() && comparison.test(v as f64, threshold))
}
