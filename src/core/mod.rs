//! Core NDVI and change processing modules

pub mod alignment;
pub mod area;
pub mod change_detection;
pub mod crop;
pub mod metrics;
pub mod ndvi;
pub mod reproject;

// Re-export main types
pub use alignment::{align_to, AlignmentParams, GridAligner, GridComparison};
pub use area::{aggregate_area, AreaRecord, AreaSummary, AreaUnit, CategoryArea};
pub use change_detection::{
    detect_change, difference, threshold_mask, ChangeClass, ChangeDetector, ChangeMask, ChangeThresholds,
    ClassCounts, Comparison, CHANGE_MASK_NODATA, THRESHOLD_TIE_TOLERANCE,
};
pub use crop::crop_to_aoi;
pub use metrics::{vegetation_metrics, VegetationMetrics, VegetationThresholds};
pub use ndvi::{compute_ndvi, NdviCalculator, NdviParams, NdviProduct, OutOfRange};
pub use reproject::{default_grid, warp, GridSpec, PointTransformer, ResamplingMethod};
