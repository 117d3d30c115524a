//! VerdeMetria: NDVI and vegetation change detection for paired spectral rasters
//!
//! This library computes NDVI from red/near-infrared bands, aligns NDVI grids
//! from two acquisition dates, classifies per-pixel change against explicit
//! thresholds and measures the changed area under a metric projection.

pub mod types;
pub mod io;
pub mod core;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, ClassImage, CoordinateSystem, Crs, GeoTransform, NdviImage, Pixel, PipelineStage, Raster,
    StageContext, VerdeError, VerdeResult,
};

pub use io::{read_aoi, read_raster, read_raster_band, write_raster, AreaOfInterest, OutputBatch, WriteOptions};

pub use crate::core::{
    aggregate_area, align_to, compute_ndvi, crop_to_aoi, detect_change, difference, threshold_mask,
    vegetation_metrics, AlignmentParams, AreaSummary, AreaUnit, ChangeClass, ChangeMask, ChangeThresholds,
    Comparison, NdviParams, NdviProduct, ResamplingMethod, VegetationThresholds,
};

pub use pipeline::{
    run_change, run_ndvi, BandPair, ChangeInputs, ChangeReport, ChangeRequest, NdviReport, NdviRequest,
    PipelineConfig,
};
