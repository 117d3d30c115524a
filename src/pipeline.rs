//! Pipeline boundary: one NDVI run or one change run, end to end.
//!
//! Every failure is reported with the stage and input path that caused it,
//! and outputs are published only after the whole run has succeeded.

use crate::core::alignment::{AlignmentParams, GridAligner};
use crate::core::area::{aggregate_area, linear_unit_metres, AreaSummary, AreaUnit};
use crate::core::change_detection::{difference, ChangeDetector, ChangeThresholds, ClassCounts};
use crate::core::crop::crop_to_aoi;
use crate::core::metrics::{vegetation_metrics, VegetationMetrics, VegetationThresholds};
use crate::core::ndvi::{NdviCalculator, NdviParams, NdviProduct};
use crate::io::aoi::{read_aoi, AreaOfInterest};
use crate::io::raster::{read_raster_band, OutputBatch, WriteOptions};
use crate::io::summary::write_area_summary;
use crate::types::{Crs, PipelineStage, Raster, StageContext, VerdeResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Every tunable of a run; passed explicitly, never read from global state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ndvi: NdviParams,
    pub alignment: AlignmentParams,
    pub vegetation: VegetationThresholds,
    pub write: WriteOptions,
    pub area_unit: AreaUnit,
}

/// Red and near-infrared inputs for one date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandPair {
    pub red: PathBuf,
    pub nir: PathBuf,
    /// 1-based band index inside `red`
    pub red_band: usize,
    /// 1-based band index inside `nir`
    pub nir_band: usize,
}

impl BandPair {
    /// Band 1 of two single-band files
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(red: P, nir: Q) -> Self {
        Self {
            red: red.into(),
            nir: nir.into(),
            red_band: 1,
            nir_band: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdviRequest {
    pub bands: BandPair,
    pub output: PathBuf,
    /// Optional GeoJSON polygon to crop to before processing
    pub aoi: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NdviReport {
    pub output: PathBuf,
    pub rows: usize,
    pub cols: usize,
    pub valid_pixels: usize,
    pub out_of_range_pixels: usize,
    pub metrics: VegetationMetrics,
}

/// Where the two NDVI grids of a change run come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeInputs {
    /// Previously computed NDVI rasters
    Ndvi { t1: PathBuf, t2: PathBuf },
    /// Band pairs; NDVI is computed in memory for each date
    Bands { t1: BandPair, t2: BandPair },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub inputs: ChangeInputs,
    pub thresholds: ChangeThresholds,
    /// Projected CRS for area measurement, e.g. `EPSG:32618`
    pub target_crs: String,
    pub mask_output: PathBuf,
    pub summary_output: PathBuf,
    /// Continuous t2 - t1 raster
    pub difference_output: Option<PathBuf>,
    /// NDVI rasters for t1 and t2 (band-pair inputs only), each on its
    /// own native grid, before any alignment
    pub ndvi_outputs: Option<(PathBuf, PathBuf)>,
    pub aoi: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeReport {
    pub counts: ClassCounts,
    pub summary: AreaSummary,
    /// True when t2 had to be resampled onto the t1 grid
    pub resampled: bool,
    pub outputs: Vec<PathBuf>,
}

/// Compute NDVI for one date and write it
pub fn run_ndvi(request: &NdviRequest, config: &PipelineConfig) -> VerdeResult<NdviReport> {
    let start = Instant::now();
    log::info!("Starting NDVI run: red={}, nir={}", request.bands.red.display(), request.bands.nir.display());

    let aoi = load_aoi(request.aoi.as_deref())?;
    let product = ndvi_for_date(&request.bands, aoi.as_ref(), config)?;
    let metrics = vegetation_metrics(&product.ndvi, &config.vegetation).at_stage(PipelineStage::Ndvi, &request.bands.red)?;

    let mut batch = OutputBatch::new(config.write.clone());
    batch
        .add_raster(&product.ndvi, &request.output)
        .at_stage(PipelineStage::Write, &request.output)?;
    batch.commit().at_stage(PipelineStage::Write, &request.output)?;

    let (rows, cols) = product.ndvi.dim();
    log::info!("NDVI run completed in {:.2}s", start.elapsed().as_secs_f64());

    Ok(NdviReport {
        output: request.output.clone(),
        rows,
        cols,
        valid_pixels: product.valid_count,
        out_of_range_pixels: product.out_of_range_count,
        metrics,
    })
}

/// Detect change between two dates, measure it and write the mask and summary
pub fn run_change(request: &ChangeRequest, config: &PipelineConfig) -> VerdeResult<ChangeReport> {
    let start = Instant::now();
    let (t1_path, t2_path) = match &request.inputs {
        ChangeInputs::Ndvi { t1, t2 } => (t1.clone(), t2.clone()),
        ChangeInputs::Bands { t1, t2 } => (t1.red.clone(), t2.red.clone()),
    };
    log::info!("Starting change run: t1={}, t2={}", t1_path.display(), t2_path.display());

    // Parameters are checked before any raster is read
    request
        .thresholds
        .validate()
        .at_stage(PipelineStage::ChangeDetection, &t1_path)?;
    let target_crs = Crs::from_user_input(&request.target_crs).at_stage(PipelineStage::AreaAggregation, &t1_path)?;
    linear_unit_metres(&target_crs).at_stage(PipelineStage::AreaAggregation, &t1_path)?;

    let aoi = load_aoi(request.aoi.as_deref())?;

    let (ndvi_t1, ndvi_t2) = match &request.inputs {
        ChangeInputs::Ndvi { t1, t2 } => (
            load_band(t1, 1, aoi.as_ref())?,
            load_band(t2, 1, aoi.as_ref())?,
        ),
        ChangeInputs::Bands { t1, t2 } => (
            ndvi_for_date(t1, aoi.as_ref(), config)?.ndvi,
            ndvi_for_date(t2, aoi.as_ref(), config)?.ndvi,
        ),
    };

    let aligner = GridAligner::with_params(config.alignment.clone());
    let aligned_t2 = aligner
        .align(&ndvi_t1, &ndvi_t2)
        .at_stage(PipelineStage::Alignment, &t2_path)?;
    let resampled = matches!(aligned_t2, Cow::Owned(_));

    let change = ChangeDetector::new(request.thresholds)
        .detect(&ndvi_t1, &aligned_t2)
        .at_stage(PipelineStage::ChangeDetection, &t1_path)?;
    let delta = match &request.difference_output {
        Some(_) => Some(difference(&ndvi_t1, &aligned_t2).at_stage(PipelineStage::ChangeDetection, &t1_path)?),
        None => None,
    };

    let summary = aggregate_area(&change.mask, &target_crs, config.area_unit)
        .at_stage(PipelineStage::AreaAggregation, &t1_path)?;

    let mut batch = OutputBatch::new(config.write.clone());
    if let (ChangeInputs::Bands { .. }, Some((out_t1, out_t2))) = (&request.inputs, &request.ndvi_outputs) {
        batch.add_raster(&ndvi_t1, out_t1).at_stage(PipelineStage::Write, out_t1)?;
        batch.add_raster(&ndvi_t2, out_t2).at_stage(PipelineStage::Write, out_t2)?;
    }
    if let (Some(path), Some(delta)) = (&request.difference_output, &delta) {
        batch.add_raster(delta, path).at_stage(PipelineStage::Write, path)?;
    }
    batch
        .add_raster(&change.mask, &request.mask_output)
        .at_stage(PipelineStage::Write, &request.mask_output)?;
    batch
        .add_file(&request.summary_output, |staged| write_area_summary(&summary, staged))
        .at_stage(PipelineStage::Write, &request.summary_output)?;
    let outputs = batch.commit().at_stage(PipelineStage::Write, &request.mask_output)?;

    log::info!("Change run completed in {:.2}s", start.elapsed().as_secs_f64());

    Ok(ChangeReport {
        counts: change.counts,
        summary,
        resampled,
        outputs,
    })
}

fn load_aoi(path: Option<&Path>) -> VerdeResult<Option<AreaOfInterest>> {
    match path {
        Some(path) => Ok(Some(read_aoi(path).at_stage(PipelineStage::Load, path)?)),
        None => Ok(None),
    }
}

fn load_band(path: &Path, band: usize, aoi: Option<&AreaOfInterest>) -> VerdeResult<Raster<f32>> {
    let raster = read_raster_band(path, band).at_stage(PipelineStage::Load, path)?;
    match aoi {
        Some(aoi) => crop_to_aoi(&raster, aoi).at_stage(PipelineStage::Crop, path),
        None => Ok(raster),
    }
}

fn ndvi_for_date(bands: &BandPair, aoi: Option<&AreaOfInterest>, config: &PipelineConfig) -> VerdeResult<NdviProduct> {
    let red = load_band(&bands.red, bands.red_band, aoi)?;
    let nir = load_band(&bands.nir, bands.nir_band, aoi)?;
    NdviCalculator::with_params(config.ndvi.clone())
        .compute(&red, &nir)
        .at_stage(PipelineStage::Ndvi, &bands.red)
}
